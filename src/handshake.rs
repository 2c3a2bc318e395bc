//! # BitTorrent Handshake
//!
//! Fixed-format initial exchange establishing protocol identity and mutual
//! agreement on the content being transferred.
//!
//! ## Message Format
//!
//! ```text
//! <pstrlen><pstr><reserved><info_hash><peer_id>
//! ```
//!
//! - **pstrlen**: 1 byte, length of the protocol identifier (19)
//! - **pstr**: protocol identifier, "BitTorrent protocol"
//! - **reserved**: 8 bytes, all zeros
//! - **info_hash**: 20 bytes, SHA-1 of the torrent's info dictionary
//! - **peer_id**: 20 bytes, identifier of the sending peer
//!
//! The total size is fixed at 49 + pstrlen bytes, so the exchange has no
//! length ambiguity. A peer answering with a different info hash is talking
//! about some other content and must be dropped.

use std::io::Read;

use crate::error::{PeerError, WireError};

const PROTOCOL_ID: &str = "BitTorrent protocol";

/// A handshake message, sent and expected immediately after connecting.
pub struct Handshake {
    /// 20-byte SHA-1 hash of the torrent's info dictionary
    pub info_hash: Vec<u8>,
    /// 20-byte identifier of the peer that produced this handshake
    pub peer_id: Vec<u8>,
}

impl Handshake {
    /// Build a new handshake for the standard protocol identifier.
    pub fn new(info_hash: Vec<u8>, peer_id: Vec<u8>) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serialize the handshake for transmission.
    pub fn serialize(&self) -> Vec<u8> {
        let mut serialized: Vec<u8> = Vec::with_capacity(49 + PROTOCOL_ID.len());

        // Add protocol identifier length
        serialized.push(PROTOCOL_ID.len() as u8);

        // Add protocol identifier
        serialized.extend_from_slice(PROTOCOL_ID.as_bytes());

        // Add reserved bytes
        serialized.extend_from_slice(&[0; 8]);

        // Add info hash
        serialized.extend_from_slice(&self.info_hash);

        // Add peer id
        serialized.extend_from_slice(&self.peer_id);

        serialized
    }

    /// Read and parse a handshake from a peer.
    ///
    /// The caller is responsible for bounding the read with a timeout on the
    /// underlying connection.
    pub fn read<R: Read>(reader: &mut R) -> Result<Handshake, PeerError> {
        // Read protocol identifier length
        let mut len_buf = [0; 1];
        reader.read_exact(&mut len_buf)?;
        let pstrlen = len_buf[0] as usize;
        if pstrlen == 0 {
            return Err(WireError::InvalidHandshake.into());
        }

        // Read the remainder of the handshake in one piece
        let mut buf = vec![0; pstrlen + 48];
        reader.read_exact(&mut buf)?;

        // Get info hash
        let info_hash = buf[(pstrlen + 8)..(pstrlen + 28)].to_vec();

        // Get peer id
        let peer_id = buf[(pstrlen + 28)..].to_vec();

        Ok(Handshake { info_hash, peer_id })
    }
}
