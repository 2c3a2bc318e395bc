//! # Errors
//!
//! Error types for the wire codec and the per-peer sessions.
//!
//! Failures at the torrent and tracker level are ordinary [`anyhow`] errors;
//! the protocol core uses these typed variants so that callers can tell a
//! malformed frame from a dead connection from a corrupted piece.

use std::io;

use thiserror::Error;

/// Violations of the peer wire protocol framing and payload rules.
#[derive(Debug, Error)]
pub enum WireError {
    /// A message arrived where the protocol requires a specific one.
    #[error("expected {expected} message from peer, received {got}")]
    UnexpectedMessage {
        expected: &'static str,
        got: &'static str,
    },

    /// A fixed-size payload had the wrong length.
    #[error("{kind} payload is {got} bytes, expected {expected}")]
    BadLength {
        kind: &'static str,
        expected: usize,
        got: usize,
    },

    /// A piece payload too short to hold its index and offset fields.
    #[error("piece payload is {0} bytes, need at least 8")]
    PayloadTooShort(usize),

    /// A piece message for a piece other than the one being fetched.
    #[error("received block for piece {got}, expected piece {expected}")]
    WrongPieceIndex { expected: u32, got: u32 },

    /// A block offset past the end of the piece buffer.
    #[error("block offset {begin} is outside a piece of {piece_len} bytes")]
    OffsetOutOfRange { begin: usize, piece_len: usize },

    /// A block that would write past the end of the piece buffer.
    #[error("block of {block_len} bytes at offset {begin} overflows a piece of {piece_len} bytes")]
    BlockOverflow {
        begin: usize,
        block_len: usize,
        piece_len: usize,
    },

    /// A length prefix larger than any frame the protocol can produce.
    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    /// A handshake with a zero-length protocol identifier.
    #[error("peer sent a zero-length protocol identifier")]
    InvalidHandshake,
}

/// Failures of a single peer session. These terminate the session at most;
/// the download keeps going on the remaining peers.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("could not connect to peer: {0}")]
    Connect(#[source] io::Error),

    #[error("peer handshake advertised a different info hash")]
    InfoHashMismatch,

    /// A bounded read or write ran past its deadline.
    #[error("timed out waiting for peer")]
    Timeout,

    #[error("connection error: {0}")]
    Io(#[source] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    /// The assembled piece did not match its declared SHA-1 digest.
    #[error("piece {0} failed hash verification")]
    Integrity(u32),
}

impl From<io::Error> for PeerError {
    fn from(err: io::Error) -> PeerError {
        // Socket read timeouts surface as WouldBlock on Unix and TimedOut
        // on Windows.
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => PeerError::Timeout,
            _ => PeerError::Io(err),
        }
    }
}
