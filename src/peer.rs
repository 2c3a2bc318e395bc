//! # Peer Endpoints
//!
//! Peers are discovered through the tracker, which answers with a compact
//! binary list of 6-byte entries:
//!
//! ```text
//! <IP: 4 bytes><Port: 2 bytes>
//! ```
//!
//! Both fields are in network byte order. A list whose length is not a
//! multiple of 6 is malformed and rejected.

use std::fmt;
use std::io::Cursor;
use std::net::Ipv4Addr;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};

const PEER_SIZE: usize = 6;

/// Network endpoint of a remote peer in the swarm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// IPv4 address of the peer
    pub ip: Ipv4Addr,
    /// Port the peer listens on
    pub port: u16,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse the compact peer list from a tracker response.
pub fn from_compact(raw: &[u8]) -> Result<Vec<Peer>> {
    // Check tracker peers are valid
    if !raw.len().is_multiple_of(PEER_SIZE) {
        return Err(anyhow!("received invalid peers from tracker"));
    }

    let mut peers: Vec<Peer> = Vec::with_capacity(raw.len() / PEER_SIZE);

    for entry in raw.chunks_exact(PEER_SIZE) {
        // Read peer IP address
        let ip = Ipv4Addr::new(entry[0], entry[1], entry[2], entry[3]);

        // Read peer port
        let mut port_cursor = Cursor::new(&entry[4..6]);
        let port = port_cursor.read_u16::<BigEndian>()?;

        peers.push(Peer { ip, port });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_compact_parses_six_byte_entries() {
        let raw = vec![192, 168, 1, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x00, 0x50];

        let peers = from_compact(&raw).unwrap();

        assert_eq!(
            peers,
            vec![
                Peer {
                    ip: Ipv4Addr::new(192, 168, 1, 1),
                    port: 6881,
                },
                Peer {
                    ip: Ipv4Addr::new(10, 0, 0, 2),
                    port: 80,
                },
            ]
        );
    }

    #[test]
    fn from_compact_accepts_an_empty_list() {
        assert!(from_compact(&[]).unwrap().is_empty());
    }

    #[test]
    fn from_compact_rejects_a_list_of_the_wrong_length() {
        let raw = vec![192, 168, 1, 1, 0x1A];

        assert!(from_compact(&raw).is_err());
    }
}
