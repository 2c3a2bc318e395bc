//! # Peer Connection
//!
//! Client side of the peer wire protocol for a single remote peer: TCP
//! connection, handshake, bitfield exchange and framed message I/O.
//!
//! ## Connection Setup
//!
//! 1. **Dial**: TCP connect with a short bounded timeout
//! 2. **Handshake**: exchange fixed-format handshakes and compare info hashes
//! 3. **Bitfield**: the peer's first message must be its piece bitmap
//!
//! A failure at any of these steps makes the peer unusable and is never
//! retried; the worker simply drops the session.
//!
//! ## Connection States
//!
//! Every connection starts choked. While choked, the peer will not answer
//! block requests; requests may only be pipelined once an unchoke arrives.
//!
//! Every read is bounded by a socket timeout, so a silent peer surfaces as
//! [`PeerError::Timeout`] rather than a hang.

use std::io::{Cursor, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::bitfield::Bitfield;
use crate::error::{PeerError, WireError};
use crate::handshake::Handshake;
use crate::message::Message;
use crate::peer::Peer;

// Timeout for dialing and for the handshake exchange
const CONNECT_TIMEOUT_SECS: u64 = 3;

// Timeout for the peer's initial bitfield message
const BITFIELD_TIMEOUT_SECS: u64 = 5;

// Upper bound on a frame's declared length; the largest legitimate frame is
// a piece message of one block plus headers
const MAX_FRAME_SIZE: usize = 1 << 20;

/// A connection to one remote peer, together with the peer's choke state
/// and claimed piece availability.
pub struct Client {
    peer: Peer,
    conn: TcpStream,
    bitfield: Bitfield,
    choked: bool,
}

impl Client {
    /// Dial a peer and bring the connection up to the point where pieces can
    /// be requested: handshake completed, info hash verified, bitfield
    /// received.
    pub fn connect(peer: &Peer, peer_id: &[u8], info_hash: &[u8]) -> Result<Client, PeerError> {
        let peer_socket = SocketAddr::new(IpAddr::V4(peer.ip), peer.port);
        let conn = TcpStream::connect_timeout(&peer_socket, Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .map_err(PeerError::Connect)?;

        info!("Connected to peer {}", peer);

        let mut client = Client {
            peer: peer.clone(),
            conn,
            bitfield: Bitfield::default(),
            choked: true,
        };

        client.set_connection_timeout(CONNECT_TIMEOUT_SECS)?;
        client.complete_handshake(peer_id, info_hash)?;
        client.recv_bitfield()?;

        Ok(client)
    }

    /// Exchange handshakes and verify the peer is serving the same torrent.
    fn complete_handshake(&mut self, peer_id: &[u8], info_hash: &[u8]) -> Result<(), PeerError> {
        let handshake = Handshake::new(info_hash.to_vec(), peer_id.to_vec());
        self.conn.write_all(&handshake.serialize())?;

        let reply = Handshake::read(&mut self.conn)?;
        if reply.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        debug!(
            "Handshake with peer {} complete (peer id {:02X?})",
            self.peer, reply.peer_id
        );

        Ok(())
    }

    /// Read the peer's initial bitfield.
    ///
    /// The protocol requires it to be the first message after the handshake;
    /// anything else ends the session.
    fn recv_bitfield(&mut self) -> Result<(), PeerError> {
        self.conn
            .set_read_timeout(Some(Duration::from_secs(BITFIELD_TIMEOUT_SECS)))?;

        match self.read_message()? {
            Message::Bitfield(bits) => {
                self.bitfield = Bitfield::from(bits);
                Ok(())
            }
            other => Err(WireError::UnexpectedMessage {
                expected: "bitfield",
                got: other.kind(),
            }
            .into()),
        }
    }

    /// Set read and write timeouts on the connection so no blocking call can
    /// hang indefinitely.
    pub fn set_connection_timeout(&self, secs: u64) -> Result<(), PeerError> {
        self.conn
            .set_write_timeout(Some(Duration::from_secs(secs)))?;
        self.conn
            .set_read_timeout(Some(Duration::from_secs(secs)))?;

        Ok(())
    }

    /// Read the next length-prefixed message from the peer.
    ///
    /// A zero length prefix is the keep-alive and is returned as such, never
    /// treated as an error.
    pub fn read_message(&mut self) -> Result<Message, PeerError> {
        // Read the 4-byte big-endian length prefix
        let mut len_buf = [0; 4];
        self.conn.read_exact(&mut len_buf)?;
        let mut cursor = Cursor::new(len_buf);
        let message_len = cursor.read_u32::<BigEndian>()? as usize;

        if message_len == 0 {
            debug!("Receive keep-alive from peer {}", self.peer);
            return Ok(Message::KeepAlive);
        }
        if message_len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(message_len).into());
        }

        // Read the frame body
        let mut body = vec![0; message_len];
        self.conn.read_exact(&mut body)?;

        let message = Message::parse(&body)?;

        Ok(message)
    }

    fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        self.conn.write_all(&message.serialize())?;
        Ok(())
    }

    /// Tell the peer it may request from us.
    pub fn send_unchoke(&mut self) -> Result<(), PeerError> {
        debug!("Send unchoke to peer {}", self.peer);
        self.send(&Message::Unchoke)
    }

    /// Tell the peer we want to download from it. Sent once per connection,
    /// before the first request.
    pub fn send_interested(&mut self) -> Result<(), PeerError> {
        debug!("Send interested to peer {}", self.peer);
        self.send(&Message::Interested)
    }

    /// Ask the peer for a block of `length` bytes at `begin` within a piece.
    pub fn send_request(&mut self, index: u32, begin: u32, length: u32) -> Result<(), PeerError> {
        debug!(
            "Send request for piece {} [{}:{}] to peer {}",
            index,
            begin,
            begin + length,
            self.peer
        );
        self.send(&Message::Request {
            index,
            begin,
            length,
        })
    }

    /// Announce a piece we now hold.
    pub fn send_have(&mut self, index: u32) -> Result<(), PeerError> {
        debug!("Send have for piece {} to peer {}", index, self.peer);
        self.send(&Message::Have(index))
    }

    /// Whether the peer currently refuses to serve our requests.
    pub fn is_choked(&self) -> bool {
        self.choked
    }

    /// Record a choke from the peer.
    pub fn mark_choked(&mut self) {
        info!("Peer {} choked us", self.peer);
        self.choked = true;
    }

    /// Record an unchoke from the peer.
    pub fn mark_unchoked(&mut self) {
        info!("Peer {} unchoked us", self.peer);
        self.choked = false;
    }

    /// Whether the peer claims to have a piece.
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    /// Record a piece announced by the peer through a have message.
    pub fn set_piece(&mut self, index: u32) {
        self.bitfield.set_piece(index);
    }

    /// The remote endpoint, for logging.
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}
