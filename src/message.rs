//! # Peer Wire Messages
//!
//! Message types and framing for the BitTorrent peer wire protocol.
//!
//! ## Framing
//!
//! Every message is a 4-byte big-endian length prefix followed by a 1-byte
//! id and a payload. The prefix counts the id and the payload, so a prefix
//! of zero is a keep-alive carrying neither; it must be accepted as a no-op.
//!
//! ## Message Types
//!
//! | ID | Name | Payload |
//! |----|------|---------|
//! | 0 | CHOKE | none |
//! | 1 | UNCHOKE | none |
//! | 2 | INTERESTED | none |
//! | 3 | NOT INTERESTED | none |
//! | 4 | HAVE | piece index |
//! | 5 | BITFIELD | piece availability bitmap |
//! | 6 | REQUEST | index, begin, length |
//! | 7 | PIECE | index, begin, block data |
//! | 8 | CANCEL | index, begin, length |
//!
//! Ids outside this table decode to [`Message::Unknown`] so they can be
//! logged and skipped without killing the connection.

use crate::error::WireError;

const MESSAGE_CHOKE: u8 = 0;
const MESSAGE_UNCHOKE: u8 = 1;
const MESSAGE_INTERESTED: u8 = 2;
const MESSAGE_NOT_INTERESTED: u8 = 3;
const MESSAGE_HAVE: u8 = 4;
const MESSAGE_BITFIELD: u8 = 5;
const MESSAGE_REQUEST: u8 = 6;
const MESSAGE_PIECE: u8 = 7;
const MESSAGE_CANCEL: u8 = 8;

/// A peer wire protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame keeping the connection open
    KeepAlive,
    /// Peer will not honor our requests
    Choke,
    /// Peer will honor our requests
    Unchoke,
    /// We want to download from the peer
    Interested,
    /// We no longer want to download from the peer
    NotInterested,
    /// Peer announces a newly available piece
    Have(u32),
    /// Peer's initial piece availability bitmap
    Bitfield(Vec<u8>),
    /// Ask the peer for a block within a piece
    Request { index: u32, begin: u32, length: u32 },
    /// A block of piece data from the peer
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Withdraw an earlier request
    Cancel { index: u32, begin: u32, length: u32 },
    /// Any id this client does not understand
    Unknown(u8),
}

impl Message {
    /// Serialize the message into a length-prefixed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let (id, payload): (u8, Vec<u8>) = match self {
            Message::KeepAlive => return vec![0; 4],
            Message::Choke => (MESSAGE_CHOKE, vec![]),
            Message::Unchoke => (MESSAGE_UNCHOKE, vec![]),
            Message::Interested => (MESSAGE_INTERESTED, vec![]),
            Message::NotInterested => (MESSAGE_NOT_INTERESTED, vec![]),
            Message::Have(index) => (MESSAGE_HAVE, index.to_be_bytes().to_vec()),
            Message::Bitfield(bits) => (MESSAGE_BITFIELD, bits.clone()),
            Message::Request {
                index,
                begin,
                length,
            } => (MESSAGE_REQUEST, encode_block_fields(*index, *begin, *length)),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                (MESSAGE_PIECE, payload)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => (MESSAGE_CANCEL, encode_block_fields(*index, *begin, *length)),
            Message::Unknown(id) => (*id, vec![]),
        };

        let mut serialized = Vec::with_capacity(4 + 1 + payload.len());
        serialized.extend_from_slice(&(1 + payload.len() as u32).to_be_bytes());
        serialized.push(id);
        serialized.extend_from_slice(&payload);
        serialized
    }

    /// Parse a frame body, the bytes following the length prefix.
    ///
    /// An empty body is the keep-alive.
    pub fn parse(body: &[u8]) -> Result<Message, WireError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = body[0];
        let payload = &body[1..];

        match id {
            MESSAGE_CHOKE => Ok(Message::Choke),
            MESSAGE_UNCHOKE => Ok(Message::Unchoke),
            MESSAGE_INTERESTED => Ok(Message::Interested),
            MESSAGE_NOT_INTERESTED => Ok(Message::NotInterested),
            MESSAGE_HAVE => {
                if payload.len() != 4 {
                    return Err(WireError::BadLength {
                        kind: "have",
                        expected: 4,
                        got: payload.len(),
                    });
                }
                Ok(Message::Have(read_u32(&payload[0..4])))
            }
            MESSAGE_BITFIELD => Ok(Message::Bitfield(payload.to_vec())),
            MESSAGE_REQUEST => {
                let (index, begin, length) = parse_block_fields("request", payload)?;
                Ok(Message::Request {
                    index,
                    begin,
                    length,
                })
            }
            MESSAGE_PIECE => {
                if payload.len() < 8 {
                    return Err(WireError::PayloadTooShort(payload.len()));
                }
                Ok(Message::Piece {
                    index: read_u32(&payload[0..4]),
                    begin: read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                })
            }
            MESSAGE_CANCEL => {
                let (index, begin, length) = parse_block_fields("cancel", payload)?;
                Ok(Message::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            id => Ok(Message::Unknown(id)),
        }
    }

    /// Human-readable name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Unknown(_) => "unknown",
        }
    }
}

/// Copy the block carried by a piece message into the piece buffer.
///
/// Rejects the message unless it is a piece message for `expected_index`
/// whose block lies entirely within `buf`. Returns the number of bytes
/// copied.
pub fn parse_piece(expected_index: u32, buf: &mut [u8], message: &Message) -> Result<usize, WireError> {
    let (index, begin, block) = match message {
        Message::Piece {
            index,
            begin,
            block,
        } => (*index, *begin as usize, block.as_slice()),
        other => {
            return Err(WireError::UnexpectedMessage {
                expected: "piece",
                got: other.kind(),
            })
        }
    };

    // Check the block belongs to the piece currently being fetched
    if index != expected_index {
        return Err(WireError::WrongPieceIndex {
            expected: expected_index,
            got: index,
        });
    }

    // Check the offset falls inside the piece
    if begin >= buf.len() {
        return Err(WireError::OffsetOutOfRange {
            begin,
            piece_len: buf.len(),
        });
    }

    // Check the block does not run past the end of the piece
    if begin + block.len() > buf.len() {
        return Err(WireError::BlockOverflow {
            begin,
            block_len: block.len(),
            piece_len: buf.len(),
        });
    }

    buf[begin..begin + block.len()].copy_from_slice(block);

    Ok(block.len())
}

fn encode_block_fields(index: u32, begin: u32, length: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(12);
    payload.extend_from_slice(&index.to_be_bytes());
    payload.extend_from_slice(&begin.to_be_bytes());
    payload.extend_from_slice(&length.to_be_bytes());
    payload
}

fn parse_block_fields(kind: &'static str, payload: &[u8]) -> Result<(u32, u32, u32), WireError> {
    if payload.len() != 12 {
        return Err(WireError::BadLength {
            kind,
            expected: 12,
            got: payload.len(),
        });
    }
    Ok((
        read_u32(&payload[0..4]),
        read_u32(&payload[4..8]),
        read_u32(&payload[8..12]),
    ))
}

// Length is checked by every caller before slicing.
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: Message) {
        let serialized = message.serialize();

        // Strip the length prefix and check it against the body
        let declared = u32::from_be_bytes([
            serialized[0],
            serialized[1],
            serialized[2],
            serialized[3],
        ]) as usize;
        let body = &serialized[4..];
        assert_eq!(declared, body.len());

        assert_eq!(Message::parse(body).unwrap(), message);
    }

    #[test]
    fn all_message_types_round_trip() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(vec![0b10110100, 0b01000000]));
        round_trip(Message::Request {
            index: 3,
            begin: 16384,
            length: 16384,
        });
        round_trip(Message::Piece {
            index: 3,
            begin: 16384,
            block: vec![0xEE; 64],
        });
        round_trip(Message::Cancel {
            index: 3,
            begin: 16384,
            length: 16384,
        });
        round_trip(Message::Unknown(20));
    }

    #[test]
    fn keep_alive_round_trips_as_an_empty_frame() {
        let serialized = Message::KeepAlive.serialize();

        assert_eq!(serialized, vec![0; 4]);
        assert_eq!(Message::parse(&[]).unwrap(), Message::KeepAlive);
    }

    #[test]
    fn parse_rejects_a_have_payload_of_the_wrong_length() {
        let body = [MESSAGE_HAVE, 0, 0, 1];

        assert!(matches!(
            Message::parse(&body),
            Err(WireError::BadLength { kind: "have", .. })
        ));
    }

    #[test]
    fn parse_rejects_a_short_request_payload() {
        let body = [MESSAGE_REQUEST, 0, 0, 0, 1, 0, 0];

        assert!(matches!(
            Message::parse(&body),
            Err(WireError::BadLength {
                kind: "request",
                ..
            })
        ));
    }

    #[test]
    fn parse_rejects_a_piece_payload_under_eight_bytes() {
        let body = [MESSAGE_PIECE, 0, 0, 0, 1, 0, 0];

        assert!(matches!(
            Message::parse(&body),
            Err(WireError::PayloadTooShort(6))
        ));
    }

    #[test]
    fn unknown_ids_are_representable() {
        let body = [99, 1, 2, 3];

        assert_eq!(Message::parse(&body).unwrap(), Message::Unknown(99));
    }

    #[test]
    fn parse_piece_copies_the_block_at_its_offset() {
        let mut buf = vec![0; 8];
        let message = Message::Piece {
            index: 1,
            begin: 4,
            block: vec![9, 9, 9, 9],
        };

        let n = parse_piece(1, &mut buf, &message).unwrap();

        assert_eq!(n, 4);
        assert_eq!(buf, vec![0, 0, 0, 0, 9, 9, 9, 9]);
    }

    #[test]
    fn parse_piece_rejects_a_message_that_is_not_a_piece() {
        let mut buf = vec![0; 8];

        assert!(matches!(
            parse_piece(1, &mut buf, &Message::Have(1)),
            Err(WireError::UnexpectedMessage {
                expected: "piece",
                got: "have",
            })
        ));
    }

    #[test]
    fn parse_piece_rejects_a_mismatched_index() {
        let mut buf = vec![0; 8];
        let message = Message::Piece {
            index: 2,
            begin: 0,
            block: vec![1],
        };

        assert!(matches!(
            parse_piece(1, &mut buf, &message),
            Err(WireError::WrongPieceIndex {
                expected: 1,
                got: 2,
            })
        ));
    }

    #[test]
    fn parse_piece_rejects_an_offset_outside_the_piece() {
        let mut buf = vec![0; 8];
        let message = Message::Piece {
            index: 1,
            begin: 8,
            block: vec![1],
        };

        assert!(matches!(
            parse_piece(1, &mut buf, &message),
            Err(WireError::OffsetOutOfRange {
                begin: 8,
                piece_len: 8,
            })
        ));
    }

    #[test]
    fn parse_piece_rejects_a_block_overflowing_the_piece() {
        let mut buf = vec![0; 8];
        let message = Message::Piece {
            index: 1,
            begin: 6,
            block: vec![1, 2, 3, 4],
        };

        assert!(matches!(
            parse_piece(1, &mut buf, &message),
            Err(WireError::BlockOverflow {
                begin: 6,
                block_len: 4,
                piece_len: 8,
            })
        ));
    }

    #[test]
    fn parse_piece_leaves_the_buffer_untouched_on_rejection() {
        let mut buf = vec![7; 8];
        let message = Message::Piece {
            index: 1,
            begin: 6,
            block: vec![1, 2, 3, 4],
        };

        let _ = parse_piece(1, &mut buf, &message);

        assert_eq!(buf, vec![7; 8]);
    }
}
