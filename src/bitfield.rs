//! # Piece Availability Bitfield
//!
//! Compact bitmap recording which pieces a remote peer claims to have.
//!
//! Each byte covers 8 pieces, most significant bit first: bit 7 of byte 0 is
//! piece 0, bit 0 of byte 0 is piece 7, and so on. Spare bits at the end of
//! the last byte are zero.
//!
//! Peers may legitimately send a bitfield shorter than the torrent's piece
//! count, and stale `Have` notifications can carry indices past its end.
//! Lookups outside the bitmap therefore answer `false` and updates outside
//! the bitmap are ignored, never treated as an error.

/// A peer's claimed piece availability, owned by that peer's session.
#[derive(Debug, Default, Clone)]
pub struct Bitfield {
    bits: Vec<u8>,
}

impl From<Vec<u8>> for Bitfield {
    fn from(bits: Vec<u8>) -> Bitfield {
        Bitfield { bits }
    }
}

impl Bitfield {
    /// Returns whether the peer claims to have a piece.
    ///
    /// An index past the end of the bitmap is simply not claimed.
    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        match self.bits.get(byte_index) {
            Some(byte) => byte >> (7 - offset) & 1 != 0,
            None => false,
        }
    }

    /// Records a piece announced by the peer.
    ///
    /// An index past the end of the bitmap is ignored.
    pub fn set_piece(&mut self, index: u32) {
        let byte_index = (index / 8) as usize;
        let offset = index % 8;

        if let Some(byte) = self.bits.get_mut(byte_index) {
            *byte |= 1 << (7 - offset);
        }
    }
}
