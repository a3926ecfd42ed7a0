//! Wrapper types around Bitvec.
use std::sync::RwLock;

use bitvec::prelude::*;

/// Bitfield where index = piece. Bit 7 (MSB) of byte 0 is piece 0, exactly
/// the layout of the wire `bitfield` message.
pub type Bitfield = BitVec<u8, Msb0>;

/// Reserved bytes exchanged during handshake.
#[derive(Debug, Clone, Default, Copy, PartialEq, Eq)]
pub struct Reserved(pub [u8; 8]);

impl From<[u8; 8]> for Reserved {
    fn from(value: [u8; 8]) -> Self {
        Self(value)
    }
}

impl Reserved {
    /// Reserved bits of protocols that the client supports.
    /// We only support the extension protocol, bit 0x10 of byte 5.
    pub fn supported() -> Reserved {
        let mut r = [0u8; 8];
        r[5] |= 0x10;
        Reserved(r)
    }

    pub fn supports_extended(&self) -> bool {
        self.0[5] & 0x10 == 0x10
    }
}

pub trait BitfieldExt {
    /// Set the bit at `index`. Writes past the current capacity are a no-op,
    /// never an error; the bitfield does not grow on write.
    fn set_piece(&mut self, index: usize);

    /// Test the bit at `index`; false past the capacity.
    fn has_piece(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn set_piece(&mut self, index: usize) {
        if index < self.len() {
            self.set(index, true);
        }
    }

    fn has_piece(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

/// The completion bitfield of the local torrent, shared by the scheduler and
/// every peer task. Reads are concurrent, writes exclusive.
#[derive(Debug)]
pub struct SharedBitfield {
    inner: RwLock<Bitfield>,
}

impl SharedBitfield {
    /// An all-zero bitfield with one bit per piece.
    pub fn with_capacity(num_pieces: usize) -> Self {
        Self { inner: RwLock::new(bitvec![u8, Msb0; 0; num_pieces]) }
    }

    pub fn from_bitfield(bitfield: Bitfield) -> Self {
        Self { inner: RwLock::new(bitfield) }
    }

    pub fn set_piece(&self, index: usize) {
        self.inner.write().unwrap().set_piece(index);
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.inner.read().unwrap().has_piece(index)
    }

    /// Append one byte worth of bits, used while incrementally building the
    /// bitfield during startup verification.
    pub fn append_byte(&self, byte: u8) {
        self.inner.write().unwrap().extend_from_raw_slice(&[byte]);
    }

    /// Grow (or shrink) to exactly `num_pieces` bits, zero-filling.
    pub fn extend_to_capacity(&self, num_pieces: usize) {
        self.inner.write().unwrap().resize(num_pieces, false);
    }

    pub fn count_ones(&self) -> usize {
        self.inner.read().unwrap().count_ones()
    }

    pub fn is_complete(&self) -> bool {
        let bf = self.inner.read().unwrap();
        bf.count_ones() == bf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().count_ones() == 0
    }

    /// Bulk copy-out, used when advertising the bitfield to a new peer.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.read().unwrap().clone().into_vec()
    }

    pub fn snapshot(&self) -> Bitfield {
        self.inner.read().unwrap().clone()
    }
}
