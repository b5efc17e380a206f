//! Piece-availability bitfield.
//!
//! Bit `i` lives at byte `i / 8`, masked by `0x80 >> (i % 8)` — the first
//! piece is the most significant bit of the first byte. This matches the
//! wire-level `BITFIELD` payload exactly, so `to_bytes`/`from_bytes` never
//! need to shuffle bits around.

use bitvec::prelude::{BitVec, Msb0};

use crate::error::{Error, Result};
use crate::{bitfield_byte_len, PieceIndex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bitfield {
    bits: BitVec<Msb0, u8>,
}

impl Bitfield {
    /// Creates a bitfield of `num_pieces` bits, all clear.
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: bitvec::bitvec![Msb0, u8; 0; num_pieces],
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.bits.len()
    }

    /// Marks `index` as present.
    pub fn set(&mut self, index: PieceIndex) -> Result<()> {
        self.check_index(index)?;
        self.bits.set(index, true);
        Ok(())
    }

    /// Returns whether `index` is present.
    pub fn has(&self, index: PieceIndex) -> Result<bool> {
        self.check_index(index)?;
        Ok(self.bits[index])
    }

    /// Marks every piece as present. Used when a peer starts out already
    /// holding the complete file.
    pub fn set_all(&mut self) {
        self.bits.set_all(true);
    }

    /// Returns true if every piece is present.
    pub fn is_complete(&self) -> bool {
        self.bits.all()
    }

    fn check_index(&self, index: PieceIndex) -> Result<()> {
        if index >= self.bits.len() {
            Err(Error::Protocol(format!(
                "piece index {} out of range (have {} pieces)",
                index,
                self.bits.len()
            )))
        } else {
            Ok(())
        }
    }

    /// Serializes to the wire format: `ceil(num_pieces / 8)` bytes, spare
    /// high-order bits of the last byte cleared.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; bitfield_byte_len(self.bits.len())];
        for (i, mut byte) in bytes.iter_mut().enumerate() {
            let mut b = 0u8;
            for bit in 0..8 {
                let index = i * 8 + bit;
                if index < self.bits.len() && self.bits[index] {
                    b |= 0x80 >> bit;
                }
            }
            *byte = b;
        }
        bytes
    }

    /// Parses a wire-format bitfield payload for a file with `num_pieces`
    /// pieces. Fails if `data`'s length doesn't match
    /// `ceil(num_pieces / 8)`, or if any spare high-order bit of the last
    /// byte is set.
    pub fn from_bytes(num_pieces: usize, data: &[u8]) -> Result<Self> {
        let expected_len = bitfield_byte_len(num_pieces);
        if data.len() != expected_len {
            return Err(Error::Protocol(format!(
                "bitfield length {} does not match expected {} for {} pieces",
                data.len(),
                expected_len,
                num_pieces
            )));
        }
        let mut bitfield = Self::new(num_pieces);
        for index in 0..num_pieces {
            let byte = data[index / 8];
            let mask = 0x80 >> (index % 8);
            if byte & mask != 0 {
                bitfield.bits.set(index, true);
            }
        }
        // any bit beyond num_pieces in the last byte must be zero
        if expected_len > 0 {
            let spare_bits = expected_len * 8 - num_pieces;
            if spare_bits > 0 {
                let mask = 0xffu8 >> (8 - spare_bits);
                if data[expected_len - 1] & mask != 0 {
                    return Err(Error::Protocol(
                        "bitfield has non-zero spare bits".into(),
                    ));
                }
            }
        }
        Ok(bitfield)
    }

    /// Returns true if `other` has at least one piece that we don't.
    pub fn has_any_interesting(&self, other: &Self) -> bool {
        debug_assert_eq!(self.bits.len(), other.bits.len());
        self.bits
            .iter()
            .zip(other.bits.iter())
            .any(|(ours, theirs)| *theirs && !*ours)
    }

    /// Picks a uniformly random piece that `other` has, we don't, and is
    /// not in `excluded` (typically the set of already in-flight
    /// requests). Returns `None` if no such piece exists.
    pub fn pick_random_missing(
        &self,
        other: &Self,
        excluded: &std::collections::HashSet<PieceIndex>,
    ) -> Option<PieceIndex> {
        use rand::seq::SliceRandom;
        let candidates: Vec<PieceIndex> = (0..self.num_pieces())
            .filter(|&i| other.bits[i] && !self.bits[i] && !excluded.contains(&i))
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_has() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.has(3).unwrap());
        bf.set(3).unwrap();
        assert!(bf.has(3).unwrap());
        assert!(!bf.has(4).unwrap());
    }

    #[test]
    fn test_out_of_range_is_error() {
        let bf = Bitfield::new(4);
        assert!(bf.has(4).is_err());
    }

    #[test]
    fn test_msb_first_byte_order() {
        let mut bf = Bitfield::new(9);
        bf.set(0).unwrap();
        bf.set(1).unwrap();
        bf.set(8).unwrap();
        let bytes = bf.to_bytes();
        assert_eq!(bytes, vec![0b1100_0000, 0b1000_0000]);
    }

    #[test]
    fn test_round_trip() {
        let mut bf = Bitfield::new(13);
        bf.set(0).unwrap();
        bf.set(5).unwrap();
        bf.set(12).unwrap();
        let bytes = bf.to_bytes();
        let back = Bitfield::from_bytes(13, &bytes).unwrap();
        assert_eq!(bf, back);
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Bitfield::from_bytes(9, &[0, 0]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_dirty_spare_bits() {
        // 9 pieces need 2 bytes; bit 0 of the second byte (piece 8) is
        // legitimate, but any other bit in that byte is a spare bit.
        assert!(Bitfield::from_bytes(9, &[0, 0b0100_0000]).is_err());
        assert!(Bitfield::from_bytes(9, &[0, 0b1000_0000]).is_ok());
    }

    #[test]
    fn test_set_all_is_complete() {
        let mut bf = Bitfield::new(5);
        assert!(!bf.is_complete());
        bf.set_all();
        assert!(bf.is_complete());
        // no stray bits beyond num_pieces
        assert_eq!(bf.to_bytes(), vec![0b1111_1000]);
    }

    #[test]
    fn test_has_any_interesting() {
        let mut mine = Bitfield::new(4);
        let mut theirs = Bitfield::new(4);
        assert!(!mine.has_any_interesting(&theirs));
        theirs.set(2).unwrap();
        assert!(mine.has_any_interesting(&theirs));
        mine.set(2).unwrap();
        assert!(!mine.has_any_interesting(&theirs));
    }

    #[test]
    fn test_pick_random_missing_respects_exclusion() {
        let mine = Bitfield::new(3);
        let mut theirs = Bitfield::new(3);
        theirs.set(1).unwrap();
        let mut excluded = std::collections::HashSet::new();
        excluded.insert(1);
        assert_eq!(mine.pick_random_missing(&theirs, &excluded), None);
        excluded.clear();
        assert_eq!(mine.pick_random_missing(&theirs, &excluded), Some(1));
    }
}
