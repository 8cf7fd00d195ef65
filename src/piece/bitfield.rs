use crate::error::{DownpourError, Result};

/// Local piece possession, one bit per piece, MSB of byte 0 = piece 0.
///
/// Bits are only ever set, never cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
    count: usize,
}

impl Bitfield {
    pub fn new(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; (num_pieces + 7) / 8],
            num_pieces,
            count: 0,
        }
    }

    /// Parse a wire-format bitfield, validating length and spare bits
    pub fn from_bytes(data: &[u8], num_pieces: usize) -> Result<Self> {
        if data.len() != (num_pieces + 7) / 8 {
            return Err(DownpourError::ProtocolError(format!(
                "Bitfield length {} does not match {} pieces",
                data.len(),
                num_pieces
            )));
        }

        // Spare bits past the last piece must be zero
        if num_pieces % 8 != 0 {
            if let Some(last) = data.last() {
                let spare = last & (0xffu8 >> (num_pieces % 8));
                if spare != 0 {
                    return Err(DownpourError::ProtocolError(
                        "Bitfield has spare bits set".to_string(),
                    ));
                }
            }
        }

        let count = data.iter().map(|b| b.count_ones() as usize).sum();
        Ok(Self {
            bits: data.to_vec(),
            num_pieces,
            count,
        })
    }

    pub fn set(&mut self, piece_index: u32) {
        let byte_index = piece_index as usize / 8;
        let bit = 0x80u8 >> (piece_index % 8);
        if byte_index < self.bits.len() && self.bits[byte_index] & bit == 0 {
            self.bits[byte_index] |= bit;
            self.count += 1;
        }
    }

    pub fn has(&self, piece_index: u32) -> bool {
        let byte_index = piece_index as usize / 8;
        let bit = 0x80u8 >> (piece_index % 8);
        byte_index < self.bits.len() && self.bits[byte_index] & bit != 0
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn len(&self) -> usize {
        self.num_pieces
    }

    pub fn is_empty(&self) -> bool {
        self.num_pieces == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.num_pieces
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Indices of pieces present in this bitfield
    pub fn set_pieces(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.num_pieces as u32).filter(|&i| self.has(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_is_piece_zero() {
        let bf = Bitfield::from_bytes(&[0b1000_0000], 8).unwrap();
        assert!(bf.has(0));
        assert!(!bf.has(1));
        assert_eq!(bf.count(), 1);
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut bf = Bitfield::new(10);
        bf.set(3);
        bf.set(3);
        assert_eq!(bf.count(), 1);
        assert!(bf.has(3));
    }

    #[test]
    fn test_full_detection() {
        let mut bf = Bitfield::new(3);
        for i in 0..3 {
            assert!(!bf.is_full());
            bf.set(i);
        }
        assert!(bf.is_full());
    }

    #[test]
    fn test_empty_bitfield_is_full() {
        let bf = Bitfield::new(0);
        assert!(bf.is_full());
    }

    #[test]
    fn test_rejects_spare_bits() {
        assert!(Bitfield::from_bytes(&[0b1111_1111], 7).is_err());
        assert!(Bitfield::from_bytes(&[0b1111_1110], 7).is_ok());
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(Bitfield::from_bytes(&[0, 0], 8).is_err());
    }

    #[test]
    fn test_set_pieces() {
        let bf = Bitfield::from_bytes(&[0b1010_0000], 8).unwrap();
        let set: Vec<u32> = bf.set_pieces().collect();
        assert_eq!(set, vec![0, 2]);
    }
}
