mod bitfield;
mod picker;
mod store;

pub use bitfield::Bitfield;
pub use picker::{PieceCandidate, PiecePicker, RarestFirstPicker, SequentialPicker};
pub use store::{AppendOutcome, FileSpec, PieceStore};

/// Standard block size (16 KiB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Immutable description of a single piece
#[derive(Debug, Clone)]
pub struct PieceInfo {
    pub index: u32,
    pub length: u32,
    pub hash: [u8; 20],
}

impl PieceInfo {
    /// Number of blocks needed to cover this piece
    pub fn block_count(&self) -> usize {
        ((self.length + BLOCK_SIZE - 1) / BLOCK_SIZE) as usize
    }
}

/// Piece layout of a torrent, built once from the metainfo piece list
#[derive(Debug, Clone)]
pub struct PieceMap {
    pieces: Vec<PieceInfo>,
    piece_length: u64,
    total_length: u64,
}

impl PieceMap {
    pub fn new(piece_length: u64, total_length: u64, hashes: Vec<[u8; 20]>) -> Self {
        let num_pieces = hashes.len();
        let mut pieces = Vec::with_capacity(num_pieces);

        for (index, hash) in hashes.into_iter().enumerate() {
            let length = if index == num_pieces - 1 {
                // Last piece might be smaller
                let remainder = total_length % piece_length;
                if remainder == 0 {
                    piece_length
                } else {
                    remainder
                }
            } else {
                piece_length
            };

            pieces.push(PieceInfo {
                index: index as u32,
                length: length as u32,
                hash,
            });
        }

        Self {
            pieces,
            piece_length,
            total_length,
        }
    }

    pub fn len(&self) -> usize {
        self.pieces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&PieceInfo> {
        self.pieces.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PieceInfo> {
        self.pieces.iter()
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Global byte offset at which a piece starts
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_lengths() {
        let map = PieceMap::new(32, 100, vec![[0u8; 20]; 4]);
        let lengths: Vec<u32> = map.iter().map(|p| p.length).collect();
        assert_eq!(lengths, vec![32, 32, 32, 4]);
    }

    #[test]
    fn test_exact_multiple_keeps_full_last_piece() {
        let map = PieceMap::new(32, 96, vec![[0u8; 20]; 3]);
        assert_eq!(map.get(2).unwrap().length, 32);
    }

    #[test]
    fn test_block_count_rounds_up() {
        let piece = PieceInfo {
            index: 0,
            length: BLOCK_SIZE * 2 + 1,
            hash: [0u8; 20],
        };
        assert_eq!(piece.block_count(), 3);
    }

    #[test]
    fn test_empty_map() {
        let map = PieceMap::new(32, 0, Vec::new());
        assert!(map.is_empty());
        assert_eq!(map.len(), 0);
    }
}
