/// A schedulable piece: its index and how many peers advertise it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceCandidate {
    pub index: u32,
    pub owners: usize,
}

/// Selects which piece to download next
///
/// Candidates are the incomplete pieces that have at least one advertising
/// peer and no downloader in flight, in ascending index order.
pub trait PiecePicker: Send + Sync {
    fn pick(&mut self, candidates: &[PieceCandidate]) -> Option<u32>;
}

/// Picks pieces in ascending index order
#[derive(Debug, Default)]
pub struct SequentialPicker;

impl PiecePicker for SequentialPicker {
    fn pick(&mut self, candidates: &[PieceCandidate]) -> Option<u32> {
        candidates.first().map(|c| c.index)
    }
}

/// Picks the piece advertised by the fewest peers, ties broken by index
#[derive(Debug, Default)]
pub struct RarestFirstPicker;

impl PiecePicker for RarestFirstPicker {
    fn pick(&mut self, candidates: &[PieceCandidate]) -> Option<u32> {
        let mut best: Option<&PieceCandidate> = None;

        for candidate in candidates {
            match best {
                Some(b) if candidate.owners >= b.owners => {}
                _ => best = Some(candidate),
            }
        }

        best.map(|c| c.index)
    }
}
