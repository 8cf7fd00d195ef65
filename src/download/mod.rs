mod clock;
mod coordinator;
mod downloader;

pub use coordinator::{Completion, Coordinator, CoreHandle};

use crate::peer::PeerId;
use crate::piece::{PiecePicker, RarestFirstPicker, SequentialPicker};
use std::collections::HashMap;
use std::time::Duration;

/// Piece-selection policy run by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Ascending piece index
    Sequential,
    /// Fewest advertising peers first, ties by index
    RarestFirst,
}

impl SelectionPolicy {
    pub(crate) fn picker(&self) -> Box<dyn PiecePicker> {
        match self {
            SelectionPolicy::Sequential => Box::new(SequentialPicker),
            SelectionPolicy::RarestFirst => Box::new(RarestFirstPicker),
        }
    }
}

/// Configuration for the download core
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Maximum number of pieces downloaded concurrently
    pub parallel_piece_downloads: usize,
    /// Outstanding block requests per downloader
    pub pipeline_depth: usize,
    /// How long a requested block may stay unanswered before it is re-queued
    pub block_timeout: Duration,
    /// Scheduling clock period
    pub tick_interval: Duration,
    /// Idle interval between keep-alive messages on a peer connection
    pub keep_alive_interval: Duration,
    pub selection: SelectionPolicy,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            parallel_piece_downloads: 4,
            pipeline_depth: 10,
            block_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            keep_alive_interval: Duration::from_secs(120),
            selection: SelectionPolicy::Sequential,
        }
    }
}

/// Read-only progress snapshot
#[derive(Debug, Clone)]
pub struct Stats {
    pub pieces_complete: usize,
    pub pieces_total: usize,
    pub active_downloads: usize,
    /// Download rate per connected peer, bytes per second
    pub per_peer_rate: HashMap<PeerId, f64>,
}
