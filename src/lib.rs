//! Download-coordination core of a BitTorrent client.
//!
//! Given connected peers announcing piece availability, the core decides
//! which pieces to request from which peers, drives the per-piece block
//! request protocol, validates received data against the torrent's piece
//! hashes and records progress.
//!
//! The enclosing client wires it up by building a [`PieceStore`] from the
//! metainfo, spawning a [`Coordinator`] and attaching each post-handshake
//! peer transport via [`CoreHandle::attach_peer`]. Completion, progress
//! statistics and fatal errors are observed through the handle.

pub mod download;
pub mod error;
pub mod peer;
pub mod piece;

pub use download::{Completion, Coordinator, CoreHandle, DownloadConfig, SelectionPolicy, Stats};
pub use error::{DownpourError, Result};
pub use peer::{BlockInfo, PeerEvent, PeerHandle, PeerId, PeerMessage, PeerSession, PeerState};
pub use piece::{AppendOutcome, Bitfield, FileSpec, PieceInfo, PieceMap, PieceStore, BLOCK_SIZE};
