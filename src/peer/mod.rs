mod message;
mod session;

pub use message::{BlockInfo, PeerMessage};
pub use session::PeerSession;

use crate::error::{DownpourError, Result};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Stable, process-unique peer identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

impl PeerId {
    /// Allocate the next identity
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// An inbound wire message tagged with the peer that sent it
#[derive(Debug, Clone)]
pub struct PeerEvent {
    pub peer: PeerId,
    pub message: PeerMessage,
}

/// Outbound half of a peer session, held by the coordinator and downloaders
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: PeerId,
    addr: SocketAddr,
    messages: mpsc::Sender<PeerMessage>,
}

impl PeerHandle {
    pub(crate) fn new(id: PeerId, addr: SocketAddr, messages: mpsc::Sender<PeerMessage>) -> Self {
        Self { id, addr, messages }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Queue an outbound message; fails once the session has terminated
    pub async fn send(&self, message: PeerMessage) -> Result<()> {
        self.messages
            .send(message)
            .await
            .map_err(|_| DownpourError::PeerError(format!("{} is gone", self.id)))
    }

    /// Queue an outbound message without waiting; used for best-effort
    /// sends (cancels, have broadcasts) that may be dropped under pressure
    pub fn try_send(&self, message: PeerMessage) -> Result<()> {
        self.messages
            .try_send(message)
            .map_err(|_| DownpourError::PeerError(format!("{} is not accepting messages", self.id)))
    }
}

/// Observable per-peer state tracked by the coordinator.
///
/// `optimistic_unchoked` and `snubbed` are owned by the upload-policy
/// subsystem; the core reads them for tie-breaking only.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Whether we are choking the peer
    pub am_choking: bool,
    /// Whether we are interested in the peer
    pub am_interested: bool,
    /// Whether the peer is choking us
    pub peer_choking: bool,
    /// Whether the peer is interested in us
    pub peer_interested: bool,
    pub optimistic_unchoked: bool,
    /// Peer has been delivering blocks too slowly
    pub snubbed: bool,
    /// Bytes downloaded in the current rate window
    pub window_bytes: u64,
    /// Download rate over the last completed window, bytes per second
    pub download_rate: f64,
    /// Pieces this peer allows us to request while choked
    pub allowed_fast: HashSet<u32>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            optimistic_unchoked: false,
            snubbed: false,
            window_bytes: 0,
            download_rate: 0.0,
            allowed_fast: HashSet::new(),
        }
    }
}
