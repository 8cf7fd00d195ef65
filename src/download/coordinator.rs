use crate::download::clock::spawn_clock;
use crate::download::downloader::{
    DownloadOutcome, DownloadResult, DownloaderMsg, PieceDownloader,
};
use crate::download::{DownloadConfig, Stats};
use crate::error::{DownpourError, Result};
use crate::peer::{PeerEvent, PeerHandle, PeerId, PeerMessage, PeerSession, PeerState};
use crate::piece::{Bitfield, PieceCandidate, PieceInfo, PiecePicker, PieceStore};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const EVENTS_CAPACITY: usize = 256;
const DOWNLOADER_INBOX_CAPACITY: usize = 64;

/// Messages buffered for a peer whose registration has not landed yet
const EARLY_BUFFER_LIMIT: usize = 64;

/// Per-piece coordination record
struct PieceSlot {
    piece: PieceInfo,
    /// Peers known to have this piece
    having: HashSet<PeerId>,
}

struct PeerRecord {
    session: PeerSession,
    handle: PeerHandle,
    state: PeerState,
}

struct ActiveDownload {
    peer: PeerId,
    inbox: mpsc::Sender<DownloaderMsg>,
}

/// In-flight downloads, keyed by piece index.
///
/// Shared with downloader tasks, which deregister themselves on retirement;
/// the lock is never held across an await and nothing sends under it. A
/// hash-mismatch penalty is recorded in the same critical section as the
/// deregistration, so the scheduler can never re-pick the offending peer
/// for that piece.
#[derive(Default)]
struct DownloadTable {
    active: HashMap<u32, ActiveDownload>,
    /// Per piece, the peers whose data failed that piece's hash
    penalized: HashMap<u32, HashSet<PeerId>>,
}

pub(crate) enum Command {
    AddPeer(PeerSession),
    Stats(oneshot::Sender<Stats>),
}

/// The channels the coordinator selects over
struct Inputs {
    ticks_rx: mpsc::Receiver<()>,
    events_rx: mpsc::Receiver<PeerEvent>,
    disconnects_rx: mpsc::Receiver<PeerId>,
    outcomes_rx: mpsc::Receiver<DownloadOutcome>,
    commands_rx: mpsc::Receiver<Command>,
    stop_rx: watch::Receiver<bool>,
}

/// Single-owner download scheduler.
///
/// Consumes the peer-event fan-in, maintains the availability index, picks
/// the next (piece, peer) pair under the parallelism cap and drives piece
/// downloaders to completion. All shared tables are mutated only here, apart
/// from the download registry downloaders deregister from.
pub struct Coordinator {
    config: DownloadConfig,
    store: Arc<PieceStore>,
    picker: Box<dyn PiecePicker>,
    slots: Vec<PieceSlot>,
    peers: HashMap<PeerId, PeerRecord>,
    early: HashMap<PeerId, Vec<PeerMessage>>,
    /// Peers the core itself observed timing out block requests. Kept apart
    /// from `PeerState::snubbed`, which the upload-policy subsystem owns.
    snubbed: HashSet<PeerId>,
    downloads: Arc<Mutex<DownloadTable>>,
    outcomes_tx: mpsc::Sender<DownloadOutcome>,
    errors_tx: mpsc::Sender<DownpourError>,
    completion_tx: watch::Sender<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
    last_tick: Instant,
}

impl Coordinator {
    /// Spawn the coordinator and its scheduling clock.
    pub fn spawn(config: DownloadConfig, store: Arc<PieceStore>) -> CoreHandle {
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);
        let (disconnects_tx, disconnects_rx) = mpsc::channel(64);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (ticks_tx, ticks_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (completion_tx, completion_rx) = watch::channel(false);
        let (errors_tx, errors_rx) = mpsc::channel(8);
        let stop_tx = Arc::new(stop_tx);

        spawn_clock(config.tick_interval, ticks_tx, stop_rx.clone());

        let slots = store
            .piece_map()
            .iter()
            .cloned()
            .map(|piece| PieceSlot {
                piece,
                having: HashSet::new(),
            })
            .collect();

        let keep_alive = config.keep_alive_interval;
        let coordinator = Coordinator {
            picker: config.selection.picker(),
            config,
            store,
            slots,
            peers: HashMap::new(),
            early: HashMap::new(),
            snubbed: HashSet::new(),
            downloads: Arc::new(Mutex::new(DownloadTable::default())),
            outcomes_tx,
            errors_tx,
            completion_tx,
            stop_tx: Arc::clone(&stop_tx),
            stop_rx: stop_rx.clone(),
            last_tick: Instant::now(),
        };

        let inputs = Inputs {
            ticks_rx,
            events_rx,
            disconnects_rx,
            outcomes_rx,
            commands_rx,
            stop_rx,
        };
        tokio::spawn(coordinator.run(inputs));

        CoreHandle {
            commands: commands_tx,
            events: events_tx,
            disconnects: disconnects_tx,
            stop: stop_tx,
            completion: completion_rx,
            errors: Some(errors_rx),
            keep_alive,
        }
    }

    async fn run(mut self, mut inputs: Inputs) {
        info!(
            "Download coordinator running: {} pieces, {} parallel downloads",
            self.slots.len(),
            self.config.parallel_piece_downloads
        );

        loop {
            tokio::select! {
                Some(()) = inputs.ticks_rx.recv() => self.on_tick(),
                Some(event) = inputs.events_rx.recv() => {
                    self.handle_message(event.peer, event.message).await;
                }
                Some(peer) = inputs.disconnects_rx.recv() => self.retire_peer(peer).await,
                Some(outcome) = inputs.outcomes_rx.recv() => self.on_outcome(outcome).await,
                Some(command) = inputs.commands_rx.recv() => self.on_command(command).await,
                _ = inputs.stop_rx.changed() => break,
                else => break,
            }
        }

        self.shutdown().await;
    }

    fn on_tick(&mut self) {
        let elapsed = self.last_tick.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            for record in self.peers.values_mut() {
                record.state.download_rate = record.state.window_bytes as f64 / elapsed;
                record.state.window_bytes = 0;
            }
        }
        self.last_tick = Instant::now();

        self.maybe_complete();
        self.schedule();
    }

    fn schedule(&mut self) {
        loop {
            let active = self.downloads.lock().unwrap().active.len();
            if active >= self.config.parallel_piece_downloads {
                break;
            }
            let Some((piece_index, peer)) = self.next_download() else {
                break;
            };
            self.spawn_download(piece_index, peer);
        }
    }

    /// Pick the next (piece, peer) pair, or `None` when nothing is schedulable
    fn next_download(&mut self) -> Option<(u32, PeerId)> {
        let bitfield = self.store.bitfield();
        let mut candidates: Vec<PieceCandidate> = {
            let table = self.downloads.lock().unwrap();
            self.slots
                .iter()
                .filter(|slot| !bitfield.has(slot.piece.index))
                .filter(|slot| !table.active.contains_key(&slot.piece.index))
                .filter(|slot| !slot.having.is_empty())
                .map(|slot| PieceCandidate {
                    index: slot.piece.index,
                    owners: slot.having.len(),
                })
                .collect()
        };

        loop {
            let piece_index = self.picker.pick(&candidates)?;
            if let Some(peer) = self.choose_peer(piece_index) {
                return Some((piece_index, peer));
            }
            // No usable peer for this piece; drop it and ask again
            candidates.retain(|c| c.index != piece_index);
        }
    }

    /// Best peer for a piece: unchoked over choked, then faster, then not
    /// snubbed, then lowest id for determinism
    fn choose_peer(&self, piece_index: u32) -> Option<PeerId> {
        let slot = self.slots.get(piece_index as usize)?;
        let penalized = {
            let table = self.downloads.lock().unwrap();
            table.penalized.get(&piece_index).cloned().unwrap_or_default()
        };
        let mut best: Option<(bool, f64, bool, PeerId)> = None;

        for peer in &slot.having {
            if penalized.contains(peer) {
                continue;
            }
            let Some(record) = self.peers.get(peer) else {
                continue;
            };
            let slow = record.state.snubbed || self.snubbed.contains(peer);
            let key = (
                !record.state.peer_choking,
                record.state.download_rate,
                !slow,
                *peer,
            );
            let preferred = match best {
                None => true,
                Some(b) => {
                    if key.0 != b.0 {
                        key.0
                    } else if key.1 != b.1 {
                        key.1 > b.1
                    } else if key.2 != b.2 {
                        key.2
                    } else {
                        key.3 < b.3
                    }
                }
            };
            if preferred {
                best = Some(key);
            }
        }

        best.map(|(_, _, _, peer)| peer)
    }

    fn spawn_download(&mut self, piece_index: u32, peer_id: PeerId) {
        let Some(record) = self.peers.get(&peer_id) else {
            return;
        };
        let Some(slot) = self.slots.get(piece_index as usize) else {
            return;
        };

        let (inbox_tx, inbox_rx) = mpsc::channel(DOWNLOADER_INBOX_CAPACITY);
        self.downloads.lock().unwrap().active.insert(
            piece_index,
            ActiveDownload {
                peer: peer_id,
                inbox: inbox_tx,
            },
        );

        let downloader = PieceDownloader::new(
            slot.piece.clone(),
            record.handle.clone(),
            Arc::clone(&self.store),
            inbox_rx,
            self.stop_rx.clone(),
            self.config.pipeline_depth,
            self.config.block_timeout,
            record.state.peer_choking,
            record.state.allowed_fast.contains(&piece_index),
        );

        debug!("Downloading piece {} from {}", piece_index, peer_id);

        let outcomes = self.outcomes_tx.clone();
        let downloads = Arc::clone(&self.downloads);
        tokio::spawn(async move {
            let outcome = downloader.run().await;
            {
                let mut table = downloads.lock().unwrap();
                // Retirement may already have deregistered this entry, or a
                // successor may hold the slot; remove only our own binding.
                if table.active.get(&outcome.piece).map(|a| a.peer) == Some(outcome.peer) {
                    table.active.remove(&outcome.piece);
                }
                match outcome.result {
                    DownloadResult::HashMismatch => {
                        table
                            .penalized
                            .entry(outcome.piece)
                            .or_default()
                            .insert(outcome.peer);
                    }
                    DownloadResult::Stored => {
                        table.penalized.remove(&outcome.piece);
                    }
                    _ => {}
                }
            }
            let _ = outcomes.send(outcome).await;
        });
    }

    async fn handle_message(&mut self, peer: PeerId, message: PeerMessage) {
        if !self.peers.contains_key(&peer) {
            let buffered = self.early.entry(peer).or_default();
            if buffered.len() < EARLY_BUFFER_LIMIT {
                buffered.push(message);
            } else {
                warn!("Dropping message from unregistered {}", peer);
            }
            return;
        }

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Have { piece_index } => {
                self.add_availability(peer, piece_index).await;
            }
            PeerMessage::Bitfield { bitfield } => {
                match Bitfield::from_bytes(&bitfield, self.slots.len()) {
                    Ok(bits) => {
                        for piece_index in bits.set_pieces() {
                            if let Some(slot) = self.slots.get_mut(piece_index as usize) {
                                slot.having.insert(peer);
                            }
                        }
                        self.update_interest(peer).await;
                    }
                    Err(e) => warn!("{} sent an invalid bitfield: {}", peer, e),
                }
            }
            PeerMessage::HaveAll => {
                for slot in &mut self.slots {
                    slot.having.insert(peer);
                }
                self.update_interest(peer).await;
            }
            PeerMessage::HaveNone => self.clear_availability(peer),
            PeerMessage::Choke => self.set_peer_choking(peer, true).await,
            PeerMessage::Unchoke => self.set_peer_choking(peer, false).await,
            PeerMessage::Interested => {
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.state.peer_interested = true;
                }
            }
            PeerMessage::NotInterested => {
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.state.peer_interested = false;
                }
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.state.window_bytes += data.len() as u64;
                }
                let delivered = self
                    .forward(piece_index, peer, DownloaderMsg::Block { offset, data })
                    .await;
                if !delivered {
                    debug!(
                        "Dropping unsolicited block {}+{} from {}",
                        piece_index, offset, peer
                    );
                }
            }
            PeerMessage::RejectRequest { block } => {
                self.forward(
                    block.piece_index,
                    peer,
                    DownloaderMsg::Rejected {
                        offset: block.offset,
                    },
                )
                .await;
            }
            PeerMessage::AllowedFast { piece_index } => {
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.state.allowed_fast.insert(piece_index);
                }
                self.forward(piece_index, peer, DownloaderMsg::AllowedFast)
                    .await;
            }
            PeerMessage::SuggestPiece { piece_index } => {
                debug!("{} suggests piece {}", peer, piece_index);
            }
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => {
                // Upload traffic belongs to the serving subsystem
                debug!("Ignoring upload request from {}", peer);
            }
            PeerMessage::Extended { id, .. } => {
                debug!("Ignoring extension message {} from {}", id, peer);
            }
        }
    }

    async fn add_availability(&mut self, peer: PeerId, piece_index: u32) {
        let Some(slot) = self.slots.get_mut(piece_index as usize) else {
            warn!("{} announced invalid piece {}", peer, piece_index);
            return;
        };
        slot.having.insert(peer);
        self.update_interest(peer).await;
    }

    /// Remove a peer from every availability set and cancel its downloads
    /// (a requested peer must remain an owner of the piece)
    fn clear_availability(&mut self, peer: PeerId) {
        for slot in &mut self.slots {
            slot.having.remove(&peer);
        }

        let cancelled: Vec<u32> = {
            let mut table = self.downloads.lock().unwrap();
            let pieces: Vec<u32> = table
                .active
                .iter()
                .filter(|(_, active)| active.peer == peer)
                .map(|(piece, _)| *piece)
                .collect();
            for piece in &pieces {
                table.active.remove(piece);
            }
            pieces
        };
        for piece in cancelled {
            debug!("Cancelled piece {} download: {} lost the piece", piece, peer);
        }
    }

    /// Announce interest once a peer owns a piece we lack
    async fn update_interest(&mut self, peer: PeerId) {
        let bitfield = self.store.bitfield();
        let wanted = self
            .slots
            .iter()
            .any(|slot| slot.having.contains(&peer) && !bitfield.has(slot.piece.index));

        let Some(record) = self.peers.get_mut(&peer) else {
            return;
        };
        if wanted && !record.state.am_interested {
            record.state.am_interested = true;
            if record.handle.send(PeerMessage::Interested).await.is_err() {
                debug!("Could not tell {} we are interested", peer);
            }
        }
    }

    async fn set_peer_choking(&mut self, peer: PeerId, choking: bool) {
        if let Some(record) = self.peers.get_mut(&peer) {
            record.state.peer_choking = choking;
        }

        // The peer's downloaders observe the transition on their own channels
        let inboxes: Vec<mpsc::Sender<DownloaderMsg>> = {
            let table = self.downloads.lock().unwrap();
            table
                .active
                .values()
                .filter(|active| active.peer == peer)
                .map(|active| active.inbox.clone())
                .collect()
        };
        for inbox in inboxes {
            let msg = if choking {
                DownloaderMsg::Choked
            } else {
                DownloaderMsg::Unchoked
            };
            let _ = inbox.send(msg).await;
        }
    }

    /// Deliver a message to the downloader bound to (piece, peer), if any
    async fn forward(&self, piece_index: u32, peer: PeerId, msg: DownloaderMsg) -> bool {
        let inbox = {
            let table = self.downloads.lock().unwrap();
            table
                .active
                .get(&piece_index)
                .filter(|active| active.peer == peer)
                .map(|active| active.inbox.clone())
        };
        match inbox {
            Some(inbox) => {
                let _ = inbox.send(msg).await;
                true
            }
            None => false,
        }
    }

    async fn retire_peer(&mut self, peer: PeerId) {
        self.early.remove(&peer);
        self.snubbed.remove(&peer);
        let Some(mut record) = self.peers.remove(&peer) else {
            return;
        };

        for slot in &mut self.slots {
            slot.having.remove(&peer);
        }

        let cancelled: Vec<u32> = {
            let mut table = self.downloads.lock().unwrap();
            let pieces: Vec<u32> = table
                .active
                .iter()
                .filter(|(_, active)| active.peer == peer)
                .map(|(piece, _)| *piece)
                .collect();
            for piece in &pieces {
                table.active.remove(piece);
            }
            pieces
        };
        for piece in cancelled {
            debug!("Cancelled piece {} download: {} disconnected", piece, peer);
        }

        record.session.close().await;
        info!("{} retired", peer);
    }

    async fn on_outcome(&mut self, outcome: DownloadOutcome) {
        if outcome.snubbed {
            self.snubbed.insert(outcome.peer);
        }

        match outcome.result {
            DownloadResult::Stored => {
                info!(
                    "Piece {} complete ({}/{})",
                    outcome.piece,
                    self.store.complete_count(),
                    self.slots.len()
                );
                self.announce_have(outcome.piece);
                self.maybe_complete();
            }
            DownloadResult::HashMismatch => {
                // The penalty was recorded when the downloader deregistered
                warn!(
                    "Piece {} from {} failed verification",
                    outcome.piece, outcome.peer
                );
            }
            DownloadResult::PeerGone => {
                debug!("Piece {} download lost its peer", outcome.piece);
            }
            DownloadResult::Stopped => {
                debug!("Piece {} download stopped", outcome.piece);
            }
            DownloadResult::Io(e) => {
                error!("Storage failure on piece {}: {}", outcome.piece, e);
                let _ = self.errors_tx.send(e).await;
                let _ = self.stop_tx.send(true);
            }
        }
    }

    /// Tell every connected peer we now have this piece
    fn announce_have(&self, piece_index: u32) {
        for record in self.peers.values() {
            let _ = record
                .handle
                .try_send(PeerMessage::Have { piece_index });
        }
    }

    fn maybe_complete(&mut self) {
        if !*self.completion_tx.borrow() && self.store.is_complete() {
            info!("All {} pieces validated", self.slots.len());
            let _ = self.completion_tx.send(true);
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::AddPeer(session) => self.register_peer(session).await,
            Command::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn register_peer(&mut self, session: PeerSession) {
        let id = session.id();
        let handle = session.handle();
        info!("Registered {} at {}", id, session.addr());
        self.peers.insert(
            id,
            PeerRecord {
                session,
                handle,
                state: PeerState::default(),
            },
        );

        // Events that raced the registration
        if let Some(buffered) = self.early.remove(&id) {
            for message in buffered {
                self.handle_message(id, message).await;
            }
        }
    }

    fn stats(&self) -> Stats {
        Stats {
            pieces_complete: self.store.complete_count(),
            pieces_total: self.slots.len(),
            active_downloads: self.downloads.lock().unwrap().active.len(),
            per_peer_rate: self
                .peers
                .iter()
                .map(|(id, record)| (*id, record.state.download_rate))
                .collect(),
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.stop_tx.send(true);
        self.downloads.lock().unwrap().active.clear();

        let mut records: Vec<PeerRecord> = self.peers.drain().map(|(_, r)| r).collect();
        for record in &mut records {
            record.session.close().await;
        }

        info!("Download coordinator stopped");
    }
}

/// Close-once completion signal supporting many waiters
#[derive(Clone)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves `true` once every piece is validated, `false` if the core
    /// stopped first.
    pub async fn wait(mut self) -> bool {
        loop {
            if *self.rx.borrow() {
                return true;
            }
            if self.rx.changed().await.is_err() {
                return *self.rx.borrow();
            }
        }
    }
}

/// The enclosing torrent manager's handle to the running core
pub struct CoreHandle {
    commands: mpsc::Sender<Command>,
    events: mpsc::Sender<PeerEvent>,
    disconnects: mpsc::Sender<PeerId>,
    stop: Arc<watch::Sender<bool>>,
    completion: watch::Receiver<bool>,
    errors: Option<mpsc::Receiver<DownpourError>>,
    keep_alive: std::time::Duration,
}

impl CoreHandle {
    /// Wrap a connected, post-handshake transport in a peer session wired to
    /// the core's channels and register it.
    pub async fn attach_peer<T>(&self, addr: SocketAddr, transport: T) -> Result<PeerId>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session = PeerSession::spawn(
            addr,
            transport,
            self.events.clone(),
            self.disconnects.clone(),
            self.keep_alive,
            self.stop.subscribe(),
        );
        let id = session.id();
        self.add_peer(session).await?;
        Ok(id)
    }

    /// Register an already-spawned session
    pub async fn add_peer(&self, session: PeerSession) -> Result<()> {
        self.commands
            .send(Command::AddPeer(session))
            .await
            .map_err(|_| DownpourError::Stopped)
    }

    /// Progress snapshot
    pub async fn stats(&self) -> Result<Stats> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Stats(reply_tx))
            .await
            .map_err(|_| DownpourError::Stopped)?;
        reply_rx.await.map_err(|_| DownpourError::Stopped)
    }

    /// Completion signal; fires once when every piece is validated
    pub fn completion(&self) -> Completion {
        Completion {
            rx: self.completion.clone(),
        }
    }

    /// Fatal errors that stop the torrent. Yields the receiver once.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<DownpourError>> {
        self.errors.take()
    }

    /// Signal every task in the core to drain and exit. Idempotent.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

impl Drop for CoreHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}
