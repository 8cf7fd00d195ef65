use crate::error::DownpourError;
use crate::peer::{BlockInfo, PeerHandle, PeerId, PeerMessage};
use crate::piece::{AppendOutcome, PieceInfo, PieceStore, BLOCK_SIZE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Events the coordinator forwards to a running downloader
#[derive(Debug)]
pub(crate) enum DownloaderMsg {
    Block { offset: u32, data: Vec<u8> },
    Choked,
    Unchoked,
    Rejected { offset: u32 },
    AllowedFast,
}

/// Terminal state of a piece download
#[derive(Debug)]
pub(crate) enum DownloadResult {
    /// Piece verified and persisted
    Stored,
    /// Assembled bytes did not match the expected hash
    HashMismatch,
    /// The peer disconnected or was retired
    PeerGone,
    /// Global stop
    Stopped,
    /// Store write failure; fatal for the torrent
    Io(DownpourError),
}

#[derive(Debug)]
pub(crate) struct DownloadOutcome {
    pub piece: u32,
    pub peer: PeerId,
    pub result: DownloadResult,
    /// The peer let requested blocks time out
    pub snubbed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    Pending,
    Requested,
    Received,
}

struct Block {
    offset: u32,
    length: u32,
    state: BlockState,
    requested_at: Option<Instant>,
}

/// Drives one piece to completion against one peer.
///
/// Requests are pipelined while the peer is not choking us (or the piece is
/// allowed-fast); choke, reject and timeout all re-queue blocks. Once every
/// block has arrived the assembled piece is offered to the store, which
/// performs the hash check.
pub(crate) struct PieceDownloader {
    piece: PieceInfo,
    peer: PeerHandle,
    store: Arc<PieceStore>,
    inbox: mpsc::Receiver<DownloaderMsg>,
    stop: watch::Receiver<bool>,
    pipeline_depth: usize,
    block_timeout: Duration,
    choked: bool,
    allowed_fast: bool,
    blocks: Vec<Block>,
    data: Vec<u8>,
    received: usize,
    requested: usize,
    snubbed: bool,
}

impl PieceDownloader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        piece: PieceInfo,
        peer: PeerHandle,
        store: Arc<PieceStore>,
        inbox: mpsc::Receiver<DownloaderMsg>,
        stop: watch::Receiver<bool>,
        pipeline_depth: usize,
        block_timeout: Duration,
        choked: bool,
        allowed_fast: bool,
    ) -> Self {
        let mut blocks = Vec::with_capacity(piece.block_count());
        let mut offset = 0u32;
        while offset < piece.length {
            let length = std::cmp::min(BLOCK_SIZE, piece.length - offset);
            blocks.push(Block {
                offset,
                length,
                state: BlockState::Pending,
                requested_at: None,
            });
            offset += length;
        }

        let data = vec![0u8; piece.length as usize];
        Self {
            piece,
            peer,
            store,
            inbox,
            stop,
            pipeline_depth,
            block_timeout,
            choked,
            allowed_fast,
            blocks,
            data,
            received: 0,
            requested: 0,
            snubbed: false,
        }
    }

    pub(crate) async fn run(mut self) -> DownloadOutcome {
        debug!(
            "Downloading piece {} from {} ({} blocks)",
            self.piece.index,
            self.peer.id(),
            self.blocks.len()
        );

        loop {
            if self.received == self.blocks.len() {
                return self.verify().await;
            }

            if !self.fill_pipeline().await {
                return self.finish(DownloadResult::PeerGone);
            }

            let deadline = self.earliest_deadline();
            tokio::select! {
                msg = self.inbox.recv() => match msg {
                    Some(DownloaderMsg::Block { offset, data }) => self.on_block(offset, data),
                    Some(DownloaderMsg::Choked) => {
                        self.choked = true;
                        self.requeue_requested();
                    }
                    Some(DownloaderMsg::Unchoked) => self.choked = false,
                    Some(DownloaderMsg::Rejected { offset }) => self.requeue(offset),
                    Some(DownloaderMsg::AllowedFast) => self.allowed_fast = true,
                    None => return self.finish(DownloadResult::PeerGone),
                },
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.on_timeout();
                }
                _ = self.stop.changed() => {
                    self.cancel_inflight();
                    return self.finish(DownloadResult::Stopped);
                }
            }
        }
    }

    /// Send requests until the pipeline window is full.
    /// Returns false once the peer's outbound channel is gone.
    async fn fill_pipeline(&mut self) -> bool {
        while (!self.choked || self.allowed_fast) && self.requested < self.pipeline_depth {
            let Some(block) = self
                .blocks
                .iter_mut()
                .find(|b| b.state == BlockState::Pending)
            else {
                break;
            };

            let request = PeerMessage::Request {
                block: BlockInfo::new(self.piece.index, block.offset, block.length),
            };
            block.state = BlockState::Requested;
            block.requested_at = Some(Instant::now());
            self.requested += 1;

            if self.peer.send(request).await.is_err() {
                return false;
            }
        }
        true
    }

    fn on_block(&mut self, offset: u32, data: Vec<u8>) {
        let Some(block) = self.blocks.iter_mut().find(|b| b.offset == offset) else {
            debug!(
                "Ignoring block at unknown offset {} for piece {}",
                offset, self.piece.index
            );
            return;
        };

        if block.state != BlockState::Requested || data.len() != block.length as usize {
            debug!(
                "Ignoring unexpected block {}+{} for piece {}",
                offset,
                data.len(),
                self.piece.index
            );
            return;
        }

        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(&data);
        block.state = BlockState::Received;
        block.requested_at = None;
        self.requested -= 1;
        self.received += 1;
    }

    fn requeue(&mut self, offset: u32) {
        if let Some(block) = self
            .blocks
            .iter_mut()
            .find(|b| b.offset == offset && b.state == BlockState::Requested)
        {
            block.state = BlockState::Pending;
            block.requested_at = None;
            self.requested -= 1;
        }
    }

    fn requeue_requested(&mut self) {
        for block in &mut self.blocks {
            if block.state == BlockState::Requested {
                block.state = BlockState::Pending;
                block.requested_at = None;
                self.requested -= 1;
            }
        }
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.blocks
            .iter()
            .filter_map(|b| b.requested_at)
            .min()
            .map(|at| at + self.block_timeout)
    }

    fn on_timeout(&mut self) {
        let now = Instant::now();
        let mut expired = 0;
        for block in &mut self.blocks {
            if let Some(at) = block.requested_at {
                if now.duration_since(at) >= self.block_timeout {
                    block.state = BlockState::Pending;
                    block.requested_at = None;
                    self.requested -= 1;
                    expired += 1;
                }
            }
        }

        if expired > 0 {
            self.snubbed = true;
            warn!(
                "{} let {} requests for piece {} time out",
                self.peer.id(),
                expired,
                self.piece.index
            );
        }
    }

    /// Best-effort cancels for blocks still in flight
    fn cancel_inflight(&self) {
        for block in &self.blocks {
            if block.state == BlockState::Requested {
                let _ = self.peer.try_send(PeerMessage::Cancel {
                    block: BlockInfo::new(self.piece.index, block.offset, block.length),
                });
            }
        }
    }

    async fn verify(self) -> DownloadOutcome {
        let result = match self.store.append_if_valid(self.piece.index, &self.data).await {
            Ok(AppendOutcome::Stored) | Ok(AppendOutcome::AlreadyComplete) => {
                DownloadResult::Stored
            }
            Ok(AppendOutcome::HashMismatch) => DownloadResult::HashMismatch,
            Err(e) => DownloadResult::Io(e),
        };
        self.finish(result)
    }

    fn finish(self, result: DownloadResult) -> DownloadOutcome {
        DownloadOutcome {
            piece: self.piece.index,
            peer: self.peer.id(),
            result,
            snubbed: self.snubbed,
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::{FileSpec, PieceMap};
    use sha1::{Digest, Sha1};
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use tokio::task::JoinHandle;

    const TWO_BLOCKS: u32 = BLOCK_SIZE * 2;

    fn hash_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    struct Harness {
        outcome: JoinHandle<DownloadOutcome>,
        inbox: mpsc::Sender<DownloaderMsg>,
        requests: mpsc::Receiver<PeerMessage>,
        stop: watch::Sender<bool>,
        store: Arc<PieceStore>,
        _dir: tempfile::TempDir,
    }

    async fn start(piece_bytes: &[u8], choked: bool, depth: usize, timeout: Duration) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let map = PieceMap::new(
            piece_bytes.len() as u64,
            piece_bytes.len() as u64,
            vec![hash_of(piece_bytes)],
        );
        let files = vec![FileSpec {
            path: PathBuf::from("out.bin"),
            length: piece_bytes.len() as u64,
        }];
        let store = Arc::new(PieceStore::new(dir.path(), files, map).await.unwrap());

        let (peer_tx, requests) = mpsc::channel(64);
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let peer = PeerHandle::new(PeerId::next(), addr, peer_tx);
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);

        let piece = store.piece_map().get(0).unwrap().clone();
        let downloader = PieceDownloader::new(
            piece,
            peer,
            store.clone(),
            inbox_rx,
            stop_rx,
            depth,
            timeout,
            choked,
            false,
        );

        Harness {
            outcome: tokio::spawn(downloader.run()),
            inbox: inbox_tx,
            requests,
            stop: stop_tx,
            store,
            _dir: dir,
        }
    }

    fn block_of(data: &[u8], offset: u32) -> DownloaderMsg {
        let end = std::cmp::min(data.len(), (offset + BLOCK_SIZE) as usize);
        DownloaderMsg::Block {
            offset,
            data: data[offset as usize..end].to_vec(),
        }
    }

    async fn expect_request(requests: &mut mpsc::Receiver<PeerMessage>) -> BlockInfo {
        match requests.recv().await {
            Some(PeerMessage::Request { block }) => block,
            other => panic!("Expected a request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_happy_path_two_blocks() {
        let data = vec![0x5au8; TWO_BLOCKS as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        let first = expect_request(&mut h.requests).await;
        let second = expect_request(&mut h.requests).await;
        assert_eq!((first.offset, first.length), (0, BLOCK_SIZE));
        assert_eq!((second.offset, second.length), (BLOCK_SIZE, BLOCK_SIZE));

        h.inbox.send(block_of(&data, 0)).await.unwrap();
        h.inbox.send(block_of(&data, BLOCK_SIZE)).await.unwrap();

        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::Stored));
        assert!(!outcome.snubbed);
        assert!(h.store.has_piece(0));
    }

    #[tokio::test]
    async fn test_short_last_block() {
        let data = vec![0x11u8; BLOCK_SIZE as usize + 100];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        let first = expect_request(&mut h.requests).await;
        let second = expect_request(&mut h.requests).await;
        assert_eq!(first.length, BLOCK_SIZE);
        assert_eq!(second.length, 100);

        h.inbox.send(block_of(&data, 0)).await.unwrap();
        h.inbox.send(block_of(&data, BLOCK_SIZE)).await.unwrap();

        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::Stored));
    }

    #[tokio::test]
    async fn test_pipeline_window_bounds_outstanding_requests() {
        let data = vec![0x33u8; BLOCK_SIZE as usize * 4];
        let mut h = start(&data, false, 2, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        expect_request(&mut h.requests).await;
        // Window of 2 is full; nothing more until a block lands
        assert!(h.requests.try_recv().is_err());

        h.inbox.send(block_of(&data, 0)).await.unwrap();
        let third = expect_request(&mut h.requests).await;
        assert_eq!(third.offset, BLOCK_SIZE * 2);
    }

    #[tokio::test]
    async fn test_choke_requeues_and_unchoke_rerequests() {
        let data = vec![0x77u8; TWO_BLOCKS as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        expect_request(&mut h.requests).await;

        h.inbox.send(DownloaderMsg::Choked).await.unwrap();
        // No new requests while choked
        assert!(h.requests.try_recv().is_err());

        h.inbox.send(DownloaderMsg::Unchoked).await.unwrap();
        let again = expect_request(&mut h.requests).await;
        assert_eq!(again.offset, 0);
        expect_request(&mut h.requests).await;

        h.inbox.send(block_of(&data, 0)).await.unwrap();
        h.inbox.send(block_of(&data, BLOCK_SIZE)).await.unwrap();
        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::Stored));
    }

    #[tokio::test]
    async fn test_choked_start_waits_for_unchoke() {
        let data = vec![0x44u8; BLOCK_SIZE as usize];
        let mut h = start(&data, true, 10, Duration::from_secs(30)).await;

        assert!(h.requests.try_recv().is_err());

        h.inbox.send(DownloaderMsg::Unchoked).await.unwrap();
        expect_request(&mut h.requests).await;
    }

    #[tokio::test]
    async fn test_reject_requeues_single_block() {
        let data = vec![0x55u8; TWO_BLOCKS as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        expect_request(&mut h.requests).await;

        h.inbox
            .send(DownloaderMsg::Rejected { offset: 0 })
            .await
            .unwrap();
        let again = expect_request(&mut h.requests).await;
        assert_eq!(again.offset, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_requeues_and_snubs() {
        let data = vec![0x66u8; BLOCK_SIZE as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        // Let the request expire; paused time auto-advances
        let again = expect_request(&mut h.requests).await;
        assert_eq!(again.offset, 0);

        h.inbox.send(block_of(&data, 0)).await.unwrap();
        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::Stored));
        assert!(outcome.snubbed);
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_blocks_ignored() {
        let data = vec![0x88u8; TWO_BLOCKS as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        expect_request(&mut h.requests).await;

        // Unknown offset
        h.inbox
            .send(DownloaderMsg::Block {
                offset: 12345,
                data: vec![0; 10],
            })
            .await
            .unwrap();
        h.inbox.send(block_of(&data, 0)).await.unwrap();
        // Duplicate of an already received block
        h.inbox.send(block_of(&data, 0)).await.unwrap();
        h.inbox.send(block_of(&data, BLOCK_SIZE)).await.unwrap();

        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::Stored));
    }

    #[tokio::test]
    async fn test_hash_mismatch_reported_without_store_write() {
        let data = vec![0x99u8; BLOCK_SIZE as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        h.inbox
            .send(DownloaderMsg::Block {
                offset: 0,
                data: vec![0xaa; BLOCK_SIZE as usize],
            })
            .await
            .unwrap();

        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::HashMismatch));
        assert!(!h.store.has_piece(0));
    }

    #[tokio::test]
    async fn test_cancelled_inbox_reports_peer_gone() {
        let data = vec![0xabu8; BLOCK_SIZE as usize];
        let h = start(&data, false, 10, Duration::from_secs(30)).await;

        drop(h.inbox);
        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::PeerGone));
    }

    #[tokio::test]
    async fn test_stop_cancels_inflight_requests() {
        let data = vec![0xcdu8; TWO_BLOCKS as usize];
        let mut h = start(&data, false, 10, Duration::from_secs(30)).await;

        expect_request(&mut h.requests).await;
        expect_request(&mut h.requests).await;

        h.stop.send(true).unwrap();
        let outcome = h.outcome.await.unwrap();
        assert!(matches!(outcome.result, DownloadResult::Stopped));

        let mut cancels = 0;
        while let Ok(msg) = h.requests.try_recv() {
            if matches!(msg, PeerMessage::Cancel { .. }) {
                cancels += 1;
            }
        }
        assert_eq!(cancels, 2);
    }
}
