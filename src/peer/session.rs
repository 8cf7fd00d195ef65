use crate::error::{DownpourError, Result};
use crate::peer::{PeerEvent, PeerHandle, PeerId, PeerMessage};
use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

const OUTBOUND_CAPACITY: usize = 64;

/// Frames larger than this are protocol violations
const MAX_MESSAGE_SIZE: usize = 1 << 20;

/// Owns one post-handshake peer transport.
///
/// Inbound frames become [`PeerEvent`]s on the shared events channel, in
/// receive order. Outbound messages arrive on the handle's channel and are
/// written by the session task, which also emits periodic keep-alives. On
/// transport error or orderly close the session sends its id exactly once
/// on the disconnect channel; a session closed locally sends nothing.
pub struct PeerSession {
    handle: PeerHandle,
    close_tx: watch::Sender<bool>,
    done_rx: mpsc::Receiver<()>,
}

enum Exit {
    /// Transport ended or misbehaved; announce on the disconnect channel
    Disconnect,
    /// Closed locally or globally; terminate silently
    Closed,
}

impl PeerSession {
    /// Spawn a session task over a connected transport.
    pub fn spawn<T>(
        addr: SocketAddr,
        transport: T,
        events: mpsc::Sender<PeerEvent>,
        disconnects: mpsc::Sender<PeerId>,
        keep_alive: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = PeerId::next();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(1);
        let handle = PeerHandle::new(id, addr, outbound_tx);

        tokio::spawn(run_session(
            id,
            transport,
            events,
            disconnects,
            outbound_rx,
            keep_alive,
            stop,
            close_rx,
            done_tx,
        ));

        Self {
            handle,
            close_tx,
            done_rx,
        }
    }

    pub fn id(&self) -> PeerId {
        self.handle.id()
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr()
    }

    /// Outbound handle for the coordinator and downloaders
    pub fn handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Close the session and wait for its task to terminate.
    ///
    /// Idempotent. A closed session delivers no further events.
    pub async fn close(&mut self) {
        let _ = self.close_tx.send(true);
        while self.done_rx.recv().await.is_some() {}
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<T>(
    id: PeerId,
    transport: T,
    events: mpsc::Sender<PeerEvent>,
    disconnects: mpsc::Sender<PeerId>,
    mut outbound_rx: mpsc::Receiver<PeerMessage>,
    keep_alive: Duration,
    mut stop: watch::Receiver<bool>,
    mut close: watch::Receiver<bool>,
    _done: mpsc::Sender<()>,
) where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(transport);
    let mut buf = BytesMut::with_capacity(4096);
    let mut keepalive = interval_at(Instant::now() + keep_alive, keep_alive);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = 'session: loop {
        // Drain every complete frame before touching the transport again,
        // so per-peer delivery order is preserved.
        loop {
            match next_frame(&mut buf) {
                Ok(Some(payload)) => match PeerMessage::from_payload(&payload) {
                    Ok(message) => {
                        debug!("{} received {:?}", id, message);
                        tokio::select! {
                            sent = events.send(PeerEvent { peer: id, message }) => {
                                if sent.is_err() {
                                    break 'session Exit::Closed;
                                }
                            }
                            _ = close.changed() => break 'session Exit::Closed,
                            _ = stop.changed() => break 'session Exit::Closed,
                        }
                    }
                    Err(e) => {
                        warn!("{} sent a malformed message: {}", id, e);
                        break 'session Exit::Disconnect;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("{} violated framing: {}", id, e);
                    break 'session Exit::Disconnect;
                }
            }
        }

        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => break Exit::Disconnect,
                Ok(_) => {}
                Err(e) => {
                    debug!("{} transport read failed: {}", id, e);
                    break Exit::Disconnect;
                }
            },
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = writer.write_all(&message.to_bytes()).await {
                        debug!("{} transport write failed: {}", id, e);
                        break Exit::Disconnect;
                    }
                }
                None => break Exit::Closed,
            },
            _ = keepalive.tick() => {
                if let Err(e) = writer.write_all(&PeerMessage::KeepAlive.to_bytes()).await {
                    debug!("{} keep-alive write failed: {}", id, e);
                    break Exit::Disconnect;
                }
            }
            _ = close.changed() => break Exit::Closed,
            _ = stop.changed() => break Exit::Closed,
        }
    };

    if matches!(exit, Exit::Disconnect) {
        tokio::select! {
            _ = disconnects.send(id) => {}
            _ = close.changed() => {}
            _ = stop.changed() => {}
        }
    }

    debug!("{} session terminated", id);
}

/// Pop one length-prefixed frame from the accumulator, if complete
fn next_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(DownpourError::ProtocolError(format!(
            "Frame of {} bytes exceeds limit",
            length
        )));
    }

    if buf.len() < 4 + length {
        return Ok(None);
    }

    buf.advance(4);
    Ok(Some(buf.split_to(length)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::DuplexStream;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 6881)
    }

    struct Harness {
        remote: DuplexStream,
        events: mpsc::Receiver<PeerEvent>,
        disconnects: mpsc::Receiver<PeerId>,
        session: PeerSession,
        _stop: watch::Sender<bool>,
    }

    fn start_session() -> Harness {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (events_tx, events) = mpsc::channel(16);
        let (disconnects_tx, disconnects) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let session = PeerSession::spawn(
            test_addr(),
            local,
            events_tx,
            disconnects_tx,
            Duration::from_secs(600),
            stop_rx,
        );
        Harness {
            remote,
            events,
            disconnects,
            session,
            _stop: stop_tx,
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_receive_order() {
        let mut h = start_session();

        let mut frames = PeerMessage::Have { piece_index: 1 }.to_bytes();
        frames.extend(PeerMessage::Have { piece_index: 2 }.to_bytes());
        frames.extend(PeerMessage::Unchoke.to_bytes());
        h.remote.write_all(&frames).await.unwrap();

        let first = h.events.recv().await.unwrap();
        let second = h.events.recv().await.unwrap();
        let third = h.events.recv().await.unwrap();
        assert_eq!(first.message, PeerMessage::Have { piece_index: 1 });
        assert_eq!(second.message, PeerMessage::Have { piece_index: 2 });
        assert_eq!(third.message, PeerMessage::Unchoke);
        assert_eq!(first.peer, h.session.id());
    }

    #[tokio::test]
    async fn test_split_frame_reassembled() {
        let mut h = start_session();

        let frame = PeerMessage::Piece {
            piece_index: 0,
            offset: 0,
            data: vec![7u8; 100],
        }
        .to_bytes();
        h.remote.write_all(&frame[..5]).await.unwrap();
        h.remote.flush().await.unwrap();
        h.remote.write_all(&frame[5..]).await.unwrap();

        let event = h.events.recv().await.unwrap();
        assert!(matches!(event.message, PeerMessage::Piece { .. }));
    }

    #[tokio::test]
    async fn test_exactly_one_disconnect_on_remote_close() {
        let h = start_session();
        let Harness {
            remote,
            events: _events,
            mut disconnects,
            session,
            _stop,
        } = h;

        drop(remote);

        assert_eq!(disconnects.recv().await, Some(session.id()));
        // The session task has exited; its sender is dropped, so the
        // channel yields no further notifications.
        assert_eq!(disconnects.recv().await, None);
    }

    #[tokio::test]
    async fn test_outbound_messages_reach_the_wire() {
        let mut h = start_session();

        h.session
            .handle()
            .send(PeerMessage::Interested)
            .await
            .unwrap();

        let mut read = vec![0u8; 5];
        h.remote.read_exact(&mut read).await.unwrap();
        assert_eq!(read, PeerMessage::Interested.to_bytes());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_events() {
        let mut h = start_session();

        h.session.close().await;
        h.session.close().await;

        // Frames written after close are never delivered
        let _ = h
            .remote
            .write_all(&PeerMessage::Have { piece_index: 0 }.to_bytes())
            .await;
        assert!(h.events.recv().await.is_none());
        // Local close does not announce a disconnect
        assert!(h.disconnects.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_disconnects() {
        let mut h = start_session();

        let mut frame = Vec::new();
        frame.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        h.remote.write_all(&frame).await.unwrap();

        assert_eq!(h.disconnects.recv().await, Some(h.session.id()));
    }

    #[tokio::test]
    async fn test_unknown_message_disconnects() {
        let mut h = start_session();

        h.remote
            .write_all(&[0, 0, 0, 1, 99])
            .await
            .unwrap();

        assert_eq!(h.disconnects.recv().await, Some(h.session.id()));
    }
}
