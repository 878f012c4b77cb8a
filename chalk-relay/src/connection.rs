//! Socket-backed peer.
//!
//! Each remote peer owns its WebSocket and runs two tasks:
//!
//! ```text
//!            ┌──────────── read task ────────────┐
//! socket ──► │ discard until started, then       │ ──► Registry::receive
//!            │ forward every frame               │
//!            └───────────────────────────────────┘
//!            ┌─────────── write task ────────────┐
//! send() ──► │ unbounded FIFO, one writer,       │ ──► socket
//!            │ never blocks the broadcaster      │
//!            └───────────────────────────────────┘
//! ```
//!
//! Any I/O failure on either side terminates the peer and asks the registry
//! to prune. Termination wakes both tasks through a shutdown signal so a
//! blocked read never outlives it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{RelayError, Result};
use crate::peer::{Lifecycle, Peer, PeerState};
use crate::protocol::{self, Frame, PeerIdentity};
use crate::registry::Registry;

type WsStream = WebSocketStream<TcpStream>;

/// Upper bound on the closing handshake once a peer is terminated.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames a peer may have queued before it is considered stalled and
/// terminated. Enqueueing itself never blocks.
pub const OUTBOX_HIGH_WATER: usize = 8192;

/// A peer connected over the network.
pub struct RemotePeer {
    identity: PeerIdentity,
    addr: SocketAddr,
    lifecycle: Lifecycle,
    /// Send queue drained by the write task. Unbounded so a broadcast
    /// never waits on a slow socket; `queued` caps it instead.
    outbox: mpsc::UnboundedSender<Frame>,
    /// Frames enqueued but not yet taken by the write task
    queued: AtomicUsize,
    /// Flipped to `true` exactly once, by `terminate`
    shutdown: watch::Sender<bool>,
}

impl RemotePeer {
    /// Upgrade `stream` to a WebSocket and read the `identify` handshake.
    ///
    /// The peer only exists once the handshake has been read; any failure
    /// before that drops the socket and is returned to the caller. On
    /// success the read and write tasks are already running, with inbound
    /// frames discarded until [`Peer::start`].
    pub async fn accept(
        stream: TcpStream,
        uuid: u64,
        registry: Weak<Registry>,
    ) -> Result<Arc<Self>> {
        let addr = stream.peer_addr()?;
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (sink, mut source) = ws_stream.split();

        let display_name = read_handshake(&mut source).await?;
        let (peer, queue) = Self::new(PeerIdentity::new(uuid, display_name), addr);

        log::info!(
            "Peer {} ({}) identified from {addr}",
            peer.identity.display_name,
            uuid
        );

        tokio::spawn(write_loop(peer.clone(), sink, queue, registry.clone()));
        tokio::spawn(read_loop(peer.clone(), source, registry));

        Ok(peer)
    }

    /// Build the peer and the receiving end of its send queue.
    fn new(identity: PeerIdentity, addr: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, queue) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let peer = Arc::new(Self {
            identity,
            addr,
            lifecycle: Lifecycle::new(),
            outbox,
            queued: AtomicUsize::new(0),
            shutdown,
        });
        (peer, queue)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        self.lifecycle.get()
    }

    pub fn is_started(&self) -> bool {
        self.state() == PeerState::Started
    }

    /// Mark the peer as waiting on the moderator.
    pub(crate) fn mark_pending(&self) -> bool {
        self.lifecycle.advance(PeerState::PendingAdmission)
    }
}

impl Peer for RemotePeer {
    fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    fn send(&self, frame: Frame) {
        if self.is_terminated() {
            return;
        }
        if self.queued.fetch_add(1, Ordering::Relaxed) >= OUTBOX_HIGH_WATER {
            log::warn!(
                "Peer {} ({}) stopped reading, dropping it",
                self.identity.display_name,
                self.identity.uuid
            );
            self.terminate();
            return;
        }
        // A closed queue means the write task already gave up.
        let _ = self.outbox.send(frame);
    }

    fn start(&self) {
        if self.lifecycle.advance(PeerState::Started) {
            log::debug!(
                "Peer {} ({}) started",
                self.identity.display_name,
                self.identity.uuid
            );
        }
    }

    fn terminate(&self) -> bool {
        if !self.lifecycle.terminate() {
            return false;
        }
        self.shutdown.send_replace(true);
        log::info!(
            "Peer {} ({}) terminated",
            self.identity.display_name,
            self.identity.uuid
        );
        true
    }

    fn is_terminated(&self) -> bool {
        self.state() == PeerState::Terminated
    }
}

impl std::fmt::Debug for RemotePeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePeer")
            .field("identity", &self.identity)
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Read exactly one handshake frame, skipping control frames.
async fn read_handshake(source: &mut SplitStream<WsStream>) -> Result<String> {
    loop {
        match source.next().await {
            Some(Ok(Message::Text(text))) => return protocol::parse_identify(text.as_str()),
            Some(Ok(Message::Binary(_))) => {
                return Err(RelayError::Handshake("binary handshake frame".into()))
            }
            Some(Ok(Message::Close(_))) | None => return Err(RelayError::Closed),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

async fn read_loop(
    peer: Arc<RemotePeer>,
    mut source: SplitStream<WsStream>,
    registry: Weak<Registry>,
) {
    let mut shutdown = peer.shutdown.subscribe();

    loop {
        let msg = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            msg = source.next() => msg,
        };

        match msg {
            Some(Ok(Message::Text(text))) => {
                // Drained even while pending so the socket buffer never stalls.
                if !peer.is_started() {
                    log::debug!(
                        "Discarding frame from {} ({}) received before admission",
                        peer.identity.display_name,
                        peer.identity.uuid
                    );
                    continue;
                }
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.receive(text.as_str(), peer.as_ref()).await;
            }
            Some(Ok(Message::Close(_))) | None => {
                log::info!("Connection closed from {}", peer.addr);
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                log::warn!("Read error from {}: {e}", peer.addr);
                break;
            }
        }
    }

    peer.terminate();
    if let Some(registry) = registry.upgrade() {
        registry.update_users().await;
    }
}

async fn write_loop<S>(
    peer: Arc<RemotePeer>,
    mut sink: S,
    mut queue: mpsc::UnboundedReceiver<Frame>,
    registry: Weak<Registry>,
) where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let mut shutdown = peer.shutdown.subscribe();

    loop {
        let frame = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            frame = queue.recv() => match frame {
                Some(frame) => {
                    peer.queued.fetch_sub(1, Ordering::Relaxed);
                    frame
                }
                None => break,
            },
        };

        let result = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            result = sink.send(Message::text(frame.to_string())) => result,
        };

        if let Err(e) = result {
            log::warn!("Write error to {}: {e}", peer.addr);
            peer.terminate();
            if let Some(registry) = registry.upgrade() {
                registry.update_users().await;
            }
            break;
        }
    }

    // Sends a close frame and shuts the write half down.
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderator::BoardView;
    use crate::snapshot::SharedBoard;
    use futures_util::sink;

    struct NullView;

    impl BoardView for NullView {
        fn receive(&self, _message: &str) {}
    }

    fn detached_peer(uuid: u64) -> (Arc<RemotePeer>, mpsc::UnboundedReceiver<Frame>) {
        let addr = "127.0.0.1:9".parse().unwrap();
        RemotePeer::new(PeerIdentity::new(uuid, "Alice"), addr)
    }

    #[test]
    fn test_terminate_reports_once_and_stops_sends() {
        let (peer, mut queue) = detached_peer(1);

        peer.send(Frame::from("first"));
        assert_eq!(queue.try_recv().unwrap().as_ref(), "first");

        assert!(peer.terminate());
        assert!(!peer.terminate());
        assert!(peer.is_terminated());
        assert!(*peer.shutdown.borrow());

        peer.send(Frame::from("late"));
        assert!(queue.try_recv().is_err());
    }

    #[test]
    fn test_stalled_peer_is_terminated_at_high_water() {
        let (peer, mut queue) = detached_peer(1);

        for _ in 0..OUTBOX_HIGH_WATER {
            peer.send(Frame::from("x"));
        }
        assert!(!peer.is_terminated());

        peer.send(Frame::from("one too many"));
        assert!(peer.is_terminated());

        let mut drained = 0;
        while queue.try_recv().is_ok() {
            drained += 1;
        }
        assert_eq!(drained, OUTBOX_HIGH_WATER);
    }

    #[tokio::test]
    async fn test_write_failure_terminates_and_prunes() {
        let (registry, _requests) =
            Registry::new("Host", Arc::new(NullView), Arc::new(SharedBoard::new()), 1);
        let (peer, queue) = detached_peer(registry.assign_identity());

        // Registration queues the board and roster for the writer.
        assert!(registry.register(peer.clone()).await);
        assert_eq!(registry.peer_count().await, 2);

        let broken = Box::pin(sink::unfold((), |(), _msg: Message| async {
            Err::<(), _>(tungstenite::Error::ConnectionClosed)
        }));
        write_loop(peer.clone(), broken, queue, Arc::downgrade(&registry)).await;

        assert!(peer.is_terminated());
        assert_eq!(registry.peer_count().await, 1);
        assert_eq!(registry.user_list().await, vec![PeerIdentity::new(0, "Host")]);
    }
}
