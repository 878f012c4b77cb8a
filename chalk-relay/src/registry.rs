//! Connection registry: the single serialization point of the relay.
//!
//! ```text
//!  accept ──► admit ──► moderator? ──yes──► lock { push, board ► peer, users ► all } ──► start
//!                           │
//!                           └──no───► terminate (nothing registered)
//!
//!  peer frame ──► receive ──► resync from moderator ──► lock { board ► all, users ► all }
//!                        ├──► resync from peer      ──► board ► peer, users ► peer
//!                        ├──► any other command     ──► lock { frame ► all (sender too) }
//!                        └──► malformed             ──► dropped
//! ```
//!
//! The peer list and every fan-out share one lock, so broadcasts are totally
//! ordered: two broadcasts never interleave their delivery to the peer set.
//! Fan-out only enqueues, so a slow peer never holds the lock on I/O.
//! Terminated peers are pruned lazily, on broadcast, kick or an explicit
//! [`Registry::update_users`]; every prune that removes someone is followed
//! by a fresh roster.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

use crate::connection::RemotePeer;
use crate::error::{RelayError, Result};
use crate::moderator::{AdmissionReceiver, BoardView, Moderator};
use crate::peer::Peer;
use crate::protocol::{self, command, Envelope, Frame, PeerIdentity};
use crate::snapshot::SnapshotProvider;

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub messages_relayed: u64,
    pub messages_dropped: u64,
}

/// Counters touched outside the registry lock.
#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    messages_relayed: AtomicU64,
    messages_dropped: AtomicU64,
}

/// The set of live peers plus identity assignment and dispatch policy.
pub struct Registry {
    /// Registered peers in insertion order; the moderator is always first
    peers: Mutex<Vec<Arc<dyn Peer>>>,
    next_uuid: AtomicU64,
    moderator: Arc<Moderator>,
    snapshot: Arc<dyn SnapshotProvider>,
    stats: AtomicRelayStats,
}

impl Registry {
    /// Create a registry with its moderator already registered as uuid 0.
    ///
    /// Returns the queue on which the operator answers admission requests.
    /// At most `admission_queue` requests wait there at once.
    pub fn new(
        moderator_name: impl Into<String>,
        view: Arc<dyn BoardView>,
        snapshot: Arc<dyn SnapshotProvider>,
        admission_queue: usize,
    ) -> (Arc<Self>, AdmissionReceiver) {
        let (admissions, requests) = mpsc::channel(admission_queue.max(1));
        let moderator_name = moderator_name.into();

        let registry = Arc::new_cyclic(|weak| {
            let next_uuid = AtomicU64::new(0);
            let identity = PeerIdentity::new(next_uuid.fetch_add(1, Ordering::SeqCst), moderator_name);
            let moderator = Arc::new(Moderator::new(identity, view, admissions, weak.clone()));

            Self {
                peers: Mutex::new(vec![moderator.clone() as Arc<dyn Peer>]),
                next_uuid,
                moderator,
                snapshot,
                stats: AtomicRelayStats::default(),
            }
        });

        (registry, requests)
    }

    /// Return a fresh identifier. Never reused for the registry's lifetime.
    pub fn assign_identity(&self) -> u64 {
        self.next_uuid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn moderator(&self) -> &Arc<Moderator> {
        &self.moderator
    }

    /// Run the admission protocol for a freshly accepted connection.
    ///
    /// The moderator is consulted without holding the registry lock, so a
    /// pending decision never stalls broadcasts or other admissions.
    pub async fn admit(self: &Arc<Self>, stream: TcpStream) -> Result<Arc<RemotePeer>> {
        let uuid = self.assign_identity();
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let peer = RemotePeer::accept(stream, uuid, Arc::downgrade(self)).await?;
        peer.mark_pending();

        if !self.moderator.check_accept_new_user(peer.display_name()).await {
            self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            peer.terminate();
            log::info!("Moderator rejected {} ({uuid})", peer.display_name());
            return Err(RelayError::Rejected {
                display_name: peer.display_name().to_owned(),
            });
        }

        if !self.register(peer.clone()).await {
            // Lost the connection while the moderator was deciding.
            return Err(RelayError::Closed);
        }

        peer.start();
        log::info!("Admitted {} ({uuid}) from {}", peer.display_name(), peer.addr());
        Ok(peer)
    }

    /// Add an approved peer. In one critical section the peer gets the
    /// board and then everyone, the newcomer included, gets the new roster.
    ///
    /// Returns false, registering nothing, if the peer already terminated.
    pub async fn register(&self, peer: Arc<dyn Peer>) -> bool {
        let mut peers = self.peers.lock().await;
        if peer.is_terminated() {
            return false;
        }
        peers.push(peer.clone());
        peer.send(self.board_message());
        let users = Self::users_frame(&peers);
        self.fan_out(&mut peers, users);
        true
    }

    /// Deliver `raw` to every registered peer, the sender included.
    pub async fn broadcast(&self, raw: &str) {
        let mut peers = self.peers.lock().await;
        self.fan_out(&mut peers, Frame::from(raw));
    }

    /// Dispatch a message received from `from`.
    pub async fn receive(&self, raw: &str, from: &dyn Peer) {
        log::debug!(
            "{}/{} ({}): {raw}",
            if from.is_privileged() { "manager" } else { "user" },
            from.display_name(),
            from.uuid()
        );

        let Some(cmd) = protocol::command_of(raw) else {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if cmd != command::RESYNC {
            let mut peers = self.peers.lock().await;
            // A kick may have landed while this frame waited for the lock.
            if from.is_terminated() {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
            self.fan_out(&mut peers, Frame::from(raw));
            return;
        }

        if from.is_privileged() {
            let mut peers = self.peers.lock().await;
            let board = self.board_message();
            self.fan_out(&mut peers, board);
            let users = Self::users_frame(&peers);
            self.fan_out(&mut peers, users);
        } else {
            // Only the requester needs it; a broadcast would storm every peer.
            let users = self.users_message().await;
            from.send(self.board_message());
            from.send(users);
        }
    }

    /// Terminate every registered peer carrying `uuid`.
    ///
    /// Returns whether any peer was actually terminated.
    pub async fn kick(&self, uuid: u64) -> bool {
        let mut peers = self.peers.lock().await;
        let mut kicked = false;
        for peer in peers.iter().filter(|p| p.uuid() == uuid) {
            kicked |= peer.terminate();
        }

        if kicked {
            log::info!("Kicked uuid {uuid}");
            self.prune(&mut peers);
        }
        kicked
    }

    /// Drop terminated peers and rebroadcast the roster if anyone left.
    pub async fn update_users(&self) {
        let mut peers = self.peers.lock().await;
        self.prune(&mut peers);
    }

    /// Current roster in insertion order.
    pub async fn user_list(&self) -> Vec<PeerIdentity> {
        let peers = self.peers.lock().await;
        peers.iter().map(|p| p.identity().clone()).collect()
    }

    /// Encoded `users` message for the current roster.
    pub async fn users_message(&self) -> Frame {
        let peers = self.peers.lock().await;
        Self::users_frame(&peers)
    }

    /// Encoded `board` message carrying the current snapshot.
    pub fn board_message(&self) -> Frame {
        Envelope::board(self.snapshot.board_data()).to_frame()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            messages_relayed: self.stats.messages_relayed.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
        }
    }

    fn users_frame(peers: &[Arc<dyn Peer>]) -> Frame {
        Envelope::users(peers.iter().map(|p| p.identity().clone()).collect()).to_frame()
    }

    /// Enqueue `frame` to every peer, then prune. Caller holds the lock.
    fn fan_out(&self, peers: &mut Vec<Arc<dyn Peer>>, frame: Frame) {
        for peer in peers.iter() {
            peer.send(frame.clone());
        }
        self.prune(peers);
    }

    /// Remove terminated peers until the set is stable, sending the new
    /// roster after every removal. Caller holds the lock.
    fn prune(&self, peers: &mut Vec<Arc<dyn Peer>>) {
        loop {
            let before = peers.len();
            peers.retain(|p| !p.is_terminated());
            if peers.len() == before {
                return;
            }

            log::debug!("Pruned {} terminated peer(s)", before - peers.len());
            let users = Self::users_frame(peers);
            for peer in peers.iter() {
                peer.send(users.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::Lifecycle;
    use crate::snapshot::SharedBoard;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingView(SyncMutex<Vec<String>>);

    impl BoardView for RecordingView {
        fn receive(&self, message: &str) {
            self.0.lock().push(message.to_owned());
        }
    }

    /// In-memory peer that records every frame it is sent.
    struct StubPeer {
        identity: PeerIdentity,
        lifecycle: Lifecycle,
        inbox: SyncMutex<Vec<String>>,
    }

    impl StubPeer {
        fn new(uuid: u64, name: &str) -> Arc<Self> {
            Arc::new(Self {
                identity: PeerIdentity::new(uuid, name),
                lifecycle: Lifecycle::new(),
                inbox: SyncMutex::new(Vec::new()),
            })
        }

        fn inbox(&self) -> Vec<String> {
            self.inbox.lock().clone()
        }
    }

    impl Peer for StubPeer {
        fn identity(&self) -> &PeerIdentity {
            &self.identity
        }
        fn send(&self, frame: Frame) {
            if !self.is_terminated() {
                self.inbox.lock().push(frame.to_string());
            }
        }
        fn start(&self) {}
        fn terminate(&self) -> bool {
            self.lifecycle.terminate()
        }
        fn is_terminated(&self) -> bool {
            self.lifecycle.get() == crate::peer::PeerState::Terminated
        }
    }

    fn test_registry() -> (Arc<Registry>, Arc<RecordingView>, AdmissionReceiver) {
        let view = Arc::new(RecordingView::default());
        let board = Arc::new(SharedBoard::with_data("snapshot"));
        let (registry, requests) = Registry::new("Host", view.clone(), board, 4);
        (registry, view, requests)
    }

    async fn register(registry: &Registry, name: &str) -> Arc<StubPeer> {
        let peer = StubPeer::new(registry.assign_identity(), name);
        registry.peers.lock().await.push(peer.clone());
        peer
    }

    fn commands(inbox: &[String]) -> Vec<String> {
        inbox
            .iter()
            .filter_map(|m| protocol::command_of(m))
            .collect()
    }

    #[tokio::test]
    async fn test_moderator_registered_first() {
        let (registry, _view, _rx) = test_registry();
        let users = registry.user_list().await;
        assert_eq!(users, vec![PeerIdentity::new(0, "Host")]);
        assert!(registry.moderator().is_privileged());
    }

    #[tokio::test]
    async fn test_uuids_strictly_increase() {
        let (registry, _view, _rx) = test_registry();
        let issued: Vec<u64> = (0..100).map(|_| registry.assign_identity()).collect();
        assert_eq!(issued.first(), Some(&1));
        assert!(issued.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_opaque_command_echoed_to_everyone() {
        let (registry, view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        let stroke = r#"{"command":"paintStroke","x":1,"y":2}"#;
        registry.receive(stroke, alice.as_ref()).await;

        assert_eq!(alice.inbox(), vec![stroke]);
        assert_eq!(bob.inbox(), vec![stroke]);
        assert_eq!(view.0.lock().as_slice(), [stroke]);
        assert_eq!(registry.stats().messages_relayed, 1);
    }

    #[tokio::test]
    async fn test_malformed_input_dropped() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;

        registry.receive("{not json", alice.as_ref()).await;
        registry.receive(r#"{"x":1}"#, alice.as_ref()).await;

        assert!(alice.inbox().is_empty());
        assert_eq!(registry.stats().messages_dropped, 2);
    }

    #[tokio::test]
    async fn test_peer_resync_is_unicast() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        registry
            .receive(r#"{"command":"resync"}"#, bob.as_ref())
            .await;

        assert!(alice.inbox().is_empty());
        assert_eq!(commands(&bob.inbox()), vec!["board", "users"]);
        let board = Envelope::decode(&bob.inbox()[0]).unwrap();
        assert_eq!(board, Envelope::board(Some("snapshot".into())));
    }

    #[tokio::test]
    async fn test_moderator_resync_is_broadcast() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        registry.moderator().resync().await;

        for peer in [&alice, &bob] {
            assert_eq!(commands(&peer.inbox()), vec!["board", "users"]);
        }
    }

    #[tokio::test]
    async fn test_broadcasts_are_ordered() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        let mut tasks = Vec::new();
        for i in 0..50 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .broadcast(&format!(r#"{{"command":"n","i":{i}}}"#))
                    .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(alice.inbox().len(), 50);
        assert_eq!(alice.inbox(), bob.inbox());
    }

    #[tokio::test]
    async fn test_kick_prunes_and_rebroadcasts() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        assert!(registry.kick(alice.uuid()).await);
        assert!(alice.is_terminated());

        let users = registry.user_list().await;
        assert!(users.iter().all(|u| u.uuid != alice.uuid()));
        assert_eq!(users.len(), 2);

        let roster = Envelope::decode(&bob.inbox()[0]).unwrap();
        assert_eq!(
            roster,
            Envelope::users(vec![
                PeerIdentity::new(0, "Host"),
                PeerIdentity::new(bob.uuid(), "Bob"),
            ])
        );
    }

    #[tokio::test]
    async fn test_kick_twice_reports_once() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;

        assert!(registry.kick(alice.uuid()).await);
        assert!(!registry.kick(alice.uuid()).await);
        assert!(!registry.kick(999).await);
    }

    #[tokio::test]
    async fn test_moderator_cannot_be_kicked() {
        let (registry, _view, _rx) = test_registry();
        assert!(!registry.kick(0).await);
        assert_eq!(registry.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_prunes_dead_peers() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        // Died without a prune, e.g. after a read error.
        alice.terminate();
        assert_eq!(registry.peer_count().await, 3);

        registry.broadcast(r#"{"command":"clear"}"#).await;
        assert_eq!(registry.peer_count().await, 2);
        assert_eq!(commands(&bob.inbox()), vec!["clear", "users"]);
    }

    #[tokio::test]
    async fn test_update_users_without_changes_is_silent() {
        let (registry, _view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;

        registry.update_users().await;
        assert!(alice.inbox().is_empty());
    }

    #[tokio::test]
    async fn test_register_sends_board_then_roster() {
        let (registry, view, _rx) = test_registry();
        let alice = StubPeer::new(registry.assign_identity(), "Alice");

        assert!(registry.register(alice.clone()).await);

        let inbox = alice.inbox();
        assert_eq!(inbox.len(), 2);
        assert_eq!(
            Envelope::decode(&inbox[0]).unwrap(),
            Envelope::board(Some("snapshot".into()))
        );
        assert_eq!(
            Envelope::decode(&inbox[1]).unwrap(),
            Envelope::users(vec![
                PeerIdentity::new(0, "Host"),
                PeerIdentity::new(1, "Alice"),
            ])
        );
        assert_eq!(view.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_register_refuses_terminated_peer() {
        let (registry, view, _rx) = test_registry();
        let alice = StubPeer::new(registry.assign_identity(), "Alice");
        alice.terminate();

        assert!(!registry.register(alice.clone()).await);
        assert_eq!(registry.peer_count().await, 1);
        assert!(view.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_frame_from_kicked_peer_is_not_relayed() {
        let (registry, view, _rx) = test_registry();
        let alice = register(&registry, "Alice").await;
        let bob = register(&registry, "Bob").await;

        // Terminated but not yet pruned, as after a kick racing the read task.
        alice.terminate();
        registry
            .receive(r#"{"command":"paintStroke"}"#, alice.as_ref())
            .await;

        assert!(bob.inbox().is_empty());
        assert!(view.0.lock().is_empty());
        assert_eq!(registry.stats().messages_relayed, 0);
        assert_eq!(registry.stats().messages_dropped, 1);
    }
}
