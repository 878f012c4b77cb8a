//! The local, privileged peer that represents the operator.
//!
//! The moderator is created by the registry and lives as long as it does.
//! It is always registered first (uuid 0), can never be terminated, decides
//! every admission, and may kick other peers. Messages addressed to it are
//! handed straight to a [`BoardView`] without crossing a socket.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};

use crate::peer::Peer;
use crate::protocol::{self, command, Envelope, Frame, PeerIdentity};
use crate::registry::Registry;

/// Receiver side of the admission queue, owned by the operator.
pub type AdmissionReceiver = mpsc::Receiver<AdmissionRequest>;

/// In-process consumer of the moderator's messages, typically the renderer.
///
/// Called synchronously from inside the registry's critical section. It must
/// return promptly and must not call back into the registry.
pub trait BoardView: Send + Sync {
    fn receive(&self, message: &str);
}

/// A pending "may this user join?" question for the operator.
///
/// Dropping the request without answering rejects the connection.
#[derive(Debug)]
pub struct AdmissionRequest {
    display_name: String,
    reply: oneshot::Sender<bool>,
}

impl AdmissionRequest {
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn decide(self, accept: bool) {
        // The admitting task may have given up already.
        let _ = self.reply.send(accept);
    }

    pub fn accept(self) {
        self.decide(true);
    }

    pub fn reject(self) {
        self.decide(false);
    }
}

/// Answer every admission request with `policy`, one at a time.
///
/// Runs until the registry is dropped.
pub async fn auto_admit<F>(mut requests: AdmissionReceiver, policy: F)
where
    F: Fn(&str) -> bool,
{
    while let Some(request) = requests.recv().await {
        let accept = policy(request.display_name());
        log::debug!(
            "Automatic admission decision for {}: {accept}",
            request.display_name()
        );
        request.decide(accept);
    }
}

/// The privileged local peer.
pub struct Moderator {
    identity: PeerIdentity,
    view: Arc<dyn BoardView>,
    admissions: mpsc::Sender<AdmissionRequest>,
    registry: Weak<Registry>,
}

impl Moderator {
    pub(crate) fn new(
        identity: PeerIdentity,
        view: Arc<dyn BoardView>,
        admissions: mpsc::Sender<AdmissionRequest>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            identity,
            view,
            admissions,
            registry,
        }
    }

    /// Ask the operator whether `display_name` may join.
    ///
    /// Requests are queued and answered in arrival order, so concurrent
    /// admissions wait their turn here rather than racing for one prompt.
    /// A closed queue or an unanswered request counts as rejection.
    pub async fn check_accept_new_user(&self, display_name: &str) -> bool {
        let (reply, decision) = oneshot::channel();
        let request = AdmissionRequest {
            display_name: display_name.to_owned(),
            reply,
        };

        if self.admissions.send(request).await.is_err() {
            log::warn!("No operator is handling admissions, rejecting {display_name}");
            return false;
        }

        decision.await.unwrap_or(false)
    }

    /// Kick every peer with `uuid`. Returns whether anyone was removed.
    pub async fn kick(&self, uuid: u64) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.kick(uuid).await,
            None => false,
        }
    }

    /// Feed an operator action into the relay as if it came over a socket.
    pub async fn send_to_server(&self, message: &str) {
        if let Some(registry) = self.registry.upgrade() {
            registry.receive(message, self).await;
        }
    }

    /// Push the snapshot and roster to every peer.
    pub async fn resync(&self) {
        self.send_to_server(&Envelope::Resync.to_frame()).await;
    }

    /// Replace everyone's board, or blank it with `None`.
    pub async fn replace_board(&self, board_data: Option<String>) {
        self.send_to_server(&Envelope::board(board_data).to_frame())
            .await;
    }
}

impl Peer for Moderator {
    fn identity(&self) -> &PeerIdentity {
        &self.identity
    }

    /// Deliver directly to the view. Resync requests and malformed input
    /// never reach it.
    fn send(&self, frame: Frame) {
        match protocol::command_of(&frame) {
            Some(cmd) if cmd == command::RESYNC => {}
            Some(_) => self.view.receive(&frame),
            None => log::debug!("Moderator dropped malformed message"),
        }
    }

    fn start(&self) {}

    fn terminate(&self) -> bool {
        false
    }

    fn is_terminated(&self) -> bool {
        false
    }

    fn is_privileged(&self) -> bool {
        true
    }
}
