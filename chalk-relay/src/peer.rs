//! Addressable participants of the relay.
//!
//! The registry talks to every participant through [`Peer`]. There are two
//! implementations: [`RemotePeer`](crate::connection::RemotePeer), backed by a
//! socket, and [`Moderator`](crate::moderator::Moderator), the in-process
//! operator. The registry never inspects which one it holds; the moderator's
//! privileges are expressed through [`Peer::is_privileged`] and
//! [`Peer::terminate`] returning `false`.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::protocol::{Frame, PeerIdentity};

/// Capability interface for anything the registry can address.
pub trait Peer: Send + Sync {
    /// Identity assigned by the registry.
    fn identity(&self) -> &PeerIdentity;

    /// Deliver a frame. Never blocks on I/O.
    fn send(&self, frame: Frame);

    /// Begin relaying this peer's inbound messages.
    fn start(&self);

    /// Terminate the peer. Returns `true` only if this call performed the
    /// termination.
    fn terminate(&self) -> bool;

    fn is_terminated(&self) -> bool;

    /// Privileged peers receive broadcast resyncs and cannot be terminated.
    fn is_privileged(&self) -> bool {
        false
    }

    fn uuid(&self) -> u64 {
        self.identity().uuid
    }

    fn display_name(&self) -> &str {
        &self.identity().display_name
    }
}

/// Lifecycle of a remote peer.
///
/// `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PeerState {
    /// Handshake read, read loop running, not yet offered for admission.
    Created = 0,
    /// Waiting on the moderator's decision.
    PendingAdmission = 1,
    /// Admitted; inbound frames are relayed.
    Started = 2,
    Terminated = 3,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::PendingAdmission,
            2 => Self::Started,
            _ => Self::Terminated,
        }
    }
}

/// Lock-free lifecycle cell.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(PeerState::Created as u8))
    }

    pub fn get(&self) -> PeerState {
        PeerState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move forward to `next` unless the current state is already at or past it.
    ///
    /// Returns whether the transition happened.
    pub fn advance(&self, next: PeerState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < next as u8).then_some(next as u8)
            })
            .is_ok()
    }

    /// Enter `Terminated`. Only the first caller gets `true`.
    pub fn terminate(&self) -> bool {
        self.0.swap(PeerState::Terminated as u8, Ordering::AcqRel) != PeerState::Terminated as u8
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
