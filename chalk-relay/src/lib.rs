//! # chalk-relay: relay core for a collaborative drawing board
//!
//! A central relay admits peers under moderator approval and fans every
//! state-changing message out to all of them, so every canvas converges.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   WebSocket (JSON)   ┌──────────────────────────────┐
//! │ BoardClient │ ◄──────────────────► │ RemotePeer (read + write)    │
//! │ (per user)  │                      └──────────────┬───────────────┘
//! └─────────────┘                                     │
//!                                                     ▼
//!                     ┌───────────┐       ┌──────────────────────┐
//!                     │ Moderator │ ◄───► │ Registry             │
//!                     │ (uuid 0)  │       │ (one lock, ordered   │
//!                     └─────┬─────┘       │  fan-out, pruning)   │
//!                           │             └──────────┬───────────┘
//!                           ▼                        ▼
//!                     ┌───────────┐       ┌──────────────────────┐
//!                     │ BoardView │       │ SnapshotProvider     │
//!                     └───────────┘       └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes and the reserved commands
//! - [`peer`]: capability interface shared by every participant
//! - [`connection`]: socket-backed peer with ordered sends
//! - [`moderator`]: privileged local peer and admission queue
//! - [`registry`]: peer set, dispatch policy, broadcast ordering
//! - [`server`]: accept loop
//! - [`snapshot`]: current board blob
//! - [`client`]: peer-side WebSocket client

pub mod client;
pub mod connection;
pub mod error;
pub mod moderator;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod snapshot;

// Re-exports for convenience
pub use client::{BoardClient, BoardEvent, ClientConfig, ConnectionState};
pub use connection::RemotePeer;
pub use error::{RelayError, Result};
pub use moderator::{auto_admit, AdmissionReceiver, AdmissionRequest, BoardView, Moderator};
pub use peer::{Peer, PeerState};
pub use protocol::{command, Envelope, Frame, PeerIdentity};
pub use registry::{Registry, RelayStats};
pub use server::{RelayServer, ServerConfig};
pub use snapshot::{SharedBoard, SnapshotProvider};
