//! JSON envelope protocol for the drawing board relay.
//!
//! Every WebSocket text frame carries exactly one JSON object:
//! ```text
//! {"command": "<name>", ...command-specific fields}
//! ```
//!
//! The relay understands four reserved commands structurally:
//!
//! | command    | direction            | payload                              |
//! |------------|----------------------|--------------------------------------|
//! | `identify` | peer → relay (first) | `{displayName}`                      |
//! | `resync`   | peer → relay         | `{}`                                 |
//! | `board`    | relay → peer(s)      | `{boardData?}` (absent = blank)      |
//! | `users`    | relay → peer(s)      | `{users: [{displayName, uuid}, ..]}` |
//!
//! Anything else is opaque and relayed verbatim.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

/// A pre-encoded frame, shared across every peer of a fan-out.
pub type Frame = Arc<str>;

/// Name of the field every envelope is tagged with.
pub const COMMAND_FIELD: &str = "command";

/// Field carrying the self-declared display name in `identify`.
pub const DISPLAY_NAME_FIELD: &str = "displayName";

/// Reserved command names.
pub mod command {
    pub const IDENTIFY: &str = "identify";
    pub const RESYNC: &str = "resync";
    pub const BOARD: &str = "board";
    pub const USERS: &str = "users";
}

/// Identity of an addressable peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub uuid: u64,
}

impl PeerIdentity {
    pub fn new(uuid: u64, display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            uuid,
        }
    }
}

/// Typed view of the reserved envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Envelope {
    /// Handshake, first frame of every connection.
    Identify {
        #[serde(rename = "displayName", default)]
        display_name: String,
    },
    /// Request for the full snapshot and roster.
    Resync,
    /// Full board snapshot. `None` resets the board to blank.
    Board {
        #[serde(
            rename = "boardData",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        board_data: Option<String>,
    },
    /// Full roster in registry insertion order.
    Users { users: Vec<PeerIdentity> },
}

impl Envelope {
    pub fn identify(display_name: impl Into<String>) -> Self {
        Self::Identify {
            display_name: display_name.into(),
        }
    }

    pub fn board(board_data: Option<String>) -> Self {
        Self::Board { board_data }
    }

    pub fn users(users: Vec<PeerIdentity>) -> Self {
        Self::Users { users }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize into a shareable frame.
    pub fn to_frame(&self) -> Frame {
        Arc::from(self.encode().unwrap_or_default())
    }

    /// Deserialize a reserved envelope. Opaque commands are an error.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Extract the `command` of a well-formed message.
///
/// Returns `None` for non-JSON input, non-object JSON, or a missing or
/// non-string `command`.
pub fn command_of(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw).ok()?;
    value.get(COMMAND_FIELD)?.as_str().map(str::to_owned)
}

/// Parse the handshake frame and return the declared display name.
///
/// The frame must be a JSON object. A missing `displayName` is read as the
/// empty string.
pub fn parse_identify(raw: &str) -> Result<String> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| RelayError::Handshake(format!("handshake is not JSON: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| RelayError::Handshake("handshake is not a JSON object".into()))?;

    match object.get(COMMAND_FIELD).and_then(Value::as_str) {
        Some(command::IDENTIFY) => {}
        other => log::warn!("Handshake carried command {other:?}, expected identify"),
    }

    Ok(object
        .get(DISPLAY_NAME_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned())
}
