//! WebSocket client for joining a drawing board relay.
//!
//! Provides:
//! - The `identify` handshake
//! - Admission tracking: outgoing messages are dropped until the relay
//!   has sent the first frame, which only happens after the moderator
//!   admitted us
//! - Decoded roster, board and drawing events for the application
//!
//! The relay echoes every drawing message back to its sender, so the
//! application should render on [`BoardEvent::Message`] rather than on
//! local input.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{RelayError, Result};
use crate::protocol::{self, Envelope, PeerIdentity};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the relay
    pub url: String,
    /// Self-declared display name sent in the handshake
    pub display_name: String,
    /// Events buffered before the reader waits on the application
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            display_name: "anonymous".to_string(),
            event_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, display_name: impl Into<String>) -> Self {
        Self {
            url: format!("ws://{host}:{port}"),
            display_name: display_name.into(),
            ..Self::default()
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Handshake sent, waiting for the moderator
    Connecting,
    /// Admitted; outgoing messages are delivered
    Active,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardEvent {
    /// Full roster
    Users(Vec<PeerIdentity>),
    /// Full board snapshot; `None` means blank
    Board(Option<String>),
    /// Opaque message (drawing commands), verbatim
    Message(String),
    /// Connection lost; `None` when the relay closed cleanly, e.g. a kick
    Disconnected(Option<String>),
}

impl BoardEvent {
    /// Decode one frame from the relay. Malformed frames yield `None`.
    pub fn classify(raw: &str) -> Option<Self> {
        match Envelope::decode(raw) {
            Ok(Envelope::Users { users }) => Some(Self::Users(users)),
            Ok(Envelope::Board { board_data }) => Some(Self::Board(board_data)),
            _ => protocol::command_of(raw).map(|_| Self::Message(raw.to_owned())),
        }
    }
}

/// The board client.
pub struct BoardClient {
    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::UnboundedSender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<BoardEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<BoardEvent>,
}

impl BoardClient {
    pub fn new(config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<BoardEvent>> {
        self.event_rx.take()
    }

    /// Connect and send the handshake.
    ///
    /// Returns once the handshake is on the wire; admission is reported by
    /// the state moving to [`ConnectionState::Active`].
    pub async fn connect(&mut self) -> Result<()> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.config.url).await {
            Ok(conn) => conn,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let identify = Envelope::identify(self.config.display_name.clone()).encode()?;
        if let Err(e) = ws_writer.send(Message::text(identify)).await {
            *self.state.write().await = ConnectionState::Disconnected;
            return Err(e.into());
        }

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: decode incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = state.write().await;
                            if *s == ConnectionState::Connecting {
                                *s = ConnectionState::Active;
                            }
                        }
                        match BoardEvent::classify(text.as_str()) {
                            Some(event) => {
                                if event_tx.send(event).await.is_err() {
                                    break None;
                                }
                            }
                            None => log::debug!("Ignoring malformed frame from relay"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break None,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                }
            };

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(BoardEvent::Disconnected(reason)).await;
        });

        Ok(())
    }

    /// Send a message to the relay.
    ///
    /// Returns `Ok(false)` when the message was dropped because the moderator
    /// has not admitted us yet.
    pub async fn send_raw(&self, message: &str) -> Result<bool> {
        match *self.state.read().await {
            ConnectionState::Active => {}
            ConnectionState::Connecting => return Ok(false),
            ConnectionState::Disconnected => return Err(RelayError::Closed),
        }

        let tx = self.outgoing_tx.as_ref().ok_or(RelayError::Closed)?;
        tx.send(message.to_owned())
            .map_err(|_| RelayError::Closed)?;
        Ok(true)
    }

    /// Ask the relay for the current board and roster.
    pub async fn resync(&self) -> Result<bool> {
        self.send_raw(&Envelope::Resync.encode()?).await
    }

    /// Close the connection. The reader reports `Disconnected` once the
    /// relay acknowledges.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}
