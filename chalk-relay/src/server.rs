//! TCP accept loop in front of the registry.
//!
//! ```text
//! listener ──accept──► tokio::spawn(admit) ──► RemotePeer (read task + write task)
//!     │                      │
//!     └── keeps accepting    └── may wait on the moderator indefinitely
//! ```
//!
//! Each connection is admitted on its own task so a slow or rejected
//! admission never delays the next arrival.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::error::{RelayError, Result};
use crate::moderator::{AdmissionReceiver, BoardView};
use crate::registry::Registry;
use crate::snapshot::SnapshotProvider;

/// First pause after a failed accept; doubled on each consecutive failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

fn accept_backoff(previous: Option<Duration>) -> Duration {
    previous.map_or(ACCEPT_BACKOFF_MIN, |d| (d * 2).min(ACCEPT_BACKOFF_MAX))
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Display name of the local moderator
    pub moderator_name: String,
    /// Admission requests allowed to wait for the operator at once
    pub admission_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            moderator_name: "moderator".to_string(),
            admission_queue: 16,
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16, moderator_name: impl Into<String>) -> Self {
        Self {
            bind_addr: format!("{host}:{port}"),
            moderator_name: moderator_name.into(),
            ..Self::default()
        }
    }
}

/// A bound relay, ready to accept connections.
pub struct RelayServer {
    config: ServerConfig,
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl RelayServer {
    /// Bind the listener and create the registry with its moderator.
    ///
    /// Fails without leaving anything running if the address cannot be bound.
    pub async fn bind(
        config: ServerConfig,
        view: Arc<dyn BoardView>,
        snapshot: Arc<dyn SnapshotProvider>,
    ) -> Result<(Self, AdmissionReceiver)> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let (registry, requests) = Registry::new(
            config.moderator_name.clone(),
            view,
            snapshot,
            config.admission_queue,
        );

        log::info!(
            "Whiteboard relay listening on {}",
            listener.local_addr()?
        );

        Ok((
            Self {
                config,
                listener,
                registry,
            },
            requests,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections forever, admitting each on its own task.
    ///
    /// Accept errors (e.g. running out of file descriptors) are logged and
    /// the loop backs off before trying again.
    pub async fn run(self) {
        let mut backoff = None;
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(conn) => {
                    backoff = None;
                    conn
                }
                Err(e) => {
                    let pause = accept_backoff(backoff);
                    log::warn!("Failed to accept connection: {e}, retrying in {pause:?}");
                    backoff = Some(pause);
                    tokio::time::sleep(pause).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            tokio::spawn(async move {
                match registry.admit(stream).await {
                    Ok(_) | Err(RelayError::Rejected { .. }) => {}
                    Err(e) => log::warn!("There was an error with a client at {addr}: {e}"),
                }
            });
        }
    }
}
