//! Shared pieces of the `chalk-server` and `chalk-client` terminal front ends.

use anyhow::{bail, Context};
use clap::Args;

use chalk_relay::moderator::AdmissionRequest;
use chalk_relay::protocol;

/// Positional arguments common to both roles.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Address to bind (server) or connect to (client)
    #[arg(value_name = "host")]
    pub host: String,

    /// TCP port
    #[arg(value_name = "port")]
    pub port: u16,

    /// Name shown to the other participants
    #[arg(value_name = "displayName")]
    pub display_name: String,
}

/// Initialize `env_logger` with an `info` default, overridable by `RUST_LOG`.
pub fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Admission requests waiting on the operator, answered one at a time.
///
/// Once the console is closed every request is rejected on arrival.
#[derive(Debug, Default)]
pub struct AdmissionDesk {
    pending: Option<AdmissionRequest>,
    closed: bool,
}

impl AdmissionDesk {
    /// Whether another request may be taken off the admission queue.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Hold `request` until the operator answers it. Returns the request
    /// to prompt for, or `None` if it was rejected because the console is
    /// closed.
    pub fn offer(&mut self, request: AdmissionRequest) -> Option<&AdmissionRequest> {
        if self.closed {
            log::info!("Console closed, rejecting {}", request.display_name());
            request.reject();
            return None;
        }
        if let Some(stale) = self.pending.replace(request) {
            stale.reject();
        }
        self.pending.as_ref()
    }

    /// Answer the pending request. Returns false if nobody was waiting.
    pub fn answer(&mut self, accept: bool) -> bool {
        match self.pending.take() {
            Some(request) => {
                request.decide(accept);
                true
            }
            None => false,
        }
    }

    /// Stop taking answers; the pending request, if any, is rejected.
    pub fn close(&mut self) {
        self.closed = true;
        if let Some(request) = self.pending.take() {
            request.reject();
        }
    }
}

/// One line typed at the moderator console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Answer to the pending admission prompt
    Answer(bool),
    Users,
    Kick(u64),
    Resync,
    Clear,
    Board(String),
    /// Drawing command sent as the moderator
    Draw(String),
    Quit,
    Empty,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> anyhow::Result<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "" => Self::Empty,
            "y" | "yes" => Self::Answer(true),
            "n" | "no" => Self::Answer(false),
            "users" => Self::Users,
            "kick" => {
                let uuid = rest
                    .parse()
                    .with_context(|| format!("kick expects a numeric uuid, got {rest:?}"))?;
                Self::Kick(uuid)
            }
            "resync" => Self::Resync,
            "clear" => Self::Clear,
            "board" if rest.is_empty() => bail!("board expects the board data"),
            "board" => Self::Board(rest.to_owned()),
            "draw" => {
                if protocol::command_of(rest).is_none() {
                    bail!("draw expects a JSON object with a \"command\" field");
                }
                Self::Draw(rest.to_owned())
            }
            "quit" | "exit" => Self::Quit,
            other => bail!("Unknown command {other:?}. Try users, kick <uuid>, resync, clear, board <data>, draw <json> or quit"),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chalk_relay::moderator::{AdmissionReceiver, BoardView};
    use chalk_relay::registry::Registry;
    use chalk_relay::snapshot::SharedBoard;
    use clap::Parser;
    use std::sync::Arc;
    use tokio::task::JoinHandle;

    struct NullView;

    impl BoardView for NullView {
        fn receive(&self, _message: &str) {}
    }

    fn admission_queue() -> (Arc<Registry>, AdmissionReceiver) {
        Registry::new("Host", Arc::new(NullView), Arc::new(SharedBoard::new()), 4)
    }

    /// Ask for `name` to be admitted and return the decision and the request.
    async fn ask(
        registry: &Arc<Registry>,
        requests: &mut AdmissionReceiver,
        name: &'static str,
    ) -> (JoinHandle<bool>, AdmissionRequest) {
        let moderator = registry.moderator().clone();
        let decision = tokio::spawn(async move { moderator.check_accept_new_user(name).await });
        let request = requests.recv().await.unwrap();
        (decision, request)
    }

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        endpoint: Endpoint,
    }

    #[test]
    fn test_endpoint_positional() {
        let cli = TestCli::try_parse_from(["chalk", "127.0.0.1", "9090", "Alice"]).unwrap();
        assert_eq!(
            cli.endpoint,
            Endpoint {
                host: "127.0.0.1".into(),
                port: 9090,
                display_name: "Alice".into(),
            }
        );
    }

    #[test]
    fn test_endpoint_rejects_bad_port() {
        assert!(TestCli::try_parse_from(["chalk", "127.0.0.1", "ninety", "Alice"]).is_err());
        assert!(TestCli::try_parse_from(["chalk", "127.0.0.1", "70000", "Alice"]).is_err());
    }

    #[test]
    fn test_endpoint_requires_all_arguments() {
        assert!(TestCli::try_parse_from(["chalk", "127.0.0.1", "9090"]).is_err());
    }

    #[test]
    fn test_parse_console_commands() {
        assert_eq!(ConsoleCommand::parse("y").unwrap(), ConsoleCommand::Answer(true));
        assert_eq!(ConsoleCommand::parse(" No ").unwrap(), ConsoleCommand::Answer(false));
        assert_eq!(ConsoleCommand::parse("users").unwrap(), ConsoleCommand::Users);
        assert_eq!(ConsoleCommand::parse("kick 3").unwrap(), ConsoleCommand::Kick(3));
        assert_eq!(ConsoleCommand::parse("resync").unwrap(), ConsoleCommand::Resync);
        assert_eq!(ConsoleCommand::parse("clear").unwrap(), ConsoleCommand::Clear);
        assert_eq!(
            ConsoleCommand::parse("board aGVsbG8=").unwrap(),
            ConsoleCommand::Board("aGVsbG8=".into())
        );
        assert_eq!(ConsoleCommand::parse("").unwrap(), ConsoleCommand::Empty);
        assert_eq!(ConsoleCommand::parse("quit").unwrap(), ConsoleCommand::Quit);
    }

    #[test]
    fn test_parse_draw_keeps_json_verbatim() {
        let line = r#"draw {"command":"paintStroke", "x": 1}"#;
        assert_eq!(
            ConsoleCommand::parse(line).unwrap(),
            ConsoleCommand::Draw(r#"{"command":"paintStroke", "x": 1}"#.into())
        );
    }

    #[test]
    fn test_parse_console_errors() {
        assert!(ConsoleCommand::parse("kick alice").is_err());
        assert!(ConsoleCommand::parse("kick").is_err());
        assert!(ConsoleCommand::parse("board").is_err());
        assert!(ConsoleCommand::parse("draw nonsense").is_err());
        assert!(ConsoleCommand::parse("dance").is_err());
    }

    #[tokio::test]
    async fn test_desk_answers_pending_request() {
        let (registry, mut requests) = admission_queue();
        let mut desk = AdmissionDesk::default();
        assert!(!desk.answer(true));

        let (decision, request) = ask(&registry, &mut requests, "Alice").await;
        assert_eq!(desk.offer(request).unwrap().display_name(), "Alice");
        assert!(!desk.is_idle());

        assert!(desk.answer(true));
        assert!(desk.is_idle());
        assert!(decision.await.unwrap());
    }

    #[tokio::test]
    async fn test_closing_desk_rejects_pending_and_later_requests() {
        let (registry, mut requests) = admission_queue();
        let mut desk = AdmissionDesk::default();

        let (first, request) = ask(&registry, &mut requests, "Alice").await;
        desk.offer(request);
        desk.close();
        assert!(desk.is_closed());
        assert!(desk.is_idle());
        assert!(!first.await.unwrap());

        let (second, request) = ask(&registry, &mut requests, "Bob").await;
        assert!(desk.offer(request).is_none());
        assert!(!second.await.unwrap());
        assert!(!desk.answer(true));
    }
}
