//! chalk-server: run a drawing board relay with the terminal as moderator.
//!
//! Admission prompts appear on stdout and are answered with `y` or `n`.
//! Other console commands: `users`, `kick <uuid>`, `resync`, `clear`,
//! `board <data>`, `draw <json>`, `quit`.
//!
//! When stdin closes the relay keeps serving until interrupted, rejecting
//! every admission.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};

use chalk_cli::{init_logging, AdmissionDesk, ConsoleCommand, Endpoint};
use chalk_relay::moderator::{AdmissionRequest, BoardView};
use chalk_relay::protocol::Envelope;
use chalk_relay::server::{RelayServer, ServerConfig};
use chalk_relay::snapshot::SharedBoard;

/// Collaborative drawing board relay
#[derive(Parser, Debug)]
#[command(name = "chalk-server")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    endpoint: Endpoint,
}

/// The moderator's canvas, as far as a terminal can show one.
///
/// Board replacements are kept as the snapshot handed to newcomers.
struct ConsoleView {
    board: Arc<SharedBoard>,
}

impl BoardView for ConsoleView {
    fn receive(&self, message: &str) {
        match Envelope::decode(message) {
            Ok(Envelope::Users { users }) => {
                let names: Vec<String> = users
                    .iter()
                    .map(|u| format!("{} ({})", u.display_name, u.uuid))
                    .collect();
                println!("users: {}", names.join(", "));
            }
            Ok(Envelope::Board { board_data }) => {
                match &board_data {
                    Some(data) => println!("board replaced ({} bytes)", data.len()),
                    None => println!("board cleared"),
                }
                self.board.replace(board_data);
            }
            _ => println!("{message}"),
        }
    }
}

fn prompt(request: &AdmissionRequest) {
    println!("Allow {} to join? [y/n]", request.display_name());
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let Endpoint {
        host,
        port,
        display_name,
    } = cli.endpoint;

    let board = Arc::new(SharedBoard::new());
    let view = Arc::new(ConsoleView {
        board: board.clone(),
    });
    let (server, mut requests) =
        RelayServer::bind(ServerConfig::new(&host, port, display_name), view, board.clone())
            .await
            .with_context(|| format!("could not start the relay on {host}:{port}"))?;

    let addr = server.local_addr()?;
    println!("Whiteboard server now running at {}:{}", addr.ip(), addr.port());

    let registry = server.registry().clone();
    let moderator = registry.moderator().clone();
    tokio::spawn(server.run());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut desk = AdmissionDesk::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            request = requests.recv(), if desk.is_idle() => {
                let Some(request) = request else { break };
                if let Some(request) = desk.offer(request) {
                    prompt(request);
                }
            }
            line = lines.next_line(), if !desk.is_closed() => {
                let Some(line) = line.context("failed to read the console")? else {
                    info!("Console closed, serving until interrupted; new users are rejected");
                    desk.close();
                    continue;
                };

                let command = match ConsoleCommand::parse(&line) {
                    Ok(command) => command,
                    Err(e) => {
                        println!("{e:#}");
                        continue;
                    }
                };

                match command {
                    ConsoleCommand::Answer(accept) => {
                        if !desk.answer(accept) {
                            println!("Nobody is waiting to join");
                        }
                    }
                    ConsoleCommand::Users => {
                        for user in registry.user_list().await {
                            println!("{:>6}  {}", user.uuid, user.display_name);
                        }
                    }
                    ConsoleCommand::Kick(uuid) => {
                        if !moderator.kick(uuid).await {
                            println!("No kickable user with uuid {uuid}");
                        }
                    }
                    ConsoleCommand::Resync => moderator.resync().await,
                    ConsoleCommand::Clear => moderator.replace_board(None).await,
                    ConsoleCommand::Board(data) => moderator.replace_board(Some(data)).await,
                    ConsoleCommand::Draw(json) => moderator.send_to_server(&json).await,
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Empty => {}
                }
            }
        }
    }

    let stats = registry.stats();
    info!(
        "Shutting down: {} connections, {} rejected, {} messages relayed, {} dropped",
        stats.total_connections,
        stats.rejected_connections,
        stats.messages_relayed,
        stats.messages_dropped
    );
    Ok(())
}
