//! chalk-client: join a drawing board relay from the terminal.
//!
//! Every stdin line that is a JSON object with a `command` field is sent to
//! the relay; `resync` asks for the board and roster again. Everything the
//! relay sends is printed.

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use chalk_cli::{init_logging, Endpoint};
use chalk_relay::client::{BoardClient, BoardEvent, ClientConfig};
use chalk_relay::protocol;

/// Collaborative drawing board client
#[derive(Parser, Debug)]
#[command(name = "chalk-client")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    endpoint: Endpoint,
}

fn print_event(event: &BoardEvent) {
    match event {
        BoardEvent::Users(users) => {
            let names: Vec<String> = users
                .iter()
                .map(|u| format!("{} ({})", u.display_name, u.uuid))
                .collect();
            println!("users: {}", names.join(", "));
        }
        BoardEvent::Board(Some(data)) => println!("board replaced ({} bytes)", data.len()),
        BoardEvent::Board(None) => println!("board cleared"),
        BoardEvent::Message(message) => println!("{message}"),
        BoardEvent::Disconnected(_) => {}
    }
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

    let mut client = BoardClient::new(ClientConfig::new(&host, port, display_name.as_str()));
    let mut events = client
        .take_event_rx()
        .context("event receiver already taken")?;
    client
        .connect()
        .await
        .with_context(|| format!("could not connect to {}", client.config().url))?;
    println!("Connected as {display_name}, waiting for the moderator to let you in");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(BoardEvent::Disconnected(Some(reason))) => {
                    eprintln!("Connection lost: {reason}");
                    break;
                }
                Some(BoardEvent::Disconnected(None)) | None => {
                    eprintln!("Connection lost. Maybe you were kicked.");
                    break;
                }
                Some(event) => print_event(&event),
            },
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    client.disconnect();
                    break;
                };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let sent = if line == "resync" {
                    client.resync().await?
                } else if protocol::command_of(line).is_some() {
                    client.send_raw(line).await?
                } else {
                    eprintln!("Not a JSON object with a \"command\" field: {line}");
                    continue;
                };
                if !sent {
                    eprintln!("Not admitted yet, message dropped");
                }
            }
        }
    }

    Ok(())
}
