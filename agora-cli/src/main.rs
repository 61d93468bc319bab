//! agora — terminal front end for the chat room.
//!
//! `agora serve` runs the WebSocket relay with its presence registry;
//! `agora join` connects to one and chats from stdin.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};

use agora_chat::bus::MessageBus;
use agora_chat::client::RemoteBus;
use agora_chat::server::{RelayServer, ServerConfig};
use agora_chat::session::{ChatEvent, ChatSession};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "agora")]
#[command(version = VERSION)]
#[command(about = "Presence-tracked chat room over WebSocket")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:9090")]
        bind: String,
        /// Platform name used in participant ids
        #[arg(long, default_value = "agora")]
        platform: String,
        /// Maximum participants in the room
        #[arg(long, default_value_t = 256)]
        max_participants: usize,
    },
    /// Join a room and chat from stdin ("/<name> text" sends privately)
    Join {
        /// Name to join as
        #[arg(long)]
        name: String,
        /// Relay server URL
        #[arg(long, default_value = "ws://127.0.0.1:9090")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            platform,
            max_participants,
        } => {
            let config = ServerConfig {
                bind_addr: bind,
                platform,
                max_participants,
            };
            serve(config).await?;
        }
        Commands::Join { name, server } => {
            join(&server, &name).await?;
        }
    }

    Ok(())
}

async fn serve(config: ServerConfig) -> Result<()> {
    info!("Starting relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);

    tokio::select! {
        result = server.run() => result.map_err(|e| anyhow!(e)),
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} frames routed",
                stats.total_connections, stats.frames_routed
            );
            Ok(())
        }
    }
}

async fn join(url: &str, name: &str) -> Result<()> {
    let (bus, inbox) = RemoteBus::connect(url, name).await?;
    let dyn_bus: Arc<dyn MessageBus> = bus.clone();
    let mut session = ChatSession::start(bus.id().clone(), bus.registry_id(), dyn_bus, inbox)?;
    println!("Joined as {}", bus.id());

    let mut events = session
        .take_event_rx()
        .ok_or_else(|| anyhow!("event stream already taken"))?;
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("{}", render(&event));
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    session.handle_input(&line).await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // Leaving also closes the socket.
    session.leave()?;
    printer.abort();
    Ok(())
}

/// One line of terminal output for an event.
fn render(event: &ChatEvent) -> String {
    match event {
        ChatEvent::ParticipantsChanged(labels) if labels.is_empty() => {
            "* nobody else is here".to_string()
        }
        ChatEvent::ParticipantsChanged(labels) => format!("* present: {}", labels.join(", ")),
        ChatEvent::Broadcast { speaker, text } => format!("{speaker}: {text}"),
        ChatEvent::Private { speaker, text } => format!("[private] {speaker}: {text}"),
    }
}
