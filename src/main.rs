//! Axi-Match terminal client
//!
//! Registers with the matching service, then drives the call from stdin.
//! Lines of text are sent as chat once connected; slash commands control
//! the session. Logs go to stderr so stdout stays readable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axi_match::rtc::{RtcNegotiatorFactory, SyntheticMediaSource};
use axi_match::{Config, SessionHandle, SessionSnapshot, SessionUpdate, SessionUpdates, Severity};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "axi-match", about = "Anonymous 1:1 video chat client")]
struct Args {
    /// Display name to register with
    #[arg(long)]
    name: String,

    /// Matching service HTTP base URL
    #[arg(long, env = "AXI_MATCHING_URL", default_value = axi_match::config::DEFAULT_MATCHING_URL)]
    matching_url: String,

    /// Matching service WebSocket base URL
    #[arg(long, env = "AXI_MATCHING_WS", default_value = axi_match::config::DEFAULT_MATCHING_WS)]
    matching_ws: String,

    /// Signaling service WebSocket base URL
    #[arg(long, env = "AXI_SIGNALING_WS", default_value = axi_match::config::DEFAULT_SIGNALING_WS)]
    signaling_ws: String,

    /// Seconds to wait for the signaling channel to open
    #[arg(long, default_value_t = 10)]
    ready_timeout_secs: u64,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            matching_url: self.matching_url.clone(),
            matching_ws: self.matching_ws.clone(),
            signaling_ws: self.signaling_ws.clone(),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
            ..Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "axi_match=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.config();
    info!(
        "Matching service {} ({}), signaling {}",
        config.matching_url, config.matching_ws, config.signaling_ws
    );

    let (session, updates) = axi_match::spawn(
        config,
        Arc::new(SyntheticMediaSource),
        Arc::new(RtcNegotiatorFactory),
    )
    .context("failed to start session")?;
    let printer = tokio::spawn(print_updates(updates));

    session.register(&args.name)?;
    println!("Registering as {}. Type /help for commands.", args.name.trim());

    let result = read_commands(&session).await;

    session.shutdown().await.ok();
    printer.abort();
    result
}

async fn read_commands(session: &SessionHandle) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut confirm_skip = false;

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();

        if confirm_skip {
            confirm_skip = false;
            if matches!(line, "y" | "Y" | "yes") {
                session.skip()?;
            } else {
                println!("Skip cancelled.");
            }
            continue;
        }

        match line {
            "" => {}
            "/quit" | "/exit" => break,
            "/skip" => {
                println!("Skip this person and find someone new? [y/N]");
                confirm_skip = true;
            }
            "/next" => session.find_next()?,
            "/help" => {
                println!("/skip    end this call and find someone new");
                println!("/next    look for a new match after the peer left");
                println!("/quit    leave");
                println!("anything else is sent as chat");
            }
            text => session.send_chat(text)?,
        }
    }
    Ok(())
}

async fn print_updates(mut updates: SessionUpdates) {
    let mut last_status = updates.snapshot.borrow().status.clone();
    let mut seen_chat = 0;

    loop {
        tokio::select! {
            update = updates.updates.recv() => match update {
                Some(update) => print_update(update),
                None => break,
            },
            changed = updates.snapshot.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.snapshot.borrow_and_update().clone();
                if snapshot.status != last_status {
                    println!("[status] {}", snapshot.status);
                    last_status = snapshot.status.clone();
                }
                seen_chat = print_chat(&snapshot, seen_chat);
            }
        }
    }
}

fn print_update(update: SessionUpdate) {
    match update {
        SessionUpdate::Notice(notice) => {
            let tag = match notice.severity {
                Severity::Info => "info",
                Severity::Success => "ok",
                Severity::Warning => "warn",
                Severity::Error => "error",
            };
            println!("[{}] {}: {}", tag, notice.title, notice.description);
        }
        SessionUpdate::LocalStream(stream) => {
            println!("[media] local preview {} ({} tracks)", stream.id(), stream.tracks().len());
        }
        SessionUpdate::RemoteStream(stream) => {
            println!("[media] remote stream {}", stream.id());
        }
        SessionUpdate::StreamsCleared => println!("[media] streams cleared"),
    }
}

/// Print chat lines past `seen`, returning the new count
fn print_chat(snapshot: &SessionSnapshot, seen: usize) -> usize {
    let chat = &snapshot.chat;
    if chat.len() < seen {
        // Log was cleared by a teardown
        return print_chat(snapshot, 0);
    }
    for message in &chat[seen..] {
        if message.own {
            println!("  you: {}", message.body);
        } else {
            println!("  {}: {}", message.sender, message.body);
        }
    }
    chat.len()
}
