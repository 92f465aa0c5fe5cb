use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{config::load_settings_from, ChatSession, Roster, SessionEvent};
use media::{MissingMediaDevices, MissingPeerConnector};
use shared::{
    domain::{CallMode, Message, MessageId, UserId},
    protocol::Credentials,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    /// Create the account instead of logging in.
    #[arg(long)]
    register: bool,
    #[arg(long, default_value = "client.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings_from(&args.config, |key| std::env::var(key).ok());
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }

    info!(server_url = %settings.server_url, "desktop: signing in");
    let credentials = Credentials {
        username: args.username,
        password: args.password,
    };
    let session = ChatSession::sign_in(
        &settings,
        &credentials,
        args.register,
        Arc::new(MissingMediaDevices),
        Arc::new(MissingPeerConnector),
    )
    .await
    .with_context(|| format!("failed to sign in to {}", settings.server_url))?;
    println!(
        "Signed in as {} ({})",
        session.identity().username,
        session.identity().user_id
    );

    let mut events = session.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::ConnectionStateChanged(state) => {
                    println!("* connection: {state:?}")
                }
                SessionEvent::RosterUpdated(roster) => print_roster(&roster),
                SessionEvent::MessagesUpdated { contact } => {
                    println!("* messages updated: {contact}")
                }
                SessionEvent::UnreadUpdated(counts) => {
                    for (contact, count) in counts {
                        println!("* unread {contact}: {count}");
                    }
                }
                SessionEvent::CallStateChanged(state) => println!("* call: {state:?}"),
                SessionEvent::Error(reason) => eprintln!("! {reason}"),
            }
        }
    });

    session.start().await?;
    println!("Commands: /select <id> /file <path> /call audio|video /hangup /delete <message id>");
    println!("          /remove <contact id> /roster /messages /people /logout /quit");
    println!("Anything else is sent as text to the selected contact.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        let outcome = match command {
            "/quit" => break,
            "/logout" => {
                session.logout().await?;
                break;
            }
            "/select" => session.select_contact(UserId::from(rest)).await,
            "/file" => match tokio::fs::read(rest).await {
                Ok(bytes) => {
                    let name = PathBuf::from(rest)
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_else(|| rest.to_string());
                    session.send_file(&name, &bytes).await
                }
                Err(err) => {
                    eprintln!("! cannot read {rest}: {err}");
                    continue;
                }
            },
            "/call" => {
                let mode = if rest.eq_ignore_ascii_case("video") {
                    CallMode::Video
                } else {
                    CallMode::Audio
                };
                session.start_call(mode).await
            }
            "/hangup" => {
                session.end_call().await;
                Ok(())
            }
            "/delete" => session.delete_message(&MessageId::from(rest)).await,
            "/remove" => session.delete_contact(&UserId::from(rest)).await,
            "/people" => session.refresh_people().await,
            "/roster" => {
                print_roster(&session.roster().await);
                Ok(())
            }
            "/messages" => {
                for message in session.messages().await {
                    print_message(&message);
                }
                Ok(())
            }
            _ => session.send_message(line).await,
        };
        if let Err(err) = outcome {
            warn!(command, "desktop: command failed: {err}");
            eprintln!("! {err}");
        }
    }

    session.shutdown().await;
    printer.abort();
    Ok(())
}

fn print_roster(roster: &Roster) {
    println!("* online:");
    for contact in &roster.online {
        println!("    {} ({})", contact.display_name, contact.id);
    }
    println!("* offline:");
    for contact in &roster.offline {
        println!("    {} ({})", contact.display_name, contact.id);
    }
}

fn print_message(message: &Message) {
    let body = match (&message.text, message.attachment_name()) {
        (Some(text), _) => text.clone(),
        (None, Some(name)) => format!("[file] {name}"),
        (None, None) => String::new(),
    };
    println!("  [{}] {}: {}", message.id, message.sender, body);
}
