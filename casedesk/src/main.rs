//! `casedesk`: command-line client for the case desk messaging API.
//!
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/casedesk/config.toml`). Logs go to a file; stdout carries
//! only command output.
//!
//! ```bash
//! casedesk --base-url http://127.0.0.1:8000/api login --email admin@casedesk.test
//! casedesk conversations
//! casedesk watch 2
//! casedesk send 2 "statement received"
//! casedesk broadcast --scope victims "office closed tomorrow"
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use casedesk::chat::{ChatError, ChatEvent, ChatSync, Message, Sender};
use casedesk::config::{CliArgs, ClientConfig, Command};
use casedesk::session::credentials::{CredentialStoreError, FileCredentialStore};
use casedesk::session::{SessionError, SessionEvent, SessionTransport};
use casedesk::transport::TransportError;
use casedesk::transport::http::ReqwestBackend;
use casedesk_proto::ids::{MessageId, UserId};

type Session = SessionTransport<ReqwestBackend, FileCredentialStore>;
type Engine = ChatSync<ReqwestBackend, FileCredentialStore>;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Storage(#[from] CredentialStoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("no command given; see --help")]
    NoCommand,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) if cli.config.is_some() => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::from_cli(&cli)
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(base_url = %config.base_url, "casedesk starting");

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("casedesk.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

async fn run(command: Option<Command>, config: &ClientConfig) -> Result<(), CliError> {
    let command = command.ok_or(CliError::NoCommand)?;
    let backend = ReqwestBackend::new(&config.base_url, config.request_timeout)?;
    let store = FileCredentialStore::new(&config.credentials_path);
    let (session, mut session_rx) = SessionTransport::new(backend, store, 8)?;
    let session = Arc::new(session);

    let result = dispatch(command, &session, &mut session_rx, config).await;

    // A refresh failure during the command means the user must sign in again.
    while let Ok(event) = session_rx.try_recv() {
        report_session_event(&event);
    }
    result
}

async fn dispatch(
    command: Command,
    session: &Arc<Session>,
    session_rx: &mut mpsc::Receiver<SessionEvent>,
    config: &ClientConfig,
) -> Result<(), CliError> {
    match command {
        Command::Login { email, password } => {
            let claims = session.login(&email, &password).await?;
            match claims.role {
                Some(role) => println!("Logged in as user {} ({role})", claims.user_id),
                None => println!("Logged in as user {}", claims.user_id),
            }
        }
        Command::Logout => {
            session.logout()?;
            println!("Logged out");
        }
        Command::Whoami => {
            let claims = session.claims()?;
            let role = claims.role.map_or_else(|| "unknown".to_string(), |r| r.to_string());
            println!("user {} role {role}", claims.user_id);
        }
        Command::Peers => {
            let (engine, _events) = ChatSync::for_session(Arc::clone(session), config.sync.clone())?;
            for peer in engine.load_roster().await? {
                println!(
                    "{:>6}  {:<28} {:<13} {}",
                    peer.id,
                    peer.display_name(),
                    peer.role.to_string(),
                    peer.status.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Conversations => {
            let (engine, _events) = ChatSync::for_session(Arc::clone(session), config.sync.clone())?;
            let roster = engine.load_roster().await?;
            let summary = engine.load_all_conversations().await;
            for peer in &summary.failed {
                eprintln!("warning: could not load conversation with {peer}");
            }
            for entry in engine.summaries() {
                let name = roster
                    .iter()
                    .find(|p| p.id == entry.peer)
                    .map_or_else(|| entry.peer.to_string(), casedesk_proto::user::Peer::display_name);
                let last = entry
                    .last_message
                    .as_ref()
                    .map_or_else(String::new, |m| m.content.clone());
                println!("{:>6}  {:<28} unread {:<3} {last}", entry.peer, name, entry.unread);
            }
        }
        Command::Watch { peer } => watch(session, session_rx, config, peer).await?,
        Command::Send { peer, text } => {
            let (engine, _events) = ChatSync::for_session(Arc::clone(session), config.sync.clone())?;
            engine.load_roster().await?;
            let message = engine.send_message(peer, &text).await?;
            println!("sent message {} to {peer}", message.id);
        }
        Command::Broadcast { scope, text } => {
            let (engine, _events) = ChatSync::for_session(Arc::clone(session), config.sync.clone())?;
            let raw = engine.send_broadcast(&text, scope).await?;
            println!("broadcast {} sent to {scope}", raw.id);
        }
    }
    Ok(())
}

/// Follow one conversation, printing new messages until Ctrl-C.
async fn watch(
    session: &Arc<Session>,
    session_rx: &mut mpsc::Receiver<SessionEvent>,
    config: &ClientConfig,
    peer: UserId,
) -> Result<(), CliError> {
    let (engine, mut events) = ChatSync::for_session(Arc::clone(session), config.sync.clone())?;
    engine.load_roster().await?;
    engine.load_all_conversations().await;
    engine.open_conversation(peer)?;
    let _background = engine.start_background_refresh();

    let mut printed = HashSet::new();
    print_new(&engine, peer, &mut printed);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            Some(event) = session_rx.recv() => {
                let terminated = matches!(event, SessionEvent::Terminated { .. });
                report_session_event(&event);
                if terminated {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(ChatEvent::ConversationUpdated { peer: updated } | ChatEvent::MessageSent { peer: updated, .. })
                    if updated == peer =>
                {
                    print_new(&engine, peer, &mut printed);
                }
                Some(ChatEvent::PeerSyncFailed { peer: failed }) if failed == peer => {
                    eprintln!("(sync with {peer} failed, retrying)");
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn print_new(engine: &Engine, peer: UserId, printed: &mut HashSet<MessageId>) {
    let Some(conversation) = engine.conversation(peer) else {
        return;
    };
    for message in conversation.messages() {
        if printed.insert(message.id) {
            println!("{}", format_message(message));
        }
    }
}

fn format_message(message: &Message) -> String {
    let who = match message.sender {
        Sender::Me => "me".to_string(),
        Sender::Them => message.sender_id.to_string(),
    };
    let broadcast = if message.is_broadcast { " [broadcast]" } else { "" };
    format!(
        "[{}] {who}{broadcast}: {} ({})",
        message.timestamp.format("%Y-%m-%d %H:%M"),
        message.content,
        message.status
    )
}

fn report_session_event(event: &SessionEvent) {
    match event {
        SessionEvent::Terminated { reason } => {
            eprintln!("Session ended ({reason}). Run `casedesk login` to sign in again.");
        }
        SessionEvent::LoggedIn { .. } | SessionEvent::LoggedOut => {}
    }
}
