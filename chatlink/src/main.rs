//! `chatlink`: line-oriented chat client.
//!
//! Hosts one [`ChatSession`] and maps stdin lines onto it. Configuration via
//! CLI flags, environment variables, or config file
//! (`~/.config/chatlink/config.toml`).
//!
//! ```bash
//! cargo run --bin chatlink -- --base-url ws://127.0.0.1:8000 \
//!     --identity u1 --token-file /run/chatlink/token
//!
//! # Or via environment variables
//! CHATLINK_URL=ws://127.0.0.1:8000 CHATLINK_IDENTITY=u1 CHATLINK_TOKEN=t cargo run
//! ```
//!
//! Commands: `/cancel`, `/retry`, `/new`, `/open <id>`, `/status`,
//! `/refresh` (restart the session), `/quit`.
//! Anything else is sent as a message.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use chatlink::alert::{Alert, AlertChannel, AlertSink, RecoveryAction};
use chatlink::auth::ConfiguredSource;
use chatlink::config::{CliArgs, ClientConfig};
use chatlink::scope::TaskScope;
use chatlink::session::{ChatSession, SessionConfig, SessionEvent};
use chatlink::transport::ws::WsConnector;
use chatlink_proto::message::ConversationId;

type Session = ChatSession<WsConnector>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    // CLI args > config file > env > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::from_cli(&cli)
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("chatlink starting");

    let session_config = match config.to_session_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let source: Arc<ConfiguredSource> = match config.credential_source() {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let (alert_sink, mut alerts) = AlertChannel::new();
    let alert_sink: Arc<dyn AlertSink> = Arc::new(alert_sink);

    loop {
        let (session, mut events, _reachability) =
            launch(&config, &session_config, &source, &alert_sink);
        println!("conversation {}", session.active());

        let exit = run(&session, &mut events, &mut alerts).await;
        session.shutdown().await;
        match exit {
            Exit::Quit => break,
            Exit::Refresh => tracing::info!("restarting chat session"),
        }
    }

    tracing::info!("chatlink exiting");
    ExitCode::SUCCESS
}

/// Start a session, with reachability checks when configured.
fn launch(
    config: &ClientConfig,
    session_config: &SessionConfig,
    source: &Arc<ConfiguredSource>,
    alerts: &Arc<dyn AlertSink>,
) -> (Session, mpsc::Receiver<SessionEvent>, Option<TaskScope>) {
    let (reachability, checker) = match config.probe() {
        Some(tcp) => {
            tracing::info!(addr = tcp.addr(), "reachability checks enabled");
            let (rx, scope) = tcp.spawn(8);
            (Some(rx), Some(scope))
        }
        None => (None, None),
    };

    let (session, events) = ChatSession::start(
        session_config.clone(),
        Arc::new(config.ws_connector()),
        Arc::clone(source),
        Arc::clone(alerts),
        reachability,
    );
    (session, events, checker)
}

/// Initialize file-based logging.
///
/// Logs are written to a file so they don't interleave with the chat on
/// stdout. Returns a [`WorkerGuard`] that must be held until shutdown to
/// ensure all buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("chatlink.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_env("CHATLINK_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Why the main loop returned.
enum Exit {
    Quit,
    Refresh,
}

/// One parsed input line.
#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Empty,
    Quit,
    Status,
    Cancel,
    Retry,
    New,
    Refresh,
    Open(&'a str),
    Unknown(&'a str),
    Say(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let (cmd, rest) = line
            .split_once(' ')
            .map_or((line, ""), |(c, rest)| (c, rest.trim()));
        match (cmd, rest) {
            ("", _) => Self::Empty,
            ("/quit", _) => Self::Quit,
            ("/status", _) => Self::Status,
            ("/cancel", _) => Self::Cancel,
            ("/retry", _) => Self::Retry,
            ("/new", _) => Self::New,
            ("/refresh", _) => Self::Refresh,
            ("/open", id) if !id.is_empty() => Self::Open(id),
            (cmd, _) if cmd.starts_with('/') => Self::Unknown(cmd),
            _ => Self::Say(line),
        }
    }
}

/// Main loop: stdin commands, session events and alerts until quit or
/// refresh.
async fn run(
    session: &Session,
    events: &mut mpsc::Receiver<SessionEvent>,
    alerts: &mut mpsc::UnboundedReceiver<Alert>,
) -> Exit {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Exit::Quit,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(exit) = handle_line(session, Command::parse(&line)).await {
                        return exit;
                    }
                }
                Ok(None) => return Exit::Quit,
                Err(e) => {
                    tracing::error!(err = %e, "stdin read failed");
                    return Exit::Quit;
                }
            },
            Some(event) = events.recv() => print_event(&event),
            Some(alert) = alerts.recv() => print_alert(&alert),
        }
    }
}

/// Handle one command. Returns how to leave the loop, if at all.
async fn handle_line(session: &Session, command: Command<'_>) -> Option<Exit> {
    match command {
        Command::Empty => {}
        Command::Quit => return Some(Exit::Quit),
        Command::Refresh => return Some(Exit::Refresh),
        Command::Status => println!("[{}]", session.connection_label()),
        Command::Cancel => {
            if let Err(e) = session.cancel().await {
                eprintln!("! cancel failed: {e}");
            }
        }
        Command::Retry => {
            if let Err(e) = session.regenerate().await {
                eprintln!("! {e}");
            }
        }
        Command::New => println!("conversation {}", session.new_conversation().await),
        Command::Open(id) => {
            session.select(ConversationId::from_external(id)).await;
            println!("conversation {id}");
        }
        Command::Unknown(cmd) => eprintln!("! unknown command {cmd}"),
        Command::Say(text) => {
            if let Err(e) = session.submit(text).await {
                eprintln!("! {e}");
            }
        }
    }
    None
}

fn print_alert(alert: &Alert) {
    eprintln!("! {alert}");
    if matches!(alert.action, Some(RecoveryAction::Navigate { .. })) {
        eprintln!("  type /refresh to restart the session");
    }
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::Status(label) => println!("[{label}]"),
        SessionEvent::Message(msg) => println!("< {}", msg.content),
        SessionEvent::Broadcast(data) => println!("* {data}"),
        SessionEvent::TitleChanged(title) => {
            println!("# {} is now \"{}\"", title.chat_id, title.new_title);
        }
        SessionEvent::GenerationChanged {
            chat_id,
            generating,
        } => {
            tracing::debug!(chat_id = %chat_id, generating, "generation changed");
        }
    }
}
