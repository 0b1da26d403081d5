//! evalbridge - send editor text to an evaluation server from a terminal.
//!
//! Reads lines from stdin and sends each one to the server. Lines starting
//! with `:` are client commands (`:connect`, `:disconnect`, `:start`,
//! `:stop`, `:status`, `:quit`).

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evalbridge::config::Config;
use evalbridge::server::{CommandLauncher, ServerLifecycle};
use evalbridge::session::SessionConnection;
use evalbridge::sinks::{StatusSink, TracingSink};

/// Attempts made when connecting right after starting the server.
const STARTUP_CONNECT_ATTEMPTS: u32 = 5;

enum Step {
    Input(Option<String>),
    Event,
    Interrupt,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries responses only.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "evalbridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting evalbridge v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load().context("Failed to load configuration")?;
    let status: Arc<dyn StatusSink> = Arc::new(TracingSink);

    let mut server = ServerLifecycle::new(
        Box::new(CommandLauncher),
        config.server_command(),
        Arc::new(|line: &str| eprintln!("[server] {}", line)),
    )
    .with_status_sink(Arc::clone(&status));

    let mut session = SessionConnection::new(config.connector()).with_framing(config.framing);
    let session_status = Arc::clone(&status);
    session.on_state_change(move |_, state| {
        session_status.show_status(&format!("session {}", state));
    });
    session.on_response(|_, response| {
        if response.is_error() {
            eprintln!("{}", response.display_text());
        } else {
            println!("{}", response.display_text());
        }
    });

    let manages_server = !config.server_path.trim().is_empty();
    if config.auto_start && manages_server {
        if server.start() && config.auto_connect {
            session.connect_with_retry(STARTUP_CONNECT_ATTEMPTS).await;
        }
    } else if config.auto_connect {
        session.connect().await;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let step = tokio::select! {
            line = lines.next_line() => Step::Input(line.context("Failed to read stdin")?),
            _ = session.process_next() => Step::Event,
            _ = tokio::signal::ctrl_c() => Step::Interrupt,
        };

        match step {
            Step::Input(Some(line)) => {
                if !run_command(&line, &mut session, &mut server, &config).await {
                    break;
                }
            }
            Step::Input(None) | Step::Interrupt => break,
            Step::Event => {}
        }
    }

    session.close().await;
    server.stop();
    tracing::info!("evalbridge exited cleanly");
    Ok(())
}

/// Handle one line of input. Returns `false` when the client should exit.
async fn run_command(
    line: &str,
    session: &mut SessionConnection,
    server: &mut ServerLifecycle,
    config: &Config,
) -> bool {
    match line.trim() {
        ":quit" => return false,
        ":connect" => {
            session.connect().await;
        }
        ":disconnect" => session.disconnect(),
        ":start" => {
            if server.start() && config.auto_connect {
                session.connect_with_retry(STARTUP_CONNECT_ATTEMPTS).await;
            }
        }
        ":stop" => {
            session.close().await;
            server.stop();
        }
        ":status" => eprintln!(
            "server {} | session {} ({}) | {} queued | {}",
            server.state(),
            session.state(),
            session.session_id(),
            session.pending_len(),
            config.endpoint()
        ),
        _ => session.send(line),
    }
    true
}
