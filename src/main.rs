//! line-command-server: a line-oriented TCP command server
//!
//! Clients connect over plain TCP and get a `>>` prompt. Printable input is
//! echoed as it arrives; each CR or LF ends a line whose whitespace-separated
//! tokens are run as commands:
//! - `DIR`: reply with a placeholder directory line
//! - `EX`: shut down the whole server
//!
//! Features:
//! - One worker thread per connection
//! - Cooperative shutdown via `EX`, SIGINT or SIGTERM
//! - Configuration via CLI arguments or TOML file

mod command;
mod config;
mod runtime;
mod server;
mod shutdown;

use command::CommandTable;
use config::Config;
use runtime::WorkerSettings;
use server::Server;
use shutdown::ShutdownFlag;
use tracing::{error, info};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoUtc::new("%F %T%z".to_string()))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .init();

    info!(
        host = ?config.host,
        port = config.port,
        backlog = config.backlog,
        poll_timeout = ?config.poll_timeout,
        drain_timeout_ms = ?config.drain_timeout.map(|d| d.as_millis()),
        read_buffer_size = config.read_buffer_size,
        "Starting line-command-server"
    );

    let addr = config.bind_addr().inspect_err(|e| error!(error = %e, "Startup failed"))?;

    let shutdown = ShutdownFlag::new();
    shutdown
        .register_signals()
        .inspect_err(|e| error!(error = %e, "Failed to install signal handlers"))?;

    let server = Server::bind(
        addr,
        config.backlog,
        WorkerSettings::from(&config),
        CommandTable::with_builtins(),
        shutdown,
    )
    .inspect_err(|e| error!(address = %addr, error = %e, "Failed to bind listener"))?
    .with_drain_timeout(config.drain_timeout);

    server.run();
    Ok(())
}
