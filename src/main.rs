//! howler: an event-driven HTTP server core
//!
//! Architecture:
//! - One event loop per worker thread, level-triggered readiness over mio
//! - Connections pinned to the worker that accepted them
//! - Vectored output channel with zero-copy buffer release and sendfile
//! - Staged plugin pipeline (accept, request, content, finalize, cleanup)
//! - Configuration via CLI arguments or TOML file

mod channel;
mod config;
mod connection;
mod event;
mod http;
mod plugin;
mod sched;
mod server;

use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        timeout_secs = config.timeout_secs,
        plugins = ?config.plugin_load,
        "Starting howler"
    );

    let server = Server::bind(config)?;
    let handle = server.start()?;
    handle.join();

    Ok(())
}
