//! frame-echo: a single-threaded, poll-driven TCP echo server.
//!
//! Clients send length-prefixed frames and receive each frame back
//! unchanged. One thread multiplexes every connection:
//! - Non-blocking sockets driven by a readiness poller (epoll/kqueue via mio)
//! - Per-connection buffering of partial reads and partial writes
//! - Pipelined requests answered in arrival order
//! - Oversized frames close the connection without a reply
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocols;
mod runtime;

use config::Config;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_message_size = config.max_message_size,
        max_connections = config.max_connections,
        "Starting frame-echo server"
    );

    if let Err(e) = runtime::run(&config) {
        error!(error = %e, "Event loop failed");
        return Err(e.into());
    }

    Ok(())
}
