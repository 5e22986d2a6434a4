//! Single-threaded readiness runtime.
//!
//! - `ByteBuffer`: growable per-connection byte accumulation
//! - `Connection`: per-socket state machine over two buffers
//! - `ConnectionTable`: slab-backed owner of all live connections
//! - `EventLoop`: poll, accept, dispatch, re-arm, sweep
//!
//! Everything runs on the calling thread; the only blocking point is the
//! poller wait.

mod buffer;
mod connection;
mod event_loop;

pub(crate) use buffer::{BufferError, ByteBuffer};
pub(crate) use connection::{Connection, ConnectionTable};
pub(crate) use event_loop::EventLoop;

use crate::config::Config;
use tracing::info;

/// Bind the configured address and serve until a fatal error.
pub fn run(config: &Config) -> std::io::Result<()> {
    let mut event_loop = EventLoop::bind(config)?;

    info!(
        addr = %event_loop.local_addr()?,
        max_message_size = config.max_message_size,
        max_connections = config.max_connections,
        "Listening"
    );

    event_loop.run()
}
