//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform one non-blocking read or write per ready connection.
//!
//! Each iteration:
//! 1. wait for readiness (an interrupted wait is retried)
//! 2. drain pending accepts if the listener is ready
//! 3. dispatch ready connections in table order
//! 4. re-register serviced connections with their current interest
//! 5. sweep connections marked for closing
//!
//! mio registrations are edge-triggered. A connection that got an event is
//! re-registered before the next wait, which re-arms it even when a single
//! read or write left work behind. Connections that saw no event are still
//! armed and are left alone.

use crate::config::Config;
use crate::runtime::{Connection, ConnectionTable};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Readiness reported for one connection in one iteration.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
}

impl Readiness {
    fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
        }
    }

    fn merge(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.error |= other.error;
    }
}

/// Single-threaded server loop owning the listener and every connection.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionTable<TcpStream>,
    /// Shared read target for all connections.
    scratch: Vec<u8>,
    /// Ready connections for the current iteration, sorted by key.
    ready: Vec<(usize, Readiness)>,
    max_message_size: usize,
}

impl EventLoop {
    /// Bind the configured address and register the listener.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(config.listen)?);
        Self::with_listener(listener, config)
    }

    fn with_listener(mut listener: TcpListener, config: &Config) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, mio::Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(config.event_capacity),
            listener,
            connections: ConnectionTable::new(config.max_connections),
            scratch: vec![0u8; config.read_buffer_size],
            ready: Vec::with_capacity(config.event_capacity),
            max_message_size: config.max_message_size,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run until the poller fails.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// Run a single iteration, waiting at most `timeout` for readiness.
    ///
    /// Only poller failures are returned; per-connection failures close the
    /// connection and are logged.
    pub fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.wait(timeout)?;

        let mut listener_ready = false;
        self.ready.clear();
        for event in self.events.iter() {
            match event.token() {
                LISTENER_TOKEN => listener_ready = true,
                Token(key) => self.ready.push((key, Readiness::from_event(event))),
            }
        }

        self.ready.sort_unstable_by_key(|(key, _)| *key);
        self.ready.dedup_by(|later, earlier| {
            if later.0 == earlier.0 {
                earlier.1.merge(later.1);
                true
            } else {
                false
            }
        });

        if listener_ready {
            self.accept_connections();
        }

        for i in 0..self.ready.len() {
            let (key, readiness) = self.ready[i];
            self.dispatch(key, readiness);
        }

        self.rearm();
        self.sweep();

        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("Poll interrupted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let Some(conn_id) = self.connections.insert(Connection::new(stream)) else {
                        warn!(peer = %peer_addr, "Connection limit reached, rejecting");
                        continue;
                    };

                    let registered = match self.connections.get_mut(conn_id) {
                        Some(conn) => self.poll.registry().register(
                            conn.stream_mut(),
                            Token(conn_id),
                            mio::Interest::READABLE,
                        ),
                        None => continue,
                    };

                    if let Err(e) = registered {
                        warn!(conn_id, peer = %peer_addr, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    debug!(
                        conn_id,
                        peer = %peer_addr,
                        live = self.connections.len(),
                        "Accepted connection"
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "Accept error");
                    // Pending connections may remain; re-arm so they are
                    // reported again.
                    if let Err(e) = self.poll.registry().reregister(
                        &mut self.listener,
                        LISTENER_TOKEN,
                        mio::Interest::READABLE,
                    ) {
                        warn!(error = %e, "Failed to re-arm listener");
                    }
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, conn_id: usize, readiness: Readiness) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        if readiness.readable {
            match conn.on_readable(&mut self.scratch, self.max_message_size) {
                Ok(0) => {}
                Ok(answered) => trace!(conn_id, answered, "Answered frames"),
                Err(e) => debug!(conn_id, error = %e, "Closing connection"),
            }
        }

        if readiness.writable {
            match conn.on_writable() {
                Ok(n) => trace!(conn_id, written = n, pending = conn.outgoing().len(), "Wrote"),
                Err(e) => debug!(conn_id, error = %e, "Closing connection"),
            }
        }

        if readiness.error && !readiness.readable && !readiness.writable {
            debug!(conn_id, "Socket error reported, closing connection");
            conn.close();
        }
    }

    /// Re-register every connection serviced this iteration.
    fn rearm(&mut self) {
        for &(conn_id, _) in &self.ready {
            let Some(conn) = self.connections.get_mut(conn_id) else {
                continue;
            };
            let Some(interest) = conn.interest() else {
                continue;
            };

            if let Err(e) = self
                .poll
                .registry()
                .reregister(conn.stream_mut(), Token(conn_id), interest)
            {
                debug!(conn_id, error = %e, "Failed to re-arm connection");
                conn.close();
            }
        }
    }

    /// Deregister and release every connection marked for closing.
    fn sweep(&mut self) {
        for (conn_id, mut conn) in self.connections.sweep() {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(conn_id, live = self.connection_count(), "Connection closed");
        }
    }
}

/// Create a non-blocking TCP listener with `SO_REUSEADDR` and the platform's
/// maximum backlog.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}
