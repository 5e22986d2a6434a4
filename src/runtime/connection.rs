//! Connection state machine for managing TCP connections.
//!
//! Each connection owns its stream, an inbound buffer accumulating request
//! bytes and an outbound buffer holding reply bytes the socket has not yet
//! accepted. The current state decides which readiness the event loop asks
//! the poller for.
//!
//! ```text
//! accept ──▶ Reading ◀──▶ Writing
//!               │            │
//!               └──▶ Closing ◀┘ ──▶ removed by the close sweep
//! ```

use crate::protocols::echo::{self, FrameError};
use crate::runtime::{BufferError, ByteBuffer};
use mio::Interest;
use slab::Slab;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for request bytes.
    Reading,
    /// Replies are pending in the outbound buffer.
    Writing,
    /// Terminal. The connection is released by the next close sweep.
    Closing,
}

/// Reason a connection was moved to `Closing`.
#[derive(Debug, Error)]
pub enum ConnError {
    /// The peer closed its side of the stream.
    #[error("peer closed connection")]
    Eof,
    /// Read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The peer violated the framing protocol.
    #[error("protocol error: {0}")]
    Frame(#[from] FrameError),
    /// Inbound bytes could not be buffered.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    incoming: ByteBuffer,
    outgoing: ByteBuffer,
}

impl<S> Connection<S> {
    /// Create a new connection in initial reading state.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            incoming: ByteBuffer::new(),
            outgoing: ByteBuffer::new(),
        }
    }

    /// Current connection state.
    #[cfg(test)]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Check if the connection is waiting for request bytes.
    pub fn wants_read(&self) -> bool {
        self.state == ConnState::Reading
    }

    /// Check if replies are pending in the outbound buffer.
    pub fn wants_write(&self) -> bool {
        self.state == ConnState::Writing
    }

    /// Check if the connection is marked for the close sweep.
    pub fn wants_close(&self) -> bool {
        self.state == ConnState::Closing
    }

    /// Readiness to register with the poller, or `None` once closing.
    pub fn interest(&self) -> Option<Interest> {
        match self.state {
            ConnState::Reading => Some(Interest::READABLE),
            ConnState::Writing => Some(Interest::WRITABLE),
            ConnState::Closing => None,
        }
    }

    /// Mark connection for closing.
    pub fn close(&mut self) {
        self.state = ConnState::Closing;
    }

    /// Get an immutable reference to the underlying stream.
    #[cfg(test)]
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Get a mutable reference to the underlying stream, for registration.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes received but not yet forming a complete frame.
    #[cfg(test)]
    pub fn incoming(&self) -> &ByteBuffer {
        &self.incoming
    }

    /// Reply bytes not yet written to the socket.
    pub fn outgoing(&self) -> &ByteBuffer {
        &self.outgoing
    }
}

impl<S: Read> Connection<S> {
    /// Handle a readable event.
    ///
    /// Performs a single read into `scratch`, buffers the bytes and answers
    /// every complete frame. Returns the number of frames answered. On error
    /// the connection has already been moved to `Closing`.
    pub fn on_readable(
        &mut self,
        scratch: &mut [u8],
        max_message_size: usize,
    ) -> Result<usize, ConnError> {
        let result = self.read_and_process(scratch, max_message_size);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn read_and_process(
        &mut self,
        scratch: &mut [u8],
        max_message_size: usize,
    ) -> Result<usize, ConnError> {
        if !self.wants_read() {
            return Ok(0);
        }

        let n = match self.stream.read(scratch) {
            Ok(0) => return Err(ConnError::Eof),
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        self.incoming.append(&scratch[..n])?;
        let answered = echo::process_all(&mut self.incoming, &mut self.outgoing, max_message_size)?;

        if !self.outgoing.is_empty() {
            self.state = ConnState::Writing;
        }

        Ok(answered)
    }
}

impl<S: Write> Connection<S> {
    /// Handle a writable event.
    ///
    /// Performs a single write of everything pending and returns the number
    /// of bytes the socket accepted. A short write leaves the connection in
    /// `Writing` until the next writable event. On error the connection has
    /// already been moved to `Closing`.
    pub fn on_writable(&mut self) -> Result<usize, ConnError> {
        let result = self.write_pending();
        if result.is_err() {
            self.close();
        }
        result
    }

    fn write_pending(&mut self) -> Result<usize, ConnError> {
        if !self.wants_write() {
            return Ok(0);
        }

        let n = match self.stream.write(self.outgoing.as_slice()) {
            Ok(0) => {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
            }
            Ok(n) => n,
            Err(ref e) if is_transient(e) => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        self.outgoing.consume(n);
        if self.outgoing.is_empty() {
            self.state = ConnState::Reading;
        }

        Ok(n)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Table of live connections using slab allocation.
///
/// The table is the sole owner of every connection. Keys of removed
/// connections are reused, so storage is bounded by the live count.
pub struct ConnectionTable<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionTable<S> {
    /// Create a new table with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::new(),
            max_connections,
        }
    }

    /// Insert a new connection into the table.
    ///
    /// Returns `None` if the table is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(key)
    }

    /// Remove a connection from the table.
    pub fn remove(&mut self, key: usize) -> Option<Connection<S>> {
        self.connections.try_remove(key)
    }

    /// Check if a connection exists.
    #[cfg(test)]
    pub fn contains(&self, key: usize) -> bool {
        self.connections.contains(key)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if the table has reached its connection limit.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Iterate over all connections in table order.
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }

    /// Remove every connection marked for closing, in table order.
    ///
    /// The caller owns the returned connections and releases them.
    pub fn sweep(&mut self) -> Vec<(usize, Connection<S>)> {
        let closing: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.wants_close())
            .map(|(key, _)| key)
            .collect();

        closing
            .into_iter()
            .map(|key| (key, self.connections.remove(key)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted read outcome for `MockStream`.
    enum ReadStep {
        Data(Vec<u8>),
        Eof,
        Fail(io::ErrorKind),
    }

    /// In-memory stream: reads follow a script, writes accept at most
    /// `write_limit` bytes per call. An exhausted script reads as
    /// `WouldBlock`.
    struct MockStream {
        reads: VecDeque<ReadStep>,
        written: Vec<u8>,
        write_limit: usize,
        write_error: Option<io::ErrorKind>,
    }

    impl MockStream {
        fn new(reads: Vec<ReadStep>) -> Self {
            Self {
                reads: reads.into(),
                written: Vec::new(),
                write_limit: usize::MAX,
                write_error: None,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(ReadStep::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Some(ReadStep::Eof) => Ok(0),
                Some(ReadStep::Fail(kind)) => Err(kind.into()),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(kind) = self.write_error {
                return Err(kind.into());
            }
            let n = buf.len().min(self.write_limit);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    const HELLO: &[u8] = b"\x00\x00\x00\x05hello";

    fn data(bytes: &[u8]) -> ReadStep {
        ReadStep::Data(bytes.to_vec())
    }

    #[test]
    fn test_connection_state_transitions() {
        let mut conn = Connection::new(MockStream::new(vec![data(HELLO)]));
        let mut scratch = [0u8; 64];

        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.interest(), Some(Interest::READABLE));

        assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 1);
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.interest(), Some(Interest::WRITABLE));
        assert!(conn.incoming().is_empty());

        assert_eq!(conn.on_writable().unwrap(), HELLO.len());
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.stream().written, HELLO);

        conn.close();
        assert!(conn.wants_close());
        assert_eq!(conn.interest(), None);
    }

    #[test]
    fn test_exactly_one_intent_at_rest() {
        let mut conn = Connection::new(MockStream::new(vec![data(HELLO)]));
        let mut scratch = [0u8; 64];

        for _ in 0..3 {
            assert!(conn.wants_read() ^ conn.wants_write());
            let _ = conn.on_readable(&mut scratch, 1024);
            assert!(conn.wants_read() ^ conn.wants_write());
            let _ = conn.on_writable();
        }
    }

    #[test]
    fn test_byte_by_byte_request() {
        let steps = HELLO.iter().map(|b| data(&[*b])).collect();
        let mut conn = Connection::new(MockStream::new(steps));
        let mut scratch = [0u8; 64];

        for _ in 0..HELLO.len() - 1 {
            assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 0);
            assert_eq!(conn.state(), ConnState::Reading);
            assert!(conn.outgoing().is_empty());
        }

        assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 1);
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.outgoing().as_slice(), HELLO);
    }

    #[test]
    fn test_partial_write_resumes() {
        let mut stream = MockStream::new(vec![data(HELLO)]);
        stream.write_limit = 4;
        let mut conn = Connection::new(stream);
        let mut scratch = [0u8; 64];

        conn.on_readable(&mut scratch, 1024).unwrap();

        assert_eq!(conn.on_writable().unwrap(), 4);
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.outgoing().as_slice(), b"hello");

        assert_eq!(conn.on_writable().unwrap(), 4);
        assert_eq!(conn.state(), ConnState::Writing);

        assert_eq!(conn.on_writable().unwrap(), 1);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.stream().written, HELLO);
    }

    #[test]
    fn test_eof_mid_frame_closes_without_reply() {
        let mut conn = Connection::new(MockStream::new(vec![
            data(b"\x00\x00\x00\x05he"),
            ReadStep::Eof,
        ]));
        let mut scratch = [0u8; 64];

        conn.on_readable(&mut scratch, 1024).unwrap();
        assert_eq!(conn.state(), ConnState::Reading);

        assert!(matches!(
            conn.on_readable(&mut scratch, 1024),
            Err(ConnError::Eof)
        ));
        assert!(conn.wants_close());
        assert!(conn.outgoing().is_empty());
    }

    #[test]
    fn test_oversized_frame_closes_without_reply() {
        let mut conn = Connection::new(MockStream::new(vec![data(b"\x00\x00\x04\x01...")]));
        let mut scratch = [0u8; 64];

        assert!(matches!(
            conn.on_readable(&mut scratch, 1024),
            Err(ConnError::Frame(FrameError::TooLarge { length: 1025, .. }))
        ));
        assert!(conn.wants_close());
        assert!(conn.outgoing().is_empty());
    }

    #[test]
    fn test_pipelined_frames_in_one_read() {
        let mut bytes = HELLO.to_vec();
        bytes.extend_from_slice(b"\x00\x00\x00\x03bye");
        let mut conn = Connection::new(MockStream::new(vec![data(&bytes)]));
        let mut scratch = [0u8; 64];

        assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 2);
        conn.on_writable().unwrap();
        assert_eq!(conn.stream().written, bytes);
    }

    #[test]
    fn test_transient_errors_keep_state() {
        let mut conn = Connection::new(MockStream::new(vec![
            ReadStep::Fail(io::ErrorKind::Interrupted),
            ReadStep::Fail(io::ErrorKind::WouldBlock),
        ]));
        let mut scratch = [0u8; 64];

        assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 0);
        assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 0);
        assert_eq!(conn.state(), ConnState::Reading);
    }

    #[test]
    fn test_read_error_closes() {
        let mut conn = Connection::new(MockStream::new(vec![ReadStep::Fail(
            io::ErrorKind::ConnectionReset,
        )]));
        let mut scratch = [0u8; 64];

        assert!(matches!(
            conn.on_readable(&mut scratch, 1024),
            Err(ConnError::Io(_))
        ));
        assert!(conn.wants_close());
    }

    #[test]
    fn test_write_error_closes() {
        let mut stream = MockStream::new(vec![data(HELLO)]);
        stream.write_error = Some(io::ErrorKind::BrokenPipe);
        let mut conn = Connection::new(stream);
        let mut scratch = [0u8; 64];

        conn.on_readable(&mut scratch, 1024).unwrap();
        assert!(conn.on_writable().is_err());
        assert!(conn.wants_close());
    }

    #[test]
    fn test_closing_ignores_events() {
        let mut conn = Connection::new(MockStream::new(vec![data(HELLO)]));
        let mut scratch = [0u8; 64];
        conn.close();

        assert_eq!(conn.on_readable(&mut scratch, 1024).unwrap(), 0);
        assert_eq!(conn.on_writable().unwrap(), 0);
        assert!(conn.wants_close());
        assert!(conn.incoming().is_empty());
    }

    #[test]
    fn test_connection_table() {
        let mut table = ConnectionTable::new(2);

        let k1 = table.insert(Connection::new(MockStream::new(vec![]))).unwrap();
        let k2 = table.insert(Connection::new(MockStream::new(vec![]))).unwrap();

        // At capacity
        assert!(table.is_full());
        assert!(table.insert(Connection::new(MockStream::new(vec![]))).is_none());
        assert_eq!(table.len(), 2);

        table.remove(k1);
        assert!(!table.contains(k1));
        assert!(table.contains(k2));
        assert_eq!(table.len(), 1);

        // Freed keys are reused.
        let k3 = table.insert(Connection::new(MockStream::new(vec![]))).unwrap();
        assert_eq!(k3, k1);
    }

    #[test]
    fn test_sweep_removes_only_closing() {
        let mut table = ConnectionTable::new(8);
        let keys: Vec<usize> = (0..4)
            .map(|_| table.insert(Connection::new(MockStream::new(vec![]))).unwrap())
            .collect();

        table.get_mut(keys[1]).unwrap().close();
        table.get_mut(keys[3]).unwrap().close();
        // Closing twice is still one removal.
        table.get_mut(keys[3]).unwrap().close();

        let removed: Vec<usize> = table.sweep().into_iter().map(|(key, _)| key).collect();
        assert_eq!(removed, vec![keys[1], keys[3]]);
        assert_eq!(table.len(), 2);
        assert!(table.sweep().is_empty());

        let remaining: Vec<usize> = table.iter().map(|(key, _)| key).collect();
        assert_eq!(remaining, vec![keys[0], keys[2]]);
    }
}
