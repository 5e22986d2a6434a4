//! Growable byte buffer for per-connection I/O accumulation.
//!
//! Each connection owns two of these: one accumulating inbound bytes until a
//! complete frame is available, one holding reply bytes not yet accepted by
//! the socket.
//!
//! ## Layout
//!
//! Held bytes are always contiguous from offset 0. Consuming a prefix shifts
//! the remainder down rather than advancing a read cursor, so the frame
//! parser can always look at `as_slice()[..4]` for the next header.
//!
//! Capacity grows geometrically and never shrinks while the buffer lives.

#![allow(dead_code)] // Positional access and capacity queries are used by tests only

use std::collections::TryReserveError;
use thiserror::Error;

/// Error returned when a buffer cannot grow.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The allocator refused the requested capacity.
    #[error("buffer allocation failed: {0}")]
    Alloc(#[from] TryReserveError),
    /// The requested size does not fit in `usize`.
    #[error("buffer capacity overflow")]
    CapacityOverflow,
}

/// Contiguous, growable byte sequence with prefix consumption.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
}

impl ByteBuffer {
    /// Create an empty buffer without allocating.
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Create an empty buffer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes held.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated size in bytes.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Held bytes, starting at offset 0.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Byte at `offset`, or `None` past the end of held data.
    pub fn at(&self, offset: usize) -> Option<u8> {
        self.data.get(offset).copied()
    }

    /// Append `bytes` to the end of the buffer, growing if needed.
    ///
    /// Fails only when the allocator cannot provide the new capacity; the
    /// buffer is left unchanged in that case.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let needed = self
            .data
            .len()
            .checked_add(bytes.len())
            .ok_or(BufferError::CapacityOverflow)?;
        self.ensure_capacity(needed)?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Drop the first `n` bytes, shifting the remainder to offset 0.
    ///
    /// Consuming more than is held clears the buffer.
    pub fn consume(&mut self, n: usize) {
        let len = self.data.len();
        if n >= len {
            self.data.clear();
            return;
        }

        self.data.copy_within(n..len, 0);
        self.data.truncate(len - n);
    }

    /// Grow to at least `min` bytes: double the current capacity, or jump
    /// straight to `min` when doubling is not enough.
    fn ensure_capacity(&mut self, min: usize) -> Result<(), BufferError> {
        let capacity = self.data.capacity();
        if capacity >= min {
            return Ok(());
        }

        let target = capacity.saturating_mul(2).max(min);
        self.data.try_reserve_exact(target - self.data.len())?;
        Ok(())
    }
}
