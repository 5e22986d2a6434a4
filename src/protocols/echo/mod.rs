//! Echo protocol implementation.
//!
//! Every request is a single length-prefixed frame and every reply is the
//! same frame sent back unchanged.
//!
//! ## Protocol Format
//!
//! ```text
//! Request:  <u32 length, big-endian><payload of exactly length bytes>
//! Response: <u32 length, big-endian><payload of exactly length bytes>
//!
//! Example:
//! Request:  00 00 00 05 68 65 6c 6c 6f   ("hello")
//! Response: 00 00 00 05 68 65 6c 6c 6f
//! ```
//!
//! The length prefix is always in network byte order, independent of the
//! host architecture.
//!
//! A length above the configured maximum message size is a protocol
//! violation: the connection is closed without a reply. There are no other
//! commands and no error responses.

pub mod handler;
pub mod parser;

pub use handler::{process_all, FrameError};
pub use parser::DEFAULT_MAX_MESSAGE_SIZE;
