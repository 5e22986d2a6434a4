//! Protocol implementations.
//!
//! Each protocol has a parser for its wire format and a handler that turns
//! buffered requests into buffered responses. Handlers never touch sockets;
//! the runtime event loop owns all I/O.
//!
//! - `echo`: length-prefixed frames, replied to byte-for-byte

pub mod echo;
