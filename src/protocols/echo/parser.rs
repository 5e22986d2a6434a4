//! Echo protocol parser.

use bytes::{Buf, BufMut};

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload accepted when nothing else is configured.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

/// Result of parsing a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// Header is complete and within limits; `length` payload bytes follow.
    Complete {
        /// Payload length announced by the prefix.
        length: u32,
    },
    /// Fewer than `HEADER_LEN` bytes available.
    Incomplete,
    /// Announced payload exceeds the maximum message size.
    TooLarge {
        /// Payload length announced by the prefix.
        length: u32,
    },
}

/// Parse the length prefix at the start of `input`.
///
/// Only the header is inspected; the caller checks that the payload has
/// fully arrived.
pub fn parse(input: &[u8], max_message_size: usize) -> ParseResult {
    if input.len() < HEADER_LEN {
        return ParseResult::Incomplete;
    }

    let mut header = &input[..HEADER_LEN];
    let length = header.get_u32();

    if length as usize > max_message_size {
        ParseResult::TooLarge { length }
    } else {
        ParseResult::Complete { length }
    }
}

/// Encode a length prefix.
pub fn response_header(length: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    (&mut header[..]).put_u32(length);
    header
}
