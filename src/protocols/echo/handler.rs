//! Echo request handling over connection buffers.

use super::parser::{self, ParseResult, HEADER_LEN};
use crate::runtime::{BufferError, ByteBuffer};
use thiserror::Error;
use tracing::trace;

/// Fatal framing errors. The connection must be closed without a reply.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length prefix announced more than the maximum message size.
    #[error("frame too large: {length} > {max}")]
    TooLarge { length: u32, max: usize },
    /// The reply could not be buffered.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Outcome of one extraction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessResult {
    /// One request answered; `consumed` bytes were dropped from the input.
    Response { consumed: usize },
    /// No complete frame buffered. Nothing was consumed.
    NeedData,
}

/// Try to answer one frame from the front of `inbound`.
///
/// On success the reply frame is appended to `outbound` and the request is
/// consumed from `inbound`. A partial frame is left untouched so it can be
/// re-evaluated after the next read.
pub fn process(
    inbound: &mut ByteBuffer,
    outbound: &mut ByteBuffer,
    max_message_size: usize,
) -> Result<ProcessResult, FrameError> {
    let length = match parser::parse(inbound.as_slice(), max_message_size) {
        ParseResult::Complete { length } => length,
        ParseResult::Incomplete => return Ok(ProcessResult::NeedData),
        ParseResult::TooLarge { length } => {
            return Err(FrameError::TooLarge {
                length,
                max: max_message_size,
            })
        }
    };

    let frame_len = HEADER_LEN + length as usize;
    if inbound.len() < frame_len {
        return Ok(ProcessResult::NeedData);
    }

    let payload = &inbound.as_slice()[HEADER_LEN..frame_len];
    outbound.append(&parser::response_header(length))?;
    outbound.append(payload)?;

    inbound.consume(frame_len);

    Ok(ProcessResult::Response {
        consumed: frame_len,
    })
}

/// Answer every complete frame buffered in `inbound`, in arrival order.
///
/// Returns the number of frames answered. Stops at the first partial frame.
pub fn process_all(
    inbound: &mut ByteBuffer,
    outbound: &mut ByteBuffer,
    max_message_size: usize,
) -> Result<usize, FrameError> {
    let mut answered = 0;
    while let ProcessResult::Response { consumed } =
        process(inbound, outbound, max_message_size)?
    {
        answered += 1;
        trace!(consumed, buffered = inbound.len(), "Echoed frame");
    }
    Ok(answered)
}
