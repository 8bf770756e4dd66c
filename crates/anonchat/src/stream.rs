//! Upstream event-stream decoding.
//!
//! The conversation endpoint answers with server-sent events:
//!
//! ```text
//! data: {"message": {...}, "conversation_id": "..."}
//!
//! data: 2024-04-10 12:30:00.123456
//!
//! data: [DONE]
//! ```
//!
//! [`EventStreamDecoder`] turns raw body chunks into the payloads after
//! `data: `, in order. Bytes are buffered until a newline so the output does
//! not depend on where the transport split the body, even in the middle of a
//! multi-byte character.

use async_stream::try_stream;
use futures::{Stream, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt::Display;

use crate::error::ProxyError;

pub const DATA_PREFIX: &str = "data: ";
pub const DONE_LINE: &str = "data: [DONE]";

lazy_static! {
    static ref HEARTBEAT: Regex =
        Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d{6}$").expect("valid heartbeat regex");
}

/// Upstream keeps idle streams alive with bare timestamps, which are not JSON.
pub fn is_heartbeat(payload: &str) -> bool {
    HEARTBEAT.is_match(payload)
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    done: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next body chunk and collect every payload completed by it.
    ///
    /// Once the `[DONE]` line has been seen the rest of that chunk and all
    /// later chunks are ignored.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut messages = Vec::new();
        if self.done {
            return messages;
        }

        self.buffer.extend_from_slice(chunk);

        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.buffer[start..end])
                .trim_end()
                .to_string();
            start = end + 1;

            if line == DONE_LINE {
                self.done = true;
                self.buffer.clear();
                return messages;
            }
            if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
                messages.push(payload.to_string());
            }
        }

        self.buffer.drain(..start);
        messages
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Bytes held back waiting for a newline. A body that ends without one
    /// leaves them here unprocessed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Lazily decode an upstream body into payload strings.
///
/// Polling stops as soon as `[DONE]` is seen; dropping the returned stream
/// drops the body and with it the upstream connection.
pub fn decode_event_stream<S, B, E>(chunks: S) -> impl Stream<Item = Result<String, ProxyError>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    try_stream! {
        let mut decoder = EventStreamDecoder::new();
        let mut chunks = Box::pin(chunks);

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| ProxyError::Stream(e.to_string()))?;
            for message in decoder.feed(chunk.as_ref()) {
                yield message;
            }
            if decoder.is_done() {
                break;
            }
        }
    }
}
