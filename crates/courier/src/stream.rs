//! Server-push event decoding.
//!
//! The body is UTF-8 text made of frames separated by a blank line. Inside a
//! frame, `event:` names the event and `data:` carries the payload; other
//! lines are ignored. A frame without `event:` is a `"message"` event.
//!
//! Bytes are accumulated and only scanned once the accumulator ends with a
//! frame terminator, so a terminator split across two reads is never mistaken
//! for a complete frame. Text left unterminated when the body closes is
//! dropped. Invalid UTF-8 inside a frame is decoded lossily and shows up as
//! U+FFFD rather than failing the stream.

use std::pin::Pin;

use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::RequestError;

pub const DEFAULT_EVENT: &str = "message";

/// Raw body chunks of a streaming response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, RequestError>> + Send>>;

/// Lazily decoded events. The first `Err` is also the last item.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = Result<StreamEvent<T>, RequestError>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent<T> {
    pub event: String,
    pub data: T,
}

/// One complete frame with its fields trimmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: String,
}

impl Frame {
    fn parse(block: &str) -> Option<Self> {
        let mut event = None;
        let mut data = None;
        for line in block.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                // a later data line replaces an earlier one
                data = Some(rest.trim().to_string());
            }
        }

        if event.is_none() && data.is_none() {
            return None;
        }
        Some(Self {
            event,
            data: data.unwrap_or_default(),
        })
    }

    pub fn event_type(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT)
    }

    pub fn into_text(self) -> StreamEvent<String> {
        StreamEvent {
            event: self.event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data: self.data,
        }
    }

    /// Parse the payload as JSON. An empty payload is read as `null`.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<StreamEvent<T>, RequestError> {
        let data = if self.data.is_empty() {
            serde_json::from_value(Value::Null)?
        } else {
            serde_json::from_str(&self.data)?
        };
        Ok(StreamEvent {
            event: self.event.unwrap_or_else(|| DEFAULT_EVENT.to_string()),
            data,
        })
    }
}

/// Incremental frame splitter.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every frame it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);
        if !ends_with_terminator(&self.buffer) {
            return Vec::new();
        }

        let text = String::from_utf8_lossy(&self.buffer).replace("\r\n", "\n");
        let mut blocks: Vec<&str> = text.split("\n\n").collect();
        let rest = blocks.pop().unwrap_or_default();

        let frames: Vec<Frame> = blocks.into_iter().filter_map(Frame::parse).collect();

        let mut seed = BytesMut::with_capacity(rest.len());
        seed.extend_from_slice(rest.as_bytes());
        self.buffer = seed;

        trace!(frames = frames.len(), "Decoded frames");
        frames
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn ends_with_terminator(buffer: &[u8]) -> bool {
    buffer.ends_with(b"\n\n") || buffer.ends_with(b"\n\r\n")
}

fn frames<S>(bytes: S) -> impl Stream<Item = Result<Frame, RequestError>> + Send
where
    S: Stream<Item = Result<Bytes, RequestError>> + Send + 'static,
{
    try_stream! {
        let mut decoder = FrameDecoder::new();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for frame in decoder.push(&chunk) {
                yield frame;
            }
        }

        let pending = decoder.pending_len();
        if pending > 0 {
            debug!(bytes = pending, "Discarding unterminated trailing frame");
        }
    }
}

/// Decode `bytes` into events whose payload is the raw trimmed text.
pub fn text_events<S>(bytes: S) -> EventStream<String>
where
    S: Stream<Item = Result<Bytes, RequestError>> + Send + 'static,
{
    Box::pin(frames(bytes).map(|frame| frame.map(Frame::into_text)))
}

/// Decode `bytes` into events whose payload is parsed as JSON.
///
/// A payload that fails to parse ends the sequence with a decode error.
pub fn json_events<T, S>(bytes: S) -> EventStream<T>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, RequestError>> + Send + 'static,
{
    Box::pin(try_stream! {
        let frames = frames(bytes);
        futures::pin_mut!(frames);
        while let Some(frame) = frames.next().await {
            let event = frame?.into_json::<T>()?;
            yield event;
        }
    })
}
