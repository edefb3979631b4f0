// ABOUTME: Incremental Server-Sent Events frame parser for the respond stream
// ABOUTME: Handles frames split across TCP boundaries and multiple frames per chunk
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

//! # SSE Frame Parser
//!
//! A buffering parser for the `text/event-stream` framing used by the
//! respond endpoint. Solves two correctness issues that naïve per-chunk
//! parsing gets wrong:
//!
//! 1. **Multiple frames per TCP chunk**: when network buffers batch several
//!    frames into a single `bytes_stream()` chunk, all of them are emitted.
//! 2. **Frames split across TCP boundaries**: a partial frame is retained in
//!    the buffer until its blank-line delimiter arrives.
//!
//! The parser knows nothing about event *semantics* — it exposes raw
//! [`SseFrame`] values (`event` name plus joined `data` payload) and leaves
//! interpretation to [`crate::stream`].
//!
//! Framing rules:
//! - frames are delimited by a blank line (two consecutive newlines);
//! - `event:` names the frame; the first assignment wins;
//! - `data:` lines contribute to the payload, joined by newline in order;
//! - one leading space after either colon is stripped;
//! - frames with neither an event name nor payload (comments, pings) are
//!   dropped; a frame with payload but no name is emitted with `event: None`
//!   and interpreted downstream as an implicit token.

use std::mem;

/// A parsed frame from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Frame name from the first `event:` line, if any
    pub event: Option<String>,
    /// Payload assembled from the frame's `data:` lines
    pub data: String,
}

/// Buffering frame parser that handles frames split across chunk boundaries
///
/// Bytes are buffered raw and only decoded at frame granularity, so feeding
/// the same byte stream in any chunking — even one that splits a multi-byte
/// character — yields the identical frame sequence.
#[derive(Debug, Default)]
pub struct SseFrameBuffer {
    /// Accumulated bytes not yet terminated by a blank line
    buffer: Vec<u8>,
}

impl SseFrameBuffer {
    /// Create a new empty frame buffer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes from a transport chunk, returning any complete frames
    ///
    /// Bytes are appended to the internal buffer; complete frames (terminated
    /// by a blank line) are extracted and returned. Any trailing partial
    /// frame remains buffered for the next `feed()` call.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        // Normalize CRLF transports on ingest: the delimiter search below
        // looks for "\n\n", which "\r\n\r\n" would never match.
        self.buffer.extend(bytes.iter().filter(|&&b| b != b'\r'));

        let mut frames = Vec::new();

        while let Some(delimiter) = find_blank_line(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..delimiter + 2).collect();
            let text = String::from_utf8_lossy(&raw[..delimiter]);

            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush any remaining buffered content as a best-effort final frame
    ///
    /// Called when the byte stream ends with an undelimited trailing frame.
    pub fn flush(&mut self) -> Option<SseFrame> {
        let remaining = mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&remaining);
        if text.trim().is_empty() {
            return None;
        }
        parse_frame(&text)
    }
}

/// Position of the first blank-line delimiter, if a complete frame is buffered
fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

/// Parse one raw frame body into its event name and joined data payload
fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event: Option<String> = None;
    let mut data_parts: Vec<&str> = Vec::new();

    for line in raw.split('\n') {
        if let Some(value) = line.strip_prefix("event:") {
            if event.is_none() {
                event = Some(strip_leading_space(value).to_owned());
            }
        } else if let Some(value) = line.strip_prefix("data:") {
            data_parts.push(strip_leading_space(value));
        }
        // Other fields (id:, retry:) and comment lines (:) are ignored.
    }

    let data = data_parts.join("\n");

    // A frame with neither a name nor payload is noise (comment or ping) and
    // must not reach the event mapper.
    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseFrame { event, data })
}

/// Strip at most one leading space after the field colon
fn strip_leading_space(value: &str) -> &str {
    value.strip_prefix(' ').unwrap_or(value)
}
