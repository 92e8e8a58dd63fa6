//! Server-sent event framing for the worker stream.
//!
//! Only the subset the worker speaks: `event:` and `data:` lines, frames
//! separated by a blank line, JSON payloads.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tracing::debug;

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: Value,
}

/// Renders a frame.
pub(crate) fn encode(event: &str, data: &Value) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

/// Buffers raw body bytes and yields complete frames.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: BytesMut,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and drains every frame it completed. Frames without
    /// an event name or with an unparseable payload are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((end, sep)) = frame_boundary(&self.buf) {
            let raw = self.buf.split_to(end);
            self.buf.advance(sep);
            if let Some(frame) = parse_frame(&String::from_utf8_lossy(&raw)) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Bytes held back waiting for a frame terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Position and length of the first blank-line separator.
fn frame_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn parse_frame(raw: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    let event = event.filter(|e| !e.is_empty())?;
    if data.is_empty() {
        return None;
    }
    match serde_json::from_str(&data.join("\n")) {
        Ok(data) => Some(SseFrame {
            event: event.to_string(),
            data,
        }),
        Err(e) => {
            debug!(event, error = %e, "dropping frame with invalid JSON");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let wire = encode("iteration", &json!({"iteration": 1, "tool_name": "Bash"}));
        let (a, b) = wire.as_bytes().split_at(17);

        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.pending(), 17);
        let frames = decoder.push(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "iteration");
        assert_eq!(frames[0].data["tool_name"], "Bash");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut decoder = SseDecoder::new();
        let wire = format!(
            "{}{}event: result\ndata: {{\"succ",
            encode("tool_result", &json!({"output": "ok"})),
            encode("error", &json!({"error": "boom"})),
        );
        let frames = decoder.push(wire.as_bytes());
        assert_eq!(
            frames.iter().map(|f| f.event.as_str()).collect::<Vec<_>>(),
            vec!["tool_result", "error"]
        );
        let frames = decoder.push(b"ess\": true}\n\n");
        assert_eq!(frames[0].data["success"], true);
    }

    #[test]
    fn test_crlf_and_bad_frames() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(
            b": keepalive\n\ndata: {\"x\":1}\n\nevent: result\ndata: not json\n\nevent: result\r\ndata: {\"ok\":1}\r\n\r\n",
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data["ok"], 1);
    }

    #[test]
    fn test_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: result\ndata: {\"a\":\ndata: 1}\n\n");
        assert_eq!(frames[0].data, json!({"a": 1}));
    }
}
