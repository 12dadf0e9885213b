//! Server-sent event parsing.
//!
//! The department search streams named events: `progress` (free text),
//! `result` (one JSON partial result), `end` (final message) and `error`
//! (`{"error": "..."}`). Frames are decoded into [`StreamEvent`]s here, so
//! nothing past this point sees raw JSON text.

use crate::models::PartialResult;
use serde_json::Value;
use tracing::debug;

/// One raw SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name, `message` when the frame has no `event:` line.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Incremental parser for SSE byte streams.
///
/// Bytes are buffered until a blank line closes a frame, so multi-byte
/// characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no blank line.
    scanned: usize,
}

impl SseParser {
    /// Feed arbitrary bytes and drain the frames they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));
        let mut frames = Vec::new();

        while let Some(split) = find_blank_line(&self.buffer, self.scanned) {
            let frame: Vec<u8> = self.buffer.drain(..split + 2).collect();
            self.scanned = 0;
            let text = String::from_utf8_lossy(&frame[..split]);
            if let Some(frame) = parse_frame(&text) {
                frames.push(frame);
            }
        }

        // The last byte may be the first half of a blank line.
        self.scanned = self.buffer.len().saturating_sub(1);
        frames
    }

    /// Parse a complete transcript in one shot.
    pub fn parse_frames(input: &str) -> Vec<SseFrame> {
        let mut parser = Self::default();
        let mut frames = parser.feed(input.as_bytes());
        // A transcript may lack the blank line after its last frame.
        frames.extend(parser.feed(b"\n\n"));
        frames
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.buffer.iter().all(u8::is_ascii_whitespace)
    }
}

fn find_blank_line(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| from + i)
}

fn parse_frame(frame: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value),
            "data" => data.push(value),
            _ => {}
        }
    }

    if event.is_none() && data.is_empty() {
        return None;
    }

    Some(SseFrame {
        event: event.unwrap_or("message").to_string(),
        data: data.join("\n"),
    })
}

/// A decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Status text; `step` is `(current, total)` for `[i/n]` messages.
    Progress {
        message: String,
        step: Option<(usize, usize)>,
    },
    /// One commune's partial result.
    Result(PartialResult),
    /// A `result` event whose payload could not be decoded.
    Rejected(String),
    /// Normal end of stream, with the server's final message.
    End(String),
    /// Server-side error; the stream stops.
    Error(String),
}

impl StreamEvent {
    /// Decode a frame. Unknown event names yield `None`.
    pub fn from_frame(frame: SseFrame) -> Option<Self> {
        match frame.event.as_str() {
            "progress" => Some(StreamEvent::Progress {
                step: parse_step(&frame.data),
                message: frame.data,
            }),
            "result" => Some(match PartialResult::from_json(&frame.data) {
                Ok(result) => StreamEvent::Result(result),
                Err(e) => StreamEvent::Rejected(e.to_string()),
            }),
            "end" => Some(StreamEvent::End(frame.data)),
            "error" => Some(StreamEvent::Error(error_message(&frame.data))),
            other => {
                debug!("Ignoring SSE event '{}'", other);
                None
            }
        }
    }

    /// Whether the stream stops after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::End(_) | StreamEvent::Error(_))
    }
}

/// Extract `(current, total)` from a `"[3/12] Commune"` progress message.
fn parse_step(message: &str) -> Option<(usize, usize)> {
    let start = message.find('[')?;
    let rest = &message[start + 1..];
    let end = rest.find(']')?;
    let (current, total) = rest[..end].split_once('/')?;
    Some((current.trim().parse().ok()?, total.trim().parse().ok()?))
}

fn error_message(data: &str) -> String {
    let from_json = serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string));

    match from_json {
        Some(message) => message,
        None if data.trim().is_empty() => "stream error".to_string(),
        None => data.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frames_incrementally() {
        let mut parser = SseParser::default();

        let frames = parser.feed(b"event: progress\ndata: [1/2] Ajain\n\nevent: res");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "progress");
        assert_eq!(frames[0].data, "[1/2] Ajain");
        assert!(!parser.is_empty_buffer());

        let frames = parser.feed(b"ult\ndata: {\"commune\": \"Ajain\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "result");
        assert!(parser.is_empty_buffer());
    }

    #[test]
    fn test_byte_by_byte_feed() {
        let payload = b"event: progress\ndata: [1/2] Ajain\n\nevent: result\ndata: {}\n\n";
        let mut parser = SseParser::default();
        let mut frames = Vec::new();
        for byte in payload.iter() {
            frames.extend(parser.feed(std::slice::from_ref(byte)));
            assert!(parser.scanned <= parser.buffer.len());
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data, "[1/2] Ajain");
        assert_eq!(frames[1].event, "result");
        assert!(parser.is_empty_buffer());
    }

    #[test]
    fn test_blank_line_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.feed(b"data: a\n").is_empty());
        assert_eq!(parser.scanned, 7);
        let frames = parser.feed(b"\ndata: b");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "a");
    }

    #[test]
    fn test_multibyte_split_across_chunks() {
        let payload = "event: progress\ndata: [2/2] Guéret\n\n".as_bytes();
        let split = payload.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut parser = SseParser::default();
        assert!(parser.feed(&payload[..split]).is_empty());
        let frames = parser.feed(&payload[split..]);
        assert_eq!(frames[0].data, "[2/2] Guéret");
    }

    #[test]
    fn test_crlf_and_comments() {
        let frames = SseParser::parse_frames(": keepalive\r\n\r\nevent: end\r\ndata: Terminé\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "end".to_string(),
                data: "Terminé".to_string()
            }]
        );
    }

    #[test]
    fn test_multiline_data() {
        let frames = SseParser::parse_frames("data: a\ndata: b\n");
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn test_progress_step() {
        assert_eq!(parse_step("[3/12] Bourganeuf"), Some((3, 12)));
        assert_eq!(parse_step("Chargement des communes"), None);
        assert_eq!(parse_step("[a/b]"), None);
    }

    #[test]
    fn test_event_mapping() {
        let frame = |event: &str, data: &str| SseFrame {
            event: event.to_string(),
            data: data.to_string(),
        };

        assert!(matches!(
            StreamEvent::from_frame(frame("result", r#"{"commune": "Ajain", "rpg": []}"#)),
            Some(StreamEvent::Result(_))
        ));
        assert!(matches!(
            StreamEvent::from_frame(frame("result", "not json")),
            Some(StreamEvent::Rejected(_))
        ));
        assert!(matches!(
            StreamEvent::from_frame(frame("result", "[]")),
            Some(StreamEvent::Rejected(_))
        ));
        assert_eq!(
            StreamEvent::from_frame(frame("error", r#"{"error": "Paramètre 'department' manquant"}"#)),
            Some(StreamEvent::Error("Paramètre 'department' manquant".to_string()))
        );
        assert_eq!(
            StreamEvent::from_frame(frame("error", "")),
            Some(StreamEvent::Error("stream error".to_string()))
        );
        assert_eq!(StreamEvent::from_frame(frame("ping", "")), None);
        assert!(StreamEvent::End(String::new()).is_terminal());
    }
}
