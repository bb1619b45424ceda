//! Server-Sent Events framing.
//!
//! Network chunks do not line up with event boundaries, so bytes are
//! buffered until a blank line closes a frame.

use tracing::trace;

/// A single decoded SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event name; `message` when the frame has no `event:` field.
    pub event_type: String,
    /// Data lines joined with `\n`.
    pub data: String,
    /// Event ID for replay/ordering.
    pub id: Option<String>,
    /// Retry timing hint from server (milliseconds).
    pub retry: Option<u64>,
}

impl SseEvent {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            id: None,
            retry: None,
        }
    }

    /// Parse one frame (without its terminating blank line). Returns `None`
    /// for comment-only or data-less frames such as keep-alives.
    pub fn parse(input: &str) -> Option<Self> {
        let mut event_type = "message".to_string();
        let mut data: Option<String> = None;
        let mut id = None;
        let mut retry = None;

        for line in input.lines() {
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            let (key, value) = match line.split_once(':') {
                Some((key, value)) => (key, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };

            match key {
                "event" => event_type = value.to_string(),
                "data" => match data.as_mut() {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(value);
                    }
                    None => data = Some(value.to_string()),
                },
                "id" => id = Some(value.to_string()),
                "retry" => retry = value.parse::<u64>().ok(),
                _ => trace!("Unknown SSE field: {}", key),
            }
        }

        Some(Self {
            event_type,
            data: data?,
            id,
            retry,
        })
    }
}

/// Incremental decoder fed with raw chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    /// Bytes of a UTF-8 sequence cut off at the end of the last chunk.
    partial: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.append_utf8(chunk);

        // A trailing CR may be the first half of a CRLF split across chunks.
        let held_cr = self.buffer.ends_with('\r');
        if held_cr {
            self.buffer.pop();
        }
        normalize_line_endings(&mut self.buffer);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = SseEvent::parse(&block) {
                events.push(event);
            }
        }

        if held_cr {
            self.buffer.push('\r');
        }
        events
    }

    fn append_utf8(&mut self, chunk: &[u8]) {
        let mut bytes = std::mem::take(&mut self.partial);
        bytes.extend_from_slice(chunk);

        match std::str::from_utf8(&bytes) {
            Ok(text) => self.buffer.push_str(text),
            Err(e) if e.error_len().is_none() => {
                let (valid, rest) = bytes.split_at(e.valid_up_to());
                self.buffer.push_str(&String::from_utf8_lossy(valid));
                self.partial = rest.to_vec();
            }
            Err(_) => self.buffer.push_str(&String::from_utf8_lossy(&bytes)),
        }
    }
}

fn normalize_line_endings(buffer: &mut String) {
    if buffer.contains('\r') {
        *buffer = buffer.replace("\r\n", "\n").replace('\r', "\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_event_parse() {
        let event = SseEvent::parse("event: training_training\nid: 123\ndata: {\"a\":1}").unwrap();

        assert_eq!(event.event_type, "training_training");
        assert_eq!(event.id, Some("123".to_string()));
        assert_eq!(event.data, "{\"a\":1}");
    }

    #[test]
    fn test_sse_event_parse_multiline() {
        let event = SseEvent::parse("event: message\ndata: Line 1\ndata: Line 2").unwrap();

        assert_eq!(event.event_type, "message");
        assert_eq!(event.data, "Line 1\nLine 2");
    }

    #[test]
    fn test_sse_event_parse_without_data_is_skipped() {
        assert!(SseEvent::parse("event: message").is_none());
        assert!(SseEvent::parse(": keep-alive").is_none());
    }

    #[test]
    fn test_sse_event_parse_retry_and_default_name() {
        let event = SseEvent::parse("retry: 2500\ndata: x").unwrap();
        assert_eq!(event.event_type, "message");
        assert_eq!(event.retry, Some(2500));
    }

    #[test]
    fn test_decoder_reassembles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: training_conn").is_empty());
        assert!(decoder.push(b"ected\ndata: {}\n").is_empty());

        let events = decoder.push(b"\nevent: training_training\ndata: {\"p\":1}\n\n: ping\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "training_connected");
        assert_eq!(events[1].data, "{\"p\":1}");
    }

    #[test]
    fn test_decoder_handles_crlf_and_holds_unterminated_frame() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: a\r\ndata: 1\r\n\r\nevent: b\r\ndata: 2");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "a");

        let tail = decoder.push(b"\r\n\r\n");
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event_type, "b");
        assert_eq!(tail[0].data, "2");
    }

    #[test]
    fn test_decoder_keeps_multibyte_chars_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let frame = "data: caf\u{e9}\n\n".as_bytes();
        let split = frame.len() - 3;
        assert!(decoder.push(&frame[..split]).is_empty());

        let events = decoder.push(&frame[split..]);
        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_decoder_crlf_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: a\r\ndata: 1\r").is_empty());
        assert!(decoder.push(b"\ndata: 2\r\n").is_empty());

        let events = decoder.push(b"\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "1\n2");
    }
}
