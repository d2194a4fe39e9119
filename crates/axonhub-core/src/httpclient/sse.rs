//! Server-Sent Events: an incremental field decoder and the outbound
//! framer. The decoder mirrors the SSE spec subset providers actually use
//! (`event:` and `data:` fields, comment lines, multi-line data).

use bytes::Bytes;

use super::decoder::StreamEvent;

/// Incremental SSE field parser. Feed it decoded lines; a blank line
/// completes the pending event.
#[derive(Default)]
pub struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, line: &str) -> Option<StreamEvent> {
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            let event = StreamEvent {
                event: self.event.take(),
                data: std::mem::take(&mut self.data).join("\n"),
            };
            return Some(event);
        }

        // Comment line
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => self.data.push(value.to_owned()),
            _ => {}
        }
        None
    }

    /// Complete a trailing event that was never terminated by a blank line.
    pub fn flush(&mut self) -> Option<StreamEvent> {
        self.decode("")
    }
}

/// Render an event back to wire framing: `event: name\ndata: json\n\n`.
pub fn frame(event: &StreamEvent) -> Bytes {
    let mut out = String::new();
    if let Some(name) = &event.event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in event.data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_named_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode("event: message_start").is_none());
        assert!(decoder.decode(r#"data: {"type":"message_start"}"#).is_none());
        let event = decoder.decode("").unwrap();
        assert_eq!(event.event.as_deref(), Some("message_start"));
        assert_eq!(event.data, r#"{"type":"message_start"}"#);
    }

    #[test]
    fn test_decode_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        decoder.decode(": keepalive");
        decoder.decode("data: line one");
        decoder.decode("data: line two");
        let event = decoder.decode("").unwrap();
        assert_eq!(event.event, None);
        assert_eq!(event.data, "line one\nline two");
    }

    #[test]
    fn test_blank_line_without_pending_event_yields_nothing() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.decode("").is_none());
    }

    #[test]
    fn test_frame_round_trip() {
        let event = StreamEvent {
            event: Some("content_block_delta".to_owned()),
            data: r#"{"index":0}"#.to_owned(),
        };
        let framed = frame(&event);
        assert_eq!(
            framed,
            Bytes::from("event: content_block_delta\ndata: {\"index\":0}\n\n")
        );

        let done = StreamEvent::done();
        assert_eq!(frame(&done), Bytes::from("data: [DONE]\n\n"));
    }
}
