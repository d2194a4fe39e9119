//! The process-wide decoder registry: content type → byte-stream decoder.
//! Initialized once at startup and immutable thereafter. SSE is the
//! default; line-delimited JSON is registered for providers that stream
//! `application/x-ndjson` / `application/jsonl`.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_stream::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::line::LineDecoder;
use super::sse::SseDecoder;
use super::{ByteEventStream, Error, Result};

/// Reserved terminal marker consumed by outbound stream transformers.
pub const DONE_MARKER: &str = "[DONE]";

/// A decoded transport-layer event: a data payload plus an optional event
/// name (Anthropic-style SSE names its events; OpenAI-style does not).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    pub data: String,
}

impl StreamEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn done() -> Self {
        Self::data(DONE_MARKER)
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_MARKER
    }
}

type RawByteStream = futures::stream::BoxStream<'static, Result<bytes::Bytes>>;
type DecoderFn = fn(RawByteStream) -> ByteEventStream;

static DECODERS: LazyLock<HashMap<&'static str, DecoderFn>> = LazyLock::new(|| {
    let mut registry: HashMap<&'static str, DecoderFn> = HashMap::new();
    registry.insert("text/event-stream", decode_sse);
    registry.insert("application/x-ndjson", decode_json_lines);
    registry.insert("application/jsonl", decode_json_lines);
    registry
});

/// Pick a decoder for the response content type; SSE when unknown.
pub fn decode(content_type: &str, bytes: RawByteStream) -> ByteEventStream {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let decoder = DECODERS.get(essence.as_str()).copied().unwrap_or(decode_sse);
    decoder(bytes)
}

fn decode_sse(mut bytes: RawByteStream) -> ByteEventStream {
    stream! {
        let mut lines = LineDecoder::new();
        let mut events = SseDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            for line in lines.decode(&chunk) {
                if let Some(event) = events.decode(&line) {
                    yield Ok(event);
                }
            }
        }

        if let Some(line) = lines.flush()
            && let Some(event) = events.decode(&line)
        {
            yield Ok(event);
        }
        if let Some(event) = events.flush() {
            yield Ok(event);
        }
    }
    .boxed()
}

fn decode_json_lines(mut bytes: RawByteStream) -> ByteEventStream {
    stream! {
        let mut lines = LineDecoder::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            for line in lines.decode(&chunk) {
                if !line.trim().is_empty() {
                    yield Ok(StreamEvent::data(line));
                }
            }
        }

        if let Some(line) = lines.flush()
            && !line.trim().is_empty()
        {
            yield Ok(StreamEvent::data(line));
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(chunks: Vec<&'static str>) -> RawByteStream {
        stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok(bytes::Bytes::from(chunk))),
        )
        .boxed()
    }

    async fn collect(stream: ByteEventStream) -> Vec<StreamEvent> {
        stream
            .map(|event| event.map_err(|e| Error::Decode(e.to_string())))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|event| event.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_sse_decoding_across_chunk_boundaries() {
        let stream = decode(
            "text/event-stream; charset=utf-8",
            byte_stream(vec!["data: {\"a\"", ":1}\n\ndata: [DONE]\n\n"]),
        );
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert!(events[1].is_done());
    }

    #[tokio::test]
    async fn test_json_lines_decoding() {
        let stream = decode(
            "application/x-ndjson",
            byte_stream(vec!["{\"a\":1}\n{\"b\":2}\n"]),
        );
        let events = collect(stream).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data, r#"{"b":2}"#);
    }

    #[tokio::test]
    async fn test_unknown_content_type_defaults_to_sse() {
        let stream = decode("", byte_stream(vec!["data: hi\n\n"]));
        let events = collect(stream).await;
        assert_eq!(events[0].data, "hi");
    }
}
