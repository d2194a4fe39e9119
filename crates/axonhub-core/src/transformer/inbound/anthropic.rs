//! Anthropic Messages inbound dialect. Content blocks and the
//! `message_start` / `content_block_*` / `message_stop` event grammar are
//! shared with the Anthropic outbound via `anthropic_compat`.

use http::StatusCode;

use crate::httpclient::{self, StreamEvent};
use crate::model::{ApiFormat, Request, Response, ResponseError};
use crate::transformer::anthropic_compat as wire;
use crate::transformer::{EventStream, InboundTransformer, ResponseMeta, ResponseStream};

#[derive(Debug, Clone, Default)]
pub struct AnthropicInbound;

impl AnthropicInbound {
    pub fn new() -> Self {
        Self
    }
}

impl InboundTransformer for AnthropicInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::Anthropic
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        let parsed: wire::MessagesRequest = super::parse_body(request)?;
        let mut neutral = wire::request_from_wire(parsed, ApiFormat::Anthropic)?;
        neutral.raw = Some(super::raw_request(request));
        Ok(neutral)
    }

    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError> {
        let envelope = wire::response_to_wire(response);
        Ok(super::json_response(serde_json::to_vec(&envelope)?))
    }

    fn transform_stream(&self, source: ResponseStream) -> EventStream {
        wire::encode_stream(source, String::new())
    }

    fn aggregate_chunks(
        &self,
        chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError> {
        let envelope = wire::aggregate_wire_events(chunks)?;
        let meta = ResponseMeta {
            id: envelope.id.clone(),
            model: envelope.model.clone(),
            usage: Some(envelope.usage.to_neutral()),
        };
        Ok((serde_json::to_vec(&envelope)?, meta))
    }

    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value) {
        let status =
            StatusCode::from_u16(error.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let kind = match error.status_code {
            400 => "invalid_request_error",
            401 => "authentication_error",
            403 => "permission_error",
            404 => "not_found_error",
            429 => "rate_limit_error",
            _ => "api_error",
        };
        let body = serde_json::json!({
            "type": "error",
            "error": {"type": kind, "message": error.detail.message},
        });
        (status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Choice, FinishReason, Message, MessageContent, Role, Usage};
    use crate::stream::{collect_all, from_slice};
    use serde_json::json;

    #[test]
    fn test_transform_request_requires_max_tokens() {
        let inbound = AnthropicInbound::new();
        let request = httpclient::Request::post("/v1/messages").with_json_body(
            serde_json::to_vec(&json!({
                "model": "claude-sonnet-4-0",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap(),
        );
        let err = inbound.transform_request(&request).unwrap_err();
        assert_eq!(err.detail.kind, "invalid_request");
        assert!(err.detail.message.contains("max_tokens"));
    }

    #[test]
    fn test_transform_response_envelope() {
        let inbound = AnthropicInbound::new();
        let mut response = Response::new("msg_1", "claude-sonnet-4-0");
        response.usage = Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 4,
            total_tokens: 14,
            ..Default::default()
        });
        let mut message = Message::new(Role::Assistant);
        message.content = Some(MessageContent::Text("128".into()));
        response.choices =
            vec![Choice::of_message(message).with_finish_reason(FinishReason::Stop)];

        let http = inbound.transform_response(&response).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&http.body).unwrap();
        assert_eq!(body["type"], "message");
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["content"][0]["text"], "128");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["usage"]["input_tokens"], 10);
        assert_eq!(body["usage"]["output_tokens"], 4);
    }

    #[tokio::test]
    async fn test_stream_then_aggregate_round_trip() {
        let inbound = AnthropicInbound::new();
        let mut chunk = Response::chunk("msg_1", "claude-sonnet-4-0");
        let mut delta = Message::new(Role::Assistant);
        delta.content = Some(MessageContent::Text("Hello".into()));
        chunk.choices = vec![Choice::of_delta(delta)];

        let events = collect_all(
            inbound.transform_stream(from_slice(vec![chunk, Response::done()])),
        )
        .await
        .unwrap();
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events.last().unwrap().event.as_deref(), Some("message_stop"));

        let (body, meta) = inbound.aggregate_chunks(&events).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["content"][0]["text"], "Hello");
        assert_eq!(meta.id, "msg_1");
    }

    #[test]
    fn test_transform_error_shape() {
        let inbound = AnthropicInbound::new();
        let (status, body) = inbound.transform_error(&ResponseError::auth_error("bad key"));
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "authentication_error");
    }
}
