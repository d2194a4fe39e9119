//! OpenAI Chat Completions inbound: the baseline dialect. The neutral model
//! maps nearly one-to-one; streaming renders `chat.completion.chunk` events
//! terminated by `[DONE]`.

use async_stream::stream;
use futures::StreamExt;
use http::StatusCode;

use crate::httpclient::{self, StreamEvent};
use crate::model::{ApiFormat, Message, Request, Response, ResponseError};
use crate::transformer::openai_compat::{
    self, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatDelta, CompatFlavor,
    StreamingFunction, StreamingToolCall,
};
use crate::transformer::{EventStream, InboundTransformer, ResponseMeta, ResponseStream};

#[derive(Debug, Clone, Default)]
pub struct OpenAiInbound;

impl OpenAiInbound {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn delta_to_wire(message: &Message) -> ChatDelta {
    ChatDelta {
        role: Some("assistant".to_owned()),
        content: message
            .content
            .as_ref()
            .map(crate::model::MessageContent::joined_text),
        tool_calls: message
            .tool_calls
            .as_deref()
            .unwrap_or_default()
            .iter()
            .enumerate()
            .map(|(index, call)| StreamingToolCall {
                index,
                id: Some(call.id.clone()),
                r#type: Some("function".to_owned()),
                function: StreamingFunction {
                    name: Some(call.function.name.clone()),
                    arguments: call.function.arguments.clone(),
                },
            })
            .collect(),
        refusal: message.refusal.clone(),
        reasoning_content: message.reasoning_content.clone(),
        reasoning: None,
    }
}

impl InboundTransformer for OpenAiInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAi
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        let wire: ChatCompletionRequest = super::parse_body(request)?;
        let mut neutral = openai_compat::request_from_wire(wire, ApiFormat::OpenAi)?;
        neutral.raw = Some(super::raw_request(request));
        Ok(neutral)
    }

    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError> {
        let wire = openai_compat::response_to_wire(response);
        Ok(super::json_response(serde_json::to_vec(&wire)?))
    }

    fn transform_stream(&self, mut source: ResponseStream) -> EventStream {
        stream! {
            while let Some(item) = source.next().await {
                let response = match item {
                    Ok(response) => response,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                if response.is_done() {
                    yield Ok(StreamEvent::done());
                    return;
                }

                let wire = ChatCompletionResponse {
                    id: response.id.clone(),
                    object: crate::model::OBJECT_CHAT_COMPLETION_CHUNK.to_owned(),
                    created: response.created,
                    model: response.model.clone(),
                    choices: response
                        .choices
                        .iter()
                        .map(|choice| ChatChoice {
                            index: choice.index,
                            message: None,
                            delta: Some(
                                choice
                                    .delta
                                    .as_ref()
                                    .map(delta_to_wire)
                                    .unwrap_or_default(),
                            ),
                            finish_reason: choice
                                .finish_reason
                                .map(openai_compat::finish_reason_to_wire)
                                .map(str::to_owned),
                        })
                        .collect(),
                    usage: response.usage,
                };
                match serde_json::to_string(&wire) {
                    Ok(data) => yield Ok(StreamEvent::data(data)),
                    Err(err) => {
                        yield Err(ResponseError::from(err));
                        return;
                    }
                }
            }
            // Upstream ended without the sentinel; still close the dialect.
            yield Ok(StreamEvent::done());
        }
        .boxed()
    }

    fn aggregate_chunks(
        &self,
        chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError> {
        let response = openai_compat::aggregate_chunks(chunks, CompatFlavor::default())?;
        let meta = ResponseMeta {
            id: response.id.clone(),
            model: response.model.clone(),
            usage: response.usage,
        };
        let body = serde_json::to_vec(&openai_compat::response_to_wire(&response))?;
        Ok((body, meta))
    }

    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value) {
        let status =
            StatusCode::from_u16(error.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_value(error.envelope())
            .unwrap_or_else(|_| serde_json::json!({"error": {"message": "internal error"}}));
        (status, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinishReason, MessageContent, Role};
    use crate::stream::{collect_all, from_slice};
    use crate::model::Choice;
    use serde_json::json;

    fn http_request(body: serde_json::Value) -> httpclient::Request {
        httpclient::Request::post("/v1/chat/completions")
            .with_json_body(serde_json::to_vec(&body).unwrap())
    }

    #[test]
    fn test_transform_request_baseline() {
        let inbound = OpenAiInbound::new();
        let request = inbound
            .transform_request(&http_request(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "Hello! How are you today?"}],
                "max_tokens": 1024
            })))
            .unwrap();
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.api_format, ApiFormat::OpenAi);
        assert_eq!(
            request.messages[0].content.as_ref().unwrap().as_text(),
            Some("Hello! How are you today?")
        );
        assert!(request.raw.is_some());
    }

    #[test]
    fn test_transform_request_rejects_missing_model() {
        let inbound = OpenAiInbound::new();
        let err = inbound
            .transform_request(&http_request(json!({"model": "", "messages": []})))
            .unwrap_err();
        assert_eq!(err.status_code, 400);
        assert_eq!(err.detail.kind, "invalid_request");
    }

    #[tokio::test]
    async fn test_transform_stream_renders_chunks_and_done() {
        let inbound = OpenAiInbound::new();
        let mut chunk = Response::chunk("c1", "gpt-4o-mini");
        let mut delta = Message::new(Role::Assistant);
        delta.content = Some(MessageContent::Text("Hi".into()));
        chunk.choices = vec![Choice::of_delta(delta).with_finish_reason(FinishReason::Stop)];

        let events = collect_all(
            inbound.transform_stream(from_slice(vec![chunk, Response::done()])),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(&events[0].data).unwrap();
        assert_eq!(parsed["object"], "chat.completion.chunk");
        assert_eq!(parsed["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_transform_error_envelope() {
        let inbound = OpenAiInbound::new();
        let (status, body) =
            inbound.transform_error(&ResponseError::rate_limit("slow down").with_code("rl"));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"]["message"], "slow down");
        assert_eq!(body["error"]["code"], "rl");
    }
}
