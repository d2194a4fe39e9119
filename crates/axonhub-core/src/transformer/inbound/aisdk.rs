//! Vercel AI-SDK data-stream inbound. Stream-only: unary responses are
//! rejected. Events are JSON-per-SSE-event with a `type` discriminator and
//! the stream is marked by the `x-vercel-ai-ui-message-stream: v1` header.

use async_stream::stream;
use futures::StreamExt;
use http::{HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::httpclient::{self, StreamEvent};
use crate::model::{
    ApiFormat, Message, MessageContent, Request, Response, ResponseError, Role,
};
use crate::transformer::{EventStream, InboundTransformer, ResponseMeta, ResponseStream};

#[derive(Debug, Clone, Deserialize)]
struct UiChatRequest {
    #[serde(default)]
    model: Option<String>,
    messages: Vec<UiMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct UiMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    #[serde(default)]
    pub parts: Vec<UiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum UiPart {
    Text { text: String },
    Reasoning { text: String },
}

#[derive(Debug, Clone, Default)]
pub struct AiSdkInbound;

impl AiSdkInbound {
    pub fn new() -> Self {
        Self
    }
}

fn data_event(value: serde_json::Value) -> StreamEvent {
    StreamEvent::data(value.to_string())
}

impl InboundTransformer for AiSdkInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::AiSdk
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        let wire: UiChatRequest = super::parse_body(request)?;
        let model = wire
            .model
            .filter(|model| !model.is_empty())
            .ok_or_else(|| ResponseError::invalid_request("model is required"))?;

        let mut neutral = Request::new(model, ApiFormat::AiSdk);
        neutral.raw = Some(super::raw_request(request));
        // The data-stream protocol is streaming by definition.
        neutral.stream = Some(true);
        for message in wire.messages {
            let role = match message.role.as_str() {
                "system" => Role::System,
                "assistant" => Role::Assistant,
                _ => Role::User,
            };
            let text: String = message
                .parts
                .iter()
                .filter_map(|part| match part {
                    UiPart::Text { text } => Some(text.as_str()),
                    UiPart::Reasoning { .. } => None,
                })
                .collect();
            let mut neutral_message = Message::new(role);
            neutral_message.content = Some(MessageContent::Text(text));
            neutral.messages.push(neutral_message);
        }
        if neutral.messages.is_empty() {
            return Err(ResponseError::invalid_request("messages must not be empty"));
        }
        Ok(neutral)
    }

    fn transform_response(&self, _response: &Response) -> Result<httpclient::Response, ResponseError> {
        Err(ResponseError::invalid_request(
            "the AI-SDK data stream does not support non-streaming responses",
        ))
    }

    fn transform_stream(&self, mut source: ResponseStream) -> EventStream {
        stream! {
            let mut message_id = String::new();
            let mut text_open = false;
            let mut reasoning_open = false;

            yield Ok(data_event(serde_json::json!({"type": "start"})));

            while let Some(item) = source.next().await {
                let response = match item {
                    Ok(response) => response,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                if response.is_done() {
                    if reasoning_open {
                        yield Ok(data_event(serde_json::json!({"type": "reasoning-end", "id": format!("{message_id}-reasoning")})));
                    }
                    if text_open {
                        yield Ok(data_event(serde_json::json!({"type": "text-end", "id": format!("{message_id}-text")})));
                    }
                    yield Ok(data_event(serde_json::json!({"type": "finish-step"})));
                    yield Ok(data_event(serde_json::json!({"type": "finish"})));
                    yield Ok(StreamEvent::done());
                    return;
                }
                if !response.id.is_empty() {
                    message_id = response.id.clone();
                }

                for choice in &response.choices {
                    let Some(delta) = &choice.delta else { continue };

                    if let Some(reasoning) = &delta.reasoning_content {
                        if !reasoning_open {
                            reasoning_open = true;
                            yield Ok(data_event(serde_json::json!({"type": "reasoning-start", "id": format!("{message_id}-reasoning")})));
                        }
                        yield Ok(data_event(serde_json::json!({
                            "type": "reasoning-delta",
                            "id": format!("{message_id}-reasoning"),
                            "delta": reasoning,
                        })));
                    }

                    if let Some(content) = &delta.content {
                        let fragment = content.joined_text();
                        if !fragment.is_empty() {
                            if reasoning_open {
                                reasoning_open = false;
                                yield Ok(data_event(serde_json::json!({"type": "reasoning-end", "id": format!("{message_id}-reasoning")})));
                            }
                            if !text_open {
                                text_open = true;
                                yield Ok(data_event(serde_json::json!({"type": "text-start", "id": format!("{message_id}-text")})));
                            }
                            yield Ok(data_event(serde_json::json!({
                                "type": "text-delta",
                                "id": format!("{message_id}-text"),
                                "delta": fragment,
                            })));
                        }
                    }

                    for call in delta.tool_calls.as_deref().unwrap_or_default() {
                        yield Ok(data_event(serde_json::json!({
                            "type": "tool-input-start",
                            "toolCallId": call.id,
                            "toolName": call.function.name,
                        })));
                        yield Ok(data_event(serde_json::json!({
                            "type": "tool-input-delta",
                            "toolCallId": call.id,
                            "inputTextDelta": call.function.arguments,
                        })));
                        yield Ok(data_event(serde_json::json!({
                            "type": "tool-input-available",
                            "toolCallId": call.id,
                            "toolName": call.function.name,
                            "input": serde_json::from_str::<serde_json::Value>(&call.function.arguments)
                                .unwrap_or(serde_json::Value::Null),
                        })));
                    }
                }
            }
            yield Ok(StreamEvent::done());
        }
        .boxed()
    }

    /// Walk the data-stream events back into a `UIMessage`. Tool-input
    /// events are not encoded into parts.
    fn aggregate_chunks(
        &self,
        chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError> {
        #[derive(Deserialize)]
        struct RawEvent {
            r#type: String,
            #[serde(default)]
            delta: Option<String>,
        }

        let mut text = String::new();
        let mut reasoning = String::new();
        for chunk in chunks {
            if chunk.is_done() || chunk.data.trim().is_empty() {
                continue;
            }
            let event: RawEvent = serde_json::from_str(&chunk.data).map_err(|err| {
                ResponseError::api_error(format!("failed to parse stream event: {err}"))
            })?;
            match event.r#type.as_str() {
                "text-delta" => text.push_str(event.delta.as_deref().unwrap_or_default()),
                "reasoning-delta" => {
                    reasoning.push_str(event.delta.as_deref().unwrap_or_default())
                }
                _ => {}
            }
        }

        let mut parts = Vec::new();
        if !reasoning.is_empty() {
            parts.push(UiPart::Reasoning { text: reasoning });
        }
        parts.push(UiPart::Text { text });
        let message = UiMessage {
            id: Some(format!("msg-{}", nanoid::nanoid!(12))),
            role: "assistant".to_owned(),
            parts,
        };
        Ok((
            serde_json::to_vec(&message)?,
            ResponseMeta {
                id: message.id.clone().unwrap_or_default(),
                model: String::new(),
                usage: None,
            },
        ))
    }

    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value) {
        let status =
            StatusCode::from_u16(error.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "type": "error",
            "errorText": error.detail.message,
        });
        (status, body)
    }

    fn stream_headers(&self) -> http::HeaderMap {
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "x-vercel-ai-ui-message-stream",
            HeaderValue::from_static("v1"),
        );
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/event-stream"),
        );
        headers.insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers
    }
}
