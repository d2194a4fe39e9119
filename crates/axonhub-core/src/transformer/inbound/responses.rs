//! OpenAI Responses inbound: the "items" model. Output is a typed item
//! list; stateful context rides `previous_response_id`, which passes
//! through as neutral metadata for the outbound to use or ignore.

use async_stream::stream;
use futures::StreamExt;
use http::StatusCode;

use crate::codec;
use crate::httpclient::{self, StreamEvent};
use crate::model::request::METADATA_PREVIOUS_RESPONSE_ID;
use crate::model::{
    ApiFormat, ContentPart, FinishReason, Message, MessageContent, ReasoningEffort, Request,
    Response, ResponseError, Role, Usage,
};
use crate::transformer::{EventStream, InboundTransformer, ResponseMeta, ResponseStream};
use serde::{Deserialize, Serialize};

// ================================================================
// Wire types
// ================================================================

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesRequest {
    pub model: String,
    pub input: InputUnion,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub previous_response_id: Option<String>,
    #[serde(default)]
    pub reasoning: Option<ReasoningParams>,
    #[serde(default)]
    pub tools: Option<Vec<ResponsesTool>>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum InputUnion {
    Text(String),
    Items(Vec<InputItem>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum InputItem {
    Message {
        role: String,
        content: ItemContent,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
    Reasoning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default)]
        summary: Vec<SummaryPart>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encrypted_content: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ItemContent {
    Text(String),
    Parts(Vec<ItemContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ItemContentPart {
    InputText { text: String },
    OutputText { text: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SummaryPart {
    pub r#type: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ReasoningParams {
    #[serde(default)]
    pub effort: Option<ReasoningEffort>,
}

/// Responses-dialect function tools are flat, unlike Chat Completions.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResponsesTool {
    pub r#type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ResponsesEnvelope {
    pub id: String,
    pub object: String,
    pub created_at: u64,
    pub model: String,
    pub status: String,
    pub output: Vec<InputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub(crate) struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl ResponsesUsage {
    fn from_neutral(usage: &Usage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }

    fn to_neutral(self) -> Usage {
        Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.total_tokens,
            ..Default::default()
        }
    }
}

fn item_content_text(content: ItemContent) -> String {
    match content {
        ItemContent::Text(text) => text,
        ItemContent::Parts(parts) => parts
            .into_iter()
            .map(|part| match part {
                ItemContentPart::InputText { text } | ItemContentPart::OutputText { text } => text,
            })
            .collect(),
    }
}

fn envelope_from_neutral(response: &Response) -> ResponsesEnvelope {
    let mut output = Vec::new();
    if let Some(message) = response.first_message() {
        for part in message.parts() {
            match part {
                ContentPart::RedactedThinking { data } => {
                    if let Some(encrypted) = codec::decode_openai_encrypted(Some(data)) {
                        output.push(InputItem::Reasoning {
                            id: None,
                            summary: Vec::new(),
                            encrypted_content: Some(encrypted),
                        });
                    }
                }
                ContentPart::Thinking { thinking, .. } => {
                    output.push(InputItem::Reasoning {
                        id: None,
                        summary: vec![SummaryPart {
                            r#type: "summary_text".to_owned(),
                            text: thinking.clone(),
                        }],
                        encrypted_content: None,
                    });
                }
                _ => {}
            }
        }
        if let Some(reasoning) = &message.reasoning_content {
            output.push(InputItem::Reasoning {
                id: None,
                summary: vec![SummaryPart {
                    r#type: "summary_text".to_owned(),
                    text: reasoning.clone(),
                }],
                encrypted_content: None,
            });
        }
        let text = message.text().unwrap_or_default();
        if !text.is_empty() {
            output.push(InputItem::Message {
                role: "assistant".to_owned(),
                content: ItemContent::Parts(vec![ItemContentPart::OutputText { text }]),
            });
        }
        for call in message.tool_calls.as_deref().unwrap_or_default() {
            output.push(InputItem::FunctionCall {
                call_id: call.id.clone(),
                name: call.function.name.clone(),
                arguments: call.function.arguments.clone(),
            });
        }
    }
    ResponsesEnvelope {
        id: response.id.clone(),
        object: "response".to_owned(),
        created_at: response.created,
        model: response.model.clone(),
        status: "completed".to_owned(),
        output,
        usage: response.usage.as_ref().map(ResponsesUsage::from_neutral),
    }
}

// ================================================================
// Transformer
// ================================================================

#[derive(Debug, Clone, Default)]
pub struct ResponsesInbound;

impl ResponsesInbound {
    pub fn new() -> Self {
        Self
    }
}

impl InboundTransformer for ResponsesInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::OpenAiResponses
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        let wire: ResponsesRequest = super::parse_body(request)?;
        if wire.model.is_empty() {
            return Err(ResponseError::invalid_request("model is required"));
        }

        let mut neutral = Request::new(wire.model, ApiFormat::OpenAiResponses);
        neutral.raw = Some(super::raw_request(request));
        neutral.stream = wire.stream;
        neutral.temperature = wire.temperature;
        neutral.max_tokens = wire.max_output_tokens;
        neutral.reasoning_effort = wire.reasoning.and_then(|params| params.effort);

        if let Some(instructions) = wire.instructions {
            neutral.messages.push(Message::system(instructions));
        }

        match wire.input {
            InputUnion::Text(text) => neutral.messages.push(Message::user(text)),
            InputUnion::Items(items) => {
                for item in items {
                    match item {
                        InputItem::Message { role, content } => {
                            let role = match role.as_str() {
                                "system" | "developer" => Role::System,
                                "assistant" => Role::Assistant,
                                _ => Role::User,
                            };
                            let mut message = Message::new(role);
                            message.content =
                                Some(MessageContent::Text(item_content_text(content)));
                            neutral.messages.push(message);
                        }
                        InputItem::FunctionCall {
                            call_id,
                            name,
                            arguments,
                        } => {
                            let mut message = Message::new(Role::Assistant);
                            message.content = Some(MessageContent::Parts(vec![
                                ContentPart::ToolUse {
                                    id: call_id,
                                    name,
                                    input: serde_json::from_str(&arguments)
                                        .unwrap_or(serde_json::Value::Null),
                                },
                            ]));
                            neutral.messages.push(message);
                        }
                        InputItem::FunctionCallOutput { call_id, output } => {
                            neutral
                                .messages
                                .push(Message::tool_result(call_id, output, false));
                        }
                        InputItem::Reasoning {
                            summary,
                            encrypted_content,
                            ..
                        } => {
                            let mut parts = Vec::new();
                            if let Some(encrypted) = encrypted_content {
                                parts.push(ContentPart::RedactedThinking {
                                    data: codec::encode_openai_encrypted(Some(&encrypted))
                                        .unwrap_or(encrypted),
                                });
                            }
                            for part in summary {
                                parts.push(ContentPart::Thinking {
                                    thinking: part.text,
                                    signature: None,
                                });
                            }
                            if !parts.is_empty() {
                                let mut message = Message::new(Role::Assistant);
                                message.content = Some(MessageContent::Parts(parts));
                                neutral.messages.push(message);
                            }
                        }
                    }
                }
            }
        }

        if let Some(tools) = wire.tools {
            let tools: Vec<_> = tools
                .into_iter()
                .filter(|tool| tool.r#type == "function")
                .map(|tool| crate::model::Tool::Function {
                    function: crate::model::FunctionDefinition {
                        name: tool.name.unwrap_or_default(),
                        description: tool.description,
                        parameters: tool.parameters,
                        strict: None,
                    },
                })
                .collect();
            if !tools.is_empty() {
                neutral.tools = Some(tools);
            }
        }

        if let Some(previous) = wire.previous_response_id {
            neutral.insert_metadata(METADATA_PREVIOUS_RESPONSE_ID, previous);
        }
        if neutral.messages.is_empty() {
            return Err(ResponseError::invalid_request("input must not be empty"));
        }
        Ok(neutral)
    }

    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError> {
        let envelope = envelope_from_neutral(response);
        Ok(super::json_response(serde_json::to_vec(&envelope)?))
    }

    fn transform_stream(&self, mut source: ResponseStream) -> EventStream {
        stream! {
            let mut text = String::new();
            let mut folded: Option<Response> = None;
            let mut started = false;

            while let Some(item) = source.next().await {
                let response = match item {
                    Ok(response) => response,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };

                if response.is_done() {
                    let mut fin = folded.take().unwrap_or_else(|| Response::new("", ""));
                    if let Some(message) = fin
                        .choices
                        .first_mut()
                        .and_then(|choice| choice.message.as_mut())
                    {
                        message.content = Some(MessageContent::Text(text.clone()));
                    }
                    let envelope = envelope_from_neutral(&fin);
                    match serde_json::to_string(
                        &serde_json::json!({"type": "response.completed", "response": envelope}),
                    ) {
                        Ok(data) => yield Ok(StreamEvent::named("response.completed", data)),
                        Err(err) => {
                            yield Err(ResponseError::from(err));
                            return;
                        }
                    }
                    return;
                }

                let folded = folded.get_or_insert_with(|| {
                    let mut base = Response::new(response.id.clone(), response.model.clone());
                    base.choices = vec![crate::model::Choice::of_message(Message::new(
                        Role::Assistant,
                    ))];
                    base
                });
                if !response.id.is_empty() {
                    folded.id = response.id.clone();
                }
                if !response.model.is_empty() {
                    folded.model = response.model.clone();
                }
                if response.usage.is_some() {
                    folded.usage = response.usage;
                }

                if !started {
                    started = true;
                    let data = serde_json::json!({
                        "type": "response.created",
                        "response": {"id": folded.id, "object": "response", "status": "in_progress"},
                    });
                    yield Ok(StreamEvent::named("response.created", data.to_string()));
                }

                for choice in &response.choices {
                    let Some(delta) = &choice.delta else { continue };
                    if let Some(content) = &delta.content {
                        let fragment = content.joined_text();
                        if !fragment.is_empty() {
                            text.push_str(&fragment);
                            let data = serde_json::json!({
                                "type": "response.output_text.delta",
                                "delta": fragment,
                            });
                            yield Ok(StreamEvent::named(
                                "response.output_text.delta",
                                data.to_string(),
                            ));
                        }
                    }
                    for call in delta.tool_calls.as_deref().unwrap_or_default() {
                        if let Some(message) = folded
                            .choices
                            .first_mut()
                            .and_then(|choice| choice.message.as_mut())
                        {
                            message
                                .tool_calls
                                .get_or_insert_with(Vec::new)
                                .push(call.clone());
                        }
                        let data = serde_json::json!({
                            "type": "response.output_item.added",
                            "item": {
                                "type": "function_call",
                                "call_id": call.id,
                                "name": call.function.name,
                                "arguments": call.function.arguments,
                            },
                        });
                        yield Ok(StreamEvent::named(
                            "response.output_item.added",
                            data.to_string(),
                        ));
                    }
                }
            }
        }
        .boxed()
    }

    fn aggregate_chunks(
        &self,
        chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError> {
        for chunk in chunks.iter().rev() {
            if chunk.event.as_deref() == Some("response.completed") {
                let parsed: serde_json::Value = serde_json::from_str(&chunk.data)
                    .map_err(|err| ResponseError::api_error(format!("bad completed event: {err}")))?;
                let envelope = parsed.get("response").cloned().unwrap_or_default();
                let usage = envelope
                    .get("usage")
                    .and_then(|usage| {
                        serde_json::from_value::<ResponsesUsage>(usage.clone()).ok()
                    })
                    .map(ResponsesUsage::to_neutral);
                let meta = ResponseMeta {
                    id: envelope
                        .get("id")
                        .and_then(|id| id.as_str())
                        .unwrap_or_default()
                        .to_owned(),
                    model: envelope
                        .get("model")
                        .and_then(|model| model.as_str())
                        .unwrap_or_default()
                        .to_owned(),
                    usage,
                };
                return Ok((serde_json::to_vec(&envelope)?, meta));
            }
        }
        Err(ResponseError::api_error(
            "stream ended without a response.completed event",
        ))
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
    use crate::model::Choice;
    use crate::stream::{collect_all, from_slice};
    use serde_json::json;

    fn http_request(body: serde_json::Value) -> httpclient::Request {
        httpclient::Request::post("/v1/responses")
            .with_json_body(serde_json::to_vec(&body).unwrap())
    }

    #[test]
    fn test_transform_request_items_model() {
        let inbound = ResponsesInbound::new();
        let request = inbound
            .transform_request(&http_request(json!({
                "model": "gpt-4o-mini",
                "instructions": "answer briefly",
                "previous_response_id": "resp_prior",
                "reasoning": {"effort": "medium"},
                "input": [
                    {"type": "message", "role": "user", "content": "What is 15 * 7 + 23?"},
                    {"type": "function_call", "call_id": "call_1", "name": "calculate", "arguments": "{\"expression\":\"15 * 7 + 23\"}"},
                    {"type": "function_call_output", "call_id": "call_1", "output": "128"},
                    {"type": "reasoning", "encrypted_content": "enc-bytes"}
                ]
            })))
            .unwrap();

        assert_eq!(request.reasoning_effort, Some(ReasoningEffort::Medium));
        assert_eq!(
            request.metadata_str(METADATA_PREVIOUS_RESPONSE_ID),
            Some("resp_prior")
        );
        assert_eq!(request.messages.len(), 5); // system + 4 items
        assert_eq!(request.messages[3].role, Role::Tool);
        match &request.messages[4].parts()[0] {
            ContentPart::RedactedThinking { data } => {
                assert!(codec::is_openai_encrypted(Some(data)));
                assert_eq!(
                    codec::decode_openai_encrypted(Some(data)).as_deref(),
                    Some("enc-bytes")
                );
            }
            other => panic!("unexpected part: {other:?}"),
        }
    }

    #[test]
    fn test_transform_response_items() {
        let inbound = ResponsesInbound::new();
        let mut message = Message::new(Role::Assistant);
        message.content = Some(MessageContent::Text("The answer is 128.".into()));
        message.tool_calls = None;
        let mut response = Response::new("resp_1", "gpt-4o-mini");
        response.choices =
            vec![Choice::of_message(message).with_finish_reason(FinishReason::Stop)];

        let http = inbound.transform_response(&response).unwrap();
        let body: serde_json::Value = serde_json::from_slice(&http.body).unwrap();
        assert_eq!(body["object"], "response");
        assert_eq!(body["output"][0]["type"], "message");
        assert_eq!(
            body["output"][0]["content"][0]["text"],
            "The answer is 128."
        );
    }

    #[tokio::test]
    async fn test_transform_stream_event_sequence() {
        let inbound = ResponsesInbound::new();
        let mut chunk = Response::chunk("resp_1", "gpt-4o-mini");
        let mut delta = Message::new(Role::Assistant);
        delta.content = Some(MessageContent::Text("128".into()));
        chunk.choices = vec![Choice::of_delta(delta)];

        let events = collect_all(
            inbound.transform_stream(from_slice(vec![chunk, Response::done()])),
        )
        .await
        .unwrap();
        let names: Vec<_> = events.iter().filter_map(|event| event.event.clone()).collect();
        assert_eq!(
            names,
            vec![
                "response.created",
                "response.output_text.delta",
                "response.completed",
            ]
        );

        let (body, meta) = inbound.aggregate_chunks(&events).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["output"][0]["content"][0]["text"], "128");
        assert_eq!(meta.id, "resp_1");
    }
}
