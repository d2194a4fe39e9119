//! Shared OpenAI Chat Completions wire model.
//!
//! The OpenAI dialect is the baseline: the inbound OpenAI transformer and
//! every OpenAI-compatible outbound (OpenAI itself, ModelScope, NanoGPT,
//! Codex, OpenRouter, xAI, Zai, DouBao) speak this wire shape, each with a
//! small set of flavor quirks layered on top.

use std::collections::BTreeMap;

use async_stream::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::httpclient::ByteEventStream;
use crate::json_utils;
use crate::model::{
    ApiFormat, Choice, ContentPart, FinishReason, FunctionCall, ImageUrl, Message, MessageContent,
    Modality, ReasoningEffort, Request, Response, ResponseError, Role, Tool, ToolCall,
    ToolCallType, ToolChoice, Usage,
};
use crate::transformer::ResponseStream;

// ================================================================
// Wire types
// ================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<std::collections::HashMap<String, serde_json::Value>>,
    /// Opaque provider bag; the Gemini bridge reads
    /// `extra_body.google.thinking_config` out of here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct StreamOptions {
    pub include_usage: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// OpenRouter/NanoGPT expose reasoning under this name instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// OpenRouter: generated images, appended after text as parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<ChatContentPart>>,
}

impl ChatMessage {
    fn new(role: &str) -> Self {
        Self {
            role: role.to_owned(),
            content: None,
            tool_calls: None,
            tool_call_id: None,
            name: None,
            refusal: None,
            reasoning_content: None,
            reasoning: None,
            images: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ChatContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ChatDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(
        default,
        deserialize_with = "json_utils::null_or_vec",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<StreamingToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refusal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl ChatDelta {
    /// True when no observable field is set (the xAI keepalive shape).
    pub(crate) fn is_empty(&self) -> bool {
        self.role.is_none()
            && self.content.is_none()
            && self.tool_calls.is_empty()
            && self.refusal.is_none()
            && self.reasoning_content.is_none()
            && self.reasoning.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StreamingToolCall {
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub function: StreamingFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StreamingFunction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: String,
}

/// Per-provider deviations from the OpenAI baseline.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct CompatFlavor {
    /// Reasoning arrives in a `reasoning` field (OpenRouter, NanoGPT).
    pub reasoning_field: bool,
    /// Drop deltas with no observable field (xAI keepalives).
    pub filter_empty_deltas: bool,
}

// ================================================================
// Finish reasons
// ================================================================

pub(crate) fn finish_reason_from_wire(reason: &str) -> Option<FinishReason> {
    match reason {
        "stop" => Some(FinishReason::Stop),
        "length" => Some(FinishReason::Length),
        "tool_calls" | "function_call" => Some(FinishReason::ToolUse),
        "content_filter" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

pub(crate) fn finish_reason_to_wire(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolUse => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
    }
}

// ================================================================
// Message conversions
// ================================================================

fn role_from_wire(role: &str) -> Result<Role, ResponseError> {
    match role {
        "system" | "developer" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(ResponseError::invalid_request(format!(
            "unsupported message role: {other}"
        ))),
    }
}

fn role_to_wire(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

pub(crate) fn message_from_wire(wire: ChatMessage) -> Result<Message, ResponseError> {
    let role = role_from_wire(&wire.role)?;

    if role == Role::Tool {
        let id = wire.tool_call_id.unwrap_or_default();
        let output = match wire.content {
            Some(ChatContent::Text(text)) => text,
            Some(ChatContent::Parts(parts)) => parts
                .into_iter()
                .filter_map(|part| match part {
                    ChatContentPart::Text { text } => Some(text),
                    ChatContentPart::ImageUrl { .. } => None,
                })
                .collect(),
            None => String::new(),
        };
        let mut message = Message::tool_result(id, output, false);
        message.name = wire.name;
        return Ok(message);
    }

    let mut message = Message::new(role);
    message.name = wire.name;
    message.refusal = wire.refusal;
    message.reasoning_content = wire.reasoning_content.or(wire.reasoning);
    message.tool_calls = wire.tool_calls.filter(|calls| !calls.is_empty());

    let mut parts: Vec<ContentPart> = Vec::new();
    let mut plain: Option<String> = None;
    match wire.content {
        Some(ChatContent::Text(text)) => plain = Some(text),
        Some(ChatContent::Parts(wire_parts)) => {
            for part in wire_parts {
                parts.push(match part {
                    ChatContentPart::Text { text } => ContentPart::Text { text },
                    ChatContentPart::ImageUrl { image_url } => ContentPart::ImageUrl { image_url },
                });
            }
        }
        None => {}
    }
    if let Some(images) = wire.images {
        if let Some(text) = plain.take() {
            parts.insert(0, ContentPart::Text { text });
        }
        for image in images {
            if let ChatContentPart::ImageUrl { image_url } = image {
                parts.push(ContentPart::ImageUrl { image_url });
            }
        }
    }

    message.content = match (plain, parts.is_empty()) {
        (Some(text), _) => Some(MessageContent::Text(text)),
        (None, false) => Some(MessageContent::Parts(parts)),
        (None, true) => None,
    };
    Ok(message)
}

pub(crate) fn message_to_wire(message: &Message) -> ChatMessage {
    if message.role == Role::Tool {
        let mut wire = ChatMessage::new("tool");
        if let Some(ContentPart::ToolResult { id, output, .. }) = message.parts().first() {
            wire.tool_call_id = Some(id.clone());
            wire.content = Some(ChatContent::Text(output.clone()));
        } else if let Some(text) = message.text() {
            wire.content = Some(ChatContent::Text(text));
        }
        wire.name = message.name.clone();
        return wire;
    }

    let mut wire = ChatMessage::new(role_to_wire(message.role));
    wire.name = message.name.clone();
    wire.refusal = message.refusal.clone();
    wire.reasoning_content = message.reasoning_content.clone();
    let mut tool_calls: Vec<ToolCall> = message.tool_calls.clone().unwrap_or_default();

    match &message.content {
        Some(MessageContent::Text(text)) => {
            wire.content = Some(ChatContent::Text(text.clone()));
        }
        Some(MessageContent::Parts(parts)) => {
            let mut wire_parts = Vec::new();
            for part in parts {
                match part {
                    ContentPart::Text { text } => {
                        wire_parts.push(ChatContentPart::Text { text: text.clone() })
                    }
                    ContentPart::ImageUrl { image_url } => wire_parts.push(ChatContentPart::ImageUrl {
                        image_url: image_url.clone(),
                    }),
                    ContentPart::ToolUse { id, name, input } => {
                        if !tool_calls.iter().any(|call| call.id == *id) {
                            tool_calls.push(ToolCall {
                                id: id.clone(),
                                r#type: ToolCallType::Function,
                                function: FunctionCall {
                                    name: name.clone(),
                                    arguments: input.to_string(),
                                },
                            });
                        }
                    }
                    // No slot in this wire shape; reasoning rides the
                    // dedicated field and foreign signatures ride markers.
                    ContentPart::Thinking { .. }
                    | ContentPart::RedactedThinking { .. }
                    | ContentPart::ToolResult { .. } => {}
                }
            }
            wire.content = match wire_parts.as_slice() {
                [] => None,
                [ChatContentPart::Text { text }] => Some(ChatContent::Text(text.clone())),
                _ => Some(ChatContent::Parts(wire_parts)),
            };
        }
        None => {}
    }

    wire.tool_calls = (!tool_calls.is_empty()).then_some(tool_calls);
    wire
}

// ================================================================
// Request conversions
// ================================================================

pub(crate) fn request_from_wire(
    wire: ChatCompletionRequest,
    api_format: ApiFormat,
) -> Result<Request, ResponseError> {
    if wire.model.is_empty() {
        return Err(ResponseError::invalid_request("model is required"));
    }
    if wire.messages.is_empty() {
        return Err(ResponseError::invalid_request("messages must not be empty"));
    }

    let mut request = Request::new(wire.model, api_format);
    request.messages = wire
        .messages
        .into_iter()
        .map(message_from_wire)
        .collect::<Result<Vec<_>, _>>()?;
    request.tools = wire.tools;
    request.tool_choice = wire.tool_choice;
    request.stream = wire.stream;
    request.temperature = wire.temperature;
    request.max_tokens = wire.max_tokens;
    request.reasoning_effort = wire.reasoning_effort;
    request.modalities = wire.modalities;
    request.metadata = wire.metadata;
    request.extra_body = wire.extra_body;
    if let Some(user) = wire.user {
        request.insert_metadata(crate::model::request::METADATA_USER_ID, user);
    }
    Ok(request)
}

pub(crate) fn request_to_wire(request: &Request) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: request.model.clone(),
        messages: request.messages.iter().map(message_to_wire).collect(),
        tools: request.tools.clone(),
        tool_choice: request.tool_choice.clone(),
        parallel_tool_calls: None,
        stream: request.stream,
        stream_options: request
            .is_streaming()
            .then_some(StreamOptions { include_usage: true }),
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        reasoning_effort: request.reasoning_effort,
        modalities: request.modalities.clone(),
        user: request
            .metadata_str(crate::model::request::METADATA_USER_ID)
            .map(str::to_owned),
        metadata: None,
        extra_body: request.extra_body.clone(),
    }
}

// ================================================================
// Response conversions
// ================================================================

pub(crate) fn response_from_wire(wire: ChatCompletionResponse) -> Result<Response, ResponseError> {
    let mut response = Response::new(wire.id, wire.model);
    if !wire.object.is_empty() {
        response.object = wire.object;
    }
    if wire.created != 0 {
        response.created = wire.created;
    }
    response.usage = wire.usage;
    response.choices = wire
        .choices
        .into_iter()
        .map(|choice| {
            let finish_reason = choice
                .finish_reason
                .as_deref()
                .and_then(finish_reason_from_wire);
            Ok(Choice {
                index: choice.index,
                message: choice.message.map(message_from_wire).transpose()?,
                delta: None,
                finish_reason,
            })
        })
        .collect::<Result<Vec<_>, ResponseError>>()?;
    Ok(response)
}

pub(crate) fn response_to_wire(response: &Response) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: response.id.clone(),
        object: response.object.clone(),
        created: response.created,
        model: response.model.clone(),
        choices: response
            .choices
            .iter()
            .map(|choice| ChatChoice {
                index: choice.index,
                message: choice.message.as_ref().map(message_to_wire),
                delta: None,
                finish_reason: choice.finish_reason.map(finish_reason_to_wire).map(str::to_owned),
            })
            .collect(),
        usage: response.usage,
    }
}

// ================================================================
// Streaming
// ================================================================

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

fn flush_tool_calls(pending: &mut BTreeMap<usize, PendingToolCall>) -> Option<Message> {
    if pending.is_empty() {
        return None;
    }
    let calls: Vec<ToolCall> = std::mem::take(pending)
        .into_values()
        .map(|call| ToolCall {
            id: call.id,
            r#type: ToolCallType::Function,
            function: FunctionCall {
                name: call.name,
                arguments: if call.arguments.is_empty() {
                    "{}".to_owned()
                } else {
                    call.arguments
                },
            },
        })
        .collect();
    let mut message = Message::new(Role::Assistant);
    message.tool_calls = Some(calls);
    Some(message)
}

/// Decode an OpenAI-compatible SSE stream into neutral delta responses.
///
/// Text and reasoning fragments flow through incrementally; partial tool
/// calls are accumulated by index and emitted once complete (at the finish
/// chunk, or at end of stream for providers that never send one). The Done
/// sentinel always closes the stream.
pub(crate) fn decode_stream(mut source: ByteEventStream, flavor: CompatFlavor) -> ResponseStream {
    stream! {
        let mut pending: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
        let mut id = String::new();
        let mut model = String::new();

        while let Some(event) = source.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    yield Err(ResponseError::stream_error(err.to_string()));
                    return;
                }
            };
            if event.is_done() {
                break;
            }

            let chunk = match serde_json::from_str::<ChatCompletionResponse>(&event.data) {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::debug!(?err, data = %event.data, "skipping undecodable chunk");
                    continue;
                }
            };
            if !chunk.id.is_empty() {
                id = chunk.id.clone();
            }
            if !chunk.model.is_empty() {
                model = chunk.model.clone();
            }

            if chunk.choices.is_empty() {
                if let Some(usage) = chunk.usage {
                    let mut out = Response::chunk(id.clone(), model.clone());
                    out.usage = Some(usage);
                    yield Ok(out);
                }
                continue;
            }

            for choice in chunk.choices {
                let finish_reason = choice
                    .finish_reason
                    .as_deref()
                    .and_then(finish_reason_from_wire);
                let delta = choice.delta.unwrap_or_default();

                if flavor.filter_empty_deltas && delta.is_empty() && finish_reason.is_none() {
                    continue;
                }

                for tool_call in &delta.tool_calls {
                    let entry = pending.entry(tool_call.index).or_default();
                    if let Some(call_id) = &tool_call.id
                        && !call_id.is_empty()
                    {
                        entry.id = call_id.clone();
                    }
                    if let Some(name) = &tool_call.function.name
                        && !name.is_empty()
                    {
                        entry.name = name.clone();
                    }
                    entry.arguments.push_str(&tool_call.function.arguments);
                }

                let mut message = Message::new(Role::Assistant);
                message.content = delta.content.map(MessageContent::Text);
                message.refusal = delta.refusal;
                message.reasoning_content = if flavor.reasoning_field {
                    delta.reasoning_content.or(delta.reasoning)
                } else {
                    delta.reasoning_content
                };

                let observable = message.content.is_some()
                    || message.refusal.is_some()
                    || message.reasoning_content.is_some();

                if finish_reason.is_some()
                    && let Some(flushed) = flush_tool_calls(&mut pending)
                {
                    let mut out = Response::chunk(id.clone(), model.clone());
                    out.choices = vec![Choice {
                        index: choice.index,
                        message: None,
                        delta: Some(flushed),
                        finish_reason: None,
                    }];
                    yield Ok(out);
                }

                if observable || finish_reason.is_some() {
                    let mut out = Response::chunk(id.clone(), model.clone());
                    out.usage = chunk.usage;
                    out.choices = vec![Choice {
                        index: choice.index,
                        message: None,
                        delta: observable.then_some(message),
                        finish_reason,
                    }];
                    yield Ok(out);
                } else if let Some(usage) = chunk.usage {
                    let mut out = Response::chunk(id.clone(), model.clone());
                    out.usage = Some(usage);
                    yield Ok(out);
                }
            }
        }

        if let Some(flushed) = flush_tool_calls(&mut pending) {
            let mut out = Response::chunk(id.clone(), model.clone());
            out.choices = vec![Choice::of_delta(flushed)];
            yield Ok(out);
        }
        yield Ok(Response::done());
    }
    .boxed()
}

/// Fold raw upstream chunks into one neutral envelope, mirroring what
/// [`decode_stream`] + client-side accumulation would produce.
pub(crate) fn aggregate_chunks(
    chunks: &[crate::httpclient::StreamEvent],
    flavor: CompatFlavor,
) -> Result<Response, ResponseError> {
    let mut id = String::new();
    let mut model = String::new();
    let mut created = 0u64;
    let mut text: Option<String> = None;
    let mut reasoning: Option<String> = None;
    let mut refusal: Option<String> = None;
    let mut pending: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
    let mut finish_reason = None;
    let mut usage = Usage::default();
    let mut saw_usage = false;

    for event in chunks {
        if event.is_done() || event.data.trim().is_empty() {
            continue;
        }
        let chunk: ChatCompletionResponse = serde_json::from_str(&event.data).map_err(|err| {
            ResponseError::api_error(format!("failed to parse stream chunk: {err}"))
        })?;
        if !chunk.id.is_empty() {
            id = chunk.id.clone();
        }
        if !chunk.model.is_empty() {
            model = chunk.model.clone();
        }
        if chunk.created != 0 {
            created = chunk.created;
        }
        if let Some(chunk_usage) = chunk.usage {
            usage.merge_latest(&chunk_usage);
            saw_usage = true;
        }
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason.as_deref().and_then(finish_reason_from_wire)
            {
                finish_reason = Some(reason);
            }
            let Some(delta) = choice.delta else { continue };
            if let Some(content) = delta.content {
                text.get_or_insert_default().push_str(&content);
            }
            let fragment = if flavor.reasoning_field {
                delta.reasoning_content.or(delta.reasoning)
            } else {
                delta.reasoning_content
            };
            if let Some(fragment) = fragment {
                reasoning.get_or_insert_default().push_str(&fragment);
            }
            if let Some(value) = delta.refusal {
                refusal.get_or_insert_default().push_str(&value);
            }
            for tool_call in delta.tool_calls {
                let entry = pending.entry(tool_call.index).or_default();
                if let Some(call_id) = tool_call.id.filter(|call_id| !call_id.is_empty()) {
                    entry.id = call_id;
                }
                if let Some(name) = tool_call.function.name.filter(|name| !name.is_empty()) {
                    entry.name = name;
                }
                entry.arguments.push_str(&tool_call.function.arguments);
            }
        }
    }

    let mut message = Message::new(Role::Assistant);
    message.content = text.map(MessageContent::Text);
    message.reasoning_content = reasoning;
    message.refusal = refusal;
    if let Some(flushed) = flush_tool_calls(&mut pending) {
        message.tool_calls = flushed.tool_calls;
        if finish_reason.is_none() {
            finish_reason = Some(FinishReason::ToolUse);
        }
    }

    let mut response = Response::new(id, model);
    if created != 0 {
        response.created = created;
    }
    response.usage = saw_usage.then_some(usage);
    let mut choice = Choice::of_message(message);
    choice.finish_reason = finish_reason;
    response.choices = vec![choice];
    Ok(response)
}

// ================================================================
// Errors
// ================================================================

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    /// String for OpenAI, numeric for OpenRouter; stringified either way.
    #[serde(default)]
    code: Option<serde_json::Value>,
}

/// Parse an OpenAI-shaped error body, falling back to the HTTP status text.
pub(crate) fn parse_error_body(status_code: u16, body: &str) -> ResponseError {
    let fallback_kind = ResponseError::kind_for_status(status_code);
    match serde_json::from_str::<WireErrorEnvelope>(body) {
        Ok(envelope) => {
            let mut error = ResponseError::new(
                status_code,
                envelope.error.r#type.as_deref().unwrap_or(fallback_kind),
                envelope
                    .error
                    .message
                    .unwrap_or_else(|| status_text(status_code)),
            );
            if let Some(code) = envelope.error.code {
                error = error.with_code(match code {
                    serde_json::Value::String(code) => code,
                    other => other.to_string(),
                });
            }
            error
        }
        Err(_) => ResponseError::new(
            status_code,
            crate::model::error::ERROR_TYPE_API,
            status_text(status_code),
        ),
    }
}

pub(crate) fn status_text(status_code: u16) -> String {
    http::StatusCode::from_u16(status_code)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::httpclient::StreamEvent;
    use crate::stream;
    use serde_json::json;

    fn event_stream(payloads: Vec<serde_json::Value>) -> ByteEventStream {
        let mut events: Vec<StreamEvent> = payloads
            .into_iter()
            .map(|payload| StreamEvent::data(payload.to_string()))
            .collect();
        events.push(StreamEvent::done());
        futures::stream::iter(events.into_iter().map(Ok)).boxed()
    }

    #[test]
    fn test_request_round_trip_preserves_messages_and_tools() {
        let wire: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "Hello! How are you today?"},
            ],
            "tools": [{"type": "function", "function": {"name": "calculate", "parameters": {"type": "object"}}}],
            "tool_choice": "auto",
            "max_tokens": 1024
        }))
        .unwrap();

        let neutral = request_from_wire(wire, ApiFormat::OpenAi).unwrap();
        assert_eq!(neutral.messages.len(), 2);
        assert_eq!(neutral.messages[0].role, Role::System);
        assert_eq!(neutral.max_tokens, Some(1024));

        let back = request_to_wire(&neutral);
        let rendered = serde_json::to_value(&back).unwrap();
        assert_eq!(rendered["model"], "gpt-4o-mini");
        assert_eq!(rendered["messages"][1]["content"], "Hello! How are you today?");
        assert_eq!(rendered["tools"][0]["function"]["name"], "calculate");
        assert_eq!(rendered["tool_choice"], "auto");
    }

    #[test]
    fn test_deserialize_wire_message_forms() {
        let assistant_json = r#"
        {
            "role": "assistant",
            "content": null,
            "refusal": null,
            "tool_calls": [
                {
                    "id": "call_1",
                    "type": "function",
                    "function": {
                        "name": "calculate",
                        "arguments": "{\"expression\": \"15 * 7 + 23\"}"
                    }
                }
            ]
        }
        "#;

        let jd = &mut serde_json::Deserializer::from_str(assistant_json);
        let message: ChatMessage = serde_path_to_error::deserialize(jd).unwrap_or_else(|err| {
            panic!(
                "Deserialization error at {} ({}:{}): {}",
                err.path(),
                err.inner().line(),
                err.inner().column(),
                err
            );
        });
        assert!(message.content.is_none());
        let calls = message.tool_calls.unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "calculate");

        let parted_json = r#"
        {
            "role": "user",
            "content": [
                {"type": "text", "text": "What's in this image?"},
                {"type": "image_url", "image_url": {"url": "https://example.com/cat.png"}}
            ]
        }
        "#;
        let jd = &mut serde_json::Deserializer::from_str(parted_json);
        let message: ChatMessage = serde_path_to_error::deserialize(jd).unwrap_or_else(|err| {
            panic!("Deserialization error at {}: {}", err.path(), err);
        });
        match message.content {
            Some(ChatContent::Parts(ref parts)) => assert_eq!(parts.len(), 2),
            ref other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn test_tool_message_round_trip() {
        let wire: ChatMessage = serde_json::from_value(json!({
            "role": "tool",
            "tool_call_id": "call_1",
            "content": "128"
        }))
        .unwrap();
        let neutral = message_from_wire(wire).unwrap();
        assert_eq!(neutral.role, Role::Tool);

        let back = message_to_wire(&neutral);
        assert_eq!(back.tool_call_id.as_deref(), Some("call_1"));
        assert!(matches!(back.content, Some(ChatContent::Text(ref text)) if text == "128"));
    }

    #[test]
    fn test_tool_use_part_becomes_flat_tool_call() {
        let mut message = Message::new(Role::Assistant);
        message.content = Some(MessageContent::Parts(vec![ContentPart::ToolUse {
            id: "toolu_1".into(),
            name: "calculate".into(),
            input: json!({"expression": "15 * 7 + 23"}),
        }]));
        let wire = message_to_wire(&message);
        assert!(wire.content.is_none());
        let calls = wire.tool_calls.unwrap();
        assert_eq!(calls[0].function.name, "calculate");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            json!({"expression": "15 * 7 + 23"})
        );
    }

    #[tokio::test]
    async fn test_decode_stream_accumulates_tool_calls() {
        let source = event_stream(vec![
            json!({"id": "c1", "model": "gpt-4o-mini", "choices": [{"index": 0, "delta": {"role": "assistant", "tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "calculate", "arguments": ""}}]}}]}),
            json!({"id": "c1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"expression\":"}}]}}]}),
            json!({"id": "c1", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"15 * 7 + 23\"}"}}]}}]}),
            json!({"id": "c1", "choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
        ]);
        let chunks = stream::collect_all(decode_stream(source, CompatFlavor::default()))
            .await
            .unwrap();

        // tool-call flush, finish chunk, done sentinel
        assert_eq!(chunks.len(), 3);
        let calls = chunks[0].first_delta().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            json!({"expression": "15 * 7 + 23"})
        );
        assert_eq!(
            chunks[1].choices[0].finish_reason,
            Some(FinishReason::ToolUse)
        );
        assert!(chunks[2].is_done());
    }

    #[tokio::test]
    async fn test_decode_stream_preserves_empty_content_with_reasoning() {
        // OpenRouter quirk: content "" alongside reasoning must stay "".
        let source = event_stream(vec![json!({
            "id": "gen-1758295230-abc",
            "model": "z-ai/glm-4.5-air:free",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "", "reasoning": "We"}}]
        })]);
        let flavor = CompatFlavor {
            reasoning_field: true,
            ..Default::default()
        };
        let chunks = stream::collect_all(decode_stream(source, flavor)).await.unwrap();
        let delta = chunks[0].first_delta().unwrap();
        assert_eq!(delta.reasoning_content.as_deref(), Some("We"));
        assert_eq!(delta.content, Some(MessageContent::Text(String::new())));
    }

    #[tokio::test]
    async fn test_empty_delta_filter_drops_keepalives_keeps_done() {
        let source = event_stream(vec![
            json!({"id": "x1", "choices": [{"index": 0, "delta": {}}]}),
            json!({"id": "x1", "choices": [{"index": 0, "delta": {"content": "hi"}}]}),
            json!({"id": "x1", "choices": [{"index": 0, "delta": {}}]}),
        ]);
        let flavor = CompatFlavor {
            filter_empty_deltas: true,
            ..Default::default()
        };
        let chunks = stream::collect_all(decode_stream(source, flavor)).await.unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].first_delta().unwrap().content,
            Some(MessageContent::Text("hi".into()))
        );
        assert!(chunks[1].is_done());
    }

    #[test]
    fn test_aggregate_matches_unary_shape() {
        let chunks = vec![
            StreamEvent::data(
                json!({"id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o-mini", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}}]}).to_string(),
            ),
            StreamEvent::data(
                json!({"id": "c1", "choices": [{"index": 0, "delta": {"content": " there"}, "finish_reason": "stop"}], "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7}}).to_string(),
            ),
            StreamEvent::done(),
        ];
        let response = aggregate_chunks(&chunks, CompatFlavor::default()).unwrap();
        let message = response.first_message().unwrap();
        assert_eq!(message.text().as_deref(), Some("Hello there"));
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Stop));
        assert_eq!(response.usage.unwrap().total_tokens, 7);
    }

    #[test]
    fn test_parse_error_body_variants() {
        let openai = parse_error_body(
            429,
            r#"{"error": {"message": "Rate limit reached", "type": "rate_limit_error", "code": "rate_limited"}}"#,
        );
        assert_eq!(openai.detail.message, "Rate limit reached");
        assert_eq!(openai.detail.code.as_deref(), Some("rate_limited"));

        let openrouter = parse_error_body(
            402,
            r#"{"error": {"message": "Insufficient credits", "code": 402, "metadata": {"raw": "..."}}}"#,
        );
        assert_eq!(openrouter.detail.code.as_deref(), Some("402"));

        let garbled = parse_error_body(502, "<html>bad gateway</html>");
        assert_eq!(garbled.detail.message, "Bad Gateway");
        assert_eq!(garbled.detail.kind, "api_error");
    }
}
