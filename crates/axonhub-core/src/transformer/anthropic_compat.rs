//! Shared Anthropic Messages wire model: content blocks, the streaming
//! event grammar, and the fold/unfold state machines used by both the
//! inbound dialect and the Anthropic/ClaudeCode outbound.

use async_stream::stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::httpclient::{ByteEventStream, StreamEvent};
use crate::model::{
    ApiFormat, Choice, ContentPart, FinishReason, FunctionCall, ImageUrl, Message, MessageContent,
    Request, Response, ResponseError, Role, Tool, ToolCall, ToolCallType, ToolChoice,
    ToolChoiceMode, Usage,
};
use crate::transformer::{EventStream, ResponseStream};

// ================================================================
// Wire types
// ================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessagesRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    pub messages: Vec<WireMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<WireToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<crate::model::ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum SystemPrompt {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireMessage {
    pub role: String,
    pub content: BlockContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum BlockContent {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<BlockContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ImageSource {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireToolChoice {
    pub r#type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
}

impl WireUsage {
    pub(crate) fn to_neutral(&self) -> Usage {
        let mut usage = Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
            ..Default::default()
        };
        if let Some(cached) = self.cache_read_input_tokens {
            usage.prompt_tokens_details = Some(crate::model::PromptTokensDetails {
                cached_tokens: cached,
            });
        }
        usage
    }

    pub(crate) fn from_neutral(usage: &Usage) -> Self {
        Self {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .map(|details| details.cached_tokens),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessagesResponse {
    pub id: String,
    pub r#type: String,
    pub role: String,
    pub model: String,
    pub content: Vec<Block>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: WireUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum AnthropicStreamEvent {
    MessageStart {
        message: MessagesResponse,
    },
    ContentBlockStart {
        index: usize,
        content_block: Block,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    #[serde(other)]
    Unknown,
}

impl AnthropicStreamEvent {
    fn event_name(&self) -> &'static str {
        match self {
            AnthropicStreamEvent::MessageStart { .. } => "message_start",
            AnthropicStreamEvent::ContentBlockStart { .. } => "content_block_start",
            AnthropicStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            AnthropicStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            AnthropicStreamEvent::MessageDelta { .. } => "message_delta",
            AnthropicStreamEvent::MessageStop => "message_stop",
            AnthropicStreamEvent::Ping => "ping",
            AnthropicStreamEvent::Unknown => "unknown",
        }
    }

    pub(crate) fn to_stream_event(&self) -> Result<StreamEvent, ResponseError> {
        Ok(StreamEvent::named(
            self.event_name(),
            serde_json::to_string(self)?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
}

// ================================================================
// Stop reasons
// ================================================================

pub(crate) fn finish_reason_from_wire(reason: &str) -> Option<FinishReason> {
    match reason {
        "end_turn" | "stop_sequence" => Some(FinishReason::Stop),
        "max_tokens" => Some(FinishReason::Length),
        "tool_use" => Some(FinishReason::ToolUse),
        "refusal" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

pub(crate) fn finish_reason_to_wire(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolUse => "tool_use",
        FinishReason::ContentFilter => "refusal",
    }
}

// ================================================================
// Request conversions
// ================================================================

fn block_to_part(block: Block) -> ContentPart {
    match block {
        Block::Text { text } => ContentPart::Text { text },
        Block::Image { source } => {
            let url = match source.r#type.as_str() {
                "url" => source.url.unwrap_or_default(),
                _ => format!(
                    "data:{};base64,{}",
                    source.media_type.as_deref().unwrap_or("image/png"),
                    source.data.unwrap_or_default()
                ),
            };
            ContentPart::ImageUrl {
                image_url: ImageUrl { url, detail: None },
            }
        }
        Block::ToolUse { id, name, input } => ContentPart::ToolUse { id, name, input },
        Block::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ContentPart::ToolResult {
            id: tool_use_id,
            output: block_content_text(content),
            is_error,
        },
        Block::Thinking {
            thinking,
            signature,
        } => ContentPart::Thinking {
            thinking,
            signature,
        },
        Block::RedactedThinking { data } => ContentPart::RedactedThinking { data },
    }
}

fn block_content_text(content: Option<BlockContent>) -> String {
    match content {
        Some(BlockContent::Text(text)) => text,
        Some(BlockContent::Blocks(blocks)) => blocks
            .into_iter()
            .filter_map(|block| match block {
                Block::Text { text } => Some(text),
                _ => None,
            })
            .collect(),
        None => String::new(),
    }
}

fn part_to_block(part: &ContentPart) -> Option<Block> {
    match part {
        ContentPart::Text { text } => Some(Block::Text { text: text.clone() }),
        ContentPart::ImageUrl { image_url } => Some(Block::Image {
            source: image_source_from_url(&image_url.url),
        }),
        ContentPart::ToolUse { id, name, input } => Some(Block::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        }),
        ContentPart::ToolResult { id, output, is_error } => Some(Block::ToolResult {
            tool_use_id: id.clone(),
            content: Some(BlockContent::Text(output.clone())),
            is_error: *is_error,
        }),
        ContentPart::Thinking {
            thinking,
            signature,
        } => {
            // Foreign signatures have no validity here; they ride the
            // redacted slot instead (handled by the caller).
            if codec::is_gemini_signature(signature.as_deref())
                || codec::is_openai_encrypted(signature.as_deref())
            {
                None
            } else {
                Some(Block::Thinking {
                    thinking: thinking.clone(),
                    signature: signature.clone(),
                })
            }
        }
        ContentPart::RedactedThinking { data } => {
            Some(Block::RedactedThinking { data: data.clone() })
        }
    }
}

fn image_source_from_url(url: &str) -> ImageSource {
    if let Some(rest) = url.strip_prefix("data:")
        && let Some((media_type, data)) = rest.split_once(";base64,")
    {
        return ImageSource {
            r#type: "base64".to_owned(),
            media_type: Some(media_type.to_owned()),
            data: Some(data.to_owned()),
            url: None,
        };
    }
    ImageSource {
        r#type: "url".to_owned(),
        media_type: None,
        data: None,
        url: Some(url.to_owned()),
    }
}

/// Convert a neutral message to Anthropic blocks. Thinking parts carrying a
/// foreign marker are re-homed into `redacted_thinking` blocks.
pub(crate) fn message_to_blocks(message: &Message) -> Vec<Block> {
    let mut blocks = Vec::new();
    match &message.content {
        Some(MessageContent::Text(text)) => blocks.push(Block::Text { text: text.clone() }),
        Some(MessageContent::Parts(parts)) => {
            for part in parts {
                if let Some(block) = part_to_block(part) {
                    blocks.push(block);
                } else if let ContentPart::Thinking { signature, .. } = part
                    && let Some(signature) = signature
                {
                    blocks.push(Block::RedactedThinking {
                        data: signature.clone(),
                    });
                }
            }
        }
        None => {}
    }
    if let Some(reasoning) = &message.reasoning_content
        && !reasoning.is_empty()
    {
        blocks.insert(
            0,
            Block::Thinking {
                thinking: reasoning.clone(),
                signature: None,
            },
        );
    }
    for call in message.tool_calls.as_deref().unwrap_or_default() {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        blocks.push(Block::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
    }
    blocks
}

/// Parse an Anthropic wire request into the neutral model. Tool-result
/// blocks split out into dedicated `role=tool` messages.
pub(crate) fn request_from_wire(
    wire: MessagesRequest,
    api_format: ApiFormat,
) -> Result<Request, ResponseError> {
    if wire.model.is_empty() {
        return Err(ResponseError::invalid_request("model is required"));
    }
    let max_tokens = wire
        .max_tokens
        .ok_or_else(|| ResponseError::invalid_request("max_tokens is required"))?;

    let mut request = Request::new(wire.model, api_format);
    request.max_tokens = Some(max_tokens);
    request.stream = wire.stream;
    request.temperature = wire.temperature;
    request.thinking = wire.thinking;

    if let Some(system) = wire.system {
        let text = match system {
            SystemPrompt::Text(text) => text,
            SystemPrompt::Blocks(blocks) => blocks
                .into_iter()
                .filter_map(|block| match block {
                    Block::Text { text } => Some(text),
                    _ => None,
                })
                .collect(),
        };
        request.messages.push(Message::system(text));
    }

    for wire_message in wire.messages {
        let role = match wire_message.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => {
                return Err(ResponseError::invalid_request(format!(
                    "unsupported message role: {other}"
                )));
            }
        };
        match wire_message.content {
            BlockContent::Text(text) => {
                let mut message = Message::new(role);
                message.content = Some(MessageContent::Text(text));
                request.messages.push(message);
            }
            BlockContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        Block::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        } => {
                            if !parts.is_empty() {
                                let mut message = Message::new(role);
                                message.content =
                                    Some(MessageContent::Parts(std::mem::take(&mut parts)));
                                request.messages.push(message);
                            }
                            request.messages.push(Message::tool_result(
                                tool_use_id,
                                block_content_text(content),
                                is_error.unwrap_or(false),
                            ));
                        }
                        other => parts.push(block_to_part(other)),
                    }
                }
                if !parts.is_empty() {
                    let mut message = Message::new(role);
                    message.content = Some(MessageContent::Parts(parts));
                    request.messages.push(message);
                }
            }
        }
    }

    if let Some(tools) = wire.tools {
        request.tools = Some(
            tools
                .into_iter()
                .map(|tool| Tool::Function {
                    function: crate::model::FunctionDefinition {
                        name: tool.name,
                        description: tool.description,
                        parameters: Some(tool.input_schema),
                        strict: None,
                    },
                })
                .collect(),
        );
    }
    if let Some(choice) = wire.tool_choice {
        request.tool_choice = Some(match choice.r#type.as_str() {
            "any" => ToolChoice::Mode(ToolChoiceMode::Required),
            "none" => ToolChoice::Mode(ToolChoiceMode::None),
            "tool" => ToolChoice::named(choice.name.unwrap_or_default()),
            _ => ToolChoice::Mode(ToolChoiceMode::Auto),
        });
    }
    Ok(request)
}

/// Render a neutral request as an Anthropic wire request.
pub(crate) fn request_to_wire(request: &Request) -> MessagesRequest {
    let mut system: Option<String> = None;
    let mut messages: Vec<WireMessage> = Vec::new();

    for message in &request.messages {
        match message.role {
            Role::System => {
                let text = message.text().unwrap_or_default();
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => system = Some(text),
                }
            }
            Role::Tool => {
                if let Some(ContentPart::ToolResult { id, output, is_error }) =
                    message.parts().first()
                {
                    messages.push(WireMessage {
                        role: "user".to_owned(),
                        content: BlockContent::Blocks(vec![Block::ToolResult {
                            tool_use_id: id.clone(),
                            content: Some(BlockContent::Text(output.clone())),
                            is_error: *is_error,
                        }]),
                    });
                }
            }
            Role::User | Role::Assistant => {
                let blocks = message_to_blocks(message);
                if blocks.is_empty() {
                    continue;
                }
                messages.push(WireMessage {
                    role: if message.role == Role::User {
                        "user".to_owned()
                    } else {
                        "assistant".to_owned()
                    },
                    content: BlockContent::Blocks(blocks),
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter_map(|tool| match tool {
                Tool::Function { function } => Some(WireTool {
                    name: function.name.clone(),
                    description: function.description.clone(),
                    input_schema: function
                        .parameters
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                }),
                _ => None,
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = request.tool_choice.as_ref().map(|choice| match choice {
        ToolChoice::Mode(ToolChoiceMode::Auto) => WireToolChoice {
            r#type: "auto".to_owned(),
            name: None,
        },
        ToolChoice::Mode(ToolChoiceMode::Required) => WireToolChoice {
            r#type: "any".to_owned(),
            name: None,
        },
        ToolChoice::Mode(ToolChoiceMode::None) => WireToolChoice {
            r#type: "none".to_owned(),
            name: None,
        },
        ToolChoice::Named(named) => WireToolChoice {
            r#type: "tool".to_owned(),
            name: Some(named.function.name.clone()),
        },
    });

    MessagesRequest {
        model: request.model.clone(),
        system: system.map(SystemPrompt::Text),
        messages,
        max_tokens: request.max_tokens,
        tools: tools.filter(|tools| !tools.is_empty()),
        tool_choice,
        stream: request.stream,
        temperature: request.temperature,
        thinking: request.thinking.clone(),
    }
}

// ================================================================
// Response conversions
// ================================================================

pub(crate) fn response_from_wire(wire: MessagesResponse) -> Response {
    let mut message = Message::new(Role::Assistant);
    let parts: Vec<ContentPart> = wire.content.into_iter().map(block_to_part).collect();
    if !parts.is_empty() {
        message.content = Some(MessageContent::Parts(parts));
    }

    let mut response = Response::new(wire.id, wire.model);
    response.usage = Some(wire.usage.to_neutral());
    let mut choice = Choice::of_message(message);
    choice.finish_reason = wire
        .stop_reason
        .as_deref()
        .and_then(finish_reason_from_wire);
    response.choices = vec![choice];
    Response {
        api_format: Some(ApiFormat::Anthropic),
        ..response
    }
}

pub(crate) fn response_to_wire(response: &Response) -> MessagesResponse {
    let choice = response.choices.first();
    let message = choice.and_then(|choice| choice.message.as_ref());
    let content = message.map(message_to_blocks).unwrap_or_default();
    MessagesResponse {
        id: response.id.clone(),
        r#type: "message".to_owned(),
        role: "assistant".to_owned(),
        model: response.model.clone(),
        content,
        stop_reason: choice
            .and_then(|choice| choice.finish_reason)
            .map(finish_reason_to_wire)
            .map(str::to_owned),
        stop_sequence: None,
        usage: response
            .usage
            .as_ref()
            .map(WireUsage::from_neutral)
            .unwrap_or_default(),
    }
}

// ================================================================
// Provider stream → neutral (outbound direction)
// ================================================================

enum OpenBlock {
    Text,
    Thinking { signature: String },
    Redacted { data: String },
    ToolUse { id: String, name: String, json: String },
}

/// Decode an Anthropic SSE stream into neutral delta responses.
///
/// Text/thinking deltas flow through incrementally; a tool-use block's
/// `input_json_delta` fragments are concatenated and parsed only at
/// `content_block_stop`. A stop without a matching start synthesizes a
/// zero-length block. Usage is additive for output tokens,
/// last-value-wins for input tokens.
pub(crate) fn decode_stream(mut source: ByteEventStream) -> ResponseStream {
    stream! {
        let mut id = String::new();
        let mut model = String::new();
        let mut usage = Usage::default();
        let mut open: Option<OpenBlock> = None;
        let mut finish_reason: Option<FinishReason> = None;

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
            let parsed = match serde_json::from_str::<AnthropicStreamEvent>(&event.data) {
                Ok(parsed) => parsed,
                Err(err) => {
                    if !event.data.trim().is_empty() {
                        yield Err(ResponseError::stream_error(format!(
                            "failed to parse stream event: {err}"
                        )));
                        return;
                    }
                    continue;
                }
            };

            match parsed {
                AnthropicStreamEvent::MessageStart { message } => {
                    id = message.id;
                    model = message.model;
                    usage.accumulate_delta(&message.usage.to_neutral());
                }
                AnthropicStreamEvent::ContentBlockStart { content_block, .. } => {
                    open = Some(match content_block {
                        Block::ToolUse { id, name, .. } => OpenBlock::ToolUse {
                            id,
                            name,
                            json: String::new(),
                        },
                        Block::Thinking { signature, .. } => OpenBlock::Thinking {
                            signature: signature.unwrap_or_default(),
                        },
                        Block::RedactedThinking { data } => OpenBlock::Redacted { data },
                        Block::Text { text } => {
                            if !text.is_empty() {
                                let mut delta = Message::new(Role::Assistant);
                                delta.content = Some(MessageContent::Text(text));
                                let mut out = Response::chunk(id.clone(), model.clone());
                                out.choices = vec![Choice::of_delta(delta)];
                                yield Ok(out);
                            }
                            OpenBlock::Text
                        }
                        _ => OpenBlock::Text,
                    });
                }
                AnthropicStreamEvent::ContentBlockDelta { delta, .. } => match delta {
                    BlockDelta::TextDelta { text } => {
                        let mut delta = Message::new(Role::Assistant);
                        delta.content = Some(MessageContent::Text(text));
                        let mut out = Response::chunk(id.clone(), model.clone());
                        out.choices = vec![Choice::of_delta(delta)];
                        yield Ok(out);
                    }
                    BlockDelta::ThinkingDelta { thinking } => {
                        let mut delta = Message::new(Role::Assistant);
                        delta.reasoning_content = Some(thinking);
                        let mut out = Response::chunk(id.clone(), model.clone());
                        out.choices = vec![Choice::of_delta(delta)];
                        yield Ok(out);
                    }
                    BlockDelta::SignatureDelta { signature } => {
                        // Signature fragments may interleave with thinking
                        // deltas inside one block scope.
                        if let Some(OpenBlock::Thinking { signature: acc }) = &mut open {
                            acc.push_str(&signature);
                        }
                    }
                    BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(OpenBlock::ToolUse { json, .. }) = &mut open {
                            json.push_str(&partial_json);
                        }
                    }
                },
                AnthropicStreamEvent::ContentBlockStop { .. } => {
                    match open.take() {
                        Some(OpenBlock::ToolUse { id: call_id, name, json }) => {
                            let arguments = if json.is_empty() { "{}".to_owned() } else { json };
                            if let Err(err) = serde_json::from_str::<serde_json::Value>(&arguments) {
                                yield Err(ResponseError::stream_error(format!(
                                    "tool input is not valid JSON: {err}"
                                )));
                                return;
                            }
                            let mut delta = Message::new(Role::Assistant);
                            delta.tool_calls = Some(vec![ToolCall {
                                id: call_id,
                                r#type: ToolCallType::Function,
                                function: FunctionCall { name, arguments },
                            }]);
                            let mut out = Response::chunk(id.clone(), model.clone());
                            out.choices = vec![Choice::of_delta(delta)];
                            yield Ok(out);
                        }
                        Some(OpenBlock::Thinking { signature }) if !signature.is_empty() => {
                            let mut delta = Message::new(Role::Assistant);
                            delta.content = Some(MessageContent::Parts(vec![
                                ContentPart::Thinking {
                                    thinking: String::new(),
                                    signature: Some(signature),
                                },
                            ]));
                            let mut out = Response::chunk(id.clone(), model.clone());
                            out.choices = vec![Choice::of_delta(delta)];
                            yield Ok(out);
                        }
                        Some(OpenBlock::Redacted { data }) => {
                            let mut delta = Message::new(Role::Assistant);
                            delta.content = Some(MessageContent::Parts(vec![
                                ContentPart::RedactedThinking { data },
                            ]));
                            let mut out = Response::chunk(id.clone(), model.clone());
                            out.choices = vec![Choice::of_delta(delta)];
                            yield Ok(out);
                        }
                        Some(_) => {}
                        None => {
                            // A stop without a start: synthesize a
                            // zero-length text block, as the aggregate does.
                            let mut delta = Message::new(Role::Assistant);
                            delta.content = Some(MessageContent::Text(String::new()));
                            let mut out = Response::chunk(id.clone(), model.clone());
                            out.choices = vec![Choice::of_delta(delta)];
                            yield Ok(out);
                        }
                    }
                }
                AnthropicStreamEvent::MessageDelta { delta, usage: delta_usage } => {
                    if let Some(delta_usage) = delta_usage {
                        usage.accumulate_delta(&delta_usage.to_neutral());
                    }
                    if let Some(reason) =
                        delta.stop_reason.as_deref().and_then(finish_reason_from_wire)
                    {
                        finish_reason = Some(reason);
                    }
                }
                AnthropicStreamEvent::MessageStop => break,
                AnthropicStreamEvent::Ping | AnthropicStreamEvent::Unknown => {}
            }
        }

        let mut last = Response::chunk(id, model);
        last.usage = Some(usage);
        if let Some(reason) = finish_reason {
            last.choices = vec![Choice {
                index: 0,
                message: None,
                delta: None,
                finish_reason: Some(reason),
            }];
        }
        yield Ok(last);
        yield Ok(Response::done());
    }
    .boxed()
}

/// Fold raw Anthropic wire events into one neutral envelope, pairing
/// start/stop markers and concatenating deltas per block index.
pub(crate) fn aggregate_wire_events(
    chunks: &[StreamEvent],
) -> Result<MessagesResponse, ResponseError> {
    let mut envelope: Option<MessagesResponse> = None;
    let mut blocks: std::collections::BTreeMap<usize, (Option<Block>, String)> =
        std::collections::BTreeMap::new();
    let mut stop_reason = None;
    let mut usage = WireUsage::default();

    for chunk in chunks {
        if chunk.data.trim().is_empty() || chunk.is_done() {
            continue;
        }
        let event: AnthropicStreamEvent = serde_json::from_str(&chunk.data).map_err(|err| {
            ResponseError::api_error(format!("failed to parse stream event: {err}"))
        })?;
        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                usage.input_tokens = message.usage.input_tokens;
                usage.output_tokens += message.usage.output_tokens;
                envelope = Some(message);
            }
            AnthropicStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                blocks.insert(index, (Some(content_block), String::new()));
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let entry = blocks.entry(index).or_insert((None, String::new()));
                match delta {
                    BlockDelta::TextDelta { text } => match &mut entry.0 {
                        Some(Block::Text { text: acc }) => acc.push_str(&text),
                        None => entry.0 = Some(Block::Text { text }),
                        _ => {}
                    },
                    BlockDelta::ThinkingDelta { thinking } => match &mut entry.0 {
                        Some(Block::Thinking { thinking: acc, .. }) => acc.push_str(&thinking),
                        None => {
                            entry.0 = Some(Block::Thinking {
                                thinking,
                                signature: None,
                            })
                        }
                        _ => {}
                    },
                    BlockDelta::SignatureDelta { signature } => {
                        if let Some(Block::Thinking {
                            signature: slot, ..
                        }) = &mut entry.0
                        {
                            match slot {
                                Some(acc) => acc.push_str(&signature),
                                None => *slot = Some(signature),
                            }
                        }
                    }
                    BlockDelta::InputJsonDelta { partial_json } => {
                        entry.1.push_str(&partial_json);
                    }
                }
            }
            AnthropicStreamEvent::ContentBlockStop { index } => {
                if let Some((block, json)) = blocks.get_mut(&index) {
                    if let Some(Block::ToolUse { input, .. }) = block {
                        // Concatenated fragments must parse only now.
                        let raw = if json.is_empty() { "{}" } else { json.as_str() };
                        *input = serde_json::from_str(raw).map_err(|err| {
                            ResponseError::api_error(format!(
                                "tool input is not valid JSON: {err}"
                            ))
                        })?;
                    }
                } else {
                    // Stop without a start: synthesize a zero-length block.
                    blocks.insert(
                        index,
                        (Some(Block::Text { text: String::new() }), String::new()),
                    );
                }
            }
            AnthropicStreamEvent::MessageDelta { delta, usage: delta_usage } => {
                if let Some(delta_usage) = delta_usage {
                    usage.output_tokens += delta_usage.output_tokens;
                    if delta_usage.input_tokens != 0 {
                        usage.input_tokens = delta_usage.input_tokens;
                    }
                }
                if delta.stop_reason.is_some() {
                    stop_reason = delta.stop_reason;
                }
            }
            AnthropicStreamEvent::MessageStop
            | AnthropicStreamEvent::Ping
            | AnthropicStreamEvent::Unknown => {}
        }
    }

    let mut envelope = envelope.unwrap_or(MessagesResponse {
        id: String::new(),
        r#type: "message".to_owned(),
        role: "assistant".to_owned(),
        model: String::new(),
        content: Vec::new(),
        stop_reason: None,
        stop_sequence: None,
        usage: WireUsage::default(),
    });
    envelope.content = blocks
        .into_values()
        .filter_map(|(block, _)| block)
        .collect();
    envelope.stop_reason = stop_reason;
    envelope.usage = usage;
    Ok(envelope)
}

// ================================================================
// Neutral stream → dialect events (inbound direction)
// ================================================================

/// Incremental encoder from neutral chunks to the Anthropic event grammar.
/// Block boundaries open and close as the delta kind changes; indices are
/// assigned in emission order.
#[derive(Default)]
struct StreamEncoder {
    started: bool,
    finished: bool,
    index: usize,
    open: Option<&'static str>, // "text" | "thinking"
    finish_reason: Option<FinishReason>,
    usage: Usage,
    id: String,
    model: String,
}

impl StreamEncoder {
    fn close_open_block(&mut self, out: &mut Vec<AnthropicStreamEvent>) {
        if self.open.take().is_some() {
            out.push(AnthropicStreamEvent::ContentBlockStop { index: self.index });
            self.index += 1;
        }
    }

    fn ensure_block(&mut self, kind: &'static str, out: &mut Vec<AnthropicStreamEvent>) {
        if self.open == Some(kind) {
            return;
        }
        self.close_open_block(out);
        self.open = Some(kind);
        let content_block = match kind {
            "thinking" => Block::Thinking {
                thinking: String::new(),
                signature: None,
            },
            _ => Block::Text {
                text: String::new(),
            },
        };
        out.push(AnthropicStreamEvent::ContentBlockStart {
            index: self.index,
            content_block,
        });
    }

    fn singleton_block(&mut self, block: Block, delta: Option<BlockDelta>, out: &mut Vec<AnthropicStreamEvent>) {
        self.close_open_block(out);
        out.push(AnthropicStreamEvent::ContentBlockStart {
            index: self.index,
            content_block: block,
        });
        if let Some(delta) = delta {
            out.push(AnthropicStreamEvent::ContentBlockDelta {
                index: self.index,
                delta,
            });
        }
        out.push(AnthropicStreamEvent::ContentBlockStop { index: self.index });
        self.index += 1;
    }

    fn feed(&mut self, response: &Response) -> Vec<AnthropicStreamEvent> {
        let mut out = Vec::new();
        if !response.id.is_empty() {
            self.id = response.id.clone();
        }
        if !response.model.is_empty() {
            self.model = response.model.clone();
        }
        if !self.started && !response.is_done() {
            self.started = true;
            out.push(AnthropicStreamEvent::MessageStart {
                message: MessagesResponse {
                    id: self.id.clone(),
                    r#type: "message".to_owned(),
                    role: "assistant".to_owned(),
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: WireUsage::default(),
                },
            });
        }
        if response.is_done() {
            out.extend(self.finish());
            return out;
        }

        if let Some(chunk_usage) = &response.usage {
            self.usage.merge_latest(chunk_usage);
        }

        for choice in &response.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            let Some(delta) = &choice.delta else { continue };

            if let Some(reasoning) = &delta.reasoning_content {
                self.ensure_block("thinking", &mut out);
                out.push(AnthropicStreamEvent::ContentBlockDelta {
                    index: self.index,
                    delta: BlockDelta::ThinkingDelta {
                        thinking: reasoning.clone(),
                    },
                });
            }

            match &delta.content {
                Some(MessageContent::Text(text)) => {
                    self.ensure_block("text", &mut out);
                    out.push(AnthropicStreamEvent::ContentBlockDelta {
                        index: self.index,
                        delta: BlockDelta::TextDelta { text: text.clone() },
                    });
                }
                Some(MessageContent::Parts(parts)) => {
                    for part in parts {
                        match part {
                            ContentPart::Thinking {
                                signature: Some(signature),
                                ..
                            } => self.singleton_block(
                                Block::Thinking {
                                    thinking: String::new(),
                                    signature: None,
                                },
                                Some(BlockDelta::SignatureDelta {
                                    signature: signature.clone(),
                                }),
                                &mut out,
                            ),
                            ContentPart::RedactedThinking { data } => self.singleton_block(
                                Block::RedactedThinking { data: data.clone() },
                                None,
                                &mut out,
                            ),
                            ContentPart::Text { text } => self.singleton_block(
                                Block::Text {
                                    text: String::new(),
                                },
                                Some(BlockDelta::TextDelta { text: text.clone() }),
                                &mut out,
                            ),
                            _ => {}
                        }
                    }
                }
                None => {}
            }

            for call in delta.tool_calls.as_deref().unwrap_or_default() {
                self.singleton_block(
                    Block::ToolUse {
                        id: call.id.clone(),
                        name: call.function.name.clone(),
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                    Some(BlockDelta::InputJsonDelta {
                        partial_json: call.function.arguments.clone(),
                    }),
                    &mut out,
                );
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<AnthropicStreamEvent> {
        if !self.started || self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        self.close_open_block(&mut out);
        out.push(AnthropicStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(
                    finish_reason_to_wire(self.finish_reason.unwrap_or(FinishReason::Stop))
                        .to_owned(),
                ),
                stop_sequence: None,
            },
            usage: Some(WireUsage::from_neutral(&self.usage)),
        });
        out.push(AnthropicStreamEvent::MessageStop);
        out
    }
}

/// Render a neutral stream as the Anthropic event grammar.
pub(crate) fn encode_stream(mut source: ResponseStream, model_hint: String) -> EventStream {
    stream! {
        let mut encoder = StreamEncoder {
            model: model_hint,
            ..Default::default()
        };

        while let Some(item) = source.next().await {
            let response = match item {
                Ok(response) => response,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            for event in encoder.feed(&response) {
                match event.to_stream_event() {
                    Ok(event) => yield Ok(event),
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
        }

        // Source ended without the sentinel; close out the message anyway.
        for event in encoder.finish() {
            match event.to_stream_event() {
                Ok(event) => yield Ok(event),
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{collect_all, from_slice};
    use serde_json::json;

    fn provider_events() -> Vec<StreamEvent> {
        vec![
            StreamEvent::named(
                "message_start",
                json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant", "model": "claude-sonnet-4-0", "content": [], "stop_reason": null, "usage": {"input_tokens": 25, "output_tokens": 1}}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_start",
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "toolu_1", "name": "calculate", "input": {}}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"expression\":"}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "\"15 * 7 + 23\"}"}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}).to_string(),
            ),
            StreamEvent::named(
                "message_delta",
                json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 30}}).to_string(),
            ),
            StreamEvent::named("message_stop", json!({"type": "message_stop"}).to_string()),
        ]
    }

    #[tokio::test]
    async fn test_decode_stream_tool_use() {
        let source = futures::stream::iter(provider_events().into_iter().map(Ok)).boxed();
        let chunks = collect_all(decode_stream(source)).await.unwrap();

        let tool_chunk = chunks
            .iter()
            .find(|chunk| {
                chunk
                    .first_delta()
                    .is_some_and(|delta| delta.tool_calls.is_some())
            })
            .unwrap();
        let calls = tool_chunk.first_delta().unwrap().tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "calculate");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            json!({"expression": "15 * 7 + 23"})
        );

        let last = &chunks[chunks.len() - 2];
        assert_eq!(last.choices[0].finish_reason, Some(FinishReason::ToolUse));
        let usage = last.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 25);
        assert_eq!(usage.completion_tokens, 31);
        assert!(chunks.last().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_decode_stream_synthesizes_block_on_stop_without_start() {
        let events = vec![
            StreamEvent::named(
                "message_start",
                json!({"type": "message_start", "message": {"id": "msg_1", "type": "message", "role": "assistant", "model": "m", "content": [], "usage": {"input_tokens": 1, "output_tokens": 0}}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}).to_string(),
            ),
            StreamEvent::named("message_stop", json!({"type": "message_stop"}).to_string()),
        ];
        let source = futures::stream::iter(events.into_iter().map(Ok)).boxed();
        let chunks = collect_all(decode_stream(source)).await.unwrap();

        // The orphan stop becomes a zero-length text block, matching what
        // aggregation of the same events produces.
        let synthesized = chunks
            .iter()
            .find(|chunk| chunk.first_delta().is_some())
            .expect("no synthesized block delta");
        assert_eq!(
            synthesized.first_delta().unwrap().content,
            Some(MessageContent::Text(String::new()))
        );
        assert!(chunks.last().unwrap().is_done());
    }

    #[test]
    fn test_aggregate_reconstructs_final_message() {
        let envelope = aggregate_wire_events(&provider_events()).unwrap();
        assert_eq!(envelope.id, "msg_1");
        assert_eq!(envelope.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(envelope.usage.input_tokens, 25);
        assert_eq!(envelope.usage.output_tokens, 31);
        match &envelope.content[0] {
            Block::ToolUse { name, input, .. } => {
                assert_eq!(name, "calculate");
                assert_eq!(input, &json!({"expression": "15 * 7 + 23"}));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_aggregate_rejects_bad_tool_json_at_stop_only() {
        let events = vec![
            StreamEvent::named(
                "content_block_start",
                json!({"type": "content_block_start", "index": 0, "content_block": {"type": "tool_use", "id": "t1", "name": "f", "input": {}}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_delta",
                json!({"type": "content_block_delta", "index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"broken\""}}).to_string(),
            ),
            StreamEvent::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": 0}).to_string(),
            ),
        ];
        assert!(aggregate_wire_events(&events).is_err());
    }

    #[tokio::test]
    async fn test_encode_stream_emits_event_grammar() {
        let mut chunk = Response::chunk("msg_1", "claude-sonnet-4-0");
        let mut delta = Message::new(Role::Assistant);
        delta.content = Some(MessageContent::Text("Hello".into()));
        chunk.choices = vec![Choice::of_delta(delta)];

        let events = collect_all(encode_stream(
            from_slice(vec![chunk, Response::done()]),
            "claude-sonnet-4-0".to_owned(),
        ))
        .await
        .unwrap();

        let names: Vec<_> = events
            .iter()
            .map(|event| event.event.clone().unwrap())
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Round trip: the encoded events aggregate back to the same text.
        let envelope = aggregate_wire_events(&events).unwrap();
        match &envelope.content[0] {
            Block::Text { text } => assert_eq!(text, "Hello"),
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(envelope.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_request_round_trip_with_thinking_blocks() {
        let wire: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-0",
            "max_tokens": 2048,
            "system": "be precise",
            "messages": [
                {"role": "user", "content": "What is 15 * 7 + 23?"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "multiply then add", "signature": "sig-native"},
                    {"type": "redacted_thinking", "data": "opaque-bytes"},
                    {"type": "tool_use", "id": "toolu_1", "name": "calculate", "input": {"expression": "15 * 7 + 23"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "128"}
                ]}
            ],
            "thinking": {"type": "enabled", "budget_tokens": 1024}
        }))
        .unwrap();

        let neutral = request_from_wire(wire, ApiFormat::Anthropic).unwrap();
        assert_eq!(neutral.messages.len(), 4); // system, user, assistant, tool
        assert_eq!(neutral.messages[3].role, Role::Tool);
        assert_eq!(neutral.thinking.as_ref().unwrap().budget_tokens, Some(1024));

        let back = request_to_wire(&neutral);
        let rendered = serde_json::to_value(&back).unwrap();
        assert_eq!(rendered["system"], "be precise");
        assert_eq!(rendered["messages"][1]["content"][0]["type"], "thinking");
        assert_eq!(rendered["messages"][1]["content"][0]["signature"], "sig-native");
        assert_eq!(rendered["messages"][1]["content"][1]["data"], "opaque-bytes");
        assert_eq!(
            rendered["messages"][2]["content"][0]["tool_use_id"],
            "toolu_1"
        );
    }

    #[test]
    fn test_foreign_signature_moves_to_redacted_slot() {
        let marked = crate::codec::encode_gemini_signature(Some("gemini-sig")).unwrap();
        let mut message = Message::new(Role::Assistant);
        message.content = Some(MessageContent::Parts(vec![ContentPart::Thinking {
            thinking: "reasoned".into(),
            signature: Some(marked.clone()),
        }]));
        let blocks = message_to_blocks(&message);
        assert_eq!(blocks.len(), 1);
        match &blocks[0] {
            Block::RedactedThinking { data } => assert_eq!(data, &marked),
            other => panic!("unexpected block: {other:?}"),
        }
    }

}
