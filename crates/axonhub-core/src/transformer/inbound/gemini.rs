//! Google Gemini generative inbound dialect.
//!
//! Chat sessions are synthesized from the neutral message list: the system
//! instruction is a separate top-level field, roles map `user`/`model`, and
//! tool identity is the function name (Gemini has no call ids). Thought
//! parts carry a `thoughtSignature` which is wrapped with the Gemini marker
//! on entry so it survives round-trips through foreign dialects.

use async_stream::stream;
use futures::StreamExt;
use http::StatusCode;

use crate::codec;
use crate::httpclient::{self, StreamEvent};
use crate::model::{
    ApiFormat, Choice, ContentPart, FinishReason, FunctionDefinition, Message, MessageContent,
    Request, Response, ResponseError, Role, ThinkingConfig, ThinkingType, Tool, ToolChoice,
    ToolChoiceMode, Usage,
};
use crate::transformer::{EventStream, InboundTransformer, ResponseMeta, ResponseStream};
use serde::{Deserialize, Serialize};

// ================================================================
// Wire types (camelCase per the v1beta API)
// ================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentRequest {
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GeminiTool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<ToolConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCallPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponsePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionCallPart {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionResponsePart {
    pub name: String,
    #[serde(default)]
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiTool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_declarations: Option<Vec<FunctionDeclaration>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_search: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_execution: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ToolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_calling_config: Option<FunctionCallingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FunctionCallingConfig {
    pub mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<GeminiThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiThinkingConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Candidate {
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

impl UsageMetadata {
    fn to_neutral(&self) -> Usage {
        Usage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: self.candidates_token_count,
            total_tokens: self.total_token_count,
            ..Default::default()
        }
    }

    fn from_neutral(usage: &Usage) -> Self {
        Self {
            prompt_token_count: usage.prompt_tokens,
            candidates_token_count: usage.completion_tokens,
            total_token_count: usage.total_tokens,
        }
    }
}

fn finish_reason_from_wire(reason: &str) -> Option<FinishReason> {
    match reason {
        "STOP" => Some(FinishReason::Stop),
        "MAX_TOKENS" => Some(FinishReason::Length),
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => Some(FinishReason::ContentFilter),
        _ => None,
    }
}

fn finish_reason_to_wire(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop | FinishReason::ToolUse => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ContentFilter => "SAFETY",
    }
}

// ================================================================
// Conversions
// ================================================================

fn parts_to_neutral(parts: Vec<Part>) -> (Vec<ContentPart>, Vec<Message>) {
    let mut neutral = Vec::new();
    let mut tool_messages = Vec::new();
    for part in parts {
        if let Some(call) = part.function_call {
            neutral.push(ContentPart::ToolUse {
                // Gemini matches tool results by name, not id.
                id: call.name.clone(),
                name: call.name,
                input: call.args,
            });
            continue;
        }
        if let Some(result) = part.function_response {
            tool_messages.push(Message::tool_result(
                result.name.clone(),
                result.response.to_string(),
                false,
            ));
            continue;
        }
        if let Some(inline) = part.inline_data {
            neutral.push(ContentPart::ImageUrl {
                image_url: crate::model::ImageUrl {
                    url: format!("data:{};base64,{}", inline.mime_type, inline.data),
                    detail: None,
                },
            });
            continue;
        }
        if let Some(text) = part.text {
            if part.thought.unwrap_or(false) {
                neutral.push(ContentPart::Thinking {
                    thinking: text,
                    signature: part
                        .thought_signature
                        .as_deref()
                        .and_then(|sig| codec::encode_gemini_signature(Some(sig))),
                });
            } else {
                neutral.push(ContentPart::Text { text });
            }
        }
    }
    (neutral, tool_messages)
}

fn message_to_parts(message: &Message) -> Vec<Part> {
    let mut parts = Vec::new();
    if let Some(reasoning) = &message.reasoning_content
        && !reasoning.is_empty()
    {
        parts.push(Part {
            text: Some(reasoning.clone()),
            thought: Some(true),
            ..Default::default()
        });
    }
    match &message.content {
        Some(MessageContent::Text(text)) => parts.push(Part::text(text.clone())),
        Some(MessageContent::Parts(content_parts)) => {
            for part in content_parts {
                match part {
                    ContentPart::Text { text } => parts.push(Part::text(text.clone())),
                    ContentPart::Thinking {
                        thinking,
                        signature,
                    } => parts.push(Part {
                        text: Some(thinking.clone()),
                        thought: Some(true),
                        thought_signature: codec::decode_gemini_signature(signature.as_deref())
                            .or_else(|| signature.clone()),
                        ..Default::default()
                    }),
                    ContentPart::RedactedThinking { data } => {
                        // Only payloads wrapped at this boundary come home.
                        if let Some(signature) = codec::decode_gemini_signature(Some(data)) {
                            parts.push(Part {
                                text: Some(String::new()),
                                thought: Some(true),
                                thought_signature: Some(signature),
                                ..Default::default()
                            });
                        }
                    }
                    ContentPart::ToolUse { name, input, .. } => parts.push(Part {
                        function_call: Some(FunctionCallPart {
                            name: name.clone(),
                            args: input.clone(),
                        }),
                        ..Default::default()
                    }),
                    ContentPart::ToolResult { id, output, .. } => parts.push(Part {
                        function_response: Some(FunctionResponsePart {
                            name: id.clone(),
                            response: serde_json::from_str(output)
                                .unwrap_or_else(|_| serde_json::json!({"result": output})),
                        }),
                        ..Default::default()
                    }),
                    ContentPart::ImageUrl { image_url } => {
                        if let Some(rest) = image_url.url.strip_prefix("data:")
                            && let Some((mime, data)) = rest.split_once(";base64,")
                        {
                            parts.push(Part {
                                inline_data: Some(InlineData {
                                    mime_type: mime.to_owned(),
                                    data: data.to_owned(),
                                }),
                                ..Default::default()
                            });
                        }
                    }
                }
            }
        }
        None => {}
    }
    for call in message.tool_calls.as_deref().unwrap_or_default() {
        parts.push(Part {
            function_call: Some(FunctionCallPart {
                name: call.function.name.clone(),
                args: serde_json::from_str(&call.function.arguments)
                    .unwrap_or(serde_json::Value::Object(serde_json::Map::new())),
            }),
            ..Default::default()
        });
    }
    parts
}

pub(crate) fn response_to_wire(response: &Response) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: response
            .choices
            .iter()
            .filter_map(|choice| {
                let message = choice.message.as_ref().or(choice.delta.as_ref())?;
                Some(Candidate {
                    content: Content {
                        role: Some("model".to_owned()),
                        parts: message_to_parts(message),
                    },
                    finish_reason: choice.finish_reason.map(finish_reason_to_wire).map(str::to_owned),
                    index: choice.index,
                })
            })
            .collect(),
        usage_metadata: response.usage.as_ref().map(UsageMetadata::from_neutral),
        model_version: Some(response.model.clone()),
        response_id: Some(response.id.clone()),
    }
}

// ================================================================
// Transformer
// ================================================================

#[derive(Debug, Clone, Default)]
pub struct GeminiInbound;

impl GeminiInbound {
    pub fn new() -> Self {
        Self
    }
}

/// The model name rides the URL path in this dialect:
/// `/v1beta/models/<model>:generateContent`.
fn model_from_path(path: &str) -> Option<(String, bool)> {
    let (_, rest) = path.split_once("/models/")?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let (model, action) = rest.split_once(':')?;
    Some((
        model.to_owned(),
        action.starts_with("streamGenerateContent"),
    ))
}

impl InboundTransformer for GeminiInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::Gemini
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        let wire: GenerateContentRequest = super::parse_body(request)?;
        let (model, streaming) = model_from_path(&request.url).ok_or_else(|| {
            ResponseError::invalid_request("model missing from request path")
        })?;

        let mut neutral = Request::new(model, ApiFormat::Gemini);
        neutral.stream = Some(streaming);
        neutral.raw = Some(super::raw_request(request));

        if let Some(system) = wire.system_instruction {
            let text: String = system
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect::<Vec<_>>()
                .join("\n");
            if !text.is_empty() {
                neutral.messages.push(Message::system(text));
            }
        }

        for content in wire.contents {
            let role = match content.role.as_deref() {
                Some("model") => Role::Assistant,
                _ => Role::User,
            };
            let (parts, tool_messages) = parts_to_neutral(content.parts);
            if !parts.is_empty() {
                let mut message = Message::new(role);
                message.content = Some(MessageContent::Parts(parts));
                neutral.messages.push(message);
            }
            neutral.messages.extend(tool_messages);
        }

        if let Some(config) = wire.generation_config {
            neutral.temperature = config.temperature;
            neutral.max_tokens = config.max_output_tokens;
            if let Some(thinking) = config.thinking_config {
                neutral.thinking = Some(ThinkingConfig {
                    r#type: if thinking.thinking_budget == Some(0) {
                        ThinkingType::Disabled
                    } else {
                        ThinkingType::Enabled
                    },
                    budget_tokens: thinking.thinking_budget,
                });
            }
        }

        if let Some(tools) = wire.tools {
            let mut neutral_tools = Vec::new();
            for tool in tools {
                if let Some(declarations) = tool.function_declarations {
                    for declaration in declarations {
                        neutral_tools.push(Tool::Function {
                            function: FunctionDefinition {
                                name: declaration.name,
                                description: declaration.description,
                                parameters: declaration.parameters,
                                strict: None,
                            },
                        });
                    }
                }
                if tool.google_search.is_some() {
                    neutral_tools.push(Tool::GoogleSearch {});
                }
                if tool.url_context.is_some() {
                    neutral_tools.push(Tool::UrlContext {});
                }
                if tool.code_execution.is_some() {
                    neutral_tools.push(Tool::CodeExecution {});
                }
            }
            if !neutral_tools.is_empty() {
                neutral.tools = Some(neutral_tools);
            }
        }
        if let Some(config) = wire.tool_config
            && let Some(calling) = config.function_calling_config
        {
            neutral.tool_choice = Some(match calling.mode.as_str() {
                "ANY" => ToolChoice::Mode(ToolChoiceMode::Required),
                "NONE" => ToolChoice::Mode(ToolChoiceMode::None),
                _ => ToolChoice::Mode(ToolChoiceMode::Auto),
            });
        }

        if neutral.messages.is_empty() {
            return Err(ResponseError::invalid_request("contents must not be empty"));
        }
        Ok(neutral)
    }

    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError> {
        Ok(super::json_response(serde_json::to_vec(&response_to_wire(
            response,
        ))?))
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
                // This dialect has no terminator; the SSE body just ends.
                if response.is_done() {
                    return;
                }
                let wire = response_to_wire(&response);
                match serde_json::to_string(&wire) {
                    Ok(data) => yield Ok(StreamEvent::data(data)),
                    Err(err) => {
                        yield Err(ResponseError::from(err));
                        return;
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
        let mut folded = GenerateContentResponse::default();
        let mut text = String::new();
        let mut thought = String::new();
        let mut extra_parts: Vec<Part> = Vec::new();
        let mut finish_reason = None;

        for chunk in chunks {
            if chunk.is_done() || chunk.data.trim().is_empty() {
                continue;
            }
            let parsed: GenerateContentResponse =
                serde_json::from_str(&chunk.data).map_err(|err| {
                    ResponseError::api_error(format!("failed to parse stream chunk: {err}"))
                })?;
            if parsed.usage_metadata.is_some() {
                folded.usage_metadata = parsed.usage_metadata;
            }
            if parsed.model_version.is_some() {
                folded.model_version = parsed.model_version;
            }
            if parsed.response_id.is_some() {
                folded.response_id = parsed.response_id;
            }
            for candidate in parsed.candidates {
                if candidate.finish_reason.is_some() {
                    finish_reason = candidate.finish_reason;
                }
                for part in candidate.content.parts {
                    if let Some(value) = &part.text {
                        if part.thought_signature.is_some() {
                            // Keep signature-bearing parts whole.
                            extra_parts.push(part);
                        } else if part.thought.unwrap_or(false) {
                            thought.push_str(value);
                        } else {
                            text.push_str(value);
                        }
                    } else if part.function_call.is_some() || part.inline_data.is_some() {
                        extra_parts.push(part);
                    }
                }
            }
        }

        let mut parts = Vec::new();
        if !thought.is_empty() {
            parts.push(Part {
                text: Some(thought),
                thought: Some(true),
                ..Default::default()
            });
        }
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        parts.extend(extra_parts);

        folded.candidates = vec![Candidate {
            content: Content {
                role: Some("model".to_owned()),
                parts,
            },
            finish_reason,
            index: 0,
        }];

        let meta = ResponseMeta {
            id: folded.response_id.clone().unwrap_or_default(),
            model: folded.model_version.clone().unwrap_or_default(),
            usage: folded.usage_metadata.as_ref().map(UsageMetadata::to_neutral),
        };
        Ok((serde_json::to_vec(&folded)?, meta))
    }

    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value) {
        let status =
            StatusCode::from_u16(error.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let grpc_status = match error.status_code {
            400 => "INVALID_ARGUMENT",
            401 => "UNAUTHENTICATED",
            403 => "PERMISSION_DENIED",
            404 => "NOT_FOUND",
            429 => "RESOURCE_EXHAUSTED",
            _ => "INTERNAL",
        };
        let body = serde_json::json!({
            "error": {
                "code": error.status_code,
                "message": error.detail.message,
                "status": grpc_status,
            }
        });
        (status, body)
    }
}
