use serde::{Deserialize, Serialize};

use super::message::Message;
use super::request::{ApiFormat, RequestType};

pub const OBJECT_CHAT_COMPLETION: &str = "chat.completion";
pub const OBJECT_CHAT_COMPLETION_CHUNK: &str = "chat.completion.chunk";
/// Terminal sentinel object. Every neutral stream ends with exactly one
/// response whose object is this value.
pub const OBJECT_DONE: &str = "chat.completion.done";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

impl Usage {
    /// Merge a chunk's usage where the last non-zero value wins
    /// (OpenAI-style chunks repeat the running totals).
    pub fn merge_latest(&mut self, other: &Usage) {
        if other.prompt_tokens != 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens != 0 {
            self.completion_tokens = other.completion_tokens;
        }
        if other.total_tokens != 0 {
            self.total_tokens = other.total_tokens;
        } else if self.prompt_tokens != 0 || self.completion_tokens != 0 {
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        if other.prompt_tokens_details.is_some() {
            self.prompt_tokens_details = other.prompt_tokens_details;
        }
        if other.completion_tokens_details.is_some() {
            self.completion_tokens_details = other.completion_tokens_details;
        }
    }

    /// Merge a message-delta usage where completion tokens are additive and
    /// prompt tokens are last-value-wins (Anthropic-style deltas).
    pub fn accumulate_delta(&mut self, other: &Usage) {
        self.completion_tokens += other.completion_tokens;
        if other.prompt_tokens != 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl Choice {
    pub fn of_message(message: Message) -> Self {
        Self {
            index: 0,
            message: Some(message),
            delta: None,
            finish_reason: None,
        }
    }

    pub fn of_delta(delta: Message) -> Self {
        Self {
            index: 0,
            message: None,
            delta: Some(delta),
            finish_reason: None,
        }
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = Some(reason);
        self
    }
}

/// Rerank scores, present only on `request_type = rerank` responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<RerankDocument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankDocument {
    pub text: String,
}

/// The neutral response. Unary calls produce one; streams produce many
/// (delta-form) followed by the [`OBJECT_DONE`] sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_results: Option<Vec<RerankResult>>,
    #[serde(skip)]
    pub request_type: RequestType,
    #[serde(skip)]
    pub api_format: Option<ApiFormat>,
}

impl Response {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            object: OBJECT_CHAT_COMPLETION.to_owned(),
            created: now_unix(),
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            rerank_results: None,
            request_type: RequestType::default(),
            api_format: None,
        }
    }

    pub fn chunk(id: impl Into<String>, model: impl Into<String>) -> Self {
        let mut response = Self::new(id, model);
        response.object = OBJECT_CHAT_COMPLETION_CHUNK.to_owned();
        response
    }

    /// The terminal sentinel closing every neutral stream.
    pub fn done() -> Self {
        let mut response = Self::new("", "");
        response.object = OBJECT_DONE.to_owned();
        response
    }

    pub fn is_done(&self) -> bool {
        self.object == OBJECT_DONE
    }

    pub fn first_message(&self) -> Option<&Message> {
        self.choices.first()?.message.as_ref()
    }

    pub fn first_delta(&self) -> Option<&Message> {
        self.choices.first()?.delta.as_ref()
    }
}

pub(crate) fn now_unix() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
