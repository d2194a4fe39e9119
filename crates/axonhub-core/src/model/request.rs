use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::message::Message;
use super::tool::{Tool, ToolChoice};

/// Tag of the wire dialect a request arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFormat {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai_responses")]
    OpenAiResponses,
    Anthropic,
    Gemini,
    AiSdk,
    JinaRerank,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestType {
    #[default]
    Chat,
    Rerank,
    Embedding,
    ImageGeneration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    None,
    Minimal,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub r#type: ThinkingType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingType {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Image,
}

/// Rerank inputs (Jina dialect). Chat requests leave this unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankParams {
    pub query: String,
    pub documents: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_documents: Option<bool>,
}

/// Snapshot of the inbound HTTP request, kept for trace/thread header
/// passthrough. Never serialized with the neutral request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRequest {
    pub headers: http::HeaderMap,
    pub path: String,
    pub query: Vec<(String, String)>,
}

/// Metadata keys consumed by outbound transformers. The whole map is
/// stripped before anything is sent upstream.
pub const METADATA_USER_ID: &str = "user_id";
pub const METADATA_REQUEST_ID: &str = "request_id";
pub const METADATA_PREVIOUS_RESPONSE_ID: &str = "previous_response_id";

/// The neutral request. Inbound transformers produce it; middleware may
/// rewrite it; exactly one outbound transformer consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<Modality>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Opaque provider-specific bag, parsed lazily by outbounds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_body: Option<serde_json::Value>,
    #[serde(default)]
    pub request_type: RequestType,
    pub api_format: ApiFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank: Option<RerankParams>,
    #[serde(skip)]
    pub raw: Option<RawRequest>,
}

impl Request {
    pub fn new(model: impl Into<String>, api_format: ApiFormat) -> Self {
        Self {
            model: model.into(),
            messages: Vec::new(),
            tools: None,
            tool_choice: None,
            stream: None,
            temperature: None,
            max_tokens: None,
            reasoning_effort: None,
            thinking: None,
            modalities: None,
            metadata: None,
            extra_body: None,
            request_type: RequestType::default(),
            api_format,
            rerank: None,
            raw: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Image generation is requested via the `image` modality or an
    /// `image_generation` tool.
    pub fn wants_image_generation(&self) -> bool {
        if self.request_type == RequestType::ImageGeneration {
            return true;
        }
        if let Some(modalities) = &self.modalities
            && modalities.contains(&Modality::Image)
        {
            return true;
        }
        self.tools
            .as_deref()
            .is_some_and(|tools| tools.iter().any(Tool::is_image_generation))
    }

    pub fn image_generation_tool(&self) -> Option<&super::tool::ImageGenerationParams> {
        self.tools.as_deref()?.iter().find_map(|tool| match tool {
            Tool::ImageGeneration { params } => Some(params),
            _ => None,
        })
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key)?.as_str()
    }

    pub fn insert_metadata(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value.into());
    }

    /// Remove and return the metadata map. Outbounds call this right before
    /// building the upstream body so nothing leaks upstream.
    pub fn take_metadata(&mut self) -> Option<HashMap<String, serde_json::Value>> {
        self.metadata.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tool::ImageGenerationParams;

    #[test]
    fn test_image_generation_detection() {
        let mut request = Request::new("gpt-image-1", ApiFormat::OpenAi);
        assert!(!request.wants_image_generation());

        request.modalities = Some(vec![Modality::Text, Modality::Image]);
        assert!(request.wants_image_generation());

        let mut request = Request::new("doubao-seedream", ApiFormat::OpenAi);
        request.tools = Some(vec![Tool::ImageGeneration {
            params: ImageGenerationParams::default(),
        }]);
        assert!(request.wants_image_generation());
    }

    #[test]
    fn test_metadata_helpers() {
        let mut request = Request::new("gpt-4o-mini", ApiFormat::OpenAi);
        request.insert_metadata(METADATA_USER_ID, "user-42");
        assert_eq!(request.metadata_str(METADATA_USER_ID), Some("user-42"));
        let taken = request.take_metadata().unwrap();
        assert!(taken.contains_key(METADATA_USER_ID));
        assert!(request.metadata.is_none());
    }

    #[test]
    fn test_request_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&RequestType::ImageGeneration).unwrap(),
            r#""image-generation""#
        );
        assert_eq!(serde_json::to_string(&RequestType::Chat).unwrap(), r#""chat""#);
    }
}
