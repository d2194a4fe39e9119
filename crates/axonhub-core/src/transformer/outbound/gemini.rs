//! Gemini outbound via the OpenAI-compatible bridge endpoint
//! (`/v1beta/openai/chat/completions`). The neutral reasoning effort maps
//! to Google's thinking config in `extra_body.google.thinking_config`; a
//! structured config already present there wins over the effort knob.

use crate::channel::ProviderType;
use crate::httpclient::{self, ByteEventStream, StreamEvent};
use crate::json_utils;
use crate::model::{ReasoningEffort, Request, Response, ResponseError};
use crate::transformer::openai_compat::{self, CompatFlavor};
use crate::transformer::{OutboundTransformer, ResponseStream};

const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com";

#[derive(Debug, Clone)]
pub struct GeminiOutbound {
    base_url: String,
    api_key: String,
}

fn thinking_config_from_effort(effort: ReasoningEffort) -> serde_json::Value {
    match effort {
        ReasoningEffort::None => serde_json::json!({"thinking_budget": 0}),
        ReasoningEffort::Minimal | ReasoningEffort::Low => serde_json::json!({
            "thinking_level": "low",
            "thinking_budget": 1024,
            "include_thoughts": true,
        }),
        ReasoningEffort::Medium => serde_json::json!({
            "thinking_level": "high",
            "thinking_budget": 8192,
            "include_thoughts": true,
        }),
        ReasoningEffort::High => serde_json::json!({
            "thinking_level": "high",
            "thinking_budget": 24576,
            "include_thoughts": true,
        }),
    }
}

impl GeminiOutbound {
    pub fn new(base_url: String, api_key: String) -> Self {
        let base_url = if base_url.is_empty() {
            GEMINI_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self { base_url, api_key }
    }

    /// Resolve the effective thinking config. An explicit
    /// `extra_body.google.thinking_config` takes priority; either way the
    /// `reasoning_effort` knob is consumed and never sent upstream.
    fn apply_thinking(&self, request: &mut Request) {
        let effort = request.reasoning_effort.take();
        let has_structured = request
            .extra_body
            .as_ref()
            .and_then(|extra| json_utils::get_path(extra, "google.thinking_config"))
            .is_some();
        if has_structured {
            return;
        }
        let Some(effort) = effort else { return };

        let config = thinking_config_from_effort(effort);
        let extra = request
            .extra_body
            .get_or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        json_utils::merge_inplace(
            extra,
            serde_json::json!({"google": {"thinking_config": config}}),
        );
    }
}

impl OutboundTransformer for GeminiOutbound {
    fn provider(&self) -> ProviderType {
        ProviderType::Gemini
    }

    fn transform_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        super::consume_metadata(&mut request);
        self.apply_thinking(&mut request);

        let wire = openai_compat::request_to_wire(&request);
        Ok(httpclient::Request::post(super::join_url(
            &self.base_url,
            "/v1beta/openai",
            "/chat/completions",
        ))
        .with_json_body(serde_json::to_vec(&wire)?)
        .with_bearer(&self.api_key))
    }

    fn transform_response(
        &self,
        response: httpclient::Response,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send {
        async move {
            let wire = response.json().map_err(|err| {
                ResponseError::api_error(format!("failed to parse response: {err}"))
            })?;
            openai_compat::response_from_wire(wire)
        }
    }

    fn transform_stream(&self, stream: ByteEventStream) -> ResponseStream {
        openai_compat::decode_stream(stream, CompatFlavor::default())
    }

    fn aggregate_chunks(&self, chunks: &[StreamEvent]) -> Result<Response, ResponseError> {
        openai_compat::aggregate_chunks(chunks, CompatFlavor::default())
    }

    fn transform_error(&self, error: &httpclient::Error) -> ResponseError {
        super::transform_error_openai_shaped(error)
    }
}
