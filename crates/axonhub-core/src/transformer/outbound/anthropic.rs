//! Anthropic outbound, also serving ClaudeCode channels (OAuth bearer plus
//! the beta headers instead of `x-api-key`).

use http::HeaderValue;
use serde::Deserialize;

use crate::channel::ProviderType;
use crate::httpclient::{self, ByteEventStream, StreamEvent};
use crate::model::{
    ReasoningEffort, Request, RequestType, Response, ResponseError, ThinkingConfig, ThinkingType,
};
use crate::transformer::anthropic_compat as wire;
use crate::transformer::{OutboundTransformer, ResponseStream};

const ANTHROPIC_API_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLAUDE_CODE_BETA: &str = "oauth-2025-04-20";

#[derive(Debug, Clone)]
pub struct AnthropicOutbound {
    provider: ProviderType,
    base_url: String,
    api_key: String,
}

/// Thinking budgets mapped from the neutral reasoning effort.
fn thinking_from_effort(effort: ReasoningEffort) -> ThinkingConfig {
    let budget = match effort {
        ReasoningEffort::None => 0,
        ReasoningEffort::Minimal | ReasoningEffort::Low => 1024,
        ReasoningEffort::Medium => 8192,
        ReasoningEffort::High => 24576,
    };
    ThinkingConfig {
        r#type: if budget == 0 {
            ThinkingType::Disabled
        } else {
            ThinkingType::Enabled
        },
        budget_tokens: (budget != 0).then_some(budget),
    }
}

impl AnthropicOutbound {
    pub fn new(provider: ProviderType, base_url: String, api_key: String) -> Self {
        let base_url = if base_url.is_empty() {
            ANTHROPIC_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self {
            provider,
            base_url,
            api_key,
        }
    }

    fn is_claude_code(&self) -> bool {
        self.provider == ProviderType::ClaudeCode
    }
}

#[derive(Debug, Deserialize)]
struct WireErrorEnvelope {
    error: WireErrorDetail,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl OutboundTransformer for AnthropicOutbound {
    fn provider(&self) -> ProviderType {
        self.provider
    }

    fn transform_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        if request.request_type != RequestType::Chat {
            return Err(ResponseError::invalid_request(format!(
                "request type {:?} is not supported by the Anthropic transformer",
                request.request_type
            )));
        }
        super::consume_metadata(&mut request);

        if request.thinking.is_none()
            && let Some(effort) = request.reasoning_effort.take()
        {
            request.thinking = Some(thinking_from_effort(effort));
        }
        if request.max_tokens.is_none() {
            return Err(ResponseError::invalid_request(
                "max_tokens is required for Anthropic",
            ));
        }

        let body = wire::request_to_wire(&request);
        let mut http = httpclient::Request::post(super::join_url(&self.base_url, "/v1", "/messages"))
            .with_json_body(serde_json::to_vec(&body)?);
        http.headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        if self.is_claude_code() {
            http = http.with_bearer(&self.api_key);
            http.headers
                .insert("anthropic-beta", HeaderValue::from_static(CLAUDE_CODE_BETA));
            http.headers.insert(
                "anthropic-dangerous-direct-browser-access",
                HeaderValue::from_static("true"),
            );
            http.headers.insert("x-app", HeaderValue::from_static("cli"));
        } else {
            http.auth = Some(httpclient::Auth::ApiKey {
                header_key: "x-api-key".to_owned(),
                api_key: self.api_key.clone(),
            });
        }
        Ok(http)
    }

    fn transform_response(
        &self,
        response: httpclient::Response,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send {
        async move {
            let envelope: wire::MessagesResponse = response.json().map_err(|err| {
                ResponseError::api_error(format!("failed to parse response: {err}"))
            })?;
            Ok(wire::response_from_wire(envelope))
        }
    }

    fn transform_stream(&self, stream: ByteEventStream) -> ResponseStream {
        wire::decode_stream(stream)
    }

    fn aggregate_chunks(&self, chunks: &[StreamEvent]) -> Result<Response, ResponseError> {
        let envelope = wire::aggregate_wire_events(chunks)?;
        Ok(wire::response_from_wire(envelope))
    }

    fn transform_error(&self, error: &httpclient::Error) -> ResponseError {
        match error {
            httpclient::Error::Status(status) => {
                match serde_json::from_str::<WireErrorEnvelope>(&status.body) {
                    Ok(envelope) => {
                        let kind = match envelope.error.r#type.as_deref() {
                            Some("invalid_request_error") => "invalid_request",
                            Some("authentication_error") => "auth_error",
                            Some("permission_error") => "permission_error",
                            Some("not_found_error") => "not_found",
                            Some("rate_limit_error") => "rate_limit",
                            _ => ResponseError::kind_for_status(status.status_code),
                        };
                        ResponseError::new(
                            status.status_code,
                            kind,
                            envelope
                                .error
                                .message
                                .unwrap_or_else(|| status.status.clone()),
                        )
                    }
                    Err(_) => ResponseError::new(
                        status.status_code,
                        crate::model::error::ERROR_TYPE_API,
                        status.status.clone(),
                    ),
                }
            }
            other => ResponseError::api_error(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiFormat, Message};

    fn base_request() -> Request {
        let mut request = Request::new("claude-sonnet-4-0", ApiFormat::Anthropic);
        request.messages = vec![Message::user("What is 15 * 7 + 23?")];
        request.max_tokens = Some(2048);
        request
    }

    #[test]
    fn test_request_uses_api_key_header_and_version() {
        let outbound = AnthropicOutbound::new(
            ProviderType::Anthropic,
            String::new(),
            "sk-ant-test".into(),
        );
        let http = outbound.transform_request(base_request()).unwrap();
        assert_eq!(http.url, "https://api.anthropic.com/v1/messages");
        assert_eq!(http.headers["anthropic-version"], ANTHROPIC_VERSION);
        assert!(matches!(
            http.auth,
            Some(httpclient::Auth::ApiKey { ref header_key, .. }) if header_key == "x-api-key"
        ));
    }

    #[test]
    fn test_claude_code_uses_bearer_and_beta_headers() {
        let outbound = AnthropicOutbound::new(
            ProviderType::ClaudeCode,
            String::new(),
            "oauth-access".into(),
        );
        let http = outbound.transform_request(base_request()).unwrap();
        assert!(matches!(http.auth, Some(httpclient::Auth::Bearer { .. })));
        assert_eq!(http.headers["anthropic-beta"], CLAUDE_CODE_BETA);
        assert_eq!(http.headers["anthropic-dangerous-direct-browser-access"], "true");
    }

    #[test]
    fn test_reasoning_effort_maps_to_thinking_budget() {
        let outbound =
            AnthropicOutbound::new(ProviderType::Anthropic, String::new(), "k".into());
        let mut request = base_request();
        request.reasoning_effort = Some(ReasoningEffort::Medium);
        let http = outbound.transform_request(request).unwrap();
        let body: serde_json::Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 8192);
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn test_error_parsing() {
        let outbound =
            AnthropicOutbound::new(ProviderType::Anthropic, String::new(), "k".into());
        let error = httpclient::Error::Status(httpclient::StatusError {
            method: http::Method::POST,
            url: "https://api.anthropic.com/v1/messages".into(),
            status_code: 429,
            status: "Too Many Requests".into(),
            body: r#"{"type":"error","error":{"type":"rate_limit_error","message":"Number of request tokens has exceeded your rate limit"}}"#.into(),
        });
        let neutral = outbound.transform_error(&error);
        assert_eq!(neutral.status_code, 429);
        assert_eq!(neutral.detail.kind, "rate_limit");
        assert!(neutral.detail.message.contains("rate limit"));
    }
}
