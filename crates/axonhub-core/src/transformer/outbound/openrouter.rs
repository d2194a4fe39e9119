//! OpenRouter outbound. OpenAI-shaped with two quirks: choices carry a
//! non-standard `reasoning` field, and messages may carry generated
//! `images` appended after text content.

use crate::channel::ProviderType;
use crate::httpclient::{self, ByteEventStream, StreamEvent};
use crate::model::{Request, Response, ResponseError};
use crate::transformer::openai_compat::{self, CompatFlavor};
use crate::transformer::{OutboundTransformer, ResponseStream};

const OPENROUTER_API_BASE_URL: &str = "https://openrouter.ai/api/v1";

const FLAVOR: CompatFlavor = CompatFlavor {
    reasoning_field: true,
    filter_empty_deltas: false,
};

#[derive(Debug, Clone)]
pub struct OpenRouterOutbound {
    base_url: String,
    api_key: String,
}

impl OpenRouterOutbound {
    pub fn new(base_url: String, api_key: String) -> Self {
        let base_url = if base_url.is_empty() {
            OPENROUTER_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self { base_url, api_key }
    }
}

impl OutboundTransformer for OpenRouterOutbound {
    fn provider(&self) -> ProviderType {
        ProviderType::OpenRouter
    }

    fn transform_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        super::consume_metadata(&mut request);
        let wire = openai_compat::request_to_wire(&request);
        Ok(httpclient::Request::post(super::join_url(
            &self.base_url,
            "/api/v1",
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
        openai_compat::decode_stream(stream, FLAVOR)
    }

    fn aggregate_chunks(&self, chunks: &[StreamEvent]) -> Result<Response, ResponseError> {
        openai_compat::aggregate_chunks(chunks, FLAVOR)
    }

    fn transform_error(&self, error: &httpclient::Error) -> ResponseError {
        super::transform_error_openai_shaped(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentPart, MessageContent};
    use crate::stream::collect_all;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_reasoning_field_maps_to_reasoning_content() {
        let outbound = OpenRouterOutbound::new(String::new(), "or-key".into());
        let chunk = json!({
            "id": "gen-1758295230-abc",
            "model": "z-ai/glm-4.5-air:free",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "", "reasoning": "We"}}]
        });
        let source = futures::stream::iter(vec![
            Ok(StreamEvent::data(chunk.to_string())),
            Ok(StreamEvent::done()),
        ])
        .boxed();
        let chunks = collect_all(outbound.transform_stream(source)).await.unwrap();
        let delta = chunks[0].first_delta().unwrap();
        assert_eq!(delta.reasoning_content.as_deref(), Some("We"));
        assert_eq!(delta.content, Some(MessageContent::Text(String::new())));
    }

    #[tokio::test]
    async fn test_images_append_after_text() {
        let outbound = OpenRouterOutbound::new(String::new(), "or-key".into());
        let body = json!({
            "id": "gen-2",
            "model": "google/gemini-2.5-flash-image",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "here you go",
                    "images": [{"type": "image_url", "image_url": {"url": "data:image/png;base64,aGk="}}]
                },
                "finish_reason": "stop"
            }]
        });
        let response = outbound
            .transform_response(httpclient::Response {
                status: http::StatusCode::OK,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::from(body.to_string()),
                request_metadata: Default::default(),
            })
            .await
            .unwrap();
        let message = response.first_message().unwrap();
        let parts = message.parts();
        assert!(matches!(parts[0], ContentPart::Text { .. }));
        assert!(matches!(parts[1], ContentPart::ImageUrl { .. }));
    }

    #[test]
    fn test_numeric_error_code_is_stringified() {
        let outbound = OpenRouterOutbound::new(String::new(), "or-key".into());
        let error = httpclient::Error::Status(httpclient::StatusError {
            method: http::Method::POST,
            url: "https://openrouter.ai/api/v1/chat/completions".into(),
            status_code: 402,
            status: "Payment Required".into(),
            body: r#"{"error":{"message":"Insufficient credits","code":402,"metadata":{"raw":"..."}}}"#.into(),
        });
        let neutral = outbound.transform_error(&error);
        assert_eq!(neutral.detail.code.as_deref(), Some("402"));
        assert_eq!(neutral.detail.message, "Insufficient credits");
    }
}
