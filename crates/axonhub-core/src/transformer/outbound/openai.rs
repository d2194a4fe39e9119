//! OpenAI outbound: the baseline provider. Also serves the
//! OpenAI-compatible channels (ModelScope, Codex, NanoGPT) with flavor
//! quirks layered on. Handles chat, rerank passthrough, and image
//! generation (including the unary-only quirk and data-URL wrapping).

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::channel::ProviderType;
use crate::httpclient::{
    self, ByteEventStream, StreamEvent, METADATA_MODEL, METADATA_OUTBOUND_FORMAT_TYPE,
};
use crate::model::{
    Choice, ContentPart, FinishReason, Message, MessageContent, RerankDocument, RerankResult,
    Request, RequestType, Response, ResponseError, Role, Usage,
};
use crate::transformer::openai_compat::{self, CompatFlavor};
use crate::transformer::{OutboundTransformer, ResponseStream};

const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

pub(crate) const FORMAT_IMAGE_GENERATION: &str = "image-generation";
pub(crate) const FORMAT_RERANK: &str = "rerank";

#[derive(Debug, Clone)]
pub struct OpenAiOutbound {
    provider: ProviderType,
    base_url: String,
    api_key: String,
    flavor: CompatFlavor,
}

impl OpenAiOutbound {
    pub fn new(provider: ProviderType, base_url: String, api_key: String) -> Self {
        let base_url = if base_url.is_empty() {
            OPENAI_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self {
            provider,
            base_url,
            api_key,
            flavor: CompatFlavor::default(),
        }
    }

    /// NanoGPT emits reasoning under a `reasoning` field.
    pub fn with_reasoning_field(mut self) -> Self {
        self.flavor.reasoning_field = true;
        self
    }

    fn url(&self, path: &str) -> String {
        super::join_url(&self.base_url, "/v1", path)
    }

    fn chat_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        let meta = super::consume_metadata(&mut request);
        let mut wire = openai_compat::request_to_wire(&request);
        wire.user = meta.user_id;

        let http = httpclient::Request::post(self.url("/chat/completions"))
            .with_json_body(serde_json::to_vec(&wire)?)
            .with_bearer(&self.api_key);
        Ok(http)
    }

    fn rerank_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        super::consume_metadata(&mut request);
        let rerank = request
            .rerank
            .as_ref()
            .ok_or_else(|| ResponseError::invalid_request("rerank parameters are required"))?;
        let body = serde_json::json!({
            "model": request.model,
            "query": rerank.query,
            "documents": rerank.documents,
            "top_n": rerank.top_n,
            "return_documents": rerank.return_documents,
        });
        Ok(httpclient::Request::post(self.url("/rerank"))
            .with_json_body(serde_json::to_vec(&body)?)
            .with_bearer(&self.api_key)
            .with_metadata(METADATA_OUTBOUND_FORMAT_TYPE, FORMAT_RERANK)
            .with_metadata(METADATA_MODEL, request.model.clone()))
    }

    fn image_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        super::consume_metadata(&mut request);
        let prompt = image_prompt(&request).ok_or_else(|| {
            ResponseError::invalid_request("image generation requires a text prompt")
        })?;
        let params = request.image_generation_tool();
        let body = serde_json::json!({
            "model": request.model,
            "prompt": prompt,
            "n": params.and_then(|params| params.n).unwrap_or(1),
            "size": params.and_then(|params| params.size.clone()),
            "quality": params.and_then(|params| params.quality.clone()),
            "response_format": "b64_json",
        });
        Ok(httpclient::Request::post(self.url("/images/generations"))
            .with_json_body(serde_json::to_vec(&body)?)
            .with_bearer(&self.api_key)
            .with_metadata(METADATA_OUTBOUND_FORMAT_TYPE, FORMAT_IMAGE_GENERATION)
            .with_metadata(METADATA_MODEL, request.model.clone()))
    }
}

/// The requested model, carried through request metadata for endpoints
/// whose responses do not echo it.
pub(crate) fn metadata_model(response: &httpclient::Response) -> String {
    response
        .request_metadata
        .get(METADATA_MODEL)
        .cloned()
        .unwrap_or_default()
}

/// Prompt for image generation: the text of the last user message.
pub(crate) fn image_prompt(request: &Request) -> Option<String> {
    request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .and_then(Message::text)
        .filter(|text| !text.is_empty())
}

// ================================================================
// Image generation response envelope
// ================================================================

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct ImagesResponse {
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub data: Vec<ImageDatum>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct ImageDatum {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b64_json: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_prompt: Option<String>,
}

/// Fetch a provider-hosted image URL and wrap it as a data URL. Data URLs
/// pass through untouched.
pub(crate) async fn ensure_data_url(url: &str) -> Result<String, ResponseError> {
    if url.starts_with("data:") {
        return Ok(url.to_owned());
    }
    let response = reqwest::get(url)
        .await
        .map_err(|err| ResponseError::api_error(format!("image download failed: {err}")))?;
    let mime = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("image/png")
        .to_owned();
    let bytes = response
        .bytes()
        .await
        .map_err(|err| ResponseError::api_error(format!("image download failed: {err}")))?;
    Ok(format!("data:{mime};base64,{}", BASE64.encode(&bytes)))
}

/// Wrap an images-API response into a chat completion envelope carrying one
/// assistant message with an `image_url` data-URL part.
pub(crate) async fn images_to_chat_response(
    model: &str,
    wire: ImagesResponse,
) -> Result<Response, ResponseError> {
    let mut parts = Vec::new();
    for datum in wire.data {
        let url = if let Some(b64) = datum.b64_json {
            format!("data:image/png;base64,{b64}")
        } else if let Some(url) = datum.url {
            ensure_data_url(&url).await?
        } else {
            continue;
        };
        parts.push(ContentPart::ImageUrl {
            image_url: crate::model::ImageUrl { url, detail: None },
        });
    }
    if parts.is_empty() {
        return Err(ResponseError::api_error(
            "image generation returned no image data",
        ));
    }

    let mut message = Message::new(Role::Assistant);
    message.content = Some(MessageContent::Parts(parts));
    let mut response = Response::new(format!("imggen-{}", nanoid::nanoid!(12)), model);
    if wire.created != 0 {
        response.created = wire.created;
    }
    response.usage = wire.usage;
    response.request_type = RequestType::ImageGeneration;
    response.choices = vec![Choice::of_message(message).with_finish_reason(FinishReason::Stop)];
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct RerankWireResponse {
    #[serde(default)]
    results: Vec<RerankWireResult>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct RerankWireResult {
    index: usize,
    relevance_score: f64,
    #[serde(default)]
    document: Option<RerankWireDocument>,
}

#[derive(Debug, Deserialize)]
struct RerankWireDocument {
    #[serde(default)]
    text: String,
}

pub(crate) fn rerank_to_response(body: &[u8], model: &str) -> Result<Response, ResponseError> {
    let wire: RerankWireResponse = serde_json::from_slice(body)
        .map_err(|err| ResponseError::api_error(format!("failed to parse rerank response: {err}")))?;
    let mut response = Response::new(format!("rerank-{}", nanoid::nanoid!(12)), model);
    response.request_type = RequestType::Rerank;
    response.usage = wire.usage;
    response.rerank_results = Some(
        wire.results
            .into_iter()
            .map(|result| RerankResult {
                index: result.index,
                relevance_score: result.relevance_score,
                document: result.document.map(|document| RerankDocument {
                    text: document.text,
                }),
            })
            .collect(),
    );
    Ok(response)
}

impl OutboundTransformer for OpenAiOutbound {
    fn provider(&self) -> ProviderType {
        self.provider
    }

    fn transform_request(&self, request: Request) -> Result<httpclient::Request, ResponseError> {
        match request.request_type {
            RequestType::Rerank => self.rerank_request(request),
            RequestType::Embedding => Err(ResponseError::invalid_request(
                "embedding requests are not routed through this transformer",
            )),
            _ if request.wants_image_generation() => self.image_request(request),
            _ => self.chat_request(request),
        }
    }

    fn transform_response(
        &self,
        response: httpclient::Response,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send {
        async move {
            match response
                .request_metadata
                .get(METADATA_OUTBOUND_FORMAT_TYPE)
                .map(String::as_str)
            {
                Some(FORMAT_IMAGE_GENERATION) => {
                    let model = metadata_model(&response);
                    let wire: ImagesResponse = response.json().map_err(|err| {
                        ResponseError::api_error(format!("failed to parse images response: {err}"))
                    })?;
                    images_to_chat_response(&model, wire).await
                }
                Some(FORMAT_RERANK) => {
                    let model = metadata_model(&response);
                    rerank_to_response(&response.body, &model)
                }
                _ => {
                    let wire = response.json().map_err(|err| {
                        ResponseError::api_error(format!("failed to parse response: {err}"))
                    })?;
                    openai_compat::response_from_wire(wire)
                }
            }
        }
    }

    fn transform_stream(&self, stream: ByteEventStream) -> ResponseStream {
        openai_compat::decode_stream(stream, self.flavor)
    }

    fn aggregate_chunks(&self, chunks: &[StreamEvent]) -> Result<Response, ResponseError> {
        openai_compat::aggregate_chunks(chunks, self.flavor)
    }

    fn transform_error(&self, error: &httpclient::Error) -> ResponseError {
        super::transform_error_openai_shaped(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiFormat, ImageGenerationParams, Modality, Tool};
    use serde_json::json;

    fn chat_request() -> Request {
        let mut request = Request::new("gpt-4o-mini", ApiFormat::OpenAi);
        request.messages = vec![Message::user("Hello! How are you today?")];
        request.max_tokens = Some(1024);
        request
    }

    #[test]
    fn test_chat_request_url_auth_and_body() {
        let outbound = OpenAiOutbound::new(ProviderType::OpenAi, String::new(), "sk-test".into());
        let http = outbound.transform_request(chat_request()).unwrap();
        assert_eq!(http.url, "https://api.openai.com/v1/chat/completions");
        assert!(matches!(
            http.auth,
            Some(httpclient::Auth::Bearer { ref api_key }) if api_key == "sk-test"
        ));
        let body: serde_json::Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][0]["content"], "Hello! How are you today?");
        assert_eq!(body["max_tokens"], 1024);
    }

    #[test]
    fn test_metadata_is_stripped_and_user_forwarded() {
        let outbound = OpenAiOutbound::new(ProviderType::OpenAi, String::new(), "sk-test".into());
        let mut request = chat_request();
        request.insert_metadata("user_id", "user-42");
        request.insert_metadata("internal_channel", "7");
        let http = outbound.transform_request(request).unwrap();
        let body: serde_json::Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["user"], "user-42");
        assert!(body.get("metadata").is_none());
        assert!(!String::from_utf8_lossy(http.body.as_deref().unwrap()).contains("internal_channel"));
    }

    #[test]
    fn test_image_generation_switches_endpoint() {
        let outbound = OpenAiOutbound::new(ProviderType::OpenAi, String::new(), "sk-test".into());
        let mut request = chat_request();
        request.modalities = Some(vec![Modality::Image]);
        request.tools = Some(vec![Tool::ImageGeneration {
            params: ImageGenerationParams {
                size: Some("1024x1024".into()),
                quality: Some("high".into()),
                ..Default::default()
            },
        }]);
        let http = outbound.transform_request(request).unwrap();
        assert_eq!(http.url, "https://api.openai.com/v1/images/generations");
        assert_eq!(
            http.metadata.get(METADATA_OUTBOUND_FORMAT_TYPE).unwrap(),
            FORMAT_IMAGE_GENERATION
        );
        assert_eq!(http.metadata.get(METADATA_MODEL).unwrap(), "gpt-4o-mini");
        let body: serde_json::Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["prompt"], "Hello! How are you today?");
        assert_eq!(body["response_format"], "b64_json");
    }

    #[tokio::test]
    async fn test_image_response_carries_requested_model() {
        let outbound = OpenAiOutbound::new(ProviderType::OpenAi, String::new(), "sk-test".into());
        let mut request_metadata = std::collections::HashMap::new();
        request_metadata.insert(
            METADATA_OUTBOUND_FORMAT_TYPE.to_owned(),
            FORMAT_IMAGE_GENERATION.to_owned(),
        );
        request_metadata.insert(METADATA_MODEL.to_owned(), "gpt-image-1".to_owned());

        let response = outbound
            .transform_response(httpclient::Response {
                status: http::StatusCode::OK,
                headers: http::HeaderMap::new(),
                body: bytes::Bytes::from(
                    json!({"created": 1700000000, "data": [{"b64_json": "aGVsbG8="}]}).to_string(),
                ),
                request_metadata,
            })
            .await
            .unwrap();
        assert_eq!(response.model, "gpt-image-1");
    }

    #[tokio::test]
    async fn test_image_b64_wraps_into_chat_envelope() {
        let wire: ImagesResponse = serde_json::from_value(json!({
            "created": 1700000000,
            "data": [{"b64_json": "aGVsbG8="}]
        }))
        .unwrap();
        let response = images_to_chat_response("gpt-image-1", wire).await.unwrap();
        let message = response.first_message().unwrap();
        match &message.parts()[0] {
            ContentPart::ImageUrl { image_url } => {
                assert_eq!(image_url.url, "data:image/png;base64,aGVsbG8=");
            }
            other => panic!("unexpected part: {other:?}"),
        }
        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
    }

    #[test]
    fn test_rerank_request_and_response() {
        let outbound = OpenAiOutbound::new(ProviderType::OpenAi, String::new(), "sk-test".into());
        let mut request = Request::new("jina-reranker-v2-base-multilingual", ApiFormat::JinaRerank);
        request.request_type = RequestType::Rerank;
        request.rerank = Some(crate::model::RerankParams {
            query: "q".into(),
            documents: vec!["a".into(), "b".into()],
            top_n: Some(1),
            return_documents: Some(true),
        });
        let http = outbound.transform_request(request).unwrap();
        assert_eq!(http.url, "https://api.openai.com/v1/rerank");

        let response = rerank_to_response(
            json!({"results": [{"index": 1, "relevance_score": 0.9, "document": {"text": "b"}}]})
                .to_string()
                .as_bytes(),
            "jina-reranker-v2-base-multilingual",
        )
        .unwrap();
        assert_eq!(response.rerank_results.unwrap()[0].index, 1);
    }
}
