//! Zai outbound. OpenAI-shaped with provider constraints: only `auto`
//! tool choice is accepted (anything else is coerced rather than
//! rejected), `user_id` must be 6–128 characters, and image editing is
//! unsupported.

use crate::channel::ProviderType;
use crate::httpclient::{
    self, ByteEventStream, StreamEvent, METADATA_MODEL, METADATA_OUTBOUND_FORMAT_TYPE,
};
use crate::model::{ContentPart, Request, Response, ResponseError, ToolChoice};
use crate::transformer::openai_compat::{self, CompatFlavor};
use crate::transformer::outbound::openai::{self, FORMAT_IMAGE_GENERATION};
use crate::transformer::{OutboundTransformer, ResponseStream};

const ZAI_API_BASE_URL: &str = "https://api.z.ai/api/paas/v4";

#[derive(Debug, Clone)]
pub struct ZaiOutbound {
    base_url: String,
    api_key: String,
}

impl ZaiOutbound {
    pub fn new(base_url: String, api_key: String) -> Self {
        let base_url = if base_url.is_empty() {
            ZAI_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self { base_url, api_key }
    }

    fn url(&self, path: &str) -> String {
        super::join_url(&self.base_url, "/v4", path)
    }
}

fn has_input_image(request: &Request) -> bool {
    request.messages.iter().any(|message| {
        message
            .parts()
            .iter()
            .any(|part| matches!(part, ContentPart::ImageUrl { .. }))
    })
}

impl OutboundTransformer for ZaiOutbound {
    fn provider(&self) -> ProviderType {
        ProviderType::Zai
    }

    fn transform_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        let meta = super::consume_metadata(&mut request);

        // Only auto is supported upstream; coerce instead of erroring.
        if request.tool_choice.is_some() {
            request.tool_choice = Some(ToolChoice::auto());
        }

        if request.wants_image_generation() {
            if has_input_image(&request) {
                return Err(ResponseError::invalid_request(
                    "image editing is not supported by Zai",
                ));
            }
            let prompt = openai::image_prompt(&request).ok_or_else(|| {
                ResponseError::invalid_request("image generation requires a text prompt")
            })?;
            let params = request.image_generation_tool();
            let body = serde_json::json!({
                "model": request.model,
                "prompt": prompt,
                "size": params
                    .and_then(|params| params.size.clone())
                    .unwrap_or_else(|| "1024x1024".to_owned()),
            });
            return Ok(httpclient::Request::post(self.url("/images/generations"))
                .with_json_body(serde_json::to_vec(&body)?)
                .with_bearer(&self.api_key)
                .with_metadata(METADATA_OUTBOUND_FORMAT_TYPE, FORMAT_IMAGE_GENERATION)
                .with_metadata(METADATA_MODEL, request.model.clone()));
        }

        let mut wire = openai_compat::request_to_wire(&request);
        // Upstream rejects user ids outside 6..=128 characters.
        wire.user = meta
            .user_id
            .filter(|user| user.chars().count() >= 6)
            .map(|user| user.chars().take(128).collect());
        Ok(httpclient::Request::post(self.url("/chat/completions"))
            .with_json_body(serde_json::to_vec(&wire)?)
            .with_bearer(&self.api_key))
    }

    fn transform_response(
        &self,
        response: httpclient::Response,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send {
        async move {
            if response
                .request_metadata
                .get(METADATA_OUTBOUND_FORMAT_TYPE)
                .is_some_and(|format| format == FORMAT_IMAGE_GENERATION)
            {
                let model = openai::metadata_model(&response);
                let wire: openai::ImagesResponse = response.json().map_err(|err| {
                    ResponseError::api_error(format!("failed to parse images response: {err}"))
                })?;
                return openai::images_to_chat_response(&model, wire).await;
            }
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
