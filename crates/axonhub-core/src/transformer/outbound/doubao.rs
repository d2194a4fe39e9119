//! DouBao (Volcengine Ark) outbound. OpenAI-shaped chat; image generation
//! and editing use the Ark images API, with the prompt taken from text
//! parts and the first `image_url` part as the editing input.

use crate::channel::ProviderType;
use crate::httpclient::{
    self, ByteEventStream, StreamEvent, METADATA_MODEL, METADATA_OUTBOUND_FORMAT_TYPE,
};
use crate::model::{ContentPart, Message, Request, Response, ResponseError, Role};
use crate::transformer::openai_compat::{self, CompatFlavor};
use crate::transformer::outbound::openai::{self, FORMAT_IMAGE_GENERATION};
use crate::transformer::{OutboundTransformer, ResponseStream};

const DOUBAO_API_BASE_URL: &str = "https://ark.cn-beijing.volces.com/api/v3";

#[derive(Debug, Clone)]
pub struct DouBaoOutbound {
    base_url: String,
    api_key: String,
    watermark: bool,
}

impl DouBaoOutbound {
    pub fn new(base_url: String, api_key: String, watermark: bool) -> Self {
        let base_url = if base_url.is_empty() {
            DOUBAO_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self {
            base_url,
            api_key,
            watermark,
        }
    }

    fn url(&self, path: &str) -> String {
        super::join_url(&self.base_url, "/api/v3", path)
    }
}

/// Prompt text and optional editing input from the last user message.
fn image_inputs(request: &Request) -> (String, Option<String>) {
    let Some(message) = request
        .messages
        .iter()
        .rev()
        .find(|message: &&Message| message.role == Role::User)
    else {
        return (String::new(), None);
    };
    let prompt = message.text().unwrap_or_default();
    let image = message.parts().iter().find_map(|part| match part {
        ContentPart::ImageUrl { image_url } => Some(image_url.url.clone()),
        _ => None,
    });
    (prompt, image)
}

fn quality_to_wire(quality: Option<&str>) -> &'static str {
    match quality {
        Some("high") => "hd",
        _ => "standard",
    }
}

impl OutboundTransformer for DouBaoOutbound {
    fn provider(&self) -> ProviderType {
        ProviderType::DouBao
    }

    fn transform_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        super::consume_metadata(&mut request);

        if request.wants_image_generation() {
            let (prompt, image) = image_inputs(&request);
            if prompt.is_empty() {
                return Err(ResponseError::invalid_request(
                    "image generation requires a text prompt",
                ));
            }
            let params = request.image_generation_tool();
            let mut body = serde_json::json!({
                "model": request.model,
                "prompt": prompt,
                "size": params
                    .and_then(|params| params.size.clone())
                    .unwrap_or_else(|| "1024x1024".to_owned()),
                "quality": quality_to_wire(
                    params.and_then(|params| params.quality.as_deref()),
                ),
                "response_format": "b64_json",
            });
            if self.watermark || params.is_some_and(|params| params.watermark == Some(true)) {
                crate::json_utils::merge_inplace(
                    &mut body,
                    serde_json::json!({"watermark": true}),
                );
            }
            if let Some(image) = image {
                crate::json_utils::merge_inplace(&mut body, serde_json::json!({"image": image}));
            }
            return Ok(httpclient::Request::post(self.url("/images/generations"))
                .with_json_body(serde_json::to_vec(&body)?)
                .with_bearer(&self.api_key)
                .with_metadata(METADATA_OUTBOUND_FORMAT_TYPE, FORMAT_IMAGE_GENERATION)
                .with_metadata(METADATA_MODEL, request.model.clone()));
        }

        let wire = openai_compat::request_to_wire(&request);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiFormat, ImageGenerationParams, MessageContent, Modality, Tool};

    #[test]
    fn test_image_editing_extracts_prompt_and_image() {
        let outbound = DouBaoOutbound::new(String::new(), "db-key".into(), false);
        let mut request = Request::new("doubao-seededit-3-0", ApiFormat::OpenAi);
        request.modalities = Some(vec![Modality::Image]);
        request.tools = Some(vec![Tool::ImageGeneration {
            params: ImageGenerationParams {
                quality: Some("high".into()),
                watermark: Some(true),
                ..Default::default()
            },
        }]);
        request.messages = vec![Message::new(Role::User).with_content(MessageContent::Parts(
            vec![
                ContentPart::text("put a hat on the cat"),
                ContentPart::image_url("data:image/png;base64,aGk="),
            ],
        ))];

        let http = outbound.transform_request(request).unwrap();
        assert_eq!(
            http.url,
            "https://ark.cn-beijing.volces.com/api/v3/images/generations"
        );
        let body: serde_json::Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["prompt"], "put a hat on the cat");
        assert_eq!(body["image"], "data:image/png;base64,aGk=");
        assert_eq!(body["quality"], "hd");
        assert_eq!(body["watermark"], true);
        assert_eq!(body["size"], "1024x1024");
    }

    #[test]
    fn test_default_quality_is_standard() {
        let outbound = DouBaoOutbound::new(String::new(), "db-key".into(), false);
        let mut request = Request::new("doubao-seedream-4-0", ApiFormat::OpenAi);
        request.modalities = Some(vec![Modality::Image]);
        request.messages = vec![Message::user("a lighthouse at dusk")];
        let http = outbound.transform_request(request).unwrap();
        let body: serde_json::Value = serde_json::from_slice(http.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["quality"], "standard");
        assert!(body.get("watermark").is_none());
    }
}
