//! xAI outbound. OpenAI-shaped; the provider interleaves keepalive chunks
//! whose delta has no observable field, which are dropped before they
//! reach the inbound side.

use crate::channel::ProviderType;
use crate::httpclient::{self, ByteEventStream, StreamEvent};
use crate::model::{Request, Response, ResponseError};
use crate::transformer::openai_compat::{self, CompatFlavor};
use crate::transformer::{OutboundTransformer, ResponseStream};

const XAI_API_BASE_URL: &str = "https://api.x.ai/v1";

const FLAVOR: CompatFlavor = CompatFlavor {
    reasoning_field: false,
    filter_empty_deltas: true,
};

#[derive(Debug, Clone)]
pub struct XAiOutbound {
    base_url: String,
    api_key: String,
}

impl XAiOutbound {
    pub fn new(base_url: String, api_key: String) -> Self {
        let base_url = if base_url.is_empty() {
            XAI_API_BASE_URL.to_owned()
        } else {
            base_url
        };
        Self { base_url, api_key }
    }
}

impl OutboundTransformer for XAiOutbound {
    fn provider(&self) -> ProviderType {
        ProviderType::XAi
    }

    fn transform_request(&self, mut request: Request) -> Result<httpclient::Request, ResponseError> {
        super::consume_metadata(&mut request);
        let wire = openai_compat::request_to_wire(&request);
        Ok(httpclient::Request::post(super::join_url(
            &self.base_url,
            "/v1",
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
    use crate::stream::collect_all;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_deltas_are_dropped_and_done_is_kept() {
        let outbound = XAiOutbound::new(String::new(), "xai-key".into());
        let events = vec![
            Ok(StreamEvent::data(
                json!({"id": "g1", "model": "grok-4", "choices": [{"index": 0, "delta": {}}]})
                    .to_string(),
            )),
            Ok(StreamEvent::data(
                json!({"id": "g1", "choices": [{"index": 0, "delta": {"content": "pong"}}]})
                    .to_string(),
            )),
            Ok(StreamEvent::data(
                json!({"id": "g1", "choices": [{"index": 0, "delta": {}}]}).to_string(),
            )),
            Ok(StreamEvent::data(
                json!({"id": "g1", "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]})
                    .to_string(),
            )),
            Ok(StreamEvent::done()),
        ];
        let source = futures::stream::iter(events).boxed();
        let chunks = collect_all(outbound.transform_stream(source)).await.unwrap();

        // content chunk + finish chunk + done; both keepalives dropped
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks[0].first_delta().unwrap().content,
            Some(crate::model::MessageContent::Text("pong".into()))
        );
        assert!(chunks[1].choices[0].finish_reason.is_some());
        assert!(chunks[2].is_done());
    }
}
