//! Jina rerank inbound: `POST /v1/rerank`, unary only.

use futures::StreamExt;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::httpclient::{self, StreamEvent};
use crate::model::{
    ApiFormat, Request, RequestType, RerankParams, Response, ResponseError, Usage,
};
use crate::transformer::{EventStream, InboundTransformer, ResponseMeta, ResponseStream};

#[derive(Debug, Clone, Deserialize)]
struct RerankRequest {
    pub model: String,
    pub query: String,
    pub documents: Vec<String>,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default)]
    pub return_documents: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct RerankEnvelope<'a> {
    pub object: &'static str,
    pub results: &'a [crate::model::RerankResult],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<RerankUsage>,
}

#[derive(Debug, Clone, Copy, Serialize)]
struct RerankUsage {
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct JinaInbound;

impl JinaInbound {
    pub fn new() -> Self {
        Self
    }
}

impl InboundTransformer for JinaInbound {
    fn api_format(&self) -> ApiFormat {
        ApiFormat::JinaRerank
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        let wire: RerankRequest = super::parse_body(request)?;
        if wire.model.is_empty() {
            return Err(ResponseError::invalid_request("model is required"));
        }
        if wire.documents.is_empty() {
            return Err(ResponseError::invalid_request("documents must not be empty"));
        }
        let mut neutral = Request::new(wire.model, ApiFormat::JinaRerank);
        neutral.request_type = RequestType::Rerank;
        neutral.raw = Some(super::raw_request(request));
        neutral.rerank = Some(RerankParams {
            query: wire.query,
            documents: wire.documents,
            top_n: wire.top_n,
            return_documents: wire.return_documents,
        });
        Ok(neutral)
    }

    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError> {
        let results = response.rerank_results.as_deref().ok_or_else(|| {
            ResponseError::api_error("rerank response carried no results")
        })?;
        let envelope = RerankEnvelope {
            object: "list",
            results,
            usage: response.usage.as_ref().map(|usage: &Usage| RerankUsage {
                total_tokens: usage.total_tokens,
            }),
        };
        Ok(super::json_response(serde_json::to_vec(&envelope)?))
    }

    fn transform_stream(&self, _source: ResponseStream) -> EventStream {
        futures::stream::iter(vec![Err(ResponseError::invalid_request(
            "rerank does not support streaming",
        ))])
        .boxed()
    }

    fn aggregate_chunks(
        &self,
        _chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError> {
        Err(ResponseError::invalid_request(
            "rerank does not support streaming",
        ))
    }

    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value) {
        let status =
            StatusCode::from_u16(error.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "detail": error.detail.message,
        });
        (status, body)
    }
}
