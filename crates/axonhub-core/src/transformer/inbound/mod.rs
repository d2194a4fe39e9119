//! Inbound transformers (C4): one per client dialect.

pub mod aisdk;
pub mod anthropic;
pub mod gemini;
pub mod jina;
pub mod openai;
pub mod responses;

use http::HeaderValue;

use crate::httpclient;
use crate::model::{RawRequest, ResponseError};

/// Parse an inbound JSON body, mapping failures to `invalid_request`.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    request: &httpclient::Request,
) -> Result<T, ResponseError> {
    let body = request
        .body
        .as_deref()
        .ok_or_else(|| ResponseError::invalid_request("request body is required"))?;
    serde_json::from_slice(body)
        .map_err(|err| ResponseError::invalid_request(format!("invalid request body: {err}")))
}

/// Snapshot the inbound request for trace/thread header passthrough.
pub(crate) fn raw_request(request: &httpclient::Request) -> RawRequest {
    RawRequest {
        headers: request.headers.clone(),
        path: request.url.clone(),
        query: request.query.clone(),
    }
}

/// A JSON HTTP response in the inbound dialect.
pub(crate) fn json_response(body: Vec<u8>) -> httpclient::Response {
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    httpclient::Response {
        status: http::StatusCode::OK,
        headers,
        body: bytes::Bytes::from(body),
        request_metadata: std::collections::HashMap::new(),
    }
}
