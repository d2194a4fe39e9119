//! Outbound transformers (C5): one per upstream provider.

pub mod anthropic;
pub mod doubao;
pub mod gemini;
pub mod openai;
pub mod openrouter;
pub mod xai;
pub mod zai;

use crate::httpclient;
use crate::model::{Request, ResponseError};

/// Join a base URL with an API path, without double-appending the version
/// segment when the configured base already carries it.
pub(crate) fn join_url(base: &str, version: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(version) {
        format!("{base}{path}")
    } else {
        format!("{base}{version}{path}")
    }
}

/// Strip neutral metadata right before the wire and surface the keys the
/// provider cares about. `request_id` falls back to the inbound trace id.
pub(crate) fn consume_metadata(request: &mut Request) -> ConsumedMetadata {
    let user_id = request
        .metadata_str(crate::model::request::METADATA_USER_ID)
        .map(str::to_owned);
    let request_id = request
        .metadata_str(crate::model::request::METADATA_REQUEST_ID)
        .map(str::to_owned)
        .or_else(|| {
            request.raw.as_ref().and_then(|raw| {
                raw.headers
                    .get(crate::pipeline::TRACE_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_owned)
            })
        });
    request.take_metadata();
    ConsumedMetadata {
        user_id,
        request_id,
    }
}

pub(crate) struct ConsumedMetadata {
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}

/// Default mapping from a transport error to the neutral model for
/// OpenAI-shaped providers.
pub(crate) fn transform_error_openai_shaped(error: &httpclient::Error) -> ResponseError {
    match error {
        httpclient::Error::Status(status) => {
            super::openai_compat::parse_error_body(status.status_code, &status.body)
        }
        other => ResponseError::api_error(other.to_string()),
    }
}
