//! The transformer layer (C4/C5): bi-directional translation between the
//! neutral model and each wire dialect.
//!
//! An inbound transformer faces the client's dialect; an outbound faces the
//! upstream provider. Both expose the same five operations (request,
//! response, stream, aggregate, error), with sides reversed. Dispatch is by
//! tagged enum over the provider/dialect tag — never by runtime type
//! inspection.

use std::future::Future;

use http::StatusCode;

use crate::channel::{Channel, ProviderType};
use crate::httpclient::{self, ByteEventStream, StreamEvent};
use crate::model::{ApiFormat, Request, Response, ResponseError, Usage};
use crate::stream::ResultStream;

pub(crate) mod anthropic_compat;
pub mod inbound;
pub(crate) mod openai_compat;
pub mod outbound;

/// A lazy stream of neutral responses (delta form), closed by the
/// [`crate::model::OBJECT_DONE`] sentinel.
pub type ResponseStream = ResultStream<Response, ResponseError>;

/// A lazy stream of dialect wire events ready for SSE framing.
pub type EventStream = ResultStream<StreamEvent, ResponseError>;

/// Summary extracted when aggregating a finished stream (for logging,
/// caching, replay).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    pub id: String,
    pub model: String,
    pub usage: Option<Usage>,
}

/// Client-dialect side of the pipeline.
pub trait InboundTransformer: Send + Sync {
    fn api_format(&self) -> ApiFormat;

    /// HTTP request → neutral request. Validation failures are
    /// `invalid_request` errors.
    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError>;

    /// Neutral response → HTTP response in this dialect.
    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError>;

    /// Neutral stream → dialect wire events. Lazy; the Done sentinel is
    /// replaced by this dialect's terminator.
    fn transform_stream(&self, stream: ResponseStream) -> EventStream;

    /// Reconstruct the single final envelope from this dialect's own wire
    /// events, independently of the live stream.
    fn aggregate_chunks(
        &self,
        chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError>;

    /// Render a neutral error in this dialect's error envelope.
    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value);

    /// Extra response headers this dialect requires on streams.
    fn stream_headers(&self) -> http::HeaderMap {
        http::HeaderMap::new()
    }
}

/// Provider side of the pipeline.
pub trait OutboundTransformer: Send + Sync {
    fn provider(&self) -> ProviderType;

    /// Neutral request → upstream HTTP request. Consumes the request;
    /// metadata is stripped here and never forwarded.
    fn transform_request(&self, request: Request) -> Result<httpclient::Request, ResponseError>;

    /// Upstream HTTP response → neutral response. Async because image URLs
    /// may need downloading into data URLs.
    fn transform_response(
        &self,
        response: httpclient::Response,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send;

    /// Upstream wire events → neutral stream, closed by the Done sentinel.
    fn transform_stream(&self, stream: ByteEventStream) -> ResponseStream;

    /// Fold upstream wire events into one neutral envelope.
    fn aggregate_chunks(&self, chunks: &[StreamEvent]) -> Result<Response, ResponseError>;

    /// Upstream HTTP error → neutral error, parsing the provider's error
    /// envelope when possible.
    fn transform_error(&self, error: &httpclient::Error) -> ResponseError;
}

// ================================================================
// Enum dispatch
// ================================================================

#[derive(Clone)]
pub enum AnyInbound {
    OpenAi(inbound::openai::OpenAiInbound),
    OpenAiResponses(inbound::responses::ResponsesInbound),
    Anthropic(inbound::anthropic::AnthropicInbound),
    Gemini(inbound::gemini::GeminiInbound),
    AiSdk(inbound::aisdk::AiSdkInbound),
    JinaRerank(inbound::jina::JinaInbound),
}

impl AnyInbound {
    pub fn for_format(format: ApiFormat) -> Self {
        match format {
            ApiFormat::OpenAi => AnyInbound::OpenAi(inbound::openai::OpenAiInbound::new()),
            ApiFormat::OpenAiResponses => {
                AnyInbound::OpenAiResponses(inbound::responses::ResponsesInbound::new())
            }
            ApiFormat::Anthropic => {
                AnyInbound::Anthropic(inbound::anthropic::AnthropicInbound::new())
            }
            ApiFormat::Gemini => AnyInbound::Gemini(inbound::gemini::GeminiInbound::new()),
            ApiFormat::AiSdk => AnyInbound::AiSdk(inbound::aisdk::AiSdkInbound::new()),
            ApiFormat::JinaRerank => AnyInbound::JinaRerank(inbound::jina::JinaInbound::new()),
        }
    }
}

macro_rules! dispatch_inbound {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyInbound::OpenAi($inner) => $body,
            AnyInbound::OpenAiResponses($inner) => $body,
            AnyInbound::Anthropic($inner) => $body,
            AnyInbound::Gemini($inner) => $body,
            AnyInbound::AiSdk($inner) => $body,
            AnyInbound::JinaRerank($inner) => $body,
        }
    };
}

impl InboundTransformer for AnyInbound {
    fn api_format(&self) -> ApiFormat {
        dispatch_inbound!(self, inner => inner.api_format())
    }

    fn transform_request(&self, request: &httpclient::Request) -> Result<Request, ResponseError> {
        dispatch_inbound!(self, inner => inner.transform_request(request))
    }

    fn transform_response(&self, response: &Response) -> Result<httpclient::Response, ResponseError> {
        dispatch_inbound!(self, inner => inner.transform_response(response))
    }

    fn transform_stream(&self, stream: ResponseStream) -> EventStream {
        dispatch_inbound!(self, inner => inner.transform_stream(stream))
    }

    fn aggregate_chunks(
        &self,
        chunks: &[StreamEvent],
    ) -> Result<(Vec<u8>, ResponseMeta), ResponseError> {
        dispatch_inbound!(self, inner => inner.aggregate_chunks(chunks))
    }

    fn transform_error(&self, error: &ResponseError) -> (StatusCode, serde_json::Value) {
        dispatch_inbound!(self, inner => inner.transform_error(error))
    }

    fn stream_headers(&self) -> http::HeaderMap {
        dispatch_inbound!(self, inner => inner.stream_headers())
    }
}

#[derive(Clone)]
pub enum AnyOutbound {
    OpenAi(outbound::openai::OpenAiOutbound),
    Anthropic(outbound::anthropic::AnthropicOutbound),
    Gemini(outbound::gemini::GeminiOutbound),
    OpenRouter(outbound::openrouter::OpenRouterOutbound),
    XAi(outbound::xai::XAiOutbound),
    Zai(outbound::zai::ZaiOutbound),
    DouBao(outbound::doubao::DouBaoOutbound),
}

impl AnyOutbound {
    /// Pick and configure the outbound for a channel's provider tag.
    /// OpenAI-compatible providers (ModelScope, NanoGPT, Codex) share the
    /// OpenAI outbound with flavor-specific quirks.
    pub fn for_channel(channel: &Channel) -> Self {
        let base_url = channel.base_url.clone().unwrap_or_default();
        let api_key = channel
            .credentials
            .api_key()
            .unwrap_or_default()
            .to_owned();
        match channel.provider {
            ProviderType::OpenAi | ProviderType::ModelScope | ProviderType::Codex => {
                AnyOutbound::OpenAi(outbound::openai::OpenAiOutbound::new(
                    channel.provider,
                    base_url,
                    api_key,
                ))
            }
            ProviderType::NanoGpt => AnyOutbound::OpenAi(
                outbound::openai::OpenAiOutbound::new(channel.provider, base_url, api_key)
                    .with_reasoning_field(),
            ),
            ProviderType::Anthropic | ProviderType::ClaudeCode => AnyOutbound::Anthropic(
                outbound::anthropic::AnthropicOutbound::new(channel.provider, base_url, api_key),
            ),
            ProviderType::Gemini => {
                AnyOutbound::Gemini(outbound::gemini::GeminiOutbound::new(base_url, api_key))
            }
            ProviderType::OpenRouter => AnyOutbound::OpenRouter(
                outbound::openrouter::OpenRouterOutbound::new(base_url, api_key),
            ),
            ProviderType::XAi => {
                AnyOutbound::XAi(outbound::xai::XAiOutbound::new(base_url, api_key))
            }
            ProviderType::Zai => {
                AnyOutbound::Zai(outbound::zai::ZaiOutbound::new(base_url, api_key))
            }
            ProviderType::DouBao => AnyOutbound::DouBao(outbound::doubao::DouBaoOutbound::new(
                base_url,
                api_key,
                channel.flags.image_watermark,
            )),
        }
    }
}

macro_rules! dispatch_outbound {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            AnyOutbound::OpenAi($inner) => $body,
            AnyOutbound::Anthropic($inner) => $body,
            AnyOutbound::Gemini($inner) => $body,
            AnyOutbound::OpenRouter($inner) => $body,
            AnyOutbound::XAi($inner) => $body,
            AnyOutbound::Zai($inner) => $body,
            AnyOutbound::DouBao($inner) => $body,
        }
    };
}

impl OutboundTransformer for AnyOutbound {
    fn provider(&self) -> ProviderType {
        dispatch_outbound!(self, inner => inner.provider())
    }

    fn transform_request(&self, request: Request) -> Result<httpclient::Request, ResponseError> {
        dispatch_outbound!(self, inner => inner.transform_request(request))
    }

    fn transform_response(
        &self,
        response: httpclient::Response,
    ) -> impl Future<Output = Result<Response, ResponseError>> + Send {
        async move {
            dispatch_outbound!(self, inner => inner.transform_response(response).await)
        }
    }

    fn transform_stream(&self, stream: ByteEventStream) -> ResponseStream {
        dispatch_outbound!(self, inner => inner.transform_stream(stream))
    }

    fn aggregate_chunks(&self, chunks: &[StreamEvent]) -> Result<Response, ResponseError> {
        dispatch_outbound!(self, inner => inner.aggregate_chunks(chunks))
    }

    fn transform_error(&self, error: &httpclient::Error) -> ResponseError {
        dispatch_outbound!(self, inner => inner.transform_error(error))
    }
}
