//! The pipeline engine (C7): composes one inbound transformer, a
//! middleware chain, and one outbound transformer around a single HTTP
//! executor, for both unary and streaming calls. Errors raised at any hop
//! are normalized to [`ResponseError`] and rendered in the inbound
//! dialect's envelope at the edge.

use bytes::Bytes;
use http::{HeaderMap, HeaderValue};

use crate::httpclient::{self, merge_headers, HttpClient};
use crate::model::{Choice, Request, Response, ResponseError};
use crate::stream;
use crate::transformer::{EventStream, InboundTransformer, OutboundTransformer};

/// Request-scoped trace identifier, auto-generated when absent.
pub const TRACE_ID_HEADER: &str = "ah-trace-id";
/// Caller-supplied conversation thread identifier.
pub const THREAD_ID_HEADER: &str = "ah-thread-id";

/// Two optional hooks, run in configured order. Returning an error aborts
/// the request; returning a request must return a complete one.
pub trait Middleware: Send + Sync {
    fn on_llm_request(&self, request: Request) -> Result<Request, ResponseError> {
        Ok(request)
    }

    fn on_raw_request(
        &self,
        request: httpclient::Request,
    ) -> Result<httpclient::Request, ResponseError> {
        Ok(request)
    }
}

/// A started stream: dialect response headers plus the event stream.
pub struct StreamReply {
    pub headers: HeaderMap,
    pub events: EventStream,
}

pub struct Pipeline<I, O> {
    inbound: I,
    outbound: O,
    client: HttpClient,
    middlewares: Vec<Box<dyn Middleware>>,
}

impl<I, O> Pipeline<I, O>
where
    I: InboundTransformer,
    O: OutboundTransformer,
{
    pub fn new(inbound: I, outbound: O, client: HttpClient) -> Self {
        Self {
            inbound,
            outbound,
            client,
            middlewares: Vec::new(),
        }
    }

    pub fn with_middleware(mut self, middleware: Box<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn inbound(&self) -> &I {
        &self.inbound
    }

    pub fn outbound(&self) -> &O {
        &self.outbound
    }

    pub(crate) fn neutral_request(
        &self,
        http_in: &httpclient::Request,
    ) -> Result<Request, ResponseError> {
        let mut neutral = self.inbound.transform_request(http_in)?;
        for middleware in &self.middlewares {
            neutral = middleware.on_llm_request(neutral)?;
        }
        Ok(neutral)
    }

    pub(crate) fn outbound_request(
        &self,
        neutral: Request,
    ) -> Result<httpclient::Request, ResponseError> {
        let inbound_headers = neutral
            .raw
            .as_ref()
            .map(|raw| raw.headers.clone())
            .unwrap_or_default();

        let mut out = self.outbound.transform_request(neutral)?;
        merge_headers(&mut out.headers, &inbound_headers);
        if !out.headers.contains_key(TRACE_ID_HEADER)
            && let Ok(value) = HeaderValue::from_str(&nanoid::nanoid!(21))
        {
            out.headers.insert(TRACE_ID_HEADER, value);
        }
        for middleware in &self.middlewares {
            out = middleware.on_raw_request(out)?;
        }
        Ok(out)
    }

    fn map_transport_error(&self, error: httpclient::Error) -> ResponseError {
        match &error {
            httpclient::Error::Status(_) => self.outbound.transform_error(&error),
            other => ResponseError::api_error(other.to_string()),
        }
    }

    async fn call_unary(&self, neutral: Request) -> Result<Response, ResponseError> {
        let request_type = neutral.request_type;
        let model = neutral.model.clone();
        let out = self.outbound_request(neutral)?;
        let http_out = self
            .client
            .send(out)
            .await
            .map_err(|err| self.map_transport_error(err))?;
        let mut response = self.outbound.transform_response(http_out).await?;
        response.request_type = request_type;
        // Providers that echo their own model name win; endpoints that
        // return none (image generation, rerank) get the requested one.
        if response.model.is_empty() {
            response.model = model;
        }
        response.api_format = Some(self.inbound.api_format());
        Ok(response)
    }

    /// Unary data flow: client dialect → neutral → provider → neutral →
    /// client dialect.
    pub async fn run(
        &self,
        http_in: &httpclient::Request,
    ) -> Result<httpclient::Response, ResponseError> {
        let neutral = self.neutral_request(http_in)?;
        let response = self.call_unary(neutral).await?;
        self.inbound.transform_response(&response)
    }

    /// Streaming data flow. Image generation always executes unary and is
    /// re-framed as a synthetic single-chunk stream.
    pub async fn run_stream(
        &self,
        http_in: &httpclient::Request,
    ) -> Result<StreamReply, ResponseError> {
        let neutral = self.neutral_request(http_in)?;

        if neutral.wants_image_generation() {
            let response = self.call_unary(neutral).await?;
            let source = stream::from_slice(vec![delta_form(response), Response::done()]);
            return Ok(StreamReply {
                headers: self.stream_headers(),
                events: self.inbound.transform_stream(source),
            });
        }

        let out = self.outbound_request(neutral)?;
        let bytes = self
            .client
            .send_streaming(out)
            .await
            .map_err(|err| self.map_transport_error(err))?;
        let events = self
            .inbound
            .transform_stream(self.outbound.transform_stream(bytes));
        Ok(StreamReply {
            headers: self.stream_headers(),
            events,
        })
    }

    fn stream_headers(&self) -> HeaderMap {
        let mut headers = self.inbound.stream_headers();
        if !headers.contains_key(http::header::CONTENT_TYPE) {
            headers.insert(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(
                http::header::CACHE_CONTROL,
                HeaderValue::from_static("no-cache"),
            );
            headers.insert(
                http::header::CONNECTION,
                HeaderValue::from_static("keep-alive"),
            );
        }
        headers
    }

    /// Render a neutral error in the inbound dialect's envelope.
    pub fn render_error(&self, error: &ResponseError) -> httpclient::Response {
        let (status, body) = self.inbound.transform_error(error);
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        httpclient::Response {
            status,
            headers,
            body: Bytes::from(body.to_string()),
            request_metadata: Default::default(),
        }
    }

    /// Like [`Pipeline::run`], with errors already rendered for the client.
    pub async fn run_rendered(&self, http_in: &httpclient::Request) -> httpclient::Response {
        match self.run(http_in).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "pipeline request failed");
                self.render_error(&err)
            }
        }
    }
}

/// Re-frame a finalized response as a delta chunk for synthetic streams.
fn delta_form(mut response: Response) -> Response {
    response.object = crate::model::OBJECT_CHAT_COMPLETION_CHUNK.to_owned();
    response.choices = response
        .choices
        .into_iter()
        .map(|choice| Choice {
            index: choice.index,
            delta: choice.message.or(choice.delta),
            message: None,
            finish_reason: choice.finish_reason,
        })
        .collect();
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformer::inbound::openai::OpenAiInbound;
    use crate::transformer::outbound::openai::OpenAiOutbound;
    use crate::channel::ProviderType;
    use http::HeaderName;
    use serde_json::json;

    struct TagModel;

    impl Middleware for TagModel {
        fn on_llm_request(&self, mut request: Request) -> Result<Request, ResponseError> {
            request.model = format!("{}-tagged", request.model);
            Ok(request)
        }
    }

    struct Reject;

    impl Middleware for Reject {
        fn on_llm_request(&self, _request: Request) -> Result<Request, ResponseError> {
            Err(ResponseError::invalid_request("rejected by middleware"))
        }
    }

    fn pipeline_with(
        middlewares: Vec<Box<dyn Middleware>>,
    ) -> Pipeline<OpenAiInbound, OpenAiOutbound> {
        let mut pipeline = Pipeline::new(
            OpenAiInbound::new(),
            OpenAiOutbound::new(ProviderType::OpenAi, String::new(), "sk-test".into()),
            HttpClient::default(),
        );
        for middleware in middlewares {
            pipeline = pipeline.with_middleware(middleware);
        }
        pipeline
    }

    fn chat_http_request() -> httpclient::Request {
        let mut request = httpclient::Request::post("/v1/chat/completions").with_json_body(
            serde_json::to_vec(&json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap(),
        );
        request.headers.insert(
            HeaderName::from_static("ah-thread-id"),
            HeaderValue::from_static("thread-7"),
        );
        request.headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer client-key"),
        );
        request
    }

    #[test]
    fn test_middleware_runs_in_order_and_can_abort() {
        let pipeline = pipeline_with(vec![Box::new(TagModel)]);
        let neutral = pipeline.neutral_request(&chat_http_request()).unwrap();
        assert_eq!(neutral.model, "gpt-4o-mini-tagged");

        let pipeline = pipeline_with(vec![Box::new(Reject), Box::new(TagModel)]);
        let err = pipeline.neutral_request(&chat_http_request()).unwrap_err();
        assert_eq!(err.detail.message, "rejected by middleware");
    }

    #[test]
    fn test_outbound_request_merges_passthrough_headers_only() {
        let pipeline = pipeline_with(Vec::new());
        let neutral = pipeline.neutral_request(&chat_http_request()).unwrap();
        let out = pipeline.outbound_request(neutral).unwrap();

        // Thread id passes through; the client's auth header never does.
        assert_eq!(out.headers["ah-thread-id"], "thread-7");
        assert!(!out.headers.contains_key(http::header::AUTHORIZATION));
        // A trace id is generated when absent.
        assert!(out.headers.contains_key(TRACE_ID_HEADER));
    }

    #[test]
    fn test_render_error_uses_inbound_envelope() {
        let pipeline = pipeline_with(Vec::new());
        let rendered = pipeline.render_error(&ResponseError::rate_limit("slow down"));
        assert_eq!(rendered.status.as_u16(), 429);
        let body: serde_json::Value = serde_json::from_slice(&rendered.body).unwrap();
        assert_eq!(body["error"]["message"], "slow down");
    }

    #[test]
    fn test_delta_form_moves_message_to_delta() {
        let mut response = Response::new("r1", "m");
        let message = crate::model::Message::assistant("hello");
        response.choices = vec![Choice::of_message(message)];
        let chunk = delta_form(response);
        assert!(chunk.choices[0].message.is_none());
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().text().as_deref(),
            Some("hello")
        );
    }
}
