//! Thin HTTP transport (C2): a typed request wrapper over `reqwest`, the
//! header hygiene policy, proxy selection, and the streaming decoder
//! registry. Everything above this layer speaks [`Request`]/[`Response`];
//! nothing above it touches `reqwest` directly.

use std::collections::HashMap;

use bytes::Bytes;
use futures::StreamExt;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use thiserror::Error;

pub mod decoder;
pub mod line;
pub mod retry;
pub mod sse;

pub use decoder::StreamEvent;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Status(StatusError),
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Stream decode error: {0}")]
    Decode(String),
}

/// An upstream HTTP response with status ≥ 400, body read eagerly so the
/// outbound transformer can parse the provider's error envelope.
#[derive(Debug, Clone)]
pub struct StatusError {
    pub method: Method,
    pub url: String,
    pub status_code: u16,
    pub status: String,
    pub body: String,
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} returned {} {}",
            self.method, self.url, self.status_code, self.status
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

// ================================================================
// Header policy
// ================================================================

/// Credential-bearing headers: masked in logs, never copied from an inbound
/// request to an outbound one.
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "api-key",
    "cookie",
    "set-cookie",
    "proxy-authorization",
    "www-authenticate",
];
const SENSITIVE_PREFIXES: &[&str] = &["x-api-"];

/// Routing/internal headers stripped before an outbound send.
const BLOCKED_HEADERS: &[&str] = &[
    "content-type",
    "connection",
    "x-channel-id",
    "x-project-id",
    "x-real-ip",
];
const BLOCKED_PREFIXES: &[&str] = &["x-forwarded-"];

/// Headers the HTTP library owns; forwarding them corrupts framing.
const LIBRARY_MANAGED_HEADERS: &[&str] =
    &["content-length", "transfer-encoding", "accept-encoding", "host"];

pub fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    SENSITIVE_HEADERS.contains(&name.as_str())
        || SENSITIVE_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn is_blocked_header(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    BLOCKED_HEADERS.contains(&name.as_str())
        || BLOCKED_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub fn is_library_managed_header(name: &str) -> bool {
    LIBRARY_MANAGED_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

/// Copy pass-through headers from `src` into `dest`. Existing `dest` values
/// always win; sensitive, blocked, and library-managed headers never cross.
pub fn merge_headers(dest: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        let key = name.as_str();
        if is_sensitive_header(key) || is_blocked_header(key) || is_library_managed_header(key) {
            continue;
        }
        if !dest.contains_key(name) {
            dest.insert(name.clone(), value.clone());
        }
    }
}

/// Render headers for tracing, with sensitive values redacted.
pub fn masked(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let rendered = if is_sensitive_header(name.as_str()) {
                "<redacted>".to_owned()
            } else {
                String::from_utf8_lossy(value.as_bytes()).into_owned()
            };
            (name.as_str().to_owned(), rendered)
        })
        .collect()
}

// ================================================================
// Request / response types
// ================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Auth {
    Bearer {
        api_key: String,
    },
    ApiKey {
        header_key: String,
        api_key: String,
    },
}

/// Set the auth header on `headers`. Bearer writes `Authorization`; ApiKey
/// writes the provider's configured header verbatim.
pub fn apply_auth(headers: &mut HeaderMap, auth: &Auth) -> Result<()> {
    match auth {
        Auth::Bearer { api_key } => {
            headers.insert(
                http::header::AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}"))?,
            );
        }
        Auth::ApiKey {
            header_key,
            api_key,
        } => {
            headers.insert(
                HeaderName::from_bytes(header_key.as_bytes())?,
                HeaderValue::from_str(api_key)?,
            );
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum ProxyPolicy {
    Disabled,
    #[default]
    Environment,
    Url {
        url: String,
        username: Option<String>,
        password: Option<String>,
    },
}

/// Metadata key outbounds set so response transformation can branch on the
/// request's wire shape (e.g. image generation).
pub const METADATA_OUTBOUND_FORMAT_TYPE: &str = "outbound_format_type";

/// Metadata key carrying the requested model for upstream endpoints whose
/// responses do not echo it (image generation, rerank).
pub const METADATA_MODEL: &str = "model";

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub auth: Option<Auth>,
    pub content_type: Option<String>,
    /// Free map carried across pipeline hops, never sent on the wire.
    pub metadata: HashMap<String, String>,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            query: Vec::new(),
            body: None,
            auth: None,
            content_type: None,
            metadata: HashMap::new(),
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(Bytes::from(body));
        self.content_type = Some("application/json".to_owned());
        self
    }

    pub fn with_bearer(mut self, api_key: impl Into<String>) -> Self {
        self.auth = Some(Auth::Bearer {
            api_key: api_key.into(),
        });
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Snapshot of the request's transformer metadata, so response
    /// transformation can branch on how the request was built.
    pub request_metadata: HashMap<String, String>,
}

impl Response {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| Error::Decode(e.to_string()))
    }
}

pub type ByteEventStream = futures::stream::BoxStream<'static, Result<StreamEvent>>;

// ================================================================
// Client
// ================================================================

/// The single HTTP executor behind every pipeline. Proxy configuration is
/// fixed at construction; the client itself is cheap to clone.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: reqwest::Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(&ProxyPolicy::Environment).unwrap_or(Self {
            inner: reqwest::Client::new(),
        })
    }
}

impl HttpClient {
    pub fn new(proxy: &ProxyPolicy) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        match proxy {
            ProxyPolicy::Disabled => builder = builder.no_proxy(),
            ProxyPolicy::Environment => {}
            ProxyPolicy::Url {
                url,
                username,
                password,
            } => {
                let mut proxy = reqwest::Proxy::all(url)?;
                if let Some(username) = username {
                    proxy = proxy.basic_auth(username, password.as_deref().unwrap_or(""));
                }
                builder = builder.proxy(proxy);
            }
        }
        Ok(Self {
            inner: builder.build()?,
        })
    }

    fn build(&self, req: &Request) -> Result<reqwest::RequestBuilder> {
        let mut headers = HeaderMap::new();
        for (name, value) in &req.headers {
            let key = name.as_str();
            if is_blocked_header(key) || is_library_managed_header(key) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
        if let Some(content_type) = &req.content_type {
            headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_str(content_type)?);
        }
        if let Some(auth) = &req.auth {
            apply_auth(&mut headers, auth)?;
        }

        tracing::debug!(
            method = %req.method,
            url = %req.url,
            headers = ?masked(&headers),
            "sending upstream request"
        );

        let mut builder = self
            .inner
            .request(req.method.clone(), &req.url)
            .headers(headers);
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.body {
            builder = builder.body(body.clone());
        }
        Ok(builder)
    }

    async fn status_error(req: &Request, response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Error::Status(StatusError {
            method: req.method.clone(),
            url: req.url.clone(),
            status_code: status.as_u16(),
            status: status
                .canonical_reason()
                .unwrap_or("Unknown")
                .to_owned(),
            body,
        })
    }

    /// Unary call. Status ≥ 400 reads the body and returns
    /// [`Error::Status`]; transformers map it per dialect.
    pub async fn send(&self, req: Request) -> Result<Response> {
        let response = self.build(&req)?.send().await?;
        if response.status().as_u16() >= 400 {
            return Err(Self::status_error(&req, response).await);
        }

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(Response {
            status,
            headers,
            body,
            request_metadata: req.metadata,
        })
    }

    /// Streaming call. The decoder is picked from the registry by response
    /// content type (SSE by default). The body is not consumed until the
    /// returned stream is polled; dropping the stream releases it.
    pub async fn send_streaming(&self, mut req: Request) -> Result<ByteEventStream> {
        req.headers
            .insert(http::header::ACCEPT, HeaderValue::from_static("text/event-stream"));
        req.headers
            .insert(http::header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        req.headers
            .insert(http::header::CONNECTION, HeaderValue::from_static("keep-alive"));

        let response = self.build(&req)?.send().await?;
        if response.status().as_u16() >= 400 {
            return Err(Self::status_error(&req, response).await);
        }

        let content_type = response
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();
        Ok(decoder::decode(&content_type, bytes))
    }
}
