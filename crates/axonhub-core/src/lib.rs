//! Core of the AxonHub gateway: a neutral LLM request/response model, the
//! bi-directional transformers between that model and each supported wire
//! dialect, and the streaming pipeline that composes them around a single
//! HTTP executor.
//!
//! # Architecture
//!
//! ```text
//! client dialect ──> inbound transformer ──> neutral model ──> outbound
//!   (OpenAI Chat,         (C4)                  (C1)          transformer
//!    Anthropic, ...)                                             (C5)
//!                                                                 │
//!                       neutral response <── provider wire <── HTTP (C2)
//! ```
//!
//! The neutral model is lossless across round-trips through providers that
//! do not share a concept (reasoning signatures travel as base64-prefixed
//! markers, see [`codec`]). Streaming is pull-based and lazy end to end:
//! nothing is read from the upstream body until the client consumes.
//!
//! Channel infrastructure (OAuth token refresh, the live channel cache, and
//! the per-provider quota probes) lives in [`oauth`], [`cache`], and
//! [`quota`].

pub mod cache;
pub mod channel;
pub mod codec;
pub mod httpclient;
pub mod json_utils;
pub mod model;
pub mod oauth;
pub mod pipeline;
pub mod quota;
pub mod stream;
pub mod transformer;
pub mod util;

pub use channel::{Channel, Credentials, ProviderType};
pub use model::{
    ApiFormat, Message, MessageContent, Request, RequestType, Response, ResponseError, Usage,
};
pub use pipeline::{Middleware, Pipeline};
