//! AxonHub — a multi-dialect LLM gateway core.
//!
//! This crate re-exports [`axonhub_core`]. See that crate for the neutral
//! request/response model, the per-dialect transformers, the streaming
//! pipeline, and the channel infrastructure (OAuth, live cache, quota).

pub use axonhub_core::*;
