//! Channel: a configured upstream (provider + credentials + base URL).
//! Channels are created by the admin plane and consumed read-only here; the
//! pipeline picks an outbound transformer by the channel's provider tag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::httpclient::ProxyPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Gemini,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "modelscope")]
    ModelScope,
    #[serde(rename = "nanogpt")]
    NanoGpt,
    #[serde(rename = "doubao")]
    DouBao,
    Zai,
    #[serde(rename = "xai")]
    XAi,
    Codex,
    ClaudeCode,
}

/// OAuth credential set for channels authenticating via an identity flow
/// rather than a static key. Mutated only by the token provider's refresh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    ApiKey(String),
    OAuth(OAuthCredentials),
}

impl Credentials {
    pub fn api_key(&self) -> Option<&str> {
        match self {
            Credentials::ApiKey(key) => Some(key),
            Credentials::OAuth(creds) => Some(&creds.access_token),
        }
    }

    pub fn oauth(&self) -> Option<&OAuthCredentials> {
        match self {
            Credentials::OAuth(creds) => Some(creds),
            Credentials::ApiKey(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub provider: ProviderType,
    pub base_url: Option<String>,
    pub credentials: Credentials,
    pub proxy: ProxyPolicy,
    /// Provider feature switches (e.g. DouBao watermarking).
    pub flags: ChannelFlags,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelFlags {
    pub disable_stream: bool,
    pub image_watermark: bool,
}

impl Channel {
    pub fn new(id: i64, provider: ProviderType, credentials: Credentials) -> Self {
        Self {
            id,
            name: String::new(),
            provider,
            base_url: None,
            credentials,
            proxy: ProxyPolicy::default(),
            flags: ChannelFlags::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}
