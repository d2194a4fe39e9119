//! Channel quota probes (C10): minimal upstream requests whose purpose is
//! to read rate-limit metadata, normalized to a common status.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{Channel, ProviderType};
use crate::model::ResponseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Available,
    Warning,
    Exhausted,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaData {
    pub status: QuotaStatus,
    pub provider_type: ProviderType,
    pub raw_data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_reset_at: Option<DateTime<Utc>>,
    /// A channel is ready while it still has headroom.
    pub ready: bool,
}

impl QuotaData {
    pub fn new(
        status: QuotaStatus,
        provider_type: ProviderType,
        raw_data: serde_json::Value,
        next_reset_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            status,
            provider_type,
            raw_data,
            next_reset_at,
            ready: matches!(status, QuotaStatus::Available | QuotaStatus::Warning),
        }
    }
}

pub trait QuotaChecker: Send + Sync {
    fn supports_channel(&self, channel: &Channel) -> bool;

    fn check_quota(
        &self,
        channel: &Channel,
    ) -> impl Future<Output = Result<QuotaData, ResponseError>> + Send;
}

const WARNING_UTILIZATION: f64 = 0.8;

// ================================================================
// ClaudeCode
// ================================================================

const CLAUDE_API_BASE_URL: &str = "https://api.anthropic.com";
const PROBE_MODEL: &str = "claude-3-5-haiku-20241022";

const HEADER_UNIFIED_STATUS: &str = "anthropic-ratelimit-unified-status";
const HEADER_UNIFIED_REPRESENTATIVE_CLAIM: &str =
    "anthropic-ratelimit-unified-representative-claim";
const HEADER_UNIFIED_5H_UTILIZATION: &str = "anthropic-ratelimit-unified-5h-utilization";
const HEADER_UNIFIED_7D_UTILIZATION: &str = "anthropic-ratelimit-unified-7d-utilization";
const HEADER_UNIFIED_5H_RESET: &str = "anthropic-ratelimit-unified-5h-reset";
const HEADER_UNIFIED_7D_RESET: &str = "anthropic-ratelimit-unified-7d-reset";

/// Probes a ClaudeCode channel by posting a one-token message and reading
/// the unified rate-limit headers.
#[derive(Debug, Clone, Default)]
pub struct ClaudeCodeQuotaChecker {
    http: reqwest::Client,
    base_url: Option<String>,
}

impl ClaudeCodeQuotaChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_f64(headers: &http::HeaderMap, name: &str) -> Option<f64> {
    header_str(headers, name)?.parse().ok()
}

fn header_datetime(headers: &http::HeaderMap, name: &str) -> Option<DateTime<Utc>> {
    let raw = header_str(headers, name)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single())
}

impl QuotaChecker for ClaudeCodeQuotaChecker {
    fn supports_channel(&self, channel: &Channel) -> bool {
        channel.provider == ProviderType::ClaudeCode
    }

    fn check_quota(
        &self,
        channel: &Channel,
    ) -> impl Future<Output = Result<QuotaData, ResponseError>> + Send {
        let base = self
            .base_url
            .clone()
            .or_else(|| channel.base_url.clone())
            .unwrap_or_else(|| CLAUDE_API_BASE_URL.to_owned());
        let token = channel
            .credentials
            .api_key()
            .unwrap_or_default()
            .to_owned();
        let http = self.http.clone();
        let provider = channel.provider;

        async move {
            let response = http
                .post(format!("{}/v1/messages", base.trim_end_matches('/')))
                .bearer_auth(token)
                .header("anthropic-beta", "oauth-2025-04-20")
                .header("anthropic-version", "2023-06-01")
                .header("anthropic-dangerous-direct-browser-access", "true")
                .header("x-app", "cli")
                .header(http::header::CONTENT_TYPE, "application/json")
                .json(&serde_json::json!({
                    "model": PROBE_MODEL,
                    "max_tokens": 1,
                    "messages": [{"role": "user", "content": "quota"}],
                }))
                .send()
                .await
                .map_err(|err| ResponseError::api_error(format!("quota probe failed: {err}")))?;

            let headers = response.headers().clone();
            let unified_status = header_str(&headers, HEADER_UNIFIED_STATUS);
            let five_hour = header_f64(&headers, HEADER_UNIFIED_5H_UTILIZATION);
            let seven_day = header_f64(&headers, HEADER_UNIFIED_7D_UTILIZATION);

            let mut status = match unified_status {
                Some("allowed") => QuotaStatus::Available,
                Some("throttled") | Some("rejected") => QuotaStatus::Exhausted,
                _ => QuotaStatus::Unknown,
            };
            if status == QuotaStatus::Available
                && five_hour
                    .into_iter()
                    .chain(seven_day)
                    .any(|utilization| utilization >= WARNING_UTILIZATION)
            {
                status = QuotaStatus::Warning;
            }

            let next_reset_at = match header_str(&headers, HEADER_UNIFIED_REPRESENTATIVE_CLAIM) {
                Some("seven_day") => header_datetime(&headers, HEADER_UNIFIED_7D_RESET),
                Some("five_hour") => header_datetime(&headers, HEADER_UNIFIED_5H_RESET),
                _ => None,
            };

            let raw_data = serde_json::json!({
                "status": unified_status,
                "five_hour_utilization": five_hour,
                "seven_day_utilization": seven_day,
                "http_status": response.status().as_u16(),
            });
            Ok(QuotaData::new(status, provider, raw_data, next_reset_at))
        }
    }
}

// ================================================================
// Codex
// ================================================================

const CODEX_USAGE_URL: &str = "https://chatgpt.com/backend-api/wham/usage";
const OPENAI_AUTH_CLAIM: &str = "https://api.openai.com/auth";

#[derive(Debug, Clone, Deserialize, Serialize)]
struct CodexUsage {
    #[serde(default)]
    plan_type: Option<String>,
    #[serde(default)]
    rate_limit: Option<CodexRateLimit>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct CodexRateLimit {
    #[serde(default)]
    allowed: bool,
    #[serde(default)]
    limit_reached: bool,
    #[serde(default)]
    primary_window: Option<CodexWindow>,
    #[serde(default)]
    secondary_window: Option<CodexWindow>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct CodexWindow {
    #[serde(default)]
    used_percent: f64,
    #[serde(default)]
    reset_at: Option<i64>,
}

/// Extract the ChatGPT account id from the access token's
/// `https://api.openai.com/auth` claim.
pub fn chatgpt_account_id(access_token: &str) -> Option<String> {
    let payload = access_token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims
        .get(OPENAI_AUTH_CLAIM)?
        .get("chatgpt_account_id")?
        .as_str()
        .map(str::to_owned)
}

#[derive(Debug, Clone, Default)]
pub struct CodexQuotaChecker {
    http: reqwest::Client,
    usage_url: Option<String>,
}

impl CodexQuotaChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_usage_url(mut self, usage_url: impl Into<String>) -> Self {
        self.usage_url = Some(usage_url.into());
        self
    }
}

impl QuotaChecker for CodexQuotaChecker {
    fn supports_channel(&self, channel: &Channel) -> bool {
        channel.provider == ProviderType::Codex
    }

    fn check_quota(
        &self,
        channel: &Channel,
    ) -> impl Future<Output = Result<QuotaData, ResponseError>> + Send {
        let url = self
            .usage_url
            .clone()
            .unwrap_or_else(|| CODEX_USAGE_URL.to_owned());
        let token = channel
            .credentials
            .api_key()
            .unwrap_or_default()
            .to_owned();
        let http = self.http.clone();
        let provider = channel.provider;

        async move {
            let account_id = chatgpt_account_id(&token).ok_or_else(|| {
                ResponseError::auth_error("access token carries no chatgpt account id")
            })?;
            let response = http
                .get(url)
                .bearer_auth(&token)
                .header("chatgpt-account-id", account_id)
                .send()
                .await
                .map_err(|err| ResponseError::api_error(format!("quota probe failed: {err}")))?;
            if !response.status().is_success() {
                return Err(ResponseError::new(
                    response.status().as_u16(),
                    ResponseError::kind_for_status(response.status().as_u16()),
                    "usage endpoint returned an error",
                ));
            }

            let usage: CodexUsage = response.json().await.map_err(|err| {
                ResponseError::api_error(format!("failed to parse usage response: {err}"))
            })?;
            let raw_data = serde_json::to_value(&usage).unwrap_or_default();

            let rate_limit = usage.rate_limit.unwrap_or_default();
            let used_percent = rate_limit
                .primary_window
                .as_ref()
                .map(|window| window.used_percent)
                .into_iter()
                .chain(
                    rate_limit
                        .secondary_window
                        .as_ref()
                        .map(|window| window.used_percent),
                )
                .fold(0.0_f64, f64::max);

            let status = if rate_limit.limit_reached || !rate_limit.allowed {
                QuotaStatus::Exhausted
            } else if used_percent >= WARNING_UTILIZATION * 100.0 {
                QuotaStatus::Warning
            } else {
                QuotaStatus::Available
            };
            let next_reset_at = rate_limit
                .primary_window
                .and_then(|window| window.reset_at)
                .and_then(|seconds| Utc.timestamp_opt(seconds, 0).single());

            Ok(QuotaData::new(status, provider, raw_data, next_reset_at))
        }
    }
}
