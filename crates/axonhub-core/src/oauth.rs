//! Per-channel OAuth token provider (C8): credential cache with
//! singleflight refresh, pluggable form/JSON token-endpoint strategies,
//! and a persistence hook invoked after each successful refresh.

use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::RwLock;
use tokio::sync::Mutex;

use crate::channel::OAuthCredentials;
use crate::model::ResponseError;

/// A credential is treated as expired this long before its actual expiry,
/// so in-flight requests never ride a token that lapses mid-call.
fn expiry_skew() -> Duration {
    Duration::minutes(3)
}

pub fn is_expired(creds: &OAuthCredentials) -> bool {
    match creds.expires_at {
        Some(expires_at) => Utc::now() + expiry_skew() >= expires_at,
        None => false,
    }
}

/// How the token endpoint wants its requests encoded. Most providers take
/// form encoding; Anthropic's Claude Code flow wants JSON with `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStrategy {
    FormEncoded,
    Json,
}

#[derive(Debug, Clone)]
pub struct OAuthUrls {
    pub authorize: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct ExchangeParams {
    pub code: String,
    pub verifier: String,
    pub redirect_uri: String,
    pub state: Option<String>,
}

type RefreshedHook = Box<
    dyn Fn(&OAuthCredentials) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

pub struct TokenProvider {
    creds: RwLock<Option<OAuthCredentials>>,
    refresh_gate: Mutex<()>,
    strategy: ExchangeStrategy,
    urls: OAuthUrls,
    client_id: String,
    http: reqwest::Client,
    user_agent: String,
    on_refreshed: Option<RefreshedHook>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl TokenProvider {
    pub fn new(strategy: ExchangeStrategy, urls: OAuthUrls, client_id: impl Into<String>) -> Self {
        Self {
            creds: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            strategy,
            urls,
            client_id: client_id.into(),
            http: reqwest::Client::new(),
            user_agent: "axonhub/oauth".to_owned(),
            on_refreshed: None,
        }
    }

    pub fn with_credentials(self, creds: OAuthCredentials) -> Self {
        self.store(creds.clone());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Persistence hook: called after every successful refresh. A failing
    /// hook does not fail the refresh.
    pub fn with_refreshed_hook(mut self, hook: RefreshedHook) -> Self {
        self.on_refreshed = Some(hook);
        self
    }

    pub fn credentials(&self) -> Option<OAuthCredentials> {
        self.creds.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn store(&self, creds: OAuthCredentials) {
        *self.creds.write().unwrap_or_else(|e| e.into_inner()) = Some(creds);
    }

    async fn post_token(
        &self,
        fields: Vec<(&'static str, String)>,
    ) -> Result<TokenResponse, ResponseError> {
        let request = self
            .http
            .post(&self.urls.token)
            .header(http::header::USER_AGENT, &self.user_agent);
        let request = match self.strategy {
            ExchangeStrategy::FormEncoded => request.form(&fields),
            ExchangeStrategy::Json => {
                let body: serde_json::Map<String, serde_json::Value> = fields
                    .into_iter()
                    .map(|(key, value)| (key.to_owned(), serde_json::Value::String(value)))
                    .collect();
                request.json(&body)
            }
        };
        let response = request
            .send()
            .await
            .map_err(|err| ResponseError::auth_error(format!("token request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ResponseError::auth_error(format!("token request failed: {err}")))?;

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|_| {
            ResponseError::auth_error(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                body
            ))
        })?;
        if let Some(error) = parsed.error {
            return Err(ResponseError::auth_error(format!(
                "token exchange failed: {} - {}",
                error,
                parsed.error_description.unwrap_or_default()
            )));
        }
        Ok(parsed)
    }

    fn credentials_from_response(
        &self,
        parsed: TokenResponse,
        previous_refresh: Option<String>,
    ) -> Result<OAuthCredentials, ResponseError> {
        let access_token = parsed
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ResponseError::auth_error("token endpoint returned no access_token")
            })?;
        Ok(OAuthCredentials {
            access_token,
            // The server may omit the refresh token and expect reuse.
            refresh_token: parsed.refresh_token.or(previous_refresh),
            expires_at: parsed
                .expires_in
                .map(|seconds| Utc::now() + Duration::seconds(seconds)),
            client_id: Some(self.client_id.clone()),
            scopes: parsed
                .scope
                .map(|scope| scope.split(' ').map(str::to_owned).collect())
                .unwrap_or_default(),
            id_token: parsed.id_token,
        })
    }

    /// Authorization-code exchange. Caches the credentials on success.
    pub async fn exchange(&self, params: ExchangeParams) -> Result<OAuthCredentials, ResponseError> {
        let mut fields = vec![
            ("grant_type", "authorization_code".to_owned()),
            ("client_id", self.client_id.clone()),
            ("code", params.code),
            ("redirect_uri", params.redirect_uri),
            ("code_verifier", params.verifier),
        ];
        if let Some(state) = params.state {
            fields.push(("state", state));
        }
        let parsed = self.post_token(fields).await?;
        if parsed.refresh_token.is_none() {
            return Err(ResponseError::auth_error(
                "token endpoint returned no refresh_token",
            ));
        }
        let creds = self.credentials_from_response(parsed, None)?;
        self.store(creds.clone());
        Ok(creds)
    }

    /// Cached credentials, refreshed under singleflight when expired. All
    /// concurrent callers observe either the still-valid credentials or
    /// the single fresh set.
    pub async fn get(&self) -> Result<OAuthCredentials, ResponseError> {
        if let Some(creds) = self.credentials()
            && !is_expired(&creds)
        {
            return Ok(creds);
        }

        let _gate = self.refresh_gate.lock().await;
        // A concurrent caller may have refreshed while we waited.
        if let Some(creds) = self.credentials()
            && !is_expired(&creds)
        {
            return Ok(creds);
        }
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<OAuthCredentials, ResponseError> {
        let current = self
            .credentials()
            .ok_or_else(|| ResponseError::auth_error("no credentials to refresh"))?;
        let refresh_token = current
            .refresh_token
            .clone()
            .ok_or_else(|| ResponseError::auth_error("credentials carry no refresh_token"))?;

        let parsed = self
            .post_token(vec![
                ("grant_type", "refresh_token".to_owned()),
                ("client_id", self.client_id.clone()),
                ("refresh_token", refresh_token),
            ])
            .await?;
        let creds = self.credentials_from_response(parsed, current.refresh_token)?;
        self.store(creds.clone());

        if let Some(hook) = &self.on_refreshed
            && let Err(err) = hook(&creds)
        {
            tracing::warn!(error = %err, "credential persistence hook failed");
        }
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provider(server: &MockServer, strategy: ExchangeStrategy) -> TokenProvider {
        TokenProvider::new(
            strategy,
            OAuthUrls {
                authorize: server.url("/oauth/authorize"),
                token: server.url("/oauth/token"),
            },
            "client-123",
        )
    }

    fn expired_creds() -> OAuthCredentials {
        OAuthCredentials {
            access_token: "old_access".into(),
            refresh_token: Some("rt-1".into()),
            expires_at: Some(Utc::now() - Duration::minutes(10)),
            client_id: Some("client-123".into()),
            scopes: Vec::new(),
            id_token: None,
        }
    }

    #[test]
    fn test_expiry_skew() {
        let mut creds = expired_creds();
        assert!(is_expired(&creds));
        creds.expires_at = Some(Utc::now() + Duration::minutes(2));
        assert!(is_expired(&creds)); // inside the 3-minute skew
        creds.expires_at = Some(Utc::now() + Duration::minutes(10));
        assert!(!is_expired(&creds));
        creds.expires_at = None;
        assert!(!is_expired(&creds));
    }

    #[tokio::test]
    async fn test_exchange_form_encoded() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/oauth/token")
                    .header("content-type", "application/x-www-form-urlencoded");
                then.status(200).json_body(serde_json::json!({
                    "access_token": "at-1",
                    "refresh_token": "rt-1",
                    "expires_in": 3600,
                    "scope": "user:inference user:profile"
                }));
            })
            .await;

        let provider = provider(&server, ExchangeStrategy::FormEncoded);
        let creds = provider
            .exchange(ExchangeParams {
                code: "code-1".into(),
                verifier: "ver-1".into(),
                redirect_uri: "http://localhost/callback".into(),
                state: None,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(creds.access_token, "at-1");
        assert_eq!(creds.scopes, vec!["user:inference", "user:profile"]);
        assert!(creds.expires_at.is_some());
        assert_eq!(provider.credentials().unwrap().access_token, "at-1");
    }

    #[tokio::test]
    async fn test_exchange_error_envelope() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth/token");
                then.status(400).json_body(serde_json::json!({
                    "error": "invalid_grant",
                    "error_description": "code expired"
                }));
            })
            .await;

        let provider = provider(&server, ExchangeStrategy::Json);
        let err = provider
            .exchange(ExchangeParams {
                code: "bad".into(),
                verifier: "v".into(),
                redirect_uri: "http://localhost".into(),
                state: Some("st-1".into()),
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.detail.message,
            "token exchange failed: invalid_grant - code expired"
        );
    }

    #[tokio::test]
    async fn test_get_refresh_singleflight() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth/token");
                then.status(200)
                    .delay(std::time::Duration::from_millis(100))
                    .json_body(serde_json::json!({
                        "access_token": "new_access",
                        "expires_in": 3600
                    }));
            })
            .await;

        let hook_calls = Arc::new(AtomicUsize::new(0));
        let hook_counter = hook_calls.clone();
        let provider = Arc::new(
            provider(&server, ExchangeStrategy::FormEncoded)
                .with_credentials(expired_creds())
                .with_refreshed_hook(Box::new(move |_creds| {
                    hook_counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
        );

        let left = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get().await }
        });
        let right = tokio::spawn({
            let provider = provider.clone();
            async move { provider.get().await }
        });

        let left = left.await.unwrap().unwrap();
        let right = right.await.unwrap().unwrap();
        assert_eq!(left.access_token, "new_access");
        assert_eq!(right.access_token, "new_access");
        // The refresh token was reused since the server omitted a new one.
        assert_eq!(left.refresh_token.as_deref(), Some("rt-1"));
        mock.assert_hits_async(1).await;
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_valid_credentials_skip_refresh() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/oauth/token");
                then.status(200).json_body(serde_json::json!({}));
            })
            .await;

        let mut creds = expired_creds();
        creds.expires_at = Some(Utc::now() + Duration::hours(1));
        let provider = provider(&server, ExchangeStrategy::FormEncoded).with_credentials(creds);
        let got = provider.get().await.unwrap();
        assert_eq!(got.access_token, "old_access");
        mock.assert_hits_async(0).await;
    }
}
