//! services/worker/src/llm/token.rs
//!
//! Provider credential ownership. The token provider is constructed once at
//! startup and shared by `Arc` with the LLM client; fetched tokens are
//! cached behind a TTL shorter than their real lifetime and refreshed
//! lazily on expiry.

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const AAD_SCOPE: &str = "https://cognitiveservices.azure.com/.default";

enum TokenSource {
    /// A static API key; returned as-is, never expires.
    Static(String),
    /// Azure AD client-credential flow.
    AzureAd {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },
}

struct CachedToken {
    value: String,
    fetched_at: Instant,
}

pub struct TokenProvider {
    source: TokenSource,
    ttl: Duration,
    cached: Mutex<Option<CachedToken>>,
    http: reqwest::Client,
}

impl TokenProvider {
    pub fn static_key(key: impl Into<String>) -> Self {
        Self {
            source: TokenSource::Static(key.into()),
            ttl: Duration::from_secs(u64::MAX / 2),
            cached: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    pub fn azure_ad(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            source: TokenSource::AzureAd {
                tenant_id: tenant_id.into(),
                client_id: client_id.into(),
                client_secret: client_secret.into(),
            },
            ttl,
            cached: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    /// Returns a bearer token, fetching a fresh one when the cached token
    /// has passed its TTL.
    pub async fn bearer(&self) -> Result<String, String> {
        if let TokenSource::Static(key) = &self.source {
            return Ok(key.clone());
        }

        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.fetched_at.elapsed() < self.ttl {
                return Ok(token.value.clone());
            }
        }

        let value = self.fetch().await?;
        debug!("Refreshed provider auth token");
        *cached = Some(CachedToken { value: value.clone(), fetched_at: Instant::now() });
        Ok(value)
    }

    async fn fetch(&self) -> Result<String, String> {
        let TokenSource::AzureAd { tenant_id, client_id, client_secret } = &self.source else {
            unreachable!("static keys never fetch");
        };

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            tenant_id
        );
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("scope", AAD_SCOPE),
        ];

        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| format!("token request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(format!("token endpoint returned {}", response.status()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("token response was not JSON: {}", e))?;

        body.get("access_token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| "token response missing access_token".to_string())
    }
}
