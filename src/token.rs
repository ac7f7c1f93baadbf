//! Service access token cache with expiry-based refresh.
//!
//! Tokens are minted through the instance's `direct_access` endpoint and
//! cached per namespace. Failures are soft: callers get `None` and proceed
//! without the token.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Refresh this long before the reported expiry.
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Assumed lifetime when the response reports no usable expiry.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(5 * 60);

/// Floor for the computed lifetime so a token is never born expired.
const MIN_TOKEN_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Serialize)]
struct DirectAccessRequest<'a> {
    workflow_definition: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    root_namespace_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DirectAccessResponse {
    #[serde(default)]
    duo_workflow_service: Option<ServiceTokenBlock>,
    #[serde(default)]
    gitlab_rails: Option<RailsTokenBlock>,
}

#[derive(Debug, Deserialize)]
struct ServiceTokenBlock {
    #[serde(default)]
    token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    token_expires_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RailsTokenBlock {
    /// ISO-8601 timestamp.
    #[serde(default)]
    token_expires_at: Option<String>,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Namespace-keyed cache of short-lived service access tokens.
pub struct TokenService {
    http: reqwest::Client,
    endpoint: String,
    workflow_definition: String,
    refresh_margin: Duration,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenService {
    pub fn new(
        http: reqwest::Client,
        instance_url: &str,
        workflow_definition: impl Into<String>,
        refresh_margin: Option<Duration>,
    ) -> Self {
        let endpoint = format!(
            "{}/api/v4/ai/duo_workflows/direct_access",
            instance_url.trim_end_matches('/')
        );
        Self {
            http,
            endpoint,
            workflow_definition: workflow_definition.into(),
            refresh_margin: refresh_margin.unwrap_or(DEFAULT_REFRESH_MARGIN),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a valid token for the namespace, minting one if the cached
    /// token is missing or within the refresh margin of expiry. Soft-fails
    /// to `None`.
    pub async fn get(&self, namespace_id: Option<&str>) -> Option<String> {
        let key = namespace_id.unwrap_or("").to_string();

        {
            let cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.expires_at > Instant::now() {
                    return Some(cached.value.clone());
                }
            }
        }

        let response = match self.mint(namespace_id).await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "direct_access token request failed");
                return None;
            }
        };

        let service = response.duo_workflow_service.as_ref();
        let token = service.and_then(|block| block.token.clone())?;
        let ttl = token_ttl(
            service.and_then(|block| block.token_expires_at),
            response
                .gitlab_rails
                .as_ref()
                .and_then(|block| block.token_expires_at.as_deref()),
            chrono::Utc::now().timestamp_millis(),
            self.refresh_margin,
        );
        debug!(namespace = %key, ttl_secs = ttl.as_secs(), "minted service token");

        let mut cache = self.cache.lock().await;
        cache.insert(
            key,
            CachedToken {
                value: token.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Some(token)
    }

    async fn mint(&self, namespace_id: Option<&str>) -> crate::errors::Result<DirectAccessResponse> {
        let request = DirectAccessRequest {
            workflow_definition: &self.workflow_definition,
            root_namespace_id: namespace_id,
        };
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    #[cfg(test)]
    async fn seed(&self, namespace_id: Option<&str>, value: &str, ttl: Duration) {
        let mut cache = self.cache.lock().await;
        cache.insert(
            namespace_id.unwrap_or("").to_string(),
            CachedToken {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Computes the cache lifetime: the earlier of the two reported expiries
/// minus the refresh margin, floored at one second, or the default window
/// when neither expiry is usable.
fn token_ttl(
    workflow_expires_at_secs: Option<i64>,
    rails_expires_at: Option<&str>,
    now_ms: i64,
    margin: Duration,
) -> Duration {
    let workflow_ms = workflow_expires_at_secs.map(|secs| secs.saturating_mul(1000));
    let rails_ms = rails_expires_at
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.timestamp_millis());

    let expiry_ms = match (workflow_ms, rails_ms) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };

    match expiry_ms {
        Some(expiry) => {
            let remaining = expiry - now_ms - margin.as_millis() as i64;
            Duration::from_millis(remaining.max(MIN_TOKEN_TTL.as_millis() as i64) as u64)
        }
        None => DEFAULT_TOKEN_TTL,
    }
}
