use serde::Deserialize;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::errors::ServiceError;

/// Refresh metadata tokens this long before they expire
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Clone)]
pub struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Supplies bearer tokens for BigQuery calls
pub enum TokenProvider {
    /// No Authorization header
    Anonymous,
    /// A fixed token from configuration
    Static(String),
    /// Short-lived tokens from the instance metadata server
    Metadata {
        url: String,
        cached: RwLock<Option<CachedToken>>,
    },
}

impl TokenProvider {
    pub fn metadata(url: impl Into<String>) -> Self {
        TokenProvider::Metadata {
            url: url.into(),
            cached: RwLock::new(None),
        }
    }

    /// Current bearer token, or `None` when requests go out unauthenticated
    pub async fn bearer(&self, http: &reqwest::Client) -> Result<Option<String>, ServiceError> {
        match self {
            TokenProvider::Anonymous => Ok(None),
            TokenProvider::Static(token) => Ok(Some(token.clone())),
            TokenProvider::Metadata { url, cached } => {
                if let Some(value) = live_token(&*cached.read().await) {
                    return Ok(Some(value));
                }

                // Refresh under the write lock so concurrent callers wait for one fetch
                let mut slot = cached.write().await;
                if let Some(value) = live_token(&slot) {
                    return Ok(Some(value));
                }

                let fresh = fetch_metadata_token(http, url).await?;
                let value = fresh.value.clone();
                *slot = Some(fresh);
                Ok(Some(value))
            }
        }
    }
}

fn live_token(slot: &Option<CachedToken>) -> Option<String> {
    slot.as_ref()
        .filter(|token| token.expires_at > Instant::now())
        .map(|token| token.value.clone())
}

impl fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenProvider::Anonymous => f.write_str("Anonymous"),
            TokenProvider::Static(_) => f.write_str("Static(<redacted>)"),
            TokenProvider::Metadata { url, .. } => {
                f.debug_struct("Metadata").field("url", url).finish()
            }
        }
    }
}

#[instrument(skip(http))]
async fn fetch_metadata_token(
    http: &reqwest::Client,
    url: &str,
) -> Result<CachedToken, ServiceError> {
    let response = http
        .get(url)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| ServiceError::UpstreamError(format!("metadata server unreachable: {}", e)))?;

    if !response.status().is_success() {
        return Err(ServiceError::UpstreamError(format!(
            "metadata server returned {}",
            response.status()
        )));
    }

    let token: MetadataToken = response
        .json()
        .await
        .map_err(|e| ServiceError::UpstreamError(format!("invalid metadata token: {}", e)))?;

    debug!(expires_in = token.expires_in, "fetched access token");

    let lifetime = Duration::from_secs(token.expires_in).saturating_sub(EXPIRY_MARGIN);
    Ok(CachedToken {
        value: token.access_token,
        expires_at: Instant::now() + lifetime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn static_and_anonymous_tokens() {
        let http = reqwest::Client::new();
        assert_eq!(TokenProvider::Anonymous.bearer(&http).await.unwrap(), None);
        assert_eq!(
            TokenProvider::Static("abc".into())
                .bearer(&http)
                .await
                .unwrap()
                .as_deref(),
            Some("abc")
        );
    }

    #[tokio::test]
    async fn metadata_token_is_cached_until_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "ya29.first",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let provider = TokenProvider::metadata(format!("{}/token", server.uri()));

        for _ in 0..3 {
            assert_eq!(
                provider.bearer(&http).await.unwrap().as_deref(),
                Some("ya29.first")
            );
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access_token": "ya29.shared", "expires_in": 3599}))
                    .set_delay(Duration::from_millis(50)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        let provider = TokenProvider::metadata(format!("{}/token", server.uri()));

        let (a, b, c) = tokio::join!(
            provider.bearer(&http),
            provider.bearer(&http),
            provider.bearer(&http)
        );
        for token in [a, b, c] {
            assert_eq!(token.unwrap().as_deref(), Some("ya29.shared"));
        }
    }

    #[tokio::test]
    async fn metadata_failure_is_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let provider = TokenProvider::metadata(format!("{}/token", server.uri()));
        let err = provider.bearer(&reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamError(_)));
    }
}
