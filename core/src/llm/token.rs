//! IAM access-token holder
//!
//! Tokens are fetched from the IAM endpoint and refreshed five minutes
//! before expiry. The holder is the only piece of mutable global state
//! besides the response cache, and both sit behind narrow interfaces.

use crate::error::{CopilotError, CopilotResult};
use crate::llm::transport::LlmTransport;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Refresh window before expiry.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

struct AccessToken {
    value: String,
    expires_at: Instant,
}

/// Cached IAM token with early refresh.
pub struct TokenHolder {
    iam_url: String,
    key_id: String,
    key_secret: String,
    token: RwLock<Option<AccessToken>>,
}

impl TokenHolder {
    pub fn new(iam_url: String, key_id: String, key_secret: String) -> Self {
        Self {
            iam_url,
            key_id,
            key_secret,
            token: RwLock::new(None),
        }
    }

    /// Current token, refreshed when it expires within the margin.
    pub async fn access_token(&self, transport: &dyn LlmTransport) -> CopilotResult<String> {
        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at.saturating_duration_since(Instant::now()) > REFRESH_MARGIN {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut guard = self.token.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if token.expires_at.saturating_duration_since(Instant::now()) > REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        debug!("Refreshing IAM access token");
        let body = json!({
            "keyId": self.key_id,
            "secret": self.key_secret,
        });

        let response = transport
            .post_json(&self.iam_url, &[], &body)
            .await
            .map_err(|e| {
                warn!("IAM token request failed: {e}");
                if e.is_transient() {
                    CopilotError::Transient(format!("IAM token request failed: {e}"))
                } else {
                    CopilotError::Permanent(format!("IAM token request rejected: {e}"))
                }
            })?;

        let parsed: serde_json::Value = serde_json::from_str(&response)
            .map_err(|e| CopilotError::Permanent(format!("IAM response was not JSON: {e}")))?;

        let value = parsed["access_token"]
            .as_str()
            .ok_or_else(|| CopilotError::Permanent("IAM response missing access_token".into()))?
            .to_string();
        let expires_in = parsed["expires_in"].as_u64().unwrap_or(3600);

        *guard = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });

        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::transport::FakeTransport;

    #[tokio::test]
    async fn test_token_fetched_once_while_fresh() {
        let transport = FakeTransport::new();
        transport.push_ok(r#"{"access_token": "tok-1", "expires_in": 3600}"#);

        let holder = TokenHolder::new("http://iam".into(), "id".into(), "secret".into());
        let first = holder.access_token(&transport).await.unwrap();
        let second = holder.access_token(&transport).await.unwrap();

        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-1");
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_token_refreshed_inside_margin() {
        let transport = FakeTransport::new();
        // expires_in below the 300s margin forces an immediate refresh
        transport.push_ok(r#"{"access_token": "tok-1", "expires_in": 10}"#);
        transport.push_ok(r#"{"access_token": "tok-2", "expires_in": 3600}"#);

        let holder = TokenHolder::new("http://iam".into(), "id".into(), "secret".into());
        let first = holder.access_token(&transport).await.unwrap();
        let second = holder.access_token(&transport).await.unwrap();

        assert_eq!(first, "tok-1");
        assert_eq!(second, "tok-2");
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_token_field_is_permanent() {
        let transport = FakeTransport::new();
        transport.push_ok(r#"{"unexpected": true}"#);

        let holder = TokenHolder::new("http://iam".into(), "id".into(), "secret".into());
        let err = holder.access_token(&transport).await.unwrap_err();
        assert!(matches!(err, CopilotError::Permanent(_)));
    }
}
