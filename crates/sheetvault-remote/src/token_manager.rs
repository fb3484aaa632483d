//! OAuth2 access tokens with in-memory caching and proactive refresh.
//!
//! One manager per remote client. Tokens are refreshed five minutes before
//! they expire; concurrent refreshes are harmless (last write wins).

use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use sheetvault_core::VaultError;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::http::transport_error;

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// How an access token is obtained.
#[derive(Debug, Clone)]
pub enum TokenGrant {
    /// `grant_type=refresh_token` (Google Drive, user-delegated)
    RefreshToken {
        token_url: String,
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    /// `grant_type=client_credentials` (Microsoft Graph, app-only)
    ClientCredentials {
        token_url: String,
        client_id: String,
        client_secret: String,
        scope: String,
    },
}

impl TokenGrant {
    pub fn google(client_id: &str, client_secret: &str, refresh_token: &str) -> Self {
        TokenGrant::RefreshToken {
            token_url: GOOGLE_TOKEN_URL.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            refresh_token: refresh_token.to_string(),
        }
    }

    pub fn microsoft(tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        TokenGrant::ClientCredentials {
            token_url: format!(
                "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
                tenant_id
            ),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: GRAPH_SCOPE.to_string(),
        }
    }

    /// Same grant against a different token endpoint.
    pub fn with_token_url(mut self, url: &str) -> Self {
        match &mut self {
            TokenGrant::RefreshToken { token_url, .. }
            | TokenGrant::ClientCredentials { token_url, .. } => *token_url = url.to_string(),
        }
        self
    }

    fn token_url(&self) -> &str {
        match self {
            TokenGrant::RefreshToken { token_url, .. }
            | TokenGrant::ClientCredentials { token_url, .. } => token_url,
        }
    }
}

/// Cached token with expiration.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() >= exp - Duration::minutes(5),
            None => true, // No expiration info → always refresh to be safe
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

pub struct TokenManager {
    http: Client,
    grant: TokenGrant,
    cache: RwLock<Option<CachedToken>>,
    /// Refresh token rotated by the provider, if any
    rotated_refresh_token: RwLock<Option<String>>,
}

impl TokenManager {
    pub fn new(http: Client, grant: TokenGrant) -> Self {
        Self {
            http,
            grant,
            cache: RwLock::new(None),
            rotated_refresh_token: RwLock::new(None),
        }
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_valid_token(&self) -> Result<String, VaultError> {
        if let Some(cached) = self.cache.read().await.as_ref() {
            if !cached.is_expired() {
                debug!("Token cache hit");
                return Ok(cached.access_token.clone());
            }
            debug!("Token expiring soon, refreshing");
        }
        self.refresh().await
    }

    /// Drop the cached token so the next call refreshes (after a 401).
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    async fn refresh(&self) -> Result<String, VaultError> {
        let rotated = self.rotated_refresh_token.read().await.clone();
        let form: Vec<(&str, &str)> = match &self.grant {
            TokenGrant::RefreshToken {
                client_id,
                client_secret,
                refresh_token,
                ..
            } => vec![
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                (
                    "refresh_token",
                    rotated.as_deref().unwrap_or(refresh_token.as_str()),
                ),
                ("grant_type", "refresh_token"),
            ],
            TokenGrant::ClientCredentials {
                client_id,
                client_secret,
                scope,
                ..
            } => vec![
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", scope.as_str()),
                ("grant_type", "client_credentials"),
            ],
        };

        let resp = self
            .http
            .post(self.grant.token_url())
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error("OAuth token request", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let context = format!("OAuth token refresh failed: {} {}", status, body);
            // A rejected grant will not fix itself on retry.
            return Err(if status.is_client_error() && status.as_u16() != 429 {
                VaultError::PermissionDenied(context)
            } else {
                VaultError::from_http_status(status.as_u16(), context)
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| transport_error("OAuth token response", e))?;

        let expires_at = token
            .expires_in
            .map(|secs| Utc::now() + Duration::seconds(secs));

        if let Some(new_refresh) = token.refresh_token {
            *self.rotated_refresh_token.write().await = Some(new_refresh);
        }

        *self.cache.write().await = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at,
        });

        info!(
            token_url = self.grant.token_url(),
            expires_at = ?expires_at,
            "Refreshed OAuth token"
        );
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn grant(server: &MockServer) -> TokenGrant {
        TokenGrant::google("cid", "secret", "refresh-1")
            .with_token_url(&format!("{}/token", server.uri()))
    }

    #[test]
    fn test_expiry_skew() {
        let fresh = CachedToken {
            access_token: "t".to_string(),
            expires_at: Some(Utc::now() + Duration::minutes(30)),
        };
        let nearly = CachedToken {
            access_token: "t".to_string(),
            expires_at: Some(Utc::now() + Duration::minutes(4)),
        };
        let unknown = CachedToken {
            access_token: "t".to_string(),
            expires_at: None,
        };
        assert!(!fresh.is_expired());
        assert!(nearly.is_expired());
        assert!(unknown.is_expired());
    }

    #[tokio::test]
    async fn test_refresh_token_grant_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let manager = TokenManager::new(Client::new(), grant(&server));
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-1");
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn test_short_lived_token_refreshes_every_time() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "short",
                "expires_in": 60
            })))
            .expect(2)
            .mount(&server)
            .await;

        let manager = TokenManager::new(Client::new(), grant(&server));
        manager.get_valid_token().await.unwrap();
        manager.get_valid_token().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh_and_uses_rotated_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=refresh-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-2",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "access-1",
                "expires_in": 3600,
                "refresh_token": "refresh-2"
            })))
            .mount(&server)
            .await;

        let manager = TokenManager::new(Client::new(), grant(&server));
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-1");
        manager.invalidate().await;
        assert_eq!(manager.get_valid_token().await.unwrap(), "access-2");
    }

    #[tokio::test]
    async fn test_client_credentials_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .and(body_string_contains("scope=https%3A%2F%2Fgraph.microsoft.com%2F.default"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "app-token",
                "expires_in": 3599
            })))
            .mount(&server)
            .await;

        let grant = TokenGrant::microsoft("tenant", "cid", "secret")
            .with_token_url(&format!("{}/token", server.uri()));
        let manager = TokenManager::new(Client::new(), grant);
        assert_eq!(manager.get_valid_token().await.unwrap(), "app-token");
    }

    #[tokio::test]
    async fn test_rejected_grant_is_permission_denied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let manager = TokenManager::new(Client::new(), grant(&server));
        assert!(matches!(
            manager.get_valid_token().await,
            Err(VaultError::PermissionDenied(_))
        ));
    }
}
