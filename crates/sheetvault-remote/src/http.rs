use reqwest::{Client, RequestBuilder, Response, StatusCode};
use sheetvault_core::VaultError;
use tracing::debug;

use crate::token_manager::TokenManager;

/// Longest error body excerpt carried into an error message.
const BODY_EXCERPT: usize = 512;

pub(crate) fn transport_error(context: &str, err: reqwest::Error) -> VaultError {
    if err.is_decode() {
        VaultError::Serialization(format!("{}: {}", context, err))
    } else if err.is_builder() {
        VaultError::Internal(format!("{}: {}", context, err))
    } else {
        VaultError::UpstreamUnavailable(format!("{}: {}", context, err))
    }
}

/// Send a bearer-authenticated request. A 401 invalidates the cached token
/// and the request is rebuilt and sent once more with a fresh one.
pub(crate) async fn send_authorized(
    http: &Client,
    tokens: &TokenManager,
    context: &str,
    build_request: impl Fn(&Client) -> RequestBuilder,
) -> Result<Response, VaultError> {
    let token = tokens.get_valid_token().await?;
    let resp = build_request(http)
        .bearer_auth(&token)
        .send()
        .await
        .map_err(|e| transport_error(context, e))?;

    if resp.status() != StatusCode::UNAUTHORIZED {
        return Ok(resp);
    }

    debug!(context, "Access token rejected, refreshing once");
    tokens.invalidate().await;
    let token = tokens.get_valid_token().await?;
    build_request(http)
        .bearer_auth(&token)
        .send()
        .await
        .map_err(|e| transport_error(context, e))
}

/// Pass successful responses through; map the rest onto `VaultError`.
pub(crate) async fn ensure_success(resp: Response, context: &str) -> Result<Response, VaultError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let excerpt: String = body.chars().take(BODY_EXCERPT).collect();
    Err(VaultError::from_http_status(
        status.as_u16(),
        format!("{} failed with {}: {}", context, status, excerpt),
    ))
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    resp: Response,
    context: &str,
) -> Result<T, VaultError> {
    resp.json().await.map_err(|e| transport_error(context, e))
}
