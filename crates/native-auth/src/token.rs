//! Token endpoint interactions
//!
//! Two grants, both `POST`ed as `application/x-www-form-urlencoded`:
//! 1. `authorization_code` completes an interactive attempt
//! 2. `refresh_token` renews an expired access token silently
//!
//! Responses are turned into an [`AuthResult`] with
//! [`TokenResponse::into_auth_result`].

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::now_millis;
use crate::result::{AuthResult, TokenInfo, TokenRole};

/// Seconds shaved off `expires_in` so a token is treated as expired slightly
/// before the server does.
pub const EXPIRY_SAFETY_MARGIN_SECS: u64 = 4;

/// `expires_in` arrives as a number from most servers and as a string from
/// some.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiresIn {
    Seconds(u64),
    Text(String),
}

impl ExpiresIn {
    pub fn seconds(&self) -> Option<u64> {
        match self {
            ExpiresIn::Seconds(s) => Some(*s),
            ExpiresIn::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Response from the token endpoint for both grants.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: Option<ExpiresIn>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl TokenResponse {
    /// Build an [`AuthResult`] from this response.
    ///
    /// The access token is mandatory. When the response has no refresh token
    /// `previous_refresh` is carried forward.
    pub fn into_auth_result(self, previous_refresh: Option<&str>) -> Result<AuthResult> {
        let access = self.access_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            Error::InvalidResponse("token response has no access_token".into())
        })?;

        let expires = self
            .expires_in
            .as_ref()
            .and_then(ExpiresIn::seconds)
            .map(|secs| now_millis() + secs.saturating_sub(EXPIRY_SAFETY_MARGIN_SECS) * 1000);

        let mut tokens = vec![TokenInfo::new(access, TokenRole::Access, expires)];
        if let Some(refresh) = self
            .refresh_token
            .filter(|t| !t.is_empty())
            .or_else(|| previous_refresh.map(str::to_string))
        {
            tokens.push(TokenInfo::new(refresh, TokenRole::Refresh, None));
        }
        if let Some(id_token) = self.id_token.filter(|t| !t.is_empty()) {
            tokens.push(TokenInfo::new(id_token, TokenRole::Identity, None));
        }
        Ok(AuthResult::new(tokens))
    }
}

/// Standard OAuth error body.
#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
    error_description: Option<String>,
}

/// Exchange an authorization code for tokens.
///
/// `verifier` is the PKCE code verifier of the attempt, when PKCE is on.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &AuthConfig,
    code: &str,
    verifier: Option<&str>,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("client_id", config.client_id()),
        ("redirect_uri", config.redirect_uri().as_str()),
    ];
    if let Some(verifier) = verifier {
        form.push(("code_verifier", verifier));
    }
    post_token_request(client, config, "authorization_code", &form).await
}

/// Renew tokens with a refresh token.
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &AuthConfig,
    refresh: &str,
) -> Result<TokenResponse> {
    let form = [
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
        ("client_id", config.client_id()),
    ];
    post_token_request(client, config, "refresh_token", &form).await
}

async fn post_token_request(
    client: &reqwest::Client,
    config: &AuthConfig,
    grant_type: &'static str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    debug!(endpoint = %config.token_endpoint(), grant_type, "requesting tokens");

    let outcome = send(client, config, form).await;
    metrics::record_token_request(grant_type, outcome.is_ok());
    outcome
}

async fn send(
    client: &reqwest::Client,
    config: &AuthConfig,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let response = client
        .post(config.token_endpoint().clone())
        .header(reqwest::header::ACCEPT, "application/json")
        .form(form)
        .send()
        .await
        .map_err(|e| Error::Network(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Protocol {
            status: status.as_u16(),
            message: describe_error_body(&body),
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid token response: {e}")))
}

/// Prefer `error: error_description` from an OAuth error body, else the raw
/// body.
pub(crate) fn describe_error_body(body: &str) -> String {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(OAuthErrorBody {
            error,
            error_description: Some(description),
        }) => format!("{error}: {description}"),
        Ok(OAuthErrorBody { error, .. }) => error,
        Err(_) => body.to_string(),
    }
}
