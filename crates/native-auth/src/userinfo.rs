//! OIDC userinfo endpoint

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::token::describe_error_body;

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct UserInfo {
    claims: Map<String, Value>,
}

impl UserInfo {
    pub fn new(claims: Map<String, Value>) -> Self {
        Self { claims }
    }

    /// Claim value by name, ignoring ASCII case.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.claims.get(name).or_else(|| {
            self.claims
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .map(|(_, value)| value)
        })
    }

    /// Claim as a string, when it is one.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Names of the claims present.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.claims.keys().map(String::as_str)
    }

    pub fn claims(&self) -> &Map<String, Value> {
        &self.claims
    }
}

/// GET the userinfo endpoint with `access_token` as bearer credential.
pub async fn fetch_user_info(
    client: &reqwest::Client,
    endpoint: &str,
    access_token: &str,
) -> Result<UserInfo> {
    debug!(endpoint, "requesting user information");
    let response = client
        .get(endpoint)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Error::Network(format!("userinfo request failed: {e}")))?;

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

    let claims = response
        .json::<Map<String, Value>>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid userinfo response: {e}")))?;
    Ok(UserInfo::new(claims))
}
