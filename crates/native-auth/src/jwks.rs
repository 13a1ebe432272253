//! JSON Web Key Set download

use jsonwebtoken::jwk::{Jwk, JwkSet};
use tracing::debug;

use crate::error::{Error, Result, SecurityError};
use crate::token::describe_error_body;

/// Fetch the key set published at `jwks_uri`.
pub async fn fetch_key_set(client: &reqwest::Client, jwks_uri: &str) -> Result<JwkSet> {
    debug!(jwks_uri, "downloading key set");
    let response = client
        .get(jwks_uri)
        .header(
            reqwest::header::ACCEPT,
            "application/jwk-set+json, application/json",
        )
        .send()
        .await
        .map_err(|e| Error::Network(format!("key set request failed: {e}")))?;

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
        .json::<JwkSet>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid key set: {e}")))
}

/// Pick the signing key for a token.
///
/// With a `kid` the key must match it. Without one, a set holding a single
/// key is unambiguous.
pub fn select_key<'a>(set: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk> {
    match kid {
        Some(kid) => set
            .find(kid)
            .ok_or_else(|| SecurityError::KeyNotFound(kid.to_string()).into()),
        None if set.keys.len() == 1 => Ok(&set.keys[0]),
        None => Err(SecurityError::KeyNotFound("<none>".into()).into()),
    }
}
