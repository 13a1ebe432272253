//! Discovery endpoint resolution
//!
//! Turns either an issuer/well-known URL or a signed identity token into the
//! authority and the `/.well-known/openid-configuration` URL to download.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use url::Url;

use crate::error::{Error, Result, SecurityError};

/// Path suffix of the OIDC metadata document.
pub const WELL_KNOWN_SUFFIX: &str = ".well-known/openid-configuration";

/// Authority plus the well-known URL its metadata lives at.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveryEndpoint {
    pub authority: String,
    pub url: String,
}

impl DiscoveryEndpoint {
    /// Resolve from a URL or, failing that, from the issuer claim of a token.
    pub fn resolve(input: &str) -> Result<Self> {
        let input = input.trim();
        if Url::parse(input).is_ok() {
            return Self::parse_url(input);
        }
        let issuer = unverified_issuer(input)?;
        Self::parse_url(&issuer)
    }

    /// Normalize an issuer or well-known URL.
    ///
    /// A trailing slash is dropped. A URL already ending in the well-known
    /// suffix yields the authority by trimming exactly that suffix; anything
    /// else gets the suffix appended.
    pub fn parse_url(input: &str) -> Result<Self> {
        let url = Url::parse(input)
            .map_err(|e| Error::MalformedUrl(format!("{input}: {e}")))?;
        if !is_supported_scheme(&url) {
            return Err(Error::MalformedUrl(format!(
                "{input}: discovery requires an http(s) URL"
            )));
        }

        let trimmed = input.strip_suffix('/').unwrap_or(input);
        if let Some(authority) = trimmed.strip_suffix(WELL_KNOWN_SUFFIX) {
            let authority = authority.strip_suffix('/').unwrap_or(authority);
            return Ok(Self {
                authority: authority.to_string(),
                url: trimmed.to_string(),
            });
        }

        Ok(Self {
            authority: trimmed.to_string(),
            url: format!("{trimmed}/{WELL_KNOWN_SUFFIX}"),
        })
    }
}

fn is_supported_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// Read the `iss` claim of a JWT without verifying it.
///
/// Only used to locate the issuer's metadata; the signature is checked
/// against keys from that metadata afterwards.
pub fn unverified_issuer(token: &str) -> Result<String> {
    let claims = unverified_claims(token)?;
    claims
        .get("iss")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Security(SecurityError::MissingClaim("iss".into())))
}

/// Decode the payload segment of a JWT into a JSON object.
fn unverified_claims(token: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return Err(Error::MalformedUrl(
            "input is neither an absolute URL nor a JWT".into(),
        ));
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| SecurityError::MalformedToken(format!("payload is not base64url: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| SecurityError::MalformedToken(format!("payload is not a JSON object: {e}")).into())
}
