//! Discovery document validation policy
//!
//! Decides which transports are acceptable and how the issuer and endpoint
//! URLs in a document are compared to the expected authority. The
//! comparison itself is a pluggable [`AuthorityValidationStrategy`].

use std::collections::HashSet;
use std::sync::Arc;

use url::Url;

use crate::error::{Result, SecurityError};

/// How issuer names and endpoint URLs are matched against an authority.
pub trait AuthorityValidationStrategy: Send + Sync {
    /// Check that `issuer` names `expected_authority`.
    fn validate_issuer(&self, issuer: &str, expected_authority: &str) -> Result<()>;

    /// Check that `endpoint` lives under one of `allowed_authorities`.
    fn validate_endpoint(&self, endpoint: &str, allowed_authorities: &[String]) -> Result<()>;
}

/// Ordinal string comparison after trailing-slash removal. An endpoint
/// matches when the authority is a prefix ending at a path, query or
/// fragment boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringComparisonStrategy;

impl AuthorityValidationStrategy for StringComparisonStrategy {
    fn validate_issuer(&self, issuer: &str, expected_authority: &str) -> Result<()> {
        if issuer.trim().is_empty() {
            return Err(SecurityError::IssuerMismatch("issuer name is missing".into()).into());
        }
        if trim_slash(issuer) == trim_slash(expected_authority) {
            return Ok(());
        }
        Err(SecurityError::IssuerMismatch(format!(
            "issuer name does not match authority: {issuer}"
        ))
        .into())
    }

    fn validate_endpoint(&self, endpoint: &str, allowed_authorities: &[String]) -> Result<()> {
        if endpoint.is_empty() {
            return Err(SecurityError::EndpointMismatch("endpoint is empty".into()).into());
        }
        if allowed_authorities
            .iter()
            .any(|authority| is_sub_path(endpoint, trim_slash(authority)))
        {
            return Ok(());
        }
        Err(SecurityError::EndpointMismatch(endpoint.to_string()).into())
    }
}

/// Parsed URL comparison: the issuer must equal the authority as a URL, and
/// an endpoint must share the authority's origin and sit at or below its
/// path.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrlEqualityStrategy;

impl AuthorityValidationStrategy for UrlEqualityStrategy {
    fn validate_issuer(&self, issuer: &str, expected_authority: &str) -> Result<()> {
        let expected = Url::parse(trim_slash(expected_authority)).map_err(|_| {
            SecurityError::IssuerMismatch(format!("authority is not a URL: {expected_authority}"))
        })?;
        if issuer.trim().is_empty() {
            return Err(SecurityError::IssuerMismatch("issuer name is missing".into()).into());
        }
        let issuer_url = Url::parse(trim_slash(issuer)).map_err(|_| {
            SecurityError::IssuerMismatch(format!("issuer name is not a valid URL: {issuer}"))
        })?;
        if issuer_url == expected {
            return Ok(());
        }
        Err(SecurityError::IssuerMismatch(format!(
            "issuer name does not match authority: {issuer}"
        ))
        .into())
    }

    fn validate_endpoint(&self, endpoint: &str, allowed_authorities: &[String]) -> Result<()> {
        let endpoint_url = Url::parse(trim_slash(endpoint)).map_err(|_| {
            SecurityError::EndpointMismatch(format!("endpoint is not a valid URL: {endpoint}"))
        })?;
        let under = |authority: &String| {
            Url::parse(trim_slash(authority)).is_ok_and(|authority| {
                authority.origin() == endpoint_url.origin()
                    && path_is_under(endpoint_url.path(), authority.path())
            })
        };
        if allowed_authorities.iter().any(under) {
            return Ok(());
        }
        Err(SecurityError::EndpointMismatch(endpoint.to_string()).into())
    }
}

fn is_sub_path(endpoint: &str, authority: &str) -> bool {
    endpoint.strip_prefix(authority).is_some_and(|rest| {
        rest.is_empty() || rest.starts_with(['/', '?', '#'])
    })
}

/// Transport and authority rules applied to every downloaded document.
#[derive(Clone)]
pub struct DiscoveryPolicy {
    /// Expected authority; when unset the endpoint's own authority is used
    pub authority: Option<String>,
    pub strategy: Arc<dyn AuthorityValidationStrategy>,
    pub require_https: bool,
    pub allow_http_on_loopback: bool,
    pub loopback_addresses: HashSet<String>,
    pub validate_issuer_name: bool,
    pub validate_endpoints: bool,
    /// Document keys (e.g. `userinfo_endpoint`) exempt from endpoint checks
    pub endpoint_validation_exclude_list: HashSet<String>,
    /// Extra base URLs endpoints may live under
    pub additional_endpoint_base_addresses: Vec<String>,
    pub require_key_set: bool,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            authority: None,
            strategy: Arc::new(StringComparisonStrategy),
            require_https: true,
            allow_http_on_loopback: true,
            loopback_addresses: ["localhost", "127.0.0.1", "[::1]"]
                .into_iter()
                .map(String::from)
                .collect(),
            validate_issuer_name: true,
            validate_endpoints: true,
            endpoint_validation_exclude_list: HashSet::new(),
            additional_endpoint_base_addresses: Vec::new(),
            require_key_set: true,
        }
    }
}

impl DiscoveryPolicy {
    /// Whether `url` satisfies the transport rules.
    pub fn is_secure(&self, url: &Url) -> bool {
        if !self.require_https || url.scheme() == "https" {
            return true;
        }
        url.scheme() == "http"
            && self.allow_http_on_loopback
            && url
                .host_str()
                .is_some_and(|host| self.loopback_addresses.contains(&host.to_ascii_lowercase()))
    }

    /// Fail with `HttpsRequired` when `url` breaks the transport rules.
    pub fn require_secure(&self, url: &str) -> Result<()> {
        let secure = Url::parse(url).is_ok_and(|parsed| self.is_secure(&parsed));
        if secure {
            Ok(())
        } else {
            Err(SecurityError::HttpsRequired(url.to_string()).into())
        }
    }
}

impl std::fmt::Debug for DiscoveryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryPolicy")
            .field("authority", &self.authority)
            .field("require_https", &self.require_https)
            .field("allow_http_on_loopback", &self.allow_http_on_loopback)
            .field("validate_issuer_name", &self.validate_issuer_name)
            .field("validate_endpoints", &self.validate_endpoints)
            .field("require_key_set", &self.require_key_set)
            .finish_non_exhaustive()
    }
}

fn trim_slash(value: &str) -> &str {
    value.strip_suffix('/').unwrap_or(value)
}

fn path_is_under(path: &str, base: &str) -> bool {
    let base = trim_slash(base);
    base.is_empty()
        || path == base
        || path
            .strip_prefix(base)
            .is_some_and(|rest| rest.starts_with('/'))
}
