//! OIDC metadata document

use serde::{Deserialize, Serialize};

use super::endpoint::DiscoveryEndpoint;
use super::policy::DiscoveryPolicy;
use crate::error::{Error, Result};

/// Issuer metadata served at `/.well-known/openid-configuration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userinfo_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub subject_types_supported: Vec<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
    #[serde(default)]
    pub grant_types_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// When this copy was downloaded, unix milliseconds. Not part of the
    /// served document.
    #[serde(default)]
    pub last_updated: u64,
}

impl DiscoveryDocument {
    /// Endpoint URLs in the document, keyed by their JSON name.
    pub fn endpoints(&self) -> Vec<(&'static str, &str)> {
        let mut endpoints = vec![
            ("authorization_endpoint", self.authorization_endpoint.as_str()),
            ("token_endpoint", self.token_endpoint.as_str()),
        ];
        if let Some(userinfo) = &self.userinfo_endpoint {
            endpoints.push(("userinfo_endpoint", userinfo));
        }
        if let Some(jwks) = &self.jwks_uri {
            endpoints.push(("jwks_uri", jwks));
        }
        endpoints
    }

    /// Apply `policy` to a document downloaded from `endpoint`.
    pub fn validate(&self, endpoint: &DiscoveryEndpoint, policy: &DiscoveryPolicy) -> Result<()> {
        let authority = policy.authority.as_deref().unwrap_or(&endpoint.authority);

        if policy.validate_issuer_name {
            policy.strategy.validate_issuer(&self.issuer, authority)?;
        }

        if policy.require_key_set && self.jwks_uri.as_deref().is_none_or(str::is_empty) {
            return Err(Error::InvalidResponse(
                "discovery document has no jwks_uri".into(),
            ));
        }

        if policy.validate_endpoints {
            let mut allowed = vec![authority.to_string()];
            allowed.extend(policy.additional_endpoint_base_addresses.iter().cloned());

            for (name, url) in self.endpoints() {
                if policy.endpoint_validation_exclude_list.contains(name) {
                    continue;
                }
                policy.require_secure(url)?;
                policy.strategy.validate_endpoint(url, &allowed)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_document(issuer: &str) -> DiscoveryDocument {
    DiscoveryDocument {
        issuer: issuer.to_string(),
        authorization_endpoint: format!("{issuer}/authorize"),
        token_endpoint: format!("{issuer}/token"),
        userinfo_endpoint: Some(format!("{issuer}/userinfo")),
        jwks_uri: Some(format!("{issuer}/jwks")),
        response_types_supported: vec!["code".into()],
        subject_types_supported: vec!["public".into()],
        scopes_supported: vec!["openid".into(), "profile".into()],
        grant_types_supported: vec!["authorization_code".into(), "refresh_token".into()],
        id_token_signing_alg_values_supported: vec!["HS256".into(), "RS256".into()],
        last_updated: 0,
    }
}
