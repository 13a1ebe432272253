//! Identity token (JWT) validation
//!
//! Validation steps:
//! 1. Read the header and the issuer claim without verifying anything
//! 2. Resolve the issuer's discovery document (cached copy when fresh)
//! 3. Download the key set from the document's `jwks_uri`
//! 4. Verify the signature with the key matching `kid`
//! 5. Verify issuer, audience, expiry and not-before
//!
//! Every failed check maps to its own [`SecurityError`] variant. Signature
//! math is delegated to `jsonwebtoken`.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::BoxFuture;
use crate::cache::ExpiringCache;
use crate::discovery::{DiscoveryDocument, DiscoveryResolver, unverified_issuer};
use crate::error::{Error, Result, SecurityError};
use crate::jwks::{fetch_key_set, select_key};
use crate::now_millis;
use crate::result::TokenValidation;

/// Default clock skew tolerated on `exp` and `nbf`.
pub const DEFAULT_LEEWAY_SECS: u64 = 60;

/// What a token must satisfy beyond a valid signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationPolicy {
    /// Required `aud` entry, normally the client id
    pub audience: String,
    /// Issuer the token must name. Any issuer whose discovery document
    /// resolves is accepted when unset.
    pub expected_issuer: Option<String>,
    pub leeway_secs: u64,
}

impl ValidationPolicy {
    pub fn new(audience: impl Into<String>) -> Self {
        Self {
            audience: audience.into(),
            expected_issuer: None,
            leeway_secs: DEFAULT_LEEWAY_SECS,
        }
    }

    pub fn with_expected_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_issuer = Some(issuer.into());
        self
    }
}

/// Identity asserted by a validated token.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub subject: Option<String>,
    pub issuer: String,
    pub audience: Vec<String>,
    /// `exp` as unix seconds
    pub expires_at: Option<u64>,
    pub claims: Map<String, Value>,
}

impl Principal {
    fn from_claims(claims: Map<String, Value>) -> Self {
        let string = |name: &str| claims.get(name).and_then(Value::as_str).map(str::to_string);
        let audience = match claims.get("aud") {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(auds)) => auds
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Self {
            subject: string("sub"),
            issuer: string("iss").unwrap_or_default(),
            audience,
            expires_at: claims.get("exp").and_then(Value::as_u64),
            claims,
        }
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }
}

/// Validates identity tokens against keys published by their issuer.
pub struct IdTokenValidator {
    resolver: Arc<DiscoveryResolver>,
    key_sets: Option<ExpiringCache<JwkSet>>,
    key_set_ttl: Duration,
}

impl IdTokenValidator {
    /// Validator that fetches the key set on every call.
    pub fn new(resolver: Arc<DiscoveryResolver>) -> Self {
        Self {
            resolver,
            key_sets: None,
            key_set_ttl: Duration::ZERO,
        }
    }

    /// Cache key sets per `jwks_uri` for `ttl`. A `kid` missing from a cached
    /// set triggers one fresh download to pick up rotated keys.
    pub fn with_key_set_cache(mut self, ttl: Duration) -> Self {
        self.key_sets = Some(ExpiringCache::new());
        self.key_set_ttl = ttl;
        self
    }

    pub fn resolver(&self) -> &Arc<DiscoveryResolver> {
        &self.resolver
    }

    /// Validate `token` and return the principal it asserts.
    pub async fn validate(&self, token: &str, policy: &ValidationPolicy) -> Result<Principal> {
        let header = decode_header(token)
            .map_err(|e| SecurityError::MalformedToken(format!("unreadable header: {e}")))?;
        let issuer = unverified_issuer(token)?;
        if let Some(expected) = &policy.expected_issuer {
            if issuer.trim_end_matches('/') != expected.trim_end_matches('/') {
                warn!(%issuer, %expected, "identity token from unexpected issuer");
                return Err(SecurityError::IssuerMismatch(format!(
                    "token issued by {issuer}, expected {expected}"
                ))
                .into());
            }
        }
        let document = self.resolver.document(&issuer, false, true).await?;

        let alg = format!("{:?}", header.alg);
        let supported = &document.id_token_signing_alg_values_supported;
        if !supported.is_empty() && !supported.contains(&alg) {
            return Err(SecurityError::UnsupportedAlgorithm(alg).into());
        }

        let key = self.decoding_key(&document, header.kid.as_deref()).await?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[document.issuer.as_str()]);
        validation.set_audience(&[policy.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = policy.leeway_secs;

        let data = decode::<Map<String, Value>>(token, &key, &validation).map_err(map_jwt_error)?;
        let principal = Principal::from_claims(data.claims);
        info!(issuer = %principal.issuer, "identity token validated");
        Ok(principal)
    }

    /// Bind this validator to `policy` as a lazily-run token capability.
    pub fn for_audience(self: &Arc<Self>, policy: ValidationPolicy) -> Arc<dyn TokenValidation> {
        Arc::new(IdTokenCheck {
            validator: self.clone(),
            policy,
        })
    }

    async fn decoding_key(&self, document: &DiscoveryDocument, kid: Option<&str>) -> Result<DecodingKey> {
        let jwks_uri = document
            .jwks_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| Error::InvalidResponse("discovery document has no jwks_uri".into()))?;
        self.resolver.policy().require_secure(jwks_uri)?;

        let (mut set, cached) = self.key_set(jwks_uri, false).await?;
        let rotated = cached
            && matches!(
                select_key(&set, kid),
                Err(Error::Security(SecurityError::KeyNotFound(_)))
            );
        if rotated {
            debug!(jwks_uri, "key not in cached set, downloading fresh set");
            set = self.key_set(jwks_uri, true).await?.0;
        }

        let jwk = select_key(&set, kid)?;
        DecodingKey::from_jwk(jwk)
            .map_err(|e| SecurityError::UnsupportedAlgorithm(format!("unusable key: {e}")).into())
    }

    /// Key set for `jwks_uri` and whether it came from the cache.
    async fn key_set(&self, jwks_uri: &str, force: bool) -> Result<(JwkSet, bool)> {
        let Some(cache) = &self.key_sets else {
            return Ok((fetch_key_set(self.resolver.client(), jwks_uri).await?, false));
        };

        if !force {
            match cache.try_get(jwks_uri).await {
                Ok(Some(set)) => return Ok((set, true)),
                Ok(None) => {}
                Err(e) => warn!(jwks_uri, error = %e, "key set cache lookup failed"),
            }
        }

        let set = fetch_key_set(self.resolver.client(), jwks_uri).await?;
        let expires = now_millis() + self.key_set_ttl.as_millis() as u64;
        if let Err(e) = cache.add(jwks_uri, set.clone(), true, Some(expires)).await {
            warn!(jwks_uri, error = %e, "failed to cache key set");
        }
        Ok((set, false))
    }
}

/// [`TokenValidation`] adapter attached to identity tokens.
struct IdTokenCheck {
    validator: Arc<IdTokenValidator>,
    policy: ValidationPolicy,
}

impl TokenValidation for IdTokenCheck {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.validator.validate(token, &self.policy).await.map(|_| ()) })
    }
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> Error {
    let reason = e.to_string();
    let security = match e.kind() {
        ErrorKind::InvalidSignature => SecurityError::InvalidSignature(reason),
        ErrorKind::InvalidIssuer => SecurityError::IssuerMismatch(reason),
        ErrorKind::InvalidAudience => SecurityError::InvalidAudience(reason),
        ErrorKind::ExpiredSignature => SecurityError::Expired(reason),
        ErrorKind::ImmatureSignature => SecurityError::NotYetValid(reason),
        ErrorKind::MissingRequiredClaim(claim) => SecurityError::MissingClaim(claim.clone()),
        ErrorKind::InvalidAlgorithm | ErrorKind::MissingAlgorithm => {
            SecurityError::UnsupportedAlgorithm(reason)
        }
        _ => SecurityError::MalformedToken(reason),
    };
    security.into()
}
