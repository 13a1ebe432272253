//! Token bundles produced by a successful authorization

use std::sync::Arc;

use common::Secret;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::BoxFuture;
use crate::error::Result;
use crate::now_millis;

/// What a token is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRole {
    Access,
    Refresh,
    Identity,
}

/// Validation capability attached to a token.
///
/// Uses a boxed future for dyn-compatibility (`Arc<dyn TokenValidation>`).
pub trait TokenValidation: Send + Sync {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// A single token with its role and optional expiry.
///
/// When a validation capability is attached, [`TokenInfo::validate`] runs it
/// once; clones share the memoized outcome. The capability is never persisted.
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    value: Secret<String>,
    role: TokenRole,
    /// Expiry as unix timestamp in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires: Option<u64>,
    #[serde(skip)]
    validator: Option<Arc<dyn TokenValidation>>,
    #[serde(skip)]
    outcome: Arc<OnceCell<Result<()>>>,
}

impl TokenInfo {
    pub fn new(value: impl Into<String>, role: TokenRole, expires: Option<u64>) -> Self {
        Self {
            value: Secret::new(value.into()),
            role,
            expires,
            validator: None,
            outcome: Arc::default(),
        }
    }

    /// Attach a validation capability. Any memoized outcome is discarded.
    pub fn with_validator(mut self, validator: Arc<dyn TokenValidation>) -> Self {
        self.validator = Some(validator);
        self.outcome = Arc::default();
        self
    }

    /// The raw token (use sparingly, never log it).
    pub fn value(&self) -> &str {
        self.value.expose()
    }

    pub fn role(&self) -> TokenRole {
        self.role
    }

    pub fn expires(&self) -> Option<u64> {
        self.expires
    }

    pub fn has_validator(&self) -> bool {
        self.validator.is_some()
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires, Some(expires) if expires <= now_millis())
    }

    /// Run the attached validation capability, at most once.
    ///
    /// Tokens without a capability are trivially valid.
    pub async fn validate(&self) -> Result<()> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        self.outcome
            .get_or_init(|| validator.validate(self.value.expose()))
            .await
            .clone()
    }

    /// Unexpired and (if a capability is attached) validated.
    pub async fn is_valid(&self) -> bool {
        !self.is_expired() && self.validate().await.is_ok()
    }
}

impl std::fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenInfo")
            .field("value", &self.value)
            .field("role", &self.role)
            .field("expires", &self.expires)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Ordered collection of tokens with first-match accessors by role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResult {
    tokens: Vec<TokenInfo>,
}

impl AuthResult {
    pub fn new(tokens: Vec<TokenInfo>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> &[TokenInfo] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn token(&self, role: TokenRole) -> Option<&TokenInfo> {
        self.tokens.iter().find(|t| t.role == role)
    }

    pub fn access_token(&self) -> Option<&TokenInfo> {
        self.token(TokenRole::Access)
    }

    pub fn refresh_token(&self) -> Option<&TokenInfo> {
        self.token(TokenRole::Refresh)
    }

    pub fn id_token(&self) -> Option<&TokenInfo> {
        self.token(TokenRole::Identity)
    }

    /// Expiry of the access token, if it has one.
    pub fn expires(&self) -> Option<u64> {
        self.access_token().and_then(TokenInfo::expires)
    }

    /// True when an access token is present and unexpired.
    pub fn has_fresh_access_token(&self) -> bool {
        self.access_token().is_some_and(|t| !t.is_expired())
    }

    /// Copy of this result without any token of `role`.
    pub fn without(&self, role: TokenRole) -> Self {
        Self {
            tokens: self
                .tokens
                .iter()
                .filter(|t| t.role != role)
                .cloned()
                .collect(),
        }
    }

    /// Copy of this result with `token` appended.
    pub fn with(mut self, token: TokenInfo) -> Self {
        self.tokens.push(token);
        self
    }

    /// Attach a validation capability to every identity token.
    pub fn with_identity_validator(mut self, validator: Arc<dyn TokenValidation>) -> Self {
        self.tokens = self
            .tokens
            .into_iter()
            .map(|t| {
                if t.role == TokenRole::Identity {
                    t.with_validator(validator.clone())
                } else {
                    t
                }
            })
            .collect();
        self
    }
}
