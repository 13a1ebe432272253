//! Token bundle cache
//!
//! Wraps an [`ExpiringCache`] of [`AuthResult`]s. When a secure store is
//! configured the refresh token is split off and kept there instead of in the
//! bundle; reads merge the two back together, so a refresh token survives
//! even when the bundle itself is gone.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::ExpiringCache;
use crate::error::{Error, Result};
use crate::result::{AuthResult, TokenInfo, TokenRole};
use crate::storage::BlobStore;

const REFRESH_NAMESPACE: &str = "refresh_token";

/// Cache for [`AuthResult`]s keyed by client registration.
pub struct TokenCache {
    entries: Arc<ExpiringCache<AuthResult>>,
    secure: Option<Arc<dyn BlobStore>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new(ExpiringCache::new())
    }
}

impl TokenCache {
    pub fn new(entries: ExpiringCache<AuthResult>) -> Self {
        Self {
            entries: Arc::new(entries),
            secure: None,
        }
    }

    /// Keep refresh tokens in `store` rather than in the bundle.
    pub fn with_secure_storage(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.secure = Some(store);
        self
    }

    /// Underlying bundle cache (for [`crate::spawn_clean_task`]).
    pub fn entries(&self) -> Arc<ExpiringCache<AuthResult>> {
        self.entries.clone()
    }

    /// Cache `result`, replacing any previous bundle for `key`.
    ///
    /// `expires` bounds how long the bundle is cached; token expiry is
    /// tracked per token and is usually what callers want, so pass `None`
    /// unless every token should go at once.
    pub async fn add(&self, key: &str, result: &AuthResult, expires: Option<u64>) -> Result<()> {
        let Some(secure) = &self.secure else {
            return self.entries.add(key, result.clone(), true, expires).await;
        };

        let key = self.entries.resolve_key(key)?;
        match result.refresh_token() {
            Some(refresh) => {
                secure
                    .set(&refresh_blob(&key), refresh.value().as_bytes().to_vec())
                    .await?
            }
            None => secure.delete(&refresh_blob(&key)).await?,
        }
        self.entries
            .add(&key, result.without(TokenRole::Refresh), true, expires)
            .await
    }

    /// Read the bundle for `key`, merging in the securely stored refresh
    /// token. Returns a refresh-only result when just that is left.
    pub async fn try_get(&self, key: &str) -> Result<Option<AuthResult>> {
        let bundle = self.entries.try_get(key).await?;
        let Some(secure) = &self.secure else {
            return Ok(bundle);
        };

        let key = self.entries.resolve_key(key)?;
        let refresh = match secure.get(&refresh_blob(&key)).await {
            Ok(Some(bytes)) => String::from_utf8(bytes)
                .map_err(|e| Error::Storage(format!("stored refresh token is not UTF-8: {e}")))?,
            Ok(None) => return Ok(bundle),
            Err(e) => {
                warn!(error = %e, "failed to read refresh token from secure storage");
                return Ok(bundle);
            }
        };

        debug!("merged refresh token from secure storage");
        let refresh = TokenInfo::new(refresh, TokenRole::Refresh, None);
        Ok(Some(match bundle {
            Some(bundle) => bundle.without(TokenRole::Refresh).with(refresh),
            None => AuthResult::new(vec![refresh]),
        }))
    }

    /// Remove the bundle, keeping any securely stored refresh token.
    pub async fn remove_access_tokens(&self, key: &str) -> Result<()> {
        self.entries.remove(key).await.map(|_| ())
    }

    /// Remove the securely stored refresh token only.
    pub async fn remove_refresh_token(&self, key: &str) -> Result<()> {
        let Some(secure) = &self.secure else {
            return Ok(());
        };
        let key = self.entries.resolve_key(key)?;
        secure.delete(&refresh_blob(&key)).await
    }

    /// Remove every token cached for `key`.
    ///
    /// Both removals are attempted; the first failure is returned.
    pub async fn remove(&self, key: &str) -> Result<()> {
        let refresh = self.remove_refresh_token(key).await;
        let bundle = self.remove_access_tokens(key).await;
        refresh.and(bundle)
    }
}

fn refresh_blob(key: &str) -> String {
    format!("{REFRESH_NAMESPACE}/{key}")
}
