//! Shared discovery document cache
//!
//! Holds the current document for the process, injected into both the
//! resolver and the validator instead of living in a static. Optionally
//! persists every downloaded document so it can stand in when the issuer
//! is unreachable.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::document::DiscoveryDocument;
use crate::cache::ExpiringCache;
use crate::now_millis;
use crate::storage::BlobStore;

/// Default age after which the current document is downloaded again.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

pub struct DiscoveryCache {
    current: RwLock<Option<Arc<DiscoveryDocument>>>,
    persisted: Option<ExpiringCache<DiscoveryDocument>>,
    max_age: Duration,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
            persisted: None,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist downloaded documents through `store`, keyed by well-known URL.
    pub fn with_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.persisted = Some(ExpiringCache::new().with_store(store, "discovery"));
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// The current document, whatever its age.
    pub async fn current(&self) -> Option<Arc<DiscoveryDocument>> {
        self.current.read().await.clone()
    }

    /// The current document if it belongs to `authority` and is younger than
    /// the max age.
    pub async fn fresh_for(&self, authority: &str) -> Option<Arc<DiscoveryDocument>> {
        let current = self.current().await?;
        let age = now_millis().saturating_sub(current.last_updated);
        let fresh = age < self.max_age.as_millis() as u64;
        let matches = trim_slash(&current.issuer) == trim_slash(authority);
        (fresh && matches).then_some(current)
    }

    /// Replace the current document unless the held one is newer.
    pub async fn set_current(&self, document: Arc<DiscoveryDocument>) {
        let mut current = self.current.write().await;
        if current
            .as_ref()
            .is_some_and(|held| held.last_updated > document.last_updated)
        {
            debug!("kept newer current discovery document");
            return;
        }
        *current = Some(document);
    }

    /// Persist `document` under `url`. Failures are logged only.
    pub async fn persist(&self, url: &str, document: &DiscoveryDocument) {
        let Some(persisted) = &self.persisted else {
            return;
        };
        if let Err(e) = persisted.add(url, document.clone(), true, None).await {
            warn!(url, error = %e, "failed to persist discovery document");
        }
    }

    /// Load the persisted copy for `url`, promoting it to current when it is
    /// newer than what is held.
    pub async fn load_persisted(&self, url: &str) -> Option<Arc<DiscoveryDocument>> {
        let persisted = self.persisted.as_ref()?;
        let document = match persisted.try_get(url).await {
            Ok(document) => Arc::new(document?),
            Err(e) => {
                warn!(url, error = %e, "failed to load persisted discovery document");
                return None;
            }
        };
        self.set_current(document.clone()).await;
        Some(document)
    }
}

fn trim_slash(value: &str) -> &str {
    value.strip_suffix('/').unwrap_or(value)
}
