//! Discovery document download with single-flight coalescing
//!
//! Overlapping downloads of the same well-known URL share one request: the
//! first caller starts a [`Shared`] future, later callers await a clone of
//! it, and every caller observes the leader's result.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::Shared;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use super::cache::DiscoveryCache;
use super::document::DiscoveryDocument;
use super::endpoint::DiscoveryEndpoint;
use super::policy::DiscoveryPolicy;
use crate::BoxFuture;
use crate::error::{Error, Result, SecurityError};
use crate::result::AuthResult;
use crate::token::describe_error_body;
use crate::{metrics, now_millis};

type Flight = Shared<BoxFuture<'static, Result<Arc<DiscoveryDocument>>>>;

/// Resolves, downloads and validates discovery documents.
pub struct DiscoveryResolver {
    client: reqwest::Client,
    policy: DiscoveryPolicy,
    cache: Arc<DiscoveryCache>,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl DiscoveryResolver {
    pub fn new(client: reqwest::Client, policy: DiscoveryPolicy, cache: Arc<DiscoveryCache>) -> Self {
        Self {
            client,
            policy,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<DiscoveryCache> {
        &self.cache
    }

    pub fn policy(&self) -> &DiscoveryPolicy {
        &self.policy
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Resolve `input` (URL or identity token) to a discovery endpoint.
    pub fn resolve(&self, input: &str) -> Result<DiscoveryEndpoint> {
        DiscoveryEndpoint::resolve(input)
    }

    /// Download and validate the document at `endpoint`, then make it
    /// current. Concurrent calls for the same URL share one request.
    pub async fn download(&self, endpoint: &DiscoveryEndpoint) -> Result<Arc<DiscoveryDocument>> {
        let flight = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&endpoint.url) {
                Some(flight) => {
                    debug!(url = %endpoint.url, "joining in-flight discovery download");
                    flight.clone()
                }
                None => {
                    let flight = fetch(
                        self.client.clone(),
                        self.policy.clone(),
                        self.cache.clone(),
                        endpoint.clone(),
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(endpoint.url.clone(), flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(&endpoint.url)
            .is_some_and(|current| current.ptr_eq(&flight))
        {
            in_flight.remove(&endpoint.url);
        }
        result
    }

    /// Document for `input`.
    ///
    /// Returns the current document when it is fresh and belongs to the same
    /// authority, unless `refresh` forces a download. With `fallback`, a
    /// failed download (other than a security failure) falls back to the
    /// persisted copy and then to the current document.
    pub async fn document(
        &self,
        input: &str,
        refresh: bool,
        fallback: bool,
    ) -> Result<Arc<DiscoveryDocument>> {
        let endpoint = self.resolve(input)?;

        if !refresh && let Some(document) = self.cache.fresh_for(&endpoint.authority).await {
            debug!(authority = %endpoint.authority, "using current discovery document");
            return Ok(document);
        }

        match self.download(&endpoint).await {
            Ok(document) => Ok(document),
            Err(e) if fallback && !e.is_security() => {
                if let Some(document) = self.fallback_document(&endpoint).await {
                    warn!(url = %endpoint.url, error = %e, "discovery download failed, using cached document");
                    return Ok(document);
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh the current document from the issuer of the identity token in
    /// `result`. Without an identity token (or when the download fails and
    /// `fallback` is set) the cached copy is used.
    pub async fn refresh_from_result(
        &self,
        result: &AuthResult,
        fallback: bool,
    ) -> Result<Arc<DiscoveryDocument>> {
        if let Some(id_token) = result.id_token() {
            return self.document(id_token.value(), true, fallback).await;
        }
        if fallback && let Some(document) = self.cache.current().await {
            return Ok(document);
        }
        Err(Error::InvalidResponse(
            "no identity token to locate the discovery document".into(),
        ))
    }

    async fn fallback_document(
        &self,
        endpoint: &DiscoveryEndpoint,
    ) -> Option<Arc<DiscoveryDocument>> {
        if let Some(document) = self.cache.load_persisted(&endpoint.url).await {
            return Some(document);
        }
        self.cache
            .current()
            .await
            .filter(|current| current.issuer.trim_end_matches('/') == endpoint.authority)
    }
}

async fn fetch(
    client: reqwest::Client,
    policy: DiscoveryPolicy,
    cache: Arc<DiscoveryCache>,
    endpoint: DiscoveryEndpoint,
) -> Result<Arc<DiscoveryDocument>> {
    let outcome = fetch_and_validate(&client, &policy, &endpoint).await;
    metrics::record_discovery_download(outcome.is_ok());

    let mut document = outcome?;
    document.last_updated = now_millis();
    let document = Arc::new(document);
    cache.set_current(document.clone()).await;
    cache.persist(&endpoint.url, &document).await;
    info!(issuer = %document.issuer, "downloaded discovery document");
    Ok(document)
}

async fn fetch_and_validate(
    client: &reqwest::Client,
    policy: &DiscoveryPolicy,
    endpoint: &DiscoveryEndpoint,
) -> Result<DiscoveryDocument> {
    let url = Url::parse(&endpoint.url)
        .map_err(|e| Error::MalformedUrl(format!("{}: {e}", endpoint.url)))?;
    if !policy.is_secure(&url) {
        return Err(SecurityError::HttpsRequired(endpoint.url.clone()).into());
    }

    debug!(url = %endpoint.url, "downloading discovery document");
    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Error::Network(format!("discovery request to {} failed: {e}", endpoint.url)))?;

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

    let document = response
        .json::<DiscoveryDocument>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid discovery document: {e}")))?;
    document.validate(endpoint, policy)?;
    Ok(document)
}
