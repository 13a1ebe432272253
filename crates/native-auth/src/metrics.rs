//! Counters emitted by the engine
//!
//! - `auth_token_requests_total` (counter): labels `grant_type`, `outcome`
//! - `auth_discovery_downloads_total` (counter): label `outcome`
//! - `auth_cache_lookups_total` (counter): label `outcome`
//!
//! Installing a recorder is up to the host. Without one these are no-ops.

/// Record a token endpoint call (`authorization_code` or `refresh_token`).
pub fn record_token_request(grant_type: &str, success: bool) {
    metrics::counter!(
        "auth_token_requests_total",
        "grant_type" => grant_type.to_string(),
        "outcome" => outcome(success)
    )
    .increment(1);
}

/// Record a discovery document download.
pub fn record_discovery_download(success: bool) {
    metrics::counter!("auth_discovery_downloads_total", "outcome" => outcome(success))
        .increment(1);
}

/// Record a cache lookup as a hit or a miss.
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    metrics::counter!("auth_cache_lookups_total", "outcome" => outcome).increment(1);
}

fn outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}
