//! OIDC discovery
//!
//! - [`DiscoveryEndpoint`] normalizes a URL or identity token into the
//!   well-known URL to fetch
//! - [`DiscoveryPolicy`] holds the transport and authority rules
//! - [`DiscoveryResolver`] downloads, validates and single-flights
//! - [`DiscoveryCache`] is the injectable current-document holder shared
//!   with the identity token validator

mod cache;
mod document;
mod endpoint;
mod policy;
mod resolver;

pub use cache::{DEFAULT_MAX_AGE, DiscoveryCache};
pub use document::DiscoveryDocument;
pub use endpoint::{DiscoveryEndpoint, WELL_KNOWN_SUFFIX, unverified_issuer};
pub use policy::{
    AuthorityValidationStrategy, DiscoveryPolicy, StringComparisonStrategy, UrlEqualityStrategy,
};
pub use resolver::DiscoveryResolver;

#[cfg(test)]
pub(crate) use document::sample_document;
