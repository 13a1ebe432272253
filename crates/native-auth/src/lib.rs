//! OAuth2 Authorization Code + PKCE client engine for native applications
//!
//! Produces and maintains access, refresh and identity tokens for a single
//! logged-in principal. The host supplies three capabilities: a [`Browser`]
//! that opens the authorization URL, a [`RedirectHandle`] it reports the
//! terminal redirect URI to, and optional [`BlobStore`]s for persistence.
//!
//! Token flow:
//! 1. `Authenticator::get_access_token_silently()` checks the [`TokenCache`]
//! 2. An expired access token is renewed with `token::refresh_token()`
//! 3. Otherwise an interactive attempt builds an [`AuthState`], opens the
//!    browser and waits for the redirect
//! 4. `token::exchange_code()` trades the code for an [`AuthResult`]
//! 5. Identity tokens are checked lazily through the [`IdTokenValidator`],
//!    which resolves signing keys via the [`DiscoveryResolver`]

pub mod authenticator;
pub mod cache;
pub mod callback;
pub mod config;
pub mod discovery;
pub mod error;
pub mod flow;
pub mod jwks;
pub mod metrics;
pub mod pkce;
pub mod result;
pub mod storage;
pub mod token;
pub mod token_cache;
pub mod userinfo;
pub mod validator;

use std::future::Future;
use std::pin::Pin;

pub use authenticator::{Authenticator, Browser};
pub use cache::{CachedItem, ExpiringCache, spawn_clean_task};
pub use callback::RedirectHandle;
pub use config::{AuthConfig, AuthConfigBuilder, Scope};
pub use discovery::{
    AuthorityValidationStrategy, DiscoveryCache, DiscoveryDocument, DiscoveryEndpoint,
    DiscoveryPolicy, DiscoveryResolver, StringComparisonStrategy, UrlEqualityStrategy,
};
pub use error::{AuthFailure, Error, Result, SecurityError};
pub use flow::{AuthEvent, AuthPhase};
pub use pkce::{AuthState, PkcePair};
pub use result::{AuthResult, TokenInfo, TokenRole, TokenValidation};
pub use storage::{BlobStore, FileBlobStore, MemoryBlobStore};
pub use token::{TokenResponse, exchange_code, refresh_token};
pub use token_cache::TokenCache;
pub use userinfo::{UserInfo, fetch_user_info};
pub use validator::{IdTokenValidator, Principal, ValidationPolicy};

/// Boxed `Send` future used by the capability traits so they stay
/// dyn-compatible (`Arc<dyn BlobStore>`, `Arc<dyn Browser>`).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Current time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
