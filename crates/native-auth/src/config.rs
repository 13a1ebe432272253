//! Client registration configuration
//!
//! An [`AuthConfig`] is built once per logical client registration through
//! [`AuthConfig::builder`], which validates the endpoints and client id.
//! The token cache is shared (`Arc`), never copied, when a config is cloned.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::cache::ExpiringCache;
use crate::discovery::DiscoveryDocument;
use crate::error::{Error, Result};
use crate::pkce::AuthState;
use crate::token_cache::TokenCache;

/// Scope requested when an identity token is wanted.
pub const OPENID_SCOPE: &str = "openid";

/// Default bound on the wait for the authorization redirect.
pub const DEFAULT_REDIRECT_TIMEOUT: Duration = Duration::from_secs(600);

/// Space-separated scope identifiers, de-duplicated, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope(Vec<String>);

impl Scope {
    /// Parse a space-separated scope string.
    pub fn parse(value: &str) -> Self {
        let mut scope = Self::default();
        scope.add(value.split_whitespace());
        scope
    }

    /// Add identifiers, trimming each and skipping blanks and duplicates.
    pub fn add<I, S>(&mut self, identifiers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for identifier in identifiers {
            let identifier = identifier.as_ref().trim();
            if !identifier.is_empty() && !self.contains(identifier) {
                self.0.push(identifier.to_string());
            }
        }
    }

    pub fn remove<I, S>(&mut self, identifiers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for identifier in identifiers {
            let identifier = identifier.as_ref().trim();
            self.0.retain(|s| s != identifier);
        }
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.0.iter().any(|s| s == identifier)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Configuration for one client registration.
#[derive(Clone)]
pub struct AuthConfig {
    authority: Url,
    token_endpoint: Url,
    redirect_uri: Url,
    client_id: String,
    scope: Scope,
    use_state: bool,
    use_pkce: bool,
    caching: bool,
    request_identity_token: bool,
    auto_validate_tokens: bool,
    redirect_timeout: Option<Duration>,
    issuer: Option<String>,
    token_cache: Arc<TokenCache>,
}

impl AuthConfig {
    pub fn builder(client_id: impl Into<String>) -> AuthConfigBuilder {
        AuthConfigBuilder::new(client_id.into())
    }

    /// Builder pre-populated with the endpoints advertised by `document`.
    pub fn from_discovery(
        document: &DiscoveryDocument,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> AuthConfigBuilder {
        Self::builder(client_id)
            .authority(document.authorization_endpoint.clone())
            .token_endpoint(document.token_endpoint.clone())
            .redirect_uri(redirect_uri)
            .issuer(document.issuer.clone())
    }

    /// Authorization endpoint.
    pub fn authority(&self) -> &Url {
        &self.authority
    }

    pub fn token_endpoint(&self) -> &Url {
        &self.token_endpoint
    }

    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn use_state(&self) -> bool {
        self.use_state
    }

    pub fn use_pkce(&self) -> bool {
        self.use_pkce
    }

    pub fn caching(&self) -> bool {
        self.caching
    }

    pub fn request_identity_token(&self) -> bool {
        self.request_identity_token
    }

    pub fn auto_validate_tokens(&self) -> bool {
        self.auto_validate_tokens
    }

    pub fn redirect_timeout(&self) -> Option<Duration> {
        self.redirect_timeout
    }

    /// Issuer identity tokens must come from, when pinned.
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    pub fn token_cache(&self) -> &Arc<TokenCache> {
        &self.token_cache
    }

    pub fn with_scope<I, S>(&mut self, identifiers: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scope.add(identifiers);
        self
    }

    pub fn remove_scope<I, S>(&mut self, identifiers: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scope.remove(identifiers);
        self
    }

    pub fn clear_scope(&mut self) -> &mut Self {
        self.scope.clear();
        self
    }

    /// Key tokens for this registration are cached under:
    /// `{authority host}::{client id}`.
    pub fn cache_key(&self) -> String {
        format!(
            "{}::{}",
            self.authority.host_str().unwrap_or_default(),
            self.client_id
        )
    }

    /// Scope sent on the authorization request. Adds `openid` when an
    /// identity token is requested, without touching the configured scope.
    pub fn effective_scope(&self) -> Scope {
        let mut scope = self.scope.clone();
        if self.request_identity_token {
            scope.add([OPENID_SCOPE]);
        }
        scope
    }

    /// Authorization request URL for one attempt.
    pub fn authorization_url(&self, state: &AuthState) -> Url {
        let mut url = self.authority.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", self.redirect_uri.as_str());
            let scope = self.effective_scope();
            if !scope.is_empty() {
                query.append_pair("scope", &scope.to_string());
            }
            for (name, value) in state.query_pairs() {
                query.append_pair(name, value);
            }
        }
        url
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("authority", &self.authority.as_str())
            .field("token_endpoint", &self.token_endpoint.as_str())
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("client_id", &self.client_id)
            .field("scope", &self.scope.to_string())
            .field("use_state", &self.use_state)
            .field("use_pkce", &self.use_pkce)
            .field("caching", &self.caching)
            .field("request_identity_token", &self.request_identity_token)
            .field("auto_validate_tokens", &self.auto_validate_tokens)
            .field("redirect_timeout", &self.redirect_timeout)
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

/// Builder for [`AuthConfig`]. Every setter is explicit; `build` validates.
pub struct AuthConfigBuilder {
    client_id: String,
    authority: Option<String>,
    token_endpoint: Option<String>,
    redirect_uri: Option<String>,
    scope: Scope,
    use_state: bool,
    use_pkce: bool,
    caching: bool,
    request_identity_token: bool,
    auto_validate_tokens: bool,
    redirect_timeout: Option<Duration>,
    issuer: Option<String>,
    token_cache: Option<Arc<TokenCache>>,
}

impl AuthConfigBuilder {
    fn new(client_id: String) -> Self {
        Self {
            client_id,
            authority: None,
            token_endpoint: None,
            redirect_uri: None,
            scope: Scope::default(),
            use_state: true,
            use_pkce: true,
            caching: true,
            request_identity_token: false,
            auto_validate_tokens: false,
            redirect_timeout: Some(DEFAULT_REDIRECT_TIMEOUT),
            issuer: None,
            token_cache: None,
        }
    }

    /// Authorization endpoint URL.
    pub fn authority(mut self, url: impl Into<String>) -> Self {
        self.authority = Some(url.into());
        self
    }

    pub fn token_endpoint(mut self, url: impl Into<String>) -> Self {
        self.token_endpoint = Some(url.into());
        self
    }

    pub fn redirect_uri(mut self, url: impl Into<String>) -> Self {
        self.redirect_uri = Some(url.into());
        self
    }

    pub fn scope<I, S>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.scope.add(identifiers);
        self
    }

    pub fn use_state(mut self, enabled: bool) -> Self {
        self.use_state = enabled;
        self
    }

    pub fn use_pkce(mut self, enabled: bool) -> Self {
        self.use_pkce = enabled;
        self
    }

    pub fn caching(mut self, enabled: bool) -> Self {
        self.caching = enabled;
        self
    }

    /// Ask for an identity token (adds the `openid` scope).
    pub fn request_identity_token(mut self, enabled: bool) -> Self {
        self.request_identity_token = enabled;
        self
    }

    /// Attach lazy validation to identity tokens in every result.
    pub fn auto_validate_tokens(mut self, enabled: bool) -> Self {
        self.auto_validate_tokens = enabled;
        self
    }

    /// Bound the wait for the redirect; `None` waits indefinitely.
    pub fn redirect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.redirect_timeout = timeout;
        self
    }

    /// Pin the issuer accepted on identity tokens.
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn token_cache(mut self, cache: Arc<TokenCache>) -> Self {
        self.token_cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<AuthConfig> {
        let client_id = self.client_id.trim().to_string();
        if client_id.is_empty() {
            return Err(Error::Configuration("client id cannot be empty".into()));
        }

        let authority = parse_endpoint("authority", self.authority.as_deref())?;
        let token_endpoint = parse_endpoint("token endpoint", self.token_endpoint.as_deref())?;
        let redirect_uri = parse_absolute("redirect URI", self.redirect_uri.as_deref())?;
        if let Some(issuer) = &self.issuer {
            parse_endpoint("issuer", Some(issuer))?;
        }

        let token_cache = self.token_cache.unwrap_or_else(|| {
            Arc::new(TokenCache::new(
                ExpiringCache::new().with_default_key(client_id.clone()),
            ))
        });

        Ok(AuthConfig {
            authority,
            token_endpoint,
            redirect_uri,
            client_id,
            scope: self.scope,
            use_state: self.use_state,
            use_pkce: self.use_pkce,
            caching: self.caching,
            request_identity_token: self.request_identity_token,
            auto_validate_tokens: self.auto_validate_tokens,
            redirect_timeout: self.redirect_timeout,
            issuer: self.issuer,
            token_cache,
        })
    }
}

fn parse_absolute(name: &str, value: Option<&str>) -> Result<Url> {
    let value = value.ok_or_else(|| Error::Configuration(format!("{name} is required")))?;
    Url::parse(value)
        .map_err(|e| Error::Configuration(format!("{name} is not an absolute URL ({value}): {e}")))
}

/// Network endpoints must be http(s) URLs with a host.
fn parse_endpoint(name: &str, value: Option<&str>) -> Result<Url> {
    let url = parse_absolute(name, value)?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::Configuration(format!(
            "{name} must be an http(s) URL: {url}"
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> AuthConfigBuilder {
        AuthConfig::builder("my-app")
            .authority("https://login.example.com/oauth2/authorize")
            .token_endpoint("https://login.example.com/oauth2/token")
            .redirect_uri("myapp://callback")
    }

    #[test]
    fn build_valid_config_with_defaults() {
        let config = builder().build().unwrap();
        assert_eq!(config.client_id(), "my-app");
        assert_eq!(config.redirect_uri().scheme(), "myapp");
        assert!(config.use_state());
        assert!(config.use_pkce());
        assert!(config.caching());
        assert!(!config.request_identity_token());
        assert_eq!(config.redirect_timeout(), Some(DEFAULT_REDIRECT_TIMEOUT));
    }

    #[test]
    fn empty_client_id_rejected() {
        let err = AuthConfig::builder("  ")
            .authority("https://a.example/authorize")
            .token_endpoint("https://a.example/token")
            .redirect_uri("myapp://cb")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "got: {err}");
    }

    #[test]
    fn relative_urls_rejected() {
        let err = builder().authority("/oauth2/authorize").build().unwrap_err();
        assert!(err.to_string().contains("authority"), "got: {err}");

        let err = builder().redirect_uri("callback").build().unwrap_err();
        assert!(err.to_string().contains("redirect URI"), "got: {err}");
    }

    #[test]
    fn missing_token_endpoint_rejected() {
        let err = AuthConfig::builder("my-app")
            .authority("https://a.example/authorize")
            .redirect_uri("myapp://cb")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("token endpoint is required"));
    }

    #[test]
    fn non_http_endpoint_rejected() {
        let err = builder().token_endpoint("myapp://token").build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn cache_key_combines_host_and_client() {
        let config = builder().build().unwrap();
        assert_eq!(config.cache_key(), "login.example.com::my-app");
    }

    #[test]
    fn scope_helpers_trim_and_dedupe() {
        let mut config = builder().build().unwrap();
        config.with_scope([" aaa ", " bbb "]);
        assert_eq!(config.scope().to_string(), "aaa bbb");

        config.with_scope(["aaa", "ccc"]);
        assert_eq!(config.scope().to_string(), "aaa bbb ccc");

        config.remove_scope(["bbb"]);
        assert_eq!(config.scope().to_string(), "aaa ccc");

        config.clear_scope();
        assert!(config.scope().is_empty());
    }

    #[test]
    fn scope_parse_splits_on_whitespace() {
        let scope = Scope::parse("  profile   email profile ");
        assert_eq!(scope.iter().collect::<Vec<_>>(), ["profile", "email"]);
    }

    #[test]
    fn clones_share_token_cache() {
        let config = builder().build().unwrap();
        let copy = config.clone();
        assert!(Arc::ptr_eq(config.token_cache(), copy.token_cache()));
    }

    #[test]
    fn authorization_url_contains_required_params() {
        let config = builder()
            .scope(["profile"])
            .request_identity_token(true)
            .build()
            .unwrap();
        let state = AuthState::new(true, true);
        let url = config.authorization_url(&state);

        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert!(url.as_str().starts_with("https://login.example.com/oauth2/authorize?"));
        assert_eq!(params["response_type"], "code");
        assert_eq!(params["client_id"], "my-app");
        assert_eq!(params["redirect_uri"], "myapp://callback");
        assert_eq!(params["scope"], "profile openid");
        assert_eq!(params["state"], state.state().unwrap());
        assert_eq!(params["code_challenge"], state.pkce().unwrap().challenge());
        assert_eq!(params["code_challenge_method"], "S256");

        // Configured scope is left untouched
        assert_eq!(config.scope().to_string(), "profile");
    }

    #[test]
    fn authorization_url_omits_disabled_params() {
        let config = builder().build().unwrap();
        let url = config.authorization_url(&AuthState::new(false, false));
        let names: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        assert_eq!(names, ["response_type", "client_id", "redirect_uri"]);
    }

    #[test]
    fn issuer_is_optional_and_validated() {
        assert_eq!(builder().build().unwrap().issuer(), None);

        let config = builder().issuer("https://login.example.com").build().unwrap();
        assert_eq!(config.issuer(), Some("https://login.example.com"));

        let err = builder().issuer("not a url").build().unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn discovery_pins_issuer() {
        let document = crate::discovery::sample_document("https://login.example.com");
        let config = AuthConfig::from_discovery(&document, "my-app", "myapp://callback")
            .build()
            .unwrap();
        assert_eq!(config.issuer(), Some("https://login.example.com"));
        assert_eq!(
            config.token_endpoint().as_str(),
            "https://login.example.com/token"
        );
    }
}
