//! Authorization orchestration
//!
//! [`Authenticator`] drives one client registration through its flows:
//! - `get_access_token(true)` returns a cached, unexpired result when there
//!   is one and otherwise runs the interactive flow
//! - `get_access_token_silently()` also renews an expired access token with
//!   the cached refresh token before going interactive
//!
//! The interactive flow claims the pending-redirect slot, opens the
//! authorization URL through the host's [`Browser`], waits (bounded by the
//! configured timeout) for the host to report the redirect through a
//! [`RedirectHandle`], checks `state`, then exchanges the code.
//!
//! Failures leave this module as [`AuthFailure`]. Cache problems are logged
//! and treated as misses.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::BoxFuture;
use crate::callback::{PendingRedirect, RedirectHandle};
use crate::config::AuthConfig;
use crate::discovery::DiscoveryResolver;
use crate::error::{AuthFailure, Error, Result, SecurityError};
use crate::flow::{AuthEvent, AuthPhase, advance};
use crate::pkce::AuthState;
use crate::result::AuthResult;
use crate::token::{exchange_code, refresh_token};
use crate::userinfo::{UserInfo, fetch_user_info};
use crate::validator::{IdTokenValidator, ValidationPolicy};

/// Host capability that presents the authorization URL to the user.
///
/// `open` reports whether the URL could be opened. The redirect itself comes
/// back separately through [`RedirectHandle::deliver`].
pub trait Browser: Send + Sync {
    fn open<'a>(&'a self, url: &'a Url, redirect_uri: &'a Url) -> BoxFuture<'a, Result<()>>;
}

pub struct Authenticator {
    config: AuthConfig,
    http: reqwest::Client,
    browser: Arc<dyn Browser>,
    pending: PendingRedirect,
    phase: watch::Sender<AuthPhase>,
    resolver: Option<Arc<DiscoveryResolver>>,
    validator: Option<Arc<IdTokenValidator>>,
}

impl Authenticator {
    pub fn new(config: AuthConfig, browser: Arc<dyn Browser>) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            browser,
            pending: PendingRedirect::new(),
            phase: watch::Sender::new(AuthPhase::Idle),
            resolver: None,
            validator: None,
        }
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Refresh discovery from identity tokens and resolve the userinfo
    /// endpoint through `resolver`. Also provides the identity token
    /// validator unless one is set explicitly.
    pub fn with_discovery(mut self, resolver: Arc<DiscoveryResolver>) -> Self {
        if self.validator.is_none() {
            self.validator = Some(Arc::new(IdTokenValidator::new(resolver.clone())));
        }
        self.resolver = Some(resolver);
        self
    }

    pub fn with_validator(mut self, validator: Arc<IdTokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Handle the host reports redirect URIs to.
    pub fn redirect_handle(&self) -> RedirectHandle {
        RedirectHandle::new(self.pending.clone(), self.config.redirect_uri().clone())
    }

    /// Whether an interactive attempt is waiting for its redirect.
    pub fn is_pending(&self) -> bool {
        self.pending.is_pending()
    }

    /// Give up on the pending interactive attempt so a new one can start.
    /// The abandoned attempt fails with `AttemptAbandoned`.
    pub fn abandon_pending(&self) -> bool {
        let abandoned = self.pending.abandon();
        if abandoned {
            info!(client_id = %self.config.client_id(), "pending authorization abandoned");
        }
        abandoned
    }

    pub fn phase(&self) -> AuthPhase {
        *self.phase.borrow()
    }

    /// Observe phase changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthPhase> {
        self.phase.subscribe()
    }

    /// Access token, from the cache when `allow_cached` and still fresh,
    /// otherwise through the interactive flow.
    pub async fn get_access_token(&self, allow_cached: bool) -> Result<AuthResult, AuthFailure> {
        if allow_cached && self.config.caching() {
            self.transition(AuthEvent::CacheLookup);
            if let Some(cached) = self.cached().await
                && cached.has_fresh_access_token()
            {
                debug!(client_id = %self.config.client_id(), "using cached access token");
                self.transition(AuthEvent::CacheHit);
                return Ok(cached);
            }
        }
        self.authorize_interactively().await
    }

    /// Access token without user interaction when possible: cached, then
    /// refreshed, then interactive. A failed refresh is logged and falls back
    /// to the interactive flow.
    pub async fn get_access_token_silently(&self) -> Result<AuthResult, AuthFailure> {
        if !self.config.caching() {
            return self.get_access_token(false).await;
        }

        self.transition(AuthEvent::CacheLookup);
        let Some(cached) = self.cached().await else {
            debug!(client_id = %self.config.client_id(), "no cached tokens");
            return self.authorize_interactively().await;
        };
        if cached.has_fresh_access_token() {
            self.transition(AuthEvent::CacheHit);
            return Ok(cached);
        }

        self.discard_access_tokens().await;
        let Some(refresh) = cached.refresh_token() else {
            debug!(client_id = %self.config.client_id(), "access token expired, no refresh token");
            return self.authorize_interactively().await;
        };

        self.transition(AuthEvent::RefreshStarted);
        match self.refresh(refresh.value()).await {
            Ok(result) => {
                self.transition(AuthEvent::Refreshed);
                info!(client_id = %self.config.client_id(), "access token refreshed");
                Ok(result)
            }
            Err(e) => {
                warn!(
                    client_id = %self.config.client_id(),
                    error = %e,
                    "token refresh failed, falling back to interactive authorization"
                );
                if matches!(e, Error::Protocol { .. }) {
                    self.discard_refresh_token().await;
                }
                self.authorize_interactively().await
            }
        }
    }

    /// Remove every cached token for this registration.
    pub async fn sign_out(&self) -> Result<()> {
        self.config
            .token_cache()
            .remove(&self.config.cache_key())
            .await?;
        self.transition(AuthEvent::Reset);
        info!(client_id = %self.config.client_id(), "cached tokens removed");
        Ok(())
    }

    /// Claims from the userinfo endpoint of the current discovery document.
    pub async fn user_info(&self, result: &AuthResult) -> Result<UserInfo> {
        let access = result
            .access_token()
            .ok_or_else(|| Error::InvalidResponse("result has no access token".into()))?;
        let resolver = self
            .resolver
            .as_ref()
            .ok_or_else(|| Error::Configuration("no discovery resolver configured".into()))?;

        let document = match resolver.cache().current().await {
            Some(document) => document,
            None => resolver.refresh_from_result(result, true).await?,
        };
        let endpoint = document
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| Error::Configuration("issuer publishes no userinfo endpoint".into()))?;
        fetch_user_info(&self.http, endpoint, access.value()).await
    }

    async fn authorize_interactively(&self) -> Result<AuthResult, AuthFailure> {
        match self.interactive().await {
            Ok(result) => {
                self.transition(AuthEvent::TokensIssued);
                info!(client_id = %self.config.client_id(), "authorized");
                Ok(result)
            }
            Err(e) => {
                self.transition(AuthEvent::Failure);
                warn!(client_id = %self.config.client_id(), error = %e, "authorization failed");
                Err(AuthFailure::with_cause(failure_message(&e), e))
            }
        }
    }

    async fn interactive(&self) -> Result<AuthResult> {
        let mut attempt = self.pending.begin()?;
        let state = AuthState::new(self.config.use_state(), self.config.use_pkce());
        let url = self.config.authorization_url(&state);

        debug!(client_id = %self.config.client_id(), "opening authorization URL");
        self.browser.open(&url, self.config.redirect_uri()).await?;
        self.transition(AuthEvent::BrowserOpened);

        let redirect = match self.config.redirect_timeout() {
            Some(limit) => tokio::time::timeout(limit, attempt.wait())
                .await
                .map_err(|_| Error::RedirectTimeout(limit.as_secs()))??,
            None => attempt.wait().await?,
        };
        drop(attempt);

        let code = authorization_code(&redirect, state.state())?;
        self.transition(AuthEvent::RedirectReceived);

        let response = exchange_code(&self.http, &self.config, &code, state.verifier()).await?;
        let result = response.into_auth_result(None)?;
        Ok(self.finish(result).await)
    }

    async fn refresh(&self, refresh: &str) -> Result<AuthResult> {
        let response = refresh_token(&self.http, &self.config, refresh).await?;
        let result = response.into_auth_result(Some(refresh))?;
        Ok(self.finish(result).await)
    }

    /// Attach validation, refresh discovery and cache a new result.
    async fn finish(&self, result: AuthResult) -> AuthResult {
        let result = self.attach_validation(result);
        if result.id_token().is_some()
            && let Some(resolver) = &self.resolver
            && let Err(e) = resolver.refresh_from_result(&result, true).await
        {
            warn!(error = %e, "failed to refresh discovery document");
        }

        if self.config.caching()
            && let Err(e) = self
                .config
                .token_cache()
                .add(&self.config.cache_key(), &result, None)
                .await
        {
            warn!(error = %e, "failed to cache tokens");
        }
        result
    }

    async fn cached(&self) -> Option<AuthResult> {
        match self.config.token_cache().try_get(&self.config.cache_key()).await {
            Ok(cached) => cached.map(|result| self.attach_validation(result)),
            Err(e) => {
                warn!(error = %e, "token cache read failed");
                None
            }
        }
    }

    /// Bind the identity token to the validator when automatic validation
    /// is on. Validators never survive the cache, so cached results get one
    /// here too.
    fn attach_validation(&self, result: AuthResult) -> AuthResult {
        if result.id_token().is_none() || !self.config.auto_validate_tokens() {
            return result;
        }
        match &self.validator {
            Some(validator) => {
                result.with_identity_validator(validator.for_audience(self.validation_policy()))
            }
            None => {
                warn!("identity token validation requested without a validator");
                result
            }
        }
    }

    /// Tokens must name this client as audience, and the configured issuer
    /// when one is pinned.
    fn validation_policy(&self) -> ValidationPolicy {
        let policy = ValidationPolicy::new(self.config.client_id());
        match self.config.issuer() {
            Some(issuer) => policy.with_expected_issuer(issuer),
            None => policy,
        }
    }

    async fn discard_access_tokens(&self) {
        let key = self.config.cache_key();
        if let Err(e) = self.config.token_cache().remove_access_tokens(&key).await {
            warn!(error = %e, "failed to remove expired tokens");
        }
    }

    async fn discard_refresh_token(&self) {
        let key = self.config.cache_key();
        if let Err(e) = self.config.token_cache().remove_refresh_token(&key).await {
            warn!(error = %e, "failed to remove rejected refresh token");
        }
    }

    fn transition(&self, event: AuthEvent) {
        self.phase.send_modify(|phase| *phase = advance(*phase, event));
    }
}

/// Authorization code from a redirect, after the state and error checks.
fn authorization_code(redirect: &Url, expected_state: Option<&str>) -> Result<String> {
    let param = |name: &str| {
        redirect
            .query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    if let Some(expected) = expected_state {
        let received = param("state").unwrap_or_default();
        if received != expected {
            return Err(SecurityError::StateMismatch {
                expected: expected.to_string(),
                received,
            }
            .into());
        }
    }

    if let Some(error) = param("error") {
        let message = match param("error_description") {
            Some(description) => format!("{error}: {description}"),
            None => error,
        };
        return Err(Error::AuthorizationDenied(message));
    }

    param("code")
        .filter(|code| !code.is_empty())
        .ok_or_else(|| Error::InvalidResponse("redirect carries no authorization code".into()))
}

fn failure_message(e: &Error) -> String {
    match e {
        Error::Security(_) => format!("authorization rejected: {e}"),
        Error::AuthorizationDenied(_) => format!("{e}"),
        Error::AttemptInProgress | Error::AttemptAbandoned | Error::RedirectTimeout(_) => {
            format!("authorization not completed: {e}")
        }
        _ => format!("authorization failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::now_millis;
    use crate::result::{TokenInfo, TokenRole};

    type Reply = Box<dyn Fn(&Url) -> Option<String> + Send + Sync>;

    /// Browser that answers every `open` with a scripted redirect.
    struct ScriptedBrowser {
        handle: OnceLock<RedirectHandle>,
        reply: Reply,
        opened: AtomicUsize,
        last_url: Mutex<Option<Url>>,
    }

    impl ScriptedBrowser {
        fn new(reply: impl Fn(&Url) -> Option<String> + Send + Sync + 'static) -> Arc<Self> {
            Arc::new(Self {
                handle: OnceLock::new(),
                reply: Box::new(reply),
                opened: AtomicUsize::new(0),
                last_url: Mutex::new(None),
            })
        }

        /// Redirects with `code=C1` and the attempt's own state.
        fn echoing() -> Arc<Self> {
            Self::new(|url| {
                let state = query(url, "state").unwrap_or_default();
                Some(format!("myapp://callback?code=C1&state={state}"))
            })
        }

        /// Never redirects.
        fn silent() -> Arc<Self> {
            Self::new(|_| None)
        }

        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }
    }

    impl Browser for ScriptedBrowser {
        fn open<'a>(&'a self, url: &'a Url, _redirect_uri: &'a Url) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                self.opened.fetch_add(1, Ordering::SeqCst);
                *self.last_url.lock().unwrap() = Some(url.clone());
                if let Some(redirect) = (self.reply)(url)
                    && let Some(handle) = self.handle.get()
                {
                    handle.deliver(&redirect);
                }
                Ok(())
            })
        }
    }

    fn query(url: &Url, name: &str) -> Option<String> {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    fn config(server: &MockServer) -> crate::config::AuthConfigBuilder {
        AuthConfig::builder("my-app")
            .authority(format!("{}/authorize", server.uri()))
            .token_endpoint(format!("{}/token", server.uri()))
            .redirect_uri("myapp://callback")
            .scope(["profile"])
    }

    fn authenticator(config: AuthConfig, browser: &Arc<ScriptedBrowser>) -> Authenticator {
        let auth = Authenticator::new(config, browser.clone());
        let _ = browser.handle.set(auth.redirect_handle());
        auth
    }

    async fn mount_grant(server: &MockServer, grant: &str, status: u16, body: serde_json::Value, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(format!("grant_type={grant}")))
            .respond_with(ResponseTemplate::new(status).set_body_json(body))
            .expect(expect)
            .mount(server)
            .await;
    }

    async fn seed_cache(auth: &Authenticator, tokens: Vec<TokenInfo>) {
        auth.config()
            .token_cache()
            .add(&auth.config().cache_key(), &AuthResult::new(tokens), None)
            .await
            .unwrap();
    }

    fn expired() -> Option<u64> {
        Some(now_millis() - 1_000)
    }

    #[tokio::test]
    async fn interactive_flow_exchanges_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=C1"))
            .and(body_string_contains("client_id=my-app"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT1",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let browser = ScriptedBrowser::echoing();
        let auth = authenticator(config(&server).build().unwrap(), &browser);

        let before = now_millis();
        let result = auth.get_access_token(false).await.unwrap();
        let after = now_millis();

        assert_eq!(result.access_token().unwrap().value(), "AT1");
        let expires = result.expires().unwrap();
        assert!(expires > before + 3_590_000);
        assert!(expires < after + 3_600_000);
        assert_eq!(auth.phase(), AuthPhase::Authorized);
        assert!(!auth.is_pending());
    }

    #[tokio::test]
    async fn authorization_url_carries_request_parameters() {
        let server = MockServer::start().await;
        mount_grant(&server, "authorization_code", 200, serde_json::json!({"access_token": "AT1"}), 1).await;

        let browser = ScriptedBrowser::echoing();
        let config = config(&server).request_identity_token(true).build().unwrap();
        let auth = authenticator(config, &browser);
        auth.get_access_token(false).await.unwrap();

        let url = browser.last_url.lock().unwrap().clone().unwrap();
        assert_eq!(url.path(), "/authorize");
        assert_eq!(query(&url, "response_type").as_deref(), Some("code"));
        assert_eq!(query(&url, "client_id").as_deref(), Some("my-app"));
        assert_eq!(query(&url, "redirect_uri").as_deref(), Some("myapp://callback"));
        assert_eq!(query(&url, "scope").as_deref(), Some("profile openid"));
        assert_eq!(query(&url, "code_challenge_method").as_deref(), Some("S256"));
        assert!(query(&url, "code_challenge").is_some());
        assert!(query(&url, "state").is_some());
    }

    #[tokio::test]
    async fn state_mismatch_fails_without_token_request() {
        let server = MockServer::start().await;
        mount_grant(&server, "authorization_code", 200, serde_json::json!({"access_token": "AT1"}), 0).await;

        let browser = ScriptedBrowser::new(|_| Some("myapp://callback?code=C1&state=xyz".into()));
        let auth = authenticator(config(&server).build().unwrap(), &browser);

        let failure = auth.get_access_token(false).await.unwrap_err();
        assert!(
            matches!(
                failure.cause,
                Some(Error::Security(SecurityError::StateMismatch { ref received, .. })) if received == "xyz"
            ),
            "got: {failure:?}"
        );
        assert_eq!(auth.phase(), AuthPhase::Failed);
        assert!(!auth.is_pending());
    }

    #[tokio::test]
    async fn error_redirect_is_denied() {
        let server = MockServer::start().await;
        mount_grant(&server, "authorization_code", 200, serde_json::json!({"access_token": "AT1"}), 0).await;

        let browser = ScriptedBrowser::new(|url| {
            let state = query(url, "state").unwrap_or_default();
            Some(format!(
                "myapp://callback?error=access_denied&error_description=user+cancelled&state={state}"
            ))
        });
        let auth = authenticator(config(&server).build().unwrap(), &browser);

        let failure = auth.get_access_token(false).await.unwrap_err();
        assert_eq!(
            failure.cause,
            Some(Error::AuthorizationDenied("access_denied: user cancelled".into()))
        );
    }

    #[tokio::test]
    async fn token_endpoint_error_is_surfaced_with_status() {
        let server = MockServer::start().await;
        mount_grant(
            &server,
            "authorization_code",
            400,
            serde_json::json!({"error": "invalid_grant", "error_description": "code expired"}),
            1,
        )
        .await;

        let browser = ScriptedBrowser::echoing();
        let auth = authenticator(config(&server).build().unwrap(), &browser);

        let failure = auth.get_access_token(false).await.unwrap_err();
        assert!(
            matches!(failure.cause, Some(Error::Protocol { status: 400, .. })),
            "got: {failure:?}"
        );
    }

    #[tokio::test]
    async fn cached_token_needs_no_network() {
        let server = MockServer::start().await;
        mount_grant(
            &server,
            "authorization_code",
            200,
            serde_json::json!({"access_token": "AT1", "expires_in": 3600}),
            1,
        )
        .await;

        let browser = ScriptedBrowser::echoing();
        let auth = authenticator(config(&server).build().unwrap(), &browser);

        let first = auth.get_access_token(true).await.unwrap();
        let second = auth.get_access_token(true).await.unwrap();
        assert_eq!(first.access_token().unwrap().value(), "AT1");
        assert_eq!(second.access_token().unwrap().value(), "AT1");
        assert_eq!(browser.opened(), 1);
    }

    #[tokio::test]
    async fn silent_refresh_renews_expired_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=RT0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "AT2",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let browser = ScriptedBrowser::silent();
        let auth = authenticator(config(&server).build().unwrap(), &browser);
        seed_cache(
            &auth,
            vec![
                TokenInfo::new("AT0", TokenRole::Access, expired()),
                TokenInfo::new("RT0", TokenRole::Refresh, None),
            ],
        )
        .await;

        let result = auth.get_access_token_silently().await.unwrap();
        assert_eq!(result.access_token().unwrap().value(), "AT2");
        assert_eq!(result.refresh_token().unwrap().value(), "RT0");
        assert_eq!(browser.opened(), 0);
        assert_eq!(auth.phase(), AuthPhase::Authorized);

        let cached = auth.cached().await.unwrap();
        assert_eq!(cached.access_token().unwrap().value(), "AT2");
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_interactive() {
        let server = MockServer::start().await;
        mount_grant(&server, "refresh_token", 400, serde_json::json!({"error": "invalid_grant"}), 1).await;
        mount_grant(&server, "authorization_code", 200, serde_json::json!({"access_token": "AT3"}), 1).await;

        let browser = ScriptedBrowser::echoing();
        let auth = authenticator(config(&server).build().unwrap(), &browser);
        seed_cache(
            &auth,
            vec![
                TokenInfo::new("AT0", TokenRole::Access, expired()),
                TokenInfo::new("RT0", TokenRole::Refresh, None),
            ],
        )
        .await;

        let result = auth.get_access_token_silently().await.unwrap();
        assert_eq!(result.access_token().unwrap().value(), "AT3");
        assert_eq!(browser.opened(), 1);
    }

    #[tokio::test]
    async fn expired_without_refresh_token_goes_interactive() {
        let server = MockServer::start().await;
        mount_grant(&server, "refresh_token", 200, serde_json::json!({"access_token": "X"}), 0).await;
        mount_grant(&server, "authorization_code", 200, serde_json::json!({"access_token": "AT1"}), 1).await;

        let browser = ScriptedBrowser::echoing();
        let auth = authenticator(config(&server).build().unwrap(), &browser);
        seed_cache(&auth, vec![TokenInfo::new("AT0", TokenRole::Access, expired())]).await;

        let result = auth.get_access_token_silently().await.unwrap();
        assert_eq!(result.access_token().unwrap().value(), "AT1");
        assert_eq!(browser.opened(), 1);
    }

    #[tokio::test]
    async fn silent_with_fresh_cache_returns_it() {
        let server = MockServer::start().await;
        let browser = ScriptedBrowser::silent();
        let auth = authenticator(config(&server).build().unwrap(), &browser);
        seed_cache(
            &auth,
            vec![TokenInfo::new("AT0", TokenRole::Access, Some(now_millis() + 60_000))],
        )
        .await;

        let result = auth.get_access_token_silently().await.unwrap();
        assert_eq!(result.access_token().unwrap().value(), "AT0");
        assert_eq!(browser.opened(), 0);
    }

    #[tokio::test]
    async fn silent_without_caching_goes_interactive() {
        let server = MockServer::start().await;
        mount_grant(&server, "authorization_code", 200, serde_json::json!({"access_token": "AT1"}), 2).await;

        let browser = ScriptedBrowser::echoing();
        let auth = authenticator(config(&server).caching(false).build().unwrap(), &browser);

        auth.get_access_token_silently().await.unwrap();
        auth.get_access_token_silently().await.unwrap();
        assert_eq!(browser.opened(), 2);
        assert!(auth.cached().await.is_none());
    }

    #[tokio::test]
    async fn second_attempt_while_pending_is_rejected() {
        let server = MockServer::start().await;
        let browser = ScriptedBrowser::silent();
        let auth = Arc::new(authenticator(
            config(&server).redirect_timeout(None).build().unwrap(),
            &browser,
        ));

        let first = tokio::spawn({
            let auth = auth.clone();
            async move { auth.get_access_token(false).await }
        });
        while !auth.is_pending() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = auth.get_access_token(false).await.unwrap_err();
        assert_eq!(second.cause, Some(Error::AttemptInProgress));

        assert!(auth.abandon_pending());
        let first = first.await.unwrap().unwrap_err();
        assert_eq!(first.cause, Some(Error::AttemptAbandoned));
        assert!(!auth.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn redirect_wait_times_out() {
        let browser = ScriptedBrowser::silent();
        let config = AuthConfig::builder("my-app")
            .authority("https://login.example.com/authorize")
            .token_endpoint("https://login.example.com/token")
            .redirect_uri("myapp://callback")
            .redirect_timeout(Some(Duration::from_secs(5)))
            .build()
            .unwrap();
        let auth = authenticator(config, &browser);

        let failure = auth.get_access_token(false).await.unwrap_err();
        assert_eq!(failure.cause, Some(Error::RedirectTimeout(5)));
        assert!(!auth.is_pending());
    }

    #[tokio::test]
    async fn sign_out_clears_cache() {
        let server = MockServer::start().await;
        let browser = ScriptedBrowser::silent();
        let auth = authenticator(config(&server).build().unwrap(), &browser);
        seed_cache(
            &auth,
            vec![TokenInfo::new("AT0", TokenRole::Access, Some(now_millis() + 60_000))],
        )
        .await;

        auth.sign_out().await.unwrap();
        assert!(auth.cached().await.is_none());
        assert_eq!(auth.phase(), AuthPhase::Idle);
    }

    #[test]
    fn authorization_code_requires_code() {
        let url = Url::parse("myapp://callback?state=abc").unwrap();
        assert!(matches!(
            authorization_code(&url, Some("abc")),
            Err(Error::InvalidResponse(_))
        ));
        let url = Url::parse("myapp://callback?code=C1").unwrap();
        assert_eq!(authorization_code(&url, None).unwrap(), "C1");
        assert!(matches!(
            authorization_code(&url, Some("abc")),
            Err(Error::Security(SecurityError::StateMismatch { .. }))
        ));
    }

    mod identity {
        use base64::Engine;
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};

        use super::*;
        use crate::cache::ExpiringCache;
        use crate::discovery::{DiscoveryCache, DiscoveryPolicy, sample_document};
        use crate::storage::{BlobStore, MemoryBlobStore};
        use crate::token_cache::TokenCache;

        const SECRET: &[u8] = b"native-auth-test-signing-secret!!";

        fn id_token(issuer: &str) -> String {
            let header = Header {
                kid: Some("k1".into()),
                ..Header::new(Algorithm::HS256)
            };
            let claims = serde_json::json!({
                "iss": issuer,
                "sub": "alice",
                "aud": "my-app",
                "exp": now_millis() / 1000 + 600
            });
            encode(&header, &claims, &EncodingKey::from_secret(SECRET)).unwrap()
        }

        #[tokio::test]
        async fn issued_identity_token_validates_lazily() {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/.well-known/openid-configuration"))
                .respond_with(ResponseTemplate::new(200).set_body_json(sample_document(&server.uri())))
                .mount(&server)
                .await;
            Mock::given(method("GET"))
                .and(path("/jwks"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "keys": [{"kty": "oct", "kid": "k1", "alg": "HS256", "k": URL_SAFE_NO_PAD.encode(SECRET)}]
                })))
                .expect(1)
                .mount(&server)
                .await;
            mount_grant(
                &server,
                "authorization_code",
                200,
                serde_json::json!({"access_token": "AT1", "id_token": id_token(&server.uri())}),
                1,
            )
            .await;

            let resolver = Arc::new(DiscoveryResolver::new(
                reqwest::Client::new(),
                DiscoveryPolicy::default(),
                Arc::new(DiscoveryCache::new()),
            ));
            let browser = ScriptedBrowser::echoing();
            let config = config(&server)
                .request_identity_token(true)
                .auto_validate_tokens(true)
                .build()
                .unwrap();
            let auth = Authenticator::new(config, browser.clone()).with_discovery(resolver.clone());
            let _ = browser.handle.set(auth.redirect_handle());

            let result = auth.get_access_token(false).await.unwrap();
            assert_eq!(resolver.cache().current().await.unwrap().issuer, server.uri());

            let id_token = result.id_token().unwrap();
            assert!(id_token.has_validator());
            assert!(id_token.is_valid().await);
            assert!(id_token.is_valid().await);
        }

        #[tokio::test]
        async fn reloaded_identity_token_is_validated_against_pinned_issuer() {
            let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
            let build = || {
                let cache = TokenCache::new(ExpiringCache::new().with_store(store.clone(), "tokens"));
                AuthConfig::builder("my-app")
                    .authority("https://login.example.com/authorize")
                    .token_endpoint("https://login.example.com/token")
                    .redirect_uri("myapp://callback")
                    .issuer("https://login.example.com")
                    .request_identity_token(true)
                    .auto_validate_tokens(true)
                    .token_cache(Arc::new(cache))
                    .build()
                    .unwrap()
            };
            let resolver = Arc::new(DiscoveryResolver::new(
                reqwest::Client::new(),
                DiscoveryPolicy::default(),
                Arc::new(DiscoveryCache::new()),
            ));

            // Written by one process
            let first = Authenticator::new(build(), ScriptedBrowser::echoing());
            seed_cache(
                &first,
                vec![
                    TokenInfo::new("AT1", TokenRole::Access, Some(now_millis() + 600_000)),
                    TokenInfo::new(id_token("https://attacker.example"), TokenRole::Identity, None),
                ],
            )
            .await;

            // Read back by the next, over the same store
            let browser = ScriptedBrowser::echoing();
            let second = Authenticator::new(build(), browser.clone()).with_discovery(resolver);
            let result = second.get_access_token(true).await.unwrap();
            assert_eq!(browser.opened(), 0);

            let id_token = result.id_token().unwrap();
            assert!(id_token.has_validator());
            assert!(matches!(
                id_token.validate().await,
                Err(Error::Security(SecurityError::IssuerMismatch(_)))
            ));
            assert!(!id_token.is_valid().await);
        }
    }
}
