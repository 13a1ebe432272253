//! Authenticator phases
//!
//! ```text
//! Idle -> TryCache -> TrySilentRefresh -> AwaitingRedirect -> ExchangingCode -> Authorized
//!            |               |                                                    ^
//!            +---------------+--------------------(hit / refreshed)---------------+
//! ```
//!
//! `Failed` is reachable from every phase. Transitions are a pure function so
//! they can be tested without any I/O.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Idle,
    TryCache,
    TrySilentRefresh,
    AwaitingRedirect,
    ExchangingCode,
    Authorized,
    Failed,
}

impl AuthPhase {
    /// Whether an attempt is underway.
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Authorized | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// Caller allows a cached result
    CacheLookup,
    /// Cached access token usable as-is
    CacheHit,
    /// Cached access token expired and a refresh token is available
    RefreshStarted,
    /// Refresh grant returned new tokens
    Refreshed,
    /// Browser opened, waiting on the redirect
    BrowserOpened,
    /// Redirect arrived and passed the state check
    RedirectReceived,
    /// Code exchange returned tokens
    TokensIssued,
    Failure,
    Reset,
}

/// Next phase for `event` in `phase`.
///
/// Any event that makes no sense for the current phase leaves it unchanged.
pub fn advance(phase: AuthPhase, event: AuthEvent) -> AuthPhase {
    use AuthEvent as E;
    use AuthPhase as P;

    match (phase, event) {
        (_, E::Failure) => P::Failed,
        (_, E::Reset) => P::Idle,

        (P::Idle | P::Authorized | P::Failed, E::CacheLookup) => P::TryCache,
        (P::TryCache, E::CacheHit) => P::Authorized,
        (P::TryCache, E::RefreshStarted) => P::TrySilentRefresh,
        (P::TrySilentRefresh, E::Refreshed) => P::Authorized,

        // Interactive attempts start fresh or after any fallback
        (P::Idle | P::Authorized | P::Failed | P::TryCache | P::TrySilentRefresh, E::BrowserOpened) => {
            P::AwaitingRedirect
        }
        (P::AwaitingRedirect, E::RedirectReceived) => P::ExchangingCode,
        (P::ExchangingCode, E::TokensIssued) => P::Authorized,

        (phase, _) => phase,
    }
}
