//! Error types for the authentication engine
//!
//! Every variant carries owned `String` context so the error is `Clone`:
//! single-flight discovery downloads and memoized token validation hand the
//! same outcome to several waiters.

/// Security failures. Always fatal to the current attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("returned state was invalid: expected \"{expected}\", received \"{received}\"")]
    StateMismatch { expected: String, received: String },

    #[error("HTTPS required: {0}")]
    HttpsRequired(String),

    #[error("issuer mismatch: {0}")]
    IssuerMismatch(String),

    #[error("endpoint belongs to a different authority: {0}")]
    EndpointMismatch(String),

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("no signing key found for kid \"{0}\"")]
    KeyNotFound(String),

    #[error("unsupported signing algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid token signature: {0}")]
    InvalidSignature(String),

    #[error("invalid audience: {0}")]
    InvalidAudience(String),

    #[error("token expired: {0}")]
    Expired(String),

    #[error("token not yet valid: {0}")]
    NotYetValid(String),

    #[error("missing required claim: {0}")]
    MissingClaim(String),
}

/// Errors from authentication operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("malformed URL: {0}")]
    MalformedUrl(String),

    #[error("HTTP request failed: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Protocol { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("key already cached: \"{0}\"")]
    Conflict(String),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("an interactive authorization is already pending")]
    AttemptInProgress,

    #[error("the pending authorization was abandoned")]
    AttemptAbandoned,

    #[error("no redirect received within {0} seconds")]
    RedirectTimeout(u64),

    #[error("could not open browser: {0}")]
    Browser(String),
}

impl Error {
    /// Whether this error is a security failure (never downgraded or retried).
    pub fn is_security(&self) -> bool {
        matches!(self, Error::Security(_))
    }
}

/// Result alias for auth operations. The authenticator boundary overrides the
/// error type with [`AuthFailure`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Uniform failure value returned across the authenticator boundary.
///
/// Carries a message suitable for display plus the underlying cause when
/// there is one.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct AuthFailure {
    pub message: String,
    #[source]
    pub cause: Option<Error>,
}

impl AuthFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause(message: impl Into<String>, cause: Error) -> Self {
        Self {
            message: message.into(),
            cause: Some(cause),
        }
    }
}
