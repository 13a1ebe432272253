//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `AUTH_CLIENT_ID` overrides the client id from the file.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use native_auth::{AuthConfig, AuthConfigBuilder, DiscoveryDocument};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    pub issuer: IssuerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Client registration
#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    pub redirect_uri: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default = "enabled")]
    pub use_state: bool,
    #[serde(default = "enabled")]
    pub use_pkce: bool,
    #[serde(default)]
    pub request_identity_token: bool,
    #[serde(default)]
    pub auto_validate_tokens: bool,
    /// 0 waits for the redirect indefinitely
    #[serde(default = "default_redirect_timeout")]
    pub redirect_timeout_secs: u64,
}

/// Where the endpoints come from.
///
/// With `authority` set the discovery document supplies any endpoint not
/// given explicitly.
#[derive(Debug, Deserialize)]
pub struct IssuerConfig {
    #[serde(default)]
    pub authority: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
}

/// Token and discovery persistence
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Directory for cached token bundles and discovery documents.
    /// In-memory only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Separate directory for refresh tokens
    #[serde(default)]
    pub secure_dir: Option<PathBuf>,
    #[serde(default = "default_clean_interval")]
    pub clean_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            secure_dir: None,
            clean_interval_secs: default_clean_interval(),
        }
    }
}

fn enabled() -> bool {
    true
}

fn default_redirect_timeout() -> u64 {
    600
}

fn default_clean_interval() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(client_id) = std::env::var("AUTH_CLIENT_ID") {
            config.client.client_id = client_id;
        }

        if config.client.client_id.trim().is_empty() {
            return Err(common::Error::Config("client_id must not be empty".into()));
        }

        let explicit = config.issuer.authorization_endpoint.is_some()
            && config.issuer.token_endpoint.is_some();
        if !explicit && config.issuer.authority.is_none() {
            return Err(common::Error::Config(
                "issuer needs an authority or both authorization_endpoint and token_endpoint"
                    .into(),
            ));
        }

        if config.cache.clean_interval_secs == 0 {
            return Err(common::Error::Config(
                "clean_interval_secs must be greater than 0".into(),
            ));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or AUTH_CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("AUTH_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("native-auth.toml")
    }

    /// Whether the endpoints must come from discovery.
    pub fn needs_discovery(&self) -> bool {
        self.issuer.authorization_endpoint.is_none() || self.issuer.token_endpoint.is_none()
    }

    /// Library builder from this config. Explicit endpoints win over the
    /// ones in `document`.
    pub fn auth_builder(
        &self,
        document: Option<&DiscoveryDocument>,
    ) -> common::Result<AuthConfigBuilder> {
        let client = &self.client;
        let mut builder = match document {
            Some(document) => {
                AuthConfig::from_discovery(document, &client.client_id, &client.redirect_uri)
            }
            None => AuthConfig::builder(&client.client_id).redirect_uri(&client.redirect_uri),
        };
        if let Some(endpoint) = &self.issuer.authorization_endpoint {
            builder = builder.authority(endpoint);
        }
        if let Some(endpoint) = &self.issuer.token_endpoint {
            builder = builder.token_endpoint(endpoint);
        }
        if let Some(authority) = &self.issuer.authority {
            builder = builder.issuer(authority);
        }
        if document.is_none() && self.needs_discovery() {
            return Err(common::Error::Config(
                "endpoints missing and no discovery document available".into(),
            ));
        }

        let timeout = match client.redirect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(builder
            .scope(&client.scope)
            .use_state(client.use_state)
            .use_pkce(client.use_pkce)
            .request_identity_token(client.request_identity_token)
            .auto_validate_tokens(client.auto_validate_tokens)
            .caching(self.cache.enabled)
            .redirect_timeout(timeout))
    }
}
