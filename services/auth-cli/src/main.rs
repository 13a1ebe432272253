//! Native auth CLI
//!
//! Host binary for the native-auth engine:
//! 1. Loads the client registration from TOML
//! 2. Resolves endpoints through discovery when not configured explicitly
//! 3. Returns cached tokens, refreshes them, or runs the interactive flow
//!    with a loopback redirect listener
//! 4. Prints a JSON summary of the result
//!
//! Flags: `--config <path>`, `--interactive` (skip the cache), `--logout`
//! (remove cached tokens), `--token` (print the raw access token),
//! `--userinfo` (include userinfo claims in the summary).

mod browser;
mod config;
mod loopback;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use native_auth::{
    AuthResult, Authenticator, BlobStore, DiscoveryCache, DiscoveryPolicy, DiscoveryResolver,
    ExpiringCache, FileBlobStore, TokenCache, spawn_clean_task,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::browser::{ConsoleBrowser, spawn_paste_reader};
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let flag = |name: &str| args.iter().any(|a| a == name);
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let http = reqwest::Client::new();
    let store: Option<Arc<dyn BlobStore>> = match &config.cache.dir {
        Some(dir) => Some(Arc::new(
            FileBlobStore::open(dir)
                .await
                .with_context(|| format!("failed to open cache directory {}", dir.display()))?,
        )),
        None => None,
    };

    let resolver = config.issuer.authority.as_ref().map(|_| {
        let cache = match &store {
            Some(store) => DiscoveryCache::new().with_store(store.clone()),
            None => DiscoveryCache::new(),
        };
        Arc::new(DiscoveryResolver::new(
            http.clone(),
            DiscoveryPolicy::default(),
            Arc::new(cache),
        ))
    });

    let document = match (&resolver, &config.issuer.authority) {
        (Some(resolver), Some(authority)) if config.needs_discovery() => Some(
            resolver
                .document(authority, false, true)
                .await
                .with_context(|| format!("failed to resolve discovery document for {authority}"))?,
        ),
        _ => None,
    };

    let token_cache = Arc::new(token_cache(&config, store.as_ref()).await?);
    let sweeper = spawn_clean_task(
        token_cache.entries(),
        Duration::from_secs(config.cache.clean_interval_secs),
    );

    let auth_config = config
        .auth_builder(document.as_deref())?
        .token_cache(token_cache)
        .build()
        .context("invalid client configuration")?;
    info!(
        client_id = %auth_config.client_id(),
        redirect_uri = %auth_config.redirect_uri(),
        caching = auth_config.caching(),
        "configuration loaded"
    );

    let mut authenticator =
        Authenticator::new(auth_config, Arc::new(ConsoleBrowser)).with_http_client(http);
    if let Some(resolver) = resolver {
        authenticator = authenticator.with_discovery(resolver);
    }

    if flag("--logout") {
        authenticator
            .sign_out()
            .await
            .context("failed to remove cached tokens")?;
        println!("{}", serde_json::json!({ "signed_out": true }));
        return Ok(());
    }

    let listener = start_redirect_delivery(&authenticator).await?;

    let outcome = if flag("--interactive") {
        authenticator.get_access_token(false).await
    } else {
        authenticator.get_access_token_silently().await
    };
    if let Some(listener) = listener {
        listener.abort();
    }
    sweeper.abort();

    let result = outcome.context("authorization failed")?;
    if flag("--token") {
        let access = result
            .access_token()
            .context("authorization returned no access token")?;
        println!("{}", access.value());
        return Ok(());
    }

    let mut summary = summarize(&result).await;
    if flag("--userinfo") {
        match authenticator.user_info(&result).await {
            Ok(info) => summary["userinfo"] = serde_json::to_value(&info)?,
            Err(e) => warn!(error = %e, "failed to fetch user information"),
        }
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

/// Token cache backed by the configured directories.
async fn token_cache(config: &Config, store: Option<&Arc<dyn BlobStore>>) -> Result<TokenCache> {
    let mut entries = ExpiringCache::new();
    if let Some(store) = store {
        entries = entries.with_store(store.clone(), "tokens");
    }

    let mut cache = TokenCache::new(entries);
    if let Some(dir) = &config.cache.secure_dir {
        let secure = FileBlobStore::open(dir)
            .await
            .with_context(|| format!("failed to open secure directory {}", dir.display()))?;
        cache = cache.with_secure_storage(Arc::new(secure));
    }
    Ok(cache)
}

/// Listen on the loopback redirect address, or read pasted redirects from
/// stdin for any other redirect URI.
async fn start_redirect_delivery(
    authenticator: &Authenticator,
) -> Result<Option<tokio::task::JoinHandle<()>>> {
    let handle = authenticator.redirect_handle();
    let Some(addr) = loopback::loopback_addr(handle.expected()) else {
        spawn_paste_reader(handle);
        return Ok(None);
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind redirect listener on {addr}"))?;
    info!(%addr, "listening for authorization redirect");

    let router = loopback::build_router(handle);
    Ok(Some(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "redirect listener failed");
        }
    })))
}

/// JSON summary of a result. Never includes token values.
async fn summarize(result: &AuthResult) -> serde_json::Value {
    let identity_valid = match result.id_token() {
        Some(id_token) if id_token.has_validator() => Some(id_token.validate().await.is_ok()),
        _ => None,
    };
    serde_json::json!({
        "access_token_expires": result.expires(),
        "has_refresh_token": result.refresh_token().is_some(),
        "has_identity_token": result.id_token().is_some(),
        "identity_token_valid": identity_valid,
    })
}
