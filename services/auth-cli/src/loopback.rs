//! Loopback redirect listener
//!
//! When the redirect URI is `http://127.0.0.1:<port>/...` (or `localhost`,
//! `[::1]`) the CLI listens on that address and hands every request for the
//! redirect path to the authenticator's [`RedirectHandle`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};
use native_auth::RedirectHandle;
use tracing::{debug, info};
use url::{Host, Position, Url};

const COMPLETED_PAGE: &str = "<!doctype html><html><body>\
<h1>Signed in</h1><p>You can close this window and return to the terminal.</p>\
</body></html>";

#[derive(Clone)]
struct LoopbackState {
    handle: RedirectHandle,
    /// `scheme://host:port` of the redirect URI
    origin: String,
}

/// Socket address to listen on for `redirect_uri`, when it is a plain-http
/// loopback URI with an explicit port.
pub fn loopback_addr(redirect_uri: &Url) -> Option<SocketAddr> {
    if redirect_uri.scheme() != "http" {
        return None;
    }
    let ip = match redirect_uri.host()? {
        Host::Ipv4(ip) if ip.is_loopback() => IpAddr::V4(ip),
        Host::Ipv6(ip) if ip.is_loopback() => IpAddr::V6(ip),
        Host::Domain(domain) if domain.eq_ignore_ascii_case("localhost") => {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, redirect_uri.port()?))
}

/// Router delivering redirect requests to `handle`.
pub fn build_router(handle: RedirectHandle) -> Router {
    let origin = handle.expected()[..Position::BeforePath].to_string();
    Router::new()
        .fallback(redirect_handler)
        .with_state(LoopbackState { handle, origin })
}

/// Any request: deliver it when it targets the redirect path.
///
/// 200 with a closing page when it completed the pending attempt, 404
/// otherwise (wrong path, nothing pending).
async fn redirect_handler(State(state): State<LoopbackState>, uri: Uri) -> Response {
    if uri.path() != state.handle.expected().path() {
        debug!(path = uri.path(), "ignored request outside redirect path");
        return StatusCode::NOT_FOUND.into_response();
    }

    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let redirect = format!("{}{}", state.origin, path_and_query);
    if state.handle.deliver(&redirect) {
        info!("authorization redirect received");
        (StatusCode::OK, Html(COMPLETED_PAGE)).into_response()
    } else {
        debug!("redirect not consumed, no attempt pending");
        StatusCode::NOT_FOUND.into_response()
    }
}
