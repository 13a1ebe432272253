//! Console "browser": shows the authorization URL for the user to open.

use native_auth::{BoxFuture, Browser, RedirectHandle, Result};
use tracing::info;
use url::Url;

pub struct ConsoleBrowser;

impl Browser for ConsoleBrowser {
    fn open<'a>(&'a self, url: &'a Url, redirect_uri: &'a Url) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            eprintln!("\nOpen this URL in a browser to sign in:\n\n  {url}\n");
            info!(redirect_uri = %redirect_uri, "waiting for authorization redirect");
            Ok(())
        })
    }
}

/// Read pasted redirect URIs from stdin until one completes the pending
/// attempt. Used when the redirect URI is not a loopback address the CLI can
/// listen on.
///
/// Runs on a plain thread so a blocked read never holds up runtime shutdown.
pub fn spawn_paste_reader(handle: RedirectHandle) {
    std::thread::spawn(move || {
        eprintln!(
            "After signing in, paste the URI you were redirected to ({}):",
            handle.expected()
        );
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if handle.deliver(line) {
                break;
            }
            eprintln!("Not a redirect for {}, try again:", handle.expected());
        }
    });
}
