//! Pending redirect correlation
//!
//! One interactive attempt may wait for a redirect at a time. The attempt
//! claims the slot with a ticket and holds the receiving half of a oneshot
//! channel; the host reports redirect URIs through a [`RedirectHandle`].
//! A URI whose scheme and authority differ from the configured redirect URI
//! is ignored and leaves the slot untouched.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

struct Pending {
    ticket: Uuid,
    sender: oneshot::Sender<Url>,
}

/// Single-occupancy completion slot shared by an authenticator and its
/// redirect handles.
#[derive(Clone, Default)]
pub(crate) struct PendingRedirect {
    slot: Arc<Mutex<Option<Pending>>>,
}

impl PendingRedirect {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Pending>> {
        // The guarded data is a plain Option, valid even after a panic.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for a new attempt.
    ///
    /// Fails with `AttemptInProgress` while another attempt is still waiting.
    pub(crate) fn begin(&self) -> Result<PendingAttempt> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|pending| !pending.sender.is_closed()) {
            return Err(Error::AttemptInProgress);
        }

        let (sender, receiver) = oneshot::channel();
        let ticket = Uuid::new_v4();
        *slot = Some(Pending { ticket, sender });
        debug!(%ticket, "pending redirect registered");
        Ok(PendingAttempt {
            owner: self.clone(),
            ticket,
            receiver: Some(receiver),
        })
    }

    /// Drop whatever attempt is pending. Its waiter fails with
    /// `AttemptAbandoned`. Returns whether an attempt was pending.
    pub(crate) fn abandon(&self) -> bool {
        let abandoned = self.lock().take();
        if let Some(pending) = &abandoned {
            debug!(ticket = %pending.ticket, "pending redirect abandoned");
        }
        abandoned.is_some()
    }

    /// Whether an attempt is waiting for its redirect.
    pub(crate) fn is_pending(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|pending| !pending.sender.is_closed())
    }

    fn complete(&self, url: Url) -> bool {
        let Some(pending) = self.lock().take() else {
            return false;
        };
        debug!(ticket = %pending.ticket, "pending redirect completed");
        pending.sender.send(url).is_ok()
    }

    fn release(&self, ticket: Uuid) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|pending| pending.ticket == ticket) {
            *slot = None;
        }
    }
}

/// An attempt's claim on the slot. Dropping it frees the slot if the attempt
/// still owns it.
pub(crate) struct PendingAttempt {
    owner: PendingRedirect,
    ticket: Uuid,
    receiver: Option<oneshot::Receiver<Url>>,
}

impl PendingAttempt {
    /// Wait for the redirect URI.
    pub(crate) async fn wait(&mut self) -> Result<Url> {
        let receiver = self.receiver.as_mut().ok_or(Error::AttemptAbandoned)?;
        let url = receiver.await.map_err(|_| Error::AttemptAbandoned);
        self.receiver = None;
        url
    }
}

impl Drop for PendingAttempt {
    fn drop(&mut self) {
        self.owner.release(self.ticket);
    }
}

/// Host-facing delivery point for terminal redirect URIs.
#[derive(Clone)]
pub struct RedirectHandle {
    pending: PendingRedirect,
    expected: Url,
}

impl RedirectHandle {
    pub(crate) fn new(pending: PendingRedirect, expected: Url) -> Self {
        Self { pending, expected }
    }

    /// The redirect URI this handle accepts.
    pub fn expected(&self) -> &Url {
        &self.expected
    }

    /// Report a redirect URI received by the host.
    ///
    /// Returns `true` when it completed the pending attempt. Unparseable or
    /// non-matching URIs, or no pending attempt, are a no-op returning
    /// `false`.
    pub fn deliver(&self, uri: &str) -> bool {
        let Ok(url) = Url::parse(uri) else {
            debug!("ignored unparseable redirect");
            return false;
        };
        if !same_origin(&url, &self.expected) {
            debug!(scheme = url.scheme(), "ignored redirect for another target");
            return false;
        }
        self.pending.complete(url)
    }
}

fn same_origin(url: &Url, expected: &Url) -> bool {
    url.scheme() == expected.scheme()
        && url.username() == expected.username()
        && url.host_str().map(str::to_ascii_lowercase)
            == expected.host_str().map(str::to_ascii_lowercase)
        && url.port_or_known_default() == expected.port_or_known_default()
}
