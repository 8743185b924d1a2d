//! Credential store.
//!
//! Holds the bearer token supplied by the host's credential provider. The
//! token is immutable for the lifetime of a session; a server-reported
//! unauthorized response invalidates it, and every authenticated component
//! stops using it until the host supplies a replacement.

use tokio::sync::watch;

/// Shared bearer-token state. Cheap to clone; all clones observe the same
/// token.
#[derive(Clone)]
pub struct Credentials {
    tx: watch::Sender<Option<String>>,
    rx: watch::Receiver<Option<String>>,
}

impl Credentials {
    pub fn new(initial: Option<String>) -> Self {
        let (tx, rx) = watch::channel(initial);
        Self { tx, rx }
    }

    /// Current token, if one is held.
    pub fn token(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Install a fresh token (host re-authenticated).
    pub fn supply(&self, token: String) {
        self.tx.send_replace(Some(token));
    }

    /// Drop the current token after a server-reported unauthorized response.
    /// Subsequent `token()` calls return None until `supply` is called.
    pub fn invalidate(&self) {
        self.tx.send_replace(None);
    }

    /// Wait until the stored token changes. Used by tasks that pause on
    /// invalidation and resume once the host re-authenticates.
    pub async fn changed(&mut self) {
        // A closed channel means the process is shutting down; treat it the
        // same as "nothing changed" and let the caller's cancellation fire.
        let _ = self.rx.changed().await;
    }
}
