//! Externally owned authentication token observed by the connection manager.
//!
//! The application keeps the [`CredentialStore`] and updates it as tokens are issued,
//! rotated or revoked. Managers only receive a [`CredentialWatch`]: they read the current
//! value at the moment of each connection attempt and never retain it.

use secrecy::SecretString;
use tokio::sync::watch;

/// Authentication token type. Redacted in debug output.
pub type Credential = SecretString;

/// Application-side owner of the current credential.
#[derive(Debug)]
pub struct CredentialStore {
    tx: watch::Sender<Option<Credential>>,
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CredentialStore {
    #[must_use]
    pub fn new(initial: Option<Credential>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Publish a new token, replacing any previous one.
    pub fn set<S: Into<String>>(&self, token: S) {
        self.tx.send_replace(Some(SecretString::from(token.into())));
    }

    /// Clear the token, e.g. on logout or expiry.
    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// A read-only view to hand to a connection manager.
    #[must_use]
    pub fn watch(&self) -> CredentialWatch {
        CredentialWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only, change-notifying view of a [`CredentialStore`].
#[derive(Debug, Clone)]
pub struct CredentialWatch {
    rx: watch::Receiver<Option<Credential>>,
}

impl CredentialWatch {
    /// A watch that never carries a credential. Connections gated on it never start.
    #[must_use]
    pub fn none() -> Self {
        let (_, rx) = watch::channel(None);
        Self { rx }
    }

    /// The token as of right now, for a single connection attempt.
    pub(crate) fn current(&self) -> Option<Credential> {
        self.rx.borrow().clone()
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Wait for the next change. Returns `false` once the store has been dropped.
    pub(crate) async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
