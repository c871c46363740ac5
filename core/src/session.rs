/// Session credential holder shared with the auth layer
use crate::model::Credential;
use tokio::sync::watch;
use tracing::info;

/// Publishes the current credential. Sign-in, token rotation and sign-out
/// all go through here; the coordinator follows the changes.
#[derive(Clone)]
pub struct SessionWatch {
    tx: watch::Sender<Option<Credential>>,
}

impl SessionWatch {
    pub fn new(initial: Option<Credential>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Replace the credential. Setting the same value does not notify.
    pub fn set(&self, credential: Credential) {
        self.tx.send_if_modified(|current| {
            if current.as_ref() == Some(&credential) {
                return false;
            }
            info!("Session credential set for {}", credential.user_id);
            *current = Some(credential);
            true
        });
    }

    pub fn clear(&self) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                return false;
            }
            info!("Session cleared");
            *current = None;
            true
        });
    }

    pub fn current(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

impl Default for SessionWatch {
    fn default() -> Self {
        Self::new(None)
    }
}
