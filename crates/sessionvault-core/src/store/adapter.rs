use std::sync::Arc;

use tracing::warn;

use super::CredentialStore;

/// String-keyed storage capability expected by the identity provider client.
///
/// Implementations never fail: local storage problems read as "no value"
/// and writes that cannot be completed are dropped.
pub trait SessionStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
}

/// Adapts [`CredentialStore`] to [`SessionStorage`].
///
/// Values pass through untouched; the adapter does not parse or rewrite the
/// payload it is given.
#[derive(Debug, Clone)]
pub struct StorageAdapter {
    store: Arc<CredentialStore>,
}

impl StorageAdapter {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }
}

impl SessionStorage for StorageAdapter {
    fn get_item(&self, key: &str) -> Option<String> {
        let bytes = self.store.get(key)?;
        match String::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, "Stored value is not UTF-8, ignoring");
                None
            }
        }
    }

    fn set_item(&self, key: &str, value: &str) {
        if let Err(e) = self.store.set(key, value.as_bytes()) {
            warn!(key, error = %e, "Failed to persist item");
        }
    }

    fn remove_item(&self, key: &str) {
        if let Err(e) = self.store.delete(key) {
            warn!(key, error = %e, "Failed to remove item");
        }
    }
}
