//! In-memory secret store.
//!
//! Stores all secrets in a `BTreeMap` behind a `RwLock`. Nothing is
//! persistent. All data is lost when the process exits. Used by tests and
//! when the controller runs outside an orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{SecretStore, StoreError};

type SecretKey = (String, String);

/// An in-memory secret store keyed by `(namespace, name)`.
///
/// Clones share state, so a test can keep a handle while the controller
/// owns another.
///
/// # Examples
///
/// ```
/// # use keeper_storage::{MemorySecretStore, SecretStore};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemorySecretStore::new();
/// store.put("vault-tokens", "root-token", "s.abc", "kube-system").await.unwrap();
/// let val = store.get("vault-tokens", "root-token", "kube-system").await.unwrap();
/// assert_eq!(val.as_deref(), Some("s.abc"));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    data: Arc<RwLock<BTreeMap<SecretKey, BTreeMap<String, String>>>>,
}

impl MemorySecretStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys of one secret, or `None` if the secret does not exist.
    pub async fn secret(&self, name: &str, namespace: &str) -> Option<BTreeMap<String, String>> {
        let data = self.data.read().await;
        data.get(&(namespace.to_owned(), name.to_owned())).cloned()
    }

    /// Number of secrets currently held.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the store holds no secrets.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(
        &self,
        name: &str,
        key: &str,
        namespace: &str,
    ) -> Result<Option<String>, StoreError> {
        let data = self.data.read().await;
        Ok(data
            .get(&(namespace.to_owned(), name.to_owned()))
            .and_then(|secret| secret.get(key))
            .cloned())
    }

    async fn put(
        &self,
        name: &str,
        key: &str,
        value: &str,
        namespace: &str,
    ) -> Result<(), StoreError> {
        let mut data = self.data.write().await;
        data.entry((namespace.to_owned(), name.to_owned()))
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}
