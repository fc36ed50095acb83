//! Secret store abstraction for `vault-keeper`.
//!
//! This crate defines the [`SecretStore`] trait: a small named-secret
//! key/value interface that knows nothing about vault instances, quorums, or
//! policies. The bootstrap coordinator escrows unseal shares and the root
//! token through it, and the policy controller persists issued tokens.
//!
//! Two implementations are provided:
//!
//! - [`KubeSecretStore`]: production default, backed by Kubernetes `Secret`
//!   objects (feature `kube-backend`)
//! - [`MemorySecretStore`]: in-memory, for tests and off-cluster runs

mod error;
#[cfg(feature = "kube-backend")]
mod kube_backend;
mod memory;

pub use error::StoreError;
#[cfg(feature = "kube-backend")]
pub use kube_backend::KubeSecretStore;
pub use memory::MemorySecretStore;

/// A pluggable store of named secrets, each holding string keys.
///
/// A secret is addressed by `(namespace, name)` and holds any number of keys.
/// Values are opaque strings; callers that need binary safety base64-encode
/// before calling [`put`](SecretStore::put). Values may be unseal keys or
/// tokens, so implementations must never log them.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Read one key of a named secret.
    ///
    /// Returns `Ok(None)` if either the secret or the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Read`] if the backend fails.
    async fn get(&self, name: &str, key: &str, namespace: &str)
    -> Result<Option<String>, StoreError>;

    /// Write one key of a named secret.
    ///
    /// Idempotent upsert: the secret is created if absent, and only `key` is
    /// patched if it already exists. Other keys are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Write`] if the backend fails.
    async fn put(
        &self,
        name: &str,
        key: &str,
        value: &str,
        namespace: &str,
    ) -> Result<(), StoreError>;
}

/// Location of a single key inside a named secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Secret name.
    pub name: String,
    /// Key within the secret.
    pub key: String,
}

impl SecretRef {
    /// Build a reference from a secret name and key.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for SecretRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.key)
    }
}
