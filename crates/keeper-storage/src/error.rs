//! Secret store error types.
//!
//! Every variant names the secret and key involved. Values are never
//! included, since they are unseal keys or tokens.

/// Errors that can occur during secret store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Failed to read a secret key.
    #[error("failed to read secret '{namespace}/{name}:{key}': {reason}")]
    Read {
        namespace: String,
        name: String,
        key: String,
        reason: String,
    },

    /// Failed to create or patch a secret key.
    #[error("failed to write secret '{namespace}/{name}:{key}': {reason}")]
    Write {
        namespace: String,
        name: String,
        key: String,
        reason: String,
    },

    /// A stored value was not valid UTF-8.
    #[error("secret '{namespace}/{name}:{key}' is not valid UTF-8")]
    Decode {
        namespace: String,
        name: String,
        key: String,
    },

    /// The backend could not be constructed or reached at all.
    #[error("secret store backend unavailable: {reason}")]
    Backend { reason: String },
}
