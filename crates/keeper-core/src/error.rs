//! Error types for `keeper-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Errors never include unseal keys or tokens, only instance
//! addresses and secret locations.

use keeper_storage::StoreError;

/// Errors from calls against a single cluster instance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClusterError {
    /// Connectivity failure, timeout, or the instance was busy (429/5xx,
    /// including 503 while sealed or in standby). Retried per the retry
    /// policy, then surfaced.
    #[error("transient error from {address} during {operation}: {reason}")]
    Transient {
        address: String,
        operation: &'static str,
        reason: String,
    },

    /// Every supplied unseal key was submitted and the instance is still
    /// sealed. Never retried: the same key set cannot change the outcome.
    #[error(
        "insufficient unseal shares for {address}: submitted {submitted}, progress {progress}/{threshold}"
    )]
    InsufficientShares {
        address: String,
        submitted: usize,
        progress: u32,
        threshold: u32,
    },

    /// Initialization was requested but the quorum secret is already escrowed
    /// in the secret store. Treated as success by the coordinator.
    #[error("quorum already established: {location} holds {shares} escrowed shares")]
    QuorumAlreadyEstablished { location: String, shares: usize },

    /// The instance rejected the request (4xx other than 429). Not retried.
    #[error("{address} rejected {operation} with status {status}: {message}")]
    Rejected {
        address: String,
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The response body did not match the expected shape.
    #[error("failed to decode {operation} response from {address}: {reason}")]
    Decode {
        address: String,
        operation: &'static str,
        reason: String,
    },

    /// The transport for an instance could not be constructed.
    #[error("failed to build client for {address}: {reason}")]
    Client { address: String, reason: String },
}

impl ClusterError {
    /// Whether another attempt could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Whether the instance answered with an authorization or not-found
    /// rejection, e.g. a lookup of a revoked or expired token.
    #[must_use]
    pub fn is_rejected_token(&self) -> bool {
        matches!(
            self,
            Self::Rejected {
                status: 400 | 403 | 404,
                ..
            }
        )
    }
}

/// A malformed duration string (TTL, period, or threshold).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{input}': {reason}")]
pub struct InvalidDuration {
    /// The string as supplied.
    pub input: String,
    /// What was wrong with it.
    pub reason: String,
}

/// Errors from instance discovery and eviction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DiscoveryError {
    /// The orchestrator listing call failed.
    #[error("instance listing failed for selector '{selector}': {reason}")]
    Listing { selector: String, reason: String },

    /// No host of a static instance list could be resolved.
    #[error("none of the {hosts} configured hosts resolved")]
    NoHostResolved { hosts: usize },

    /// The orchestrator refused or failed to delete an instance.
    #[error("failed to evict instance '{name}': {reason}")]
    Eviction { name: String, reason: String },

    /// The registry has no orchestrator to evict through.
    #[error("registry does not support eviction (instance '{name}')")]
    EvictionUnsupported { name: String },
}

/// Errors from reading the declared policy set.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to list policy declarations from {source_name}: {reason}")]
pub struct SourceError {
    /// Human-readable name of the declaration source.
    pub source_name: String,
    /// What went wrong.
    pub reason: String,
}

/// Errors from reconciling one policy declaration.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A TTL, period, or threshold did not parse.
    #[error("policy '{policy}': {source}")]
    InvalidDuration {
        policy: String,
        #[source]
        source: InvalidDuration,
    },

    /// The declaration is structurally invalid.
    #[error("policy '{policy}' is invalid: {reason}")]
    InvalidDeclaration { policy: String, reason: String },

    /// A cluster call failed.
    #[error("policy '{policy}': {source}")]
    Cluster {
        policy: String,
        #[source]
        source: ClusterError,
    },

    /// Reading or writing the issued token failed.
    #[error("policy '{policy}': {source}")]
    Store {
        policy: String,
        #[source]
        source: StoreError,
    },
}
