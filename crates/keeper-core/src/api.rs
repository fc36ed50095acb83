//! Transport seam between the coordinator and a cluster instance.
//!
//! [`VaultApi`] is one request per method with no retry and no
//! interpretation beyond decoding. [`crate::client::InstanceClient`] layers
//! retry and the unseal loop on top. [`Connector`] builds a transport for an
//! instance address, so the coordinator and the policy controller never
//! construct HTTP clients themselves.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;
use crate::root_token::RootToken;

/// Response of `PUT /v1/sys/init`.
#[derive(Clone, Deserialize)]
pub struct InitResponse {
    /// Unseal shares, base64.
    #[serde(default)]
    pub keys_base64: Vec<String>,
    /// Root token.
    pub root_token: String,
}

impl std::fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys_base64", &self.keys_base64.len())
            .finish_non_exhaustive()
    }
}

/// Response of `GET /v1/sys/seal-status` and `PUT /v1/sys/unseal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the instance is sealed.
    pub sealed: bool,
    /// Unseal threshold.
    #[serde(rename = "t", default)]
    pub threshold: u32,
    /// Total shares.
    #[serde(rename = "n", default)]
    pub shares: u32,
    /// Shares accepted so far toward the threshold.
    #[serde(default)]
    pub progress: u32,
}

/// Live state of a token as reported by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenInfo {
    /// Remaining lifetime in seconds.
    pub ttl_seconds: u64,
    /// Whether the token may be renewed.
    pub renewable: bool,
}

/// Lifetime of a token to create. Exactly one of TTL or period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLifetime {
    /// Hard expiry after the given seconds.
    Ttl(u64),
    /// Periodic token, renewable by the given seconds indefinitely.
    Period(u64),
}

impl TokenLifetime {
    /// The lifetime in seconds, also the renewal increment.
    #[must_use]
    pub fn seconds(self) -> u64 {
        match self {
            Self::Ttl(s) | Self::Period(s) => s,
        }
    }
}

/// Parameters for a token create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// Policies attached to the token.
    pub policies: Vec<String>,
    /// Display name recorded by the cluster.
    pub display_name: String,
    /// TTL or period.
    pub lifetime: TokenLifetime,
}

/// A single-request transport against one instance.
#[async_trait::async_trait]
pub trait VaultApi: Send + Sync {
    /// Address this transport talks to, for error context and logs.
    fn address(&self) -> &str;

    /// `GET /v1/sys/init`.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn init_status(&self) -> Result<bool, ClusterError>;

    /// `PUT /v1/sys/init`.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, ClusterError>;

    /// `GET /v1/sys/seal-status`.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn seal_status(&self) -> Result<SealStatus, ClusterError>;

    /// `PUT /v1/sys/unseal` with a single key.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn unseal_key(&self, key: &str) -> Result<SealStatus, ClusterError>;

    /// `GET /v1/sys/leader`; `true` when this instance is the active node.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn leader(&self) -> Result<bool, ClusterError>;

    /// `PUT /v1/sys/policy/<name>`.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn put_policy(&self, name: &str, rules: &str) -> Result<(), ClusterError>;

    /// `PUT /v1/auth/token/create`; returns the client token.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn create_token(&self, request: &TokenRequest) -> Result<String, ClusterError>;

    /// `PUT /v1/auth/token/lookup`.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`], [`ClusterError::Rejected`] for an unknown token.
    async fn lookup_token(&self, token: &str) -> Result<TokenInfo, ClusterError>;

    /// `PUT /v1/auth/token/renew`.
    ///
    /// # Errors
    ///
    /// Any [`ClusterError`].
    async fn renew_token(&self, token: &str, increment: u64) -> Result<(), ClusterError>;
}

/// Builds a transport for an instance address.
pub trait Connector: Send + Sync + 'static {
    /// Connect to `address` (a full base URL), authenticating with `token`
    /// when given.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Client`] if the transport cannot be built.
    fn connect(
        &self,
        address: &str,
        token: Option<&RootToken>,
    ) -> Result<Arc<dyn VaultApi>, ClusterError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn seal_status_decodes_vault_field_names() {
        let status: SealStatus =
            serde_json::from_str(r#"{"sealed":true,"t":3,"n":5,"progress":1,"version":"1.15"}"#)
                .unwrap();
        assert_eq!(
            status,
            SealStatus {
                sealed: true,
                threshold: 3,
                shares: 5,
                progress: 1,
            }
        );
    }

    #[test]
    fn init_response_debug_is_redacted() {
        let resp: InitResponse = serde_json::from_str(
            r#"{"keys":["aa"],"keys_base64":["YWE="],"root_token":"s.root"}"#,
        )
        .unwrap();
        let debug = format!("{resp:?}");
        assert!(!debug.contains("YWE="));
        assert!(!debug.contains("s.root"));
    }

    #[test]
    fn lifetime_seconds() {
        assert_eq!(TokenLifetime::Ttl(60).seconds(), 60);
        assert_eq!(TokenLifetime::Period(3_600).seconds(), 3_600);
    }
}
