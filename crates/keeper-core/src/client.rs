//! Per-instance client with bounded retry.
//!
//! Status reads and token lookups go through the [`RetryPolicy`].
//! `initialize` is never retried: a second init against an instance that
//! accepted the first one would fail, and the first response's shares would
//! already be lost. `unseal` submits keys one at a time and stops as soon as
//! the instance reports unsealed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::api::{SealStatus, TokenInfo, TokenRequest, VaultApi};
use crate::error::ClusterError;
use crate::instance::QuorumSecret;
use crate::retry::RetryPolicy;
use crate::root_token::RootToken;

/// A retrying client bound to one instance.
#[derive(Clone)]
pub struct InstanceClient {
    api: Arc<dyn VaultApi>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for InstanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceClient")
            .field("address", &self.api.address())
            .field("retry", &self.retry)
            .finish()
    }
}

impl InstanceClient {
    /// Wrap a transport.
    #[must_use]
    pub fn new(api: Arc<dyn VaultApi>, retry: RetryPolicy) -> Self {
        Self { api, retry }
    }

    /// Address of the instance.
    #[must_use]
    pub fn address(&self) -> &str {
        self.api.address()
    }

    /// Whether the instance is initialized.
    ///
    /// # Errors
    ///
    /// The last error once the retry policy gives up.
    pub async fn init_status(&self) -> Result<bool, ClusterError> {
        self.retry
            .run(self.address(), "init-status", || self.api.init_status())
            .await
    }

    /// Current seal state.
    ///
    /// # Errors
    ///
    /// The last error once the retry policy gives up.
    pub async fn seal_status(&self) -> Result<SealStatus, ClusterError> {
        self.retry
            .run(self.address(), "seal-status", || self.api.seal_status())
            .await
    }

    /// Whether the instance is the active node.
    ///
    /// # Errors
    ///
    /// The last error once the retry policy gives up.
    pub async fn leader_status(&self) -> Result<bool, ClusterError> {
        self.retry
            .run(self.address(), "leader-status", || self.api.leader())
            .await
    }

    /// Initialize the instance, one attempt only.
    ///
    /// # Errors
    ///
    /// Any transport error, or [`ClusterError::Decode`] if the response
    /// carries fewer shares than requested or no root token.
    pub async fn initialize(&self, shares: u8, threshold: u8) -> Result<QuorumSecret, ClusterError> {
        info!(address = self.address(), shares, threshold, "initializing instance");
        let resp = self.api.init(shares, threshold).await?;

        if resp.keys_base64.len() != usize::from(shares) || resp.root_token.is_empty() {
            return Err(ClusterError::Decode {
                address: self.address().to_owned(),
                operation: "init",
                reason: format!(
                    "expected {shares} shares and a root token, got {} shares",
                    resp.keys_base64.len()
                ),
            });
        }

        Ok(QuorumSecret {
            shares: resp.keys_base64,
            threshold,
            root_token: RootToken::new(resp.root_token),
        })
    }

    /// Submit a comma-delimited key set until the instance unseals.
    ///
    /// Empty entries are skipped. An already unsealed instance returns
    /// without submitting anything.
    ///
    /// # Errors
    ///
    /// [`ClusterError::InsufficientShares`] if every key was submitted and
    /// the instance is still sealed; any error from a key submission.
    pub async fn unseal(&self, keys: &str) -> Result<SealStatus, ClusterError> {
        let mut status = self.seal_status().await?;
        if !status.sealed {
            debug!(address = self.address(), "already unsealed");
            return Ok(status);
        }

        let mut submitted = 0usize;
        for key in keys.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            status = self.api.unseal_key(key).await?;
            submitted += 1;
            debug!(
                address = self.address(),
                submitted,
                progress = status.progress,
                threshold = status.threshold,
                "unseal key accepted"
            );
            if !status.sealed {
                info!(address = self.address(), submitted, "instance unsealed");
                return Ok(status);
            }
        }

        warn!(
            address = self.address(),
            submitted,
            progress = status.progress,
            threshold = status.threshold,
            "ran out of unseal keys"
        );
        Err(ClusterError::InsufficientShares {
            address: self.address().to_owned(),
            submitted,
            progress: status.progress,
            threshold: status.threshold,
        })
    }

    /// Create or replace a named policy.
    ///
    /// # Errors
    ///
    /// Any transport error.
    pub async fn put_policy(&self, name: &str, rules: &str) -> Result<(), ClusterError> {
        self.api.put_policy(name, rules).await
    }

    /// Create a token; returns the client token.
    ///
    /// # Errors
    ///
    /// Any transport error.
    pub async fn create_token(&self, request: &TokenRequest) -> Result<String, ClusterError> {
        self.api.create_token(request).await
    }

    /// Live TTL and renewability of a token.
    ///
    /// # Errors
    ///
    /// The last error once the retry policy gives up, or a rejection for a
    /// revoked or expired token.
    pub async fn lookup_token(&self, token: &str) -> Result<TokenInfo, ClusterError> {
        self.retry
            .run(self.address(), "token-lookup", || self.api.lookup_token(token))
            .await
    }

    /// Renew a token by `increment` seconds.
    ///
    /// # Errors
    ///
    /// Any transport error.
    pub async fn renew_token(&self, token: &str, increment: u64) -> Result<(), ClusterError> {
        self.api.renew_token(token, increment).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::sim::SimInstance;

    fn client(sim: &Arc<SimInstance>) -> InstanceClient {
        InstanceClient::new(
            sim.session(None),
            RetryPolicy {
                interval: Duration::from_millis(10),
                max_attempts: 3,
                timeout: Duration::from_secs(1),
            },
        )
    }

    // ── initialize ───────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_returns_requested_shares() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        let secret = client(&sim).initialize(5, 3).await.unwrap();
        assert_eq!(secret.shares.len(), 5);
        assert_eq!(secret.threshold, 3);
        assert!(!secret.root_token.expose().is_empty());
        assert_eq!(sim.init_calls(), 1);
    }

    #[tokio::test]
    async fn initialize_is_not_retried() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        sim.fail_next(3);
        assert!(client(&sim).initialize(5, 3).await.is_err());
        assert_eq!(sim.init_calls(), 0);
        assert_eq!(sim.failed_calls(), 1);
    }

    // ── unseal ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unseal_with_threshold_keys_unseals() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        let c = client(&sim);
        let secret = c.initialize(5, 3).await.unwrap();

        let status = c.unseal(&secret.joined_shares()).await.unwrap();
        assert!(!status.sealed);
        // Stops after the threshold (3) keys.
        assert_eq!(sim.unseal_calls(), 3);
    }

    #[tokio::test]
    async fn unseal_with_too_few_keys_is_insufficient() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        let c = client(&sim);
        let secret = c.initialize(5, 3).await.unwrap();
        let two = secret.shares[..2].join(",");

        let err = c.unseal(&two).await.unwrap_err();
        match err {
            ClusterError::InsufficientShares {
                submitted,
                progress,
                threshold,
                ..
            } => {
                assert_eq!(submitted, 2);
                assert_eq!(progress, 2);
                assert_eq!(threshold, 3);
            }
            other => unreachable!("unexpected error: {other}"),
        }
        assert!(sim.is_sealed());
    }

    #[tokio::test]
    async fn unseal_skips_empty_entries() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        let c = client(&sim);
        let secret = c.initialize(3, 2).await.unwrap();
        let keys = format!(",{},,{},", secret.shares[0], secret.shares[1]);

        assert!(!c.unseal(&keys).await.unwrap().sealed);
        assert_eq!(sim.unseal_calls(), 2);
    }

    #[tokio::test]
    async fn unseal_when_already_unsealed_submits_nothing() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        let c = client(&sim);
        let secret = c.initialize(3, 2).await.unwrap();
        c.unseal(&secret.joined_shares()).await.unwrap();
        let before = sim.unseal_calls();

        c.unseal("").await.unwrap();
        assert_eq!(sim.unseal_calls(), before);
    }

    // ── retry ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn status_reads_retry_transient_failures() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        sim.fail_next(2);
        assert!(!client(&sim).init_status().await.unwrap());
        assert_eq!(sim.failed_calls(), 2);
    }

    #[tokio::test]
    async fn status_reads_give_up_after_max_attempts() {
        let sim = SimInstance::new("https://10.0.0.1:8243");
        sim.fail_next(10);
        assert!(client(&sim).seal_status().await.unwrap_err().is_transient());
        assert_eq!(sim.failed_calls(), 3);
    }
}
