//! Policy controller: keeps declared policies written and their tokens alive.
//!
//! Each cycle reads the current root token, lists the declarations, and for
//! every declaration writes the policy body, then creates, renews, recreates,
//! or keeps its token. A policy and its token are never updated atomically;
//! either half missing is repaired on a later cycle.

use std::sync::Arc;
use std::time::Duration;

use keeper_storage::SecretStore;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{Connector, TokenRequest};
use crate::client::InstanceClient;
use crate::error::PolicyError;
use crate::lifecycle::{IssuedToken, TokenAction, decide};
use crate::policy::{PolicyDeclaration, PolicySource, ValidatedPolicy};
use crate::retry::RetryPolicy;
use crate::root_token::RootTokenWatch;

/// Sweep restarts allowed per cycle when the root token rotates mid-sweep.
pub const MAX_SWEEP_RESTARTS: u32 = 3;

/// Controller settings.
#[derive(Debug, Clone)]
pub struct PolicyControllerConfig {
    /// Cluster service address, e.g. `https://vault.kube-system.svc:8243`.
    pub vault_addr: String,
    /// TTL seconds for declarations with neither `ttl` nor `period`.
    pub default_ttl: u64,
}

/// Result of reconciling one declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyOutcome {
    /// No token existed; one was issued.
    Created,
    /// The token was replaced.
    Recreated,
    /// The token was extended.
    Renewed,
    /// Nothing to do.
    Unchanged,
    /// The declaration is invalid and was skipped.
    Skipped { reason: String },
    /// A cluster or store call failed.
    Failed { reason: String },
}

/// Per-policy status row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyStatus {
    pub name: String,
    pub namespace: String,
    #[serde(flatten)]
    pub outcome: PolicyOutcome,
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct PolicyCycleReport {
    /// Outcome per declaration of the final sweep.
    pub statuses: Vec<PolicyStatus>,
    /// No root token was available.
    pub no_root_token: bool,
    /// The declaration listing failed.
    pub listing_failed: bool,
    /// Sweeps restarted after a root token rotation.
    pub restarts: u32,
    /// The cycle stopped early on cancellation.
    pub cancelled: bool,
}

impl PolicyCycleReport {
    /// Outcome for a policy name.
    #[must_use]
    pub fn outcome(&self, name: &str) -> Option<&PolicyOutcome> {
        self.statuses
            .iter()
            .find(|s| s.name == name)
            .map(|s| &s.outcome)
    }
}

/// Reconciles policy declarations against the cluster.
pub struct PolicyController {
    config: PolicyControllerConfig,
    source: Arc<dyn PolicySource>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn SecretStore>,
    retry: RetryPolicy,
    root_token: RootTokenWatch,
    snapshot: watch::Sender<Vec<PolicyStatus>>,
}

impl PolicyController {
    #[must_use]
    pub fn new(
        config: PolicyControllerConfig,
        source: Arc<dyn PolicySource>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SecretStore>,
        retry: RetryPolicy,
        root_token: RootTokenWatch,
    ) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            config,
            source,
            connector,
            store,
            retry,
            root_token,
            snapshot,
        }
    }

    /// Receiver for the per-policy statuses published after every cycle.
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<Vec<PolicyStatus>> {
        self.snapshot.subscribe()
    }

    /// Run cycles every `interval` until cancelled.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "policy controller started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("policy controller shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle(&cancel).await;
                    debug!(
                        policies = report.statuses.len(),
                        restarts = report.restarts,
                        "policy cycle complete"
                    );
                }
            }
        }
    }

    /// One reconcile pass.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> PolicyCycleReport {
        let mut report = PolicyCycleReport::default();

        'sweep: loop {
            let Some(token) = self.root_token.current() else {
                warn!("no root token available, skipping policy cycle");
                report.no_root_token = true;
                break;
            };

            let client = match self.connector.connect(&self.config.vault_addr, Some(&token)) {
                Ok(api) => InstanceClient::new(api, self.retry),
                Err(e) => {
                    error!(error = %e, "cannot build cluster client");
                    break;
                }
            };

            let declarations = match self.source.list().await {
                Ok(d) => d,
                Err(e) => {
                    error!(error = %e, "failed to list policy declarations");
                    report.listing_failed = true;
                    break;
                }
            };

            report.statuses.clear();
            for decl in &declarations {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'sweep;
                }
                if self.root_token.has_changed() && report.restarts < MAX_SWEEP_RESTARTS {
                    report.restarts += 1;
                    info!(restarts = report.restarts, "root token rotated, restarting sweep");
                    continue 'sweep;
                }

                let outcome = match self.reconcile(&client, decl).await {
                    Ok(outcome) => outcome,
                    Err(e @ (PolicyError::InvalidDuration { .. } | PolicyError::InvalidDeclaration { .. })) => {
                        warn!(error = %e, "skipping invalid policy declaration");
                        PolicyOutcome::Skipped {
                            reason: e.to_string(),
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "policy reconcile failed");
                        PolicyOutcome::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                debug!(policy = %decl.name, outcome = ?outcome, "policy reconciled");
                report.statuses.push(PolicyStatus {
                    name: decl.name.clone(),
                    namespace: decl.namespace.clone(),
                    outcome,
                });
            }
            break;
        }

        self.snapshot.send_replace(report.statuses.clone());
        report
    }

    async fn reconcile(
        &self,
        client: &InstanceClient,
        decl: &PolicyDeclaration,
    ) -> Result<PolicyOutcome, PolicyError> {
        let policy = decl.validate(self.config.default_ttl)?;
        let cluster = |source| PolicyError::Cluster {
            policy: policy.name.clone(),
            source,
        };
        let store_err = |source| PolicyError::Store {
            policy: policy.name.clone(),
            source,
        };

        client
            .put_policy(&policy.name, &policy.render_rules())
            .await
            .map_err(cluster)?;

        let Some(existing) = IssuedToken::load(&*self.store, &policy.name, &policy.namespace)
            .await
            .map_err(store_err)?
        else {
            self.issue(client, &policy).await?;
            return Ok(PolicyOutcome::Created);
        };

        let info = match client.lookup_token(&existing.token).await {
            Ok(info) => info,
            Err(e) if e.is_rejected_token() => {
                info!(policy = %policy.name, error = %e, "stored token is no longer valid, recreating");
                self.issue(client, &policy).await?;
                return Ok(PolicyOutcome::Recreated);
            }
            Err(e) => return Err(cluster(e)),
        };

        match decide(info.ttl_seconds, info.renewable, policy.thresholds) {
            TokenAction::Recreate => {
                info!(policy = %policy.name, remaining = info.ttl_seconds, "recreating token");
                self.issue(client, &policy).await?;
                Ok(PolicyOutcome::Recreated)
            }
            TokenAction::Renew => {
                let increment = policy.lifetime.seconds();
                info!(policy = %policy.name, remaining = info.ttl_seconds, increment, "renewing token");
                client
                    .renew_token(&existing.token, increment)
                    .await
                    .map_err(cluster)?;
                Ok(PolicyOutcome::Renewed)
            }
            TokenAction::Keep => Ok(PolicyOutcome::Unchanged),
        }
    }

    async fn issue(
        &self,
        client: &InstanceClient,
        policy: &ValidatedPolicy,
    ) -> Result<(), PolicyError> {
        let token = client
            .create_token(&TokenRequest {
                policies: vec![policy.name.clone()],
                display_name: policy.name.clone(),
                lifetime: policy.lifetime,
            })
            .await
            .map_err(|source| PolicyError::Cluster {
                policy: policy.name.clone(),
                source,
            })?;

        IssuedToken::issued_now(&policy.name, token, policy.lifetime.seconds())
            .persist(&*self.store, &policy.namespace)
            .await
            .map_err(|source| PolicyError::Store {
                policy: policy.name.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_with_tag() {
        let status = PolicyStatus {
            name: "app".to_owned(),
            namespace: "apps".to_owned(),
            outcome: PolicyOutcome::Skipped {
                reason: "bad".to_owned(),
            },
        };
        let json = serde_json::to_value(&status).unwrap_or_default();
        assert_eq!(json["outcome"], "skipped");
        assert_eq!(json["reason"], "bad");
        assert_eq!(json["name"], "app");
    }
}
