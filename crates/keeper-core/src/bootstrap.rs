//! Bootstrap and unseal coordinator.
//!
//! Each cycle the coordinator takes a discovery snapshot and walks every
//! instance, in name order, toward unsealed:
//!
//! ```text
//! Unknown ──init_status──▶ Uninitialized ──initialize──▶ Initialized
//!    │                                                       │
//!    └──────────────────────────────────────────────────────▶│
//!                                     seal_status            ▼
//!                        Sealed ◀──────────────────── Initialized
//!                          │ unseal                          │
//!                          ▼                                 ▼
//!                       Unsealed ──leader_status──▶ Leader | Follower
//! ```
//!
//! Failed or Unknown pods, and instances whose status queries keep failing,
//! are evicted when eviction is enabled. A fresh initialize persists the
//! shares and root token before unsealing, then publishes the root token on
//! the hand-off channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use keeper_storage::{SecretRef, SecretStore};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::api::Connector;
use crate::client::InstanceClient;
use crate::error::ClusterError;
use crate::instance::{Instance, InstanceState, InstanceStatus, Target, count_keys};
use crate::registry::InstanceRegistry;
use crate::retry::RetryPolicy;
use crate::root_token::{RootToken, RootTokenPublisher};

/// Coordinator settings.
#[derive(Clone)]
pub struct BootstrapConfig {
    /// Shares requested at initialize.
    pub shares: u8,
    /// Shares required to unseal.
    pub threshold: u8,
    /// Namespace of the escrow secrets.
    pub namespace: String,
    /// Where the comma-joined unseal shares are escrowed.
    pub unseal_secret: SecretRef,
    /// Where the root token is escrowed.
    pub token_secret: SecretRef,
    /// Scheme for instance URLs.
    pub scheme: String,
    /// Port for instance URLs.
    pub port: u16,
    /// Whether instances may be evicted.
    pub eviction: bool,
    /// Consecutive failed cycles before a reachable-looking instance is evicted.
    pub evict_after_failures: u32,
    /// Operator-supplied unseal keys, used when nothing is escrowed.
    pub static_unseal_keys: Option<Zeroizing<String>>,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            shares: 5,
            threshold: 3,
            namespace: "kube-system".to_owned(),
            unseal_secret: SecretRef::new("vault-unseal-keys", "unseal-keys"),
            token_secret: SecretRef::new("vault-tokens", "root-token"),
            scheme: "https".to_owned(),
            port: 8243,
            eviction: false,
            evict_after_failures: 1,
            static_unseal_keys: None,
        }
    }
}

impl std::fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("shares", &self.shares)
            .field("threshold", &self.threshold)
            .field("namespace", &self.namespace)
            .field("unseal_secret", &self.unseal_secret)
            .field("token_secret", &self.token_secret)
            .field("scheme", &self.scheme)
            .field("port", &self.port)
            .field("eviction", &self.eviction)
            .field("evict_after_failures", &self.evict_after_failures)
            .field("static_unseal_keys", &self.static_unseal_keys.is_some())
            .finish()
    }
}

impl BootstrapConfig {
    /// Base URL of an instance at `address`.
    #[must_use]
    pub fn instance_url(&self, address: &str) -> String {
        if address.contains(':') && !address.starts_with('[') {
            // Bare IPv6 literal.
            format!("{}://[{address}]:{}", self.scheme, self.port)
        } else {
            format!("{}://{address}:{}", self.scheme, self.port)
        }
    }
}

/// What one cycle did.
#[derive(Debug, Default)]
pub struct CycleReport {
    /// Every discovered instance with its trail.
    pub instances: Vec<Instance>,
    /// Instances initialized this cycle.
    pub initialized: Vec<String>,
    /// Instances unsealed this cycle.
    pub unsealed: Vec<String>,
    /// Instances evicted this cycle.
    pub evicted: Vec<String>,
    /// Discovery failed; the cycle ran on an empty set.
    pub discovery_failed: bool,
    /// The cycle stopped early on cancellation.
    pub cancelled: bool,
}

impl CycleReport {
    /// Look up an instance by name.
    #[must_use]
    pub fn instance(&self, name: &str) -> Option<&Instance> {
        self.instances.iter().find(|i| i.name == name)
    }
}

enum InitOutcome {
    Initialized,
    Skipped,
}

/// Drives instances to unsealed, one cycle at a time.
pub struct BootstrapCoordinator {
    config: BootstrapConfig,
    registry: Arc<dyn InstanceRegistry>,
    connector: Arc<dyn Connector>,
    store: Arc<dyn SecretStore>,
    retry: RetryPolicy,
    publisher: RootTokenPublisher,
    fresh_shares: Option<Zeroizing<String>>,
    failures: HashMap<String, u32>,
    snapshot: watch::Sender<Vec<InstanceStatus>>,
}

impl BootstrapCoordinator {
    /// Build a coordinator. It becomes the only root token writer.
    #[must_use]
    pub fn new(
        config: BootstrapConfig,
        registry: Arc<dyn InstanceRegistry>,
        connector: Arc<dyn Connector>,
        store: Arc<dyn SecretStore>,
        retry: RetryPolicy,
        publisher: RootTokenPublisher,
    ) -> Self {
        let (snapshot, _) = watch::channel(Vec::new());
        Self {
            config,
            registry,
            connector,
            store,
            retry,
            publisher,
            fresh_shares: None,
            failures: HashMap::new(),
            snapshot,
        }
    }

    /// Receiver for the instance snapshot published after every cycle.
    #[must_use]
    pub fn snapshot(&self) -> watch::Receiver<Vec<InstanceStatus>> {
        self.snapshot.subscribe()
    }

    /// Run cycles every `interval` until cancelled.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "bootstrap coordinator started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("bootstrap coordinator shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let report = self.run_cycle(&cancel).await;
                    debug!(
                        instances = report.instances.len(),
                        initialized = report.initialized.len(),
                        unsealed = report.unsealed.len(),
                        evicted = report.evicted.len(),
                        "bootstrap cycle complete"
                    );
                }
            }
        }
    }

    /// One pass over the discovered instances.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        self.adopt_escrowed_root_token().await;

        let discovered = match self.registry.discover().await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "instance discovery failed, continuing with no instances");
                report.discovery_failed = true;
                BTreeMap::new()
            }
        };

        // Forget failure streaks of instances that are gone.
        self.failures.retain(|name, _| discovered.contains_key(name));

        for (name, entry) in &discovered {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut instance = Instance::new(name, entry);
            match entry.target() {
                Target::Evict => {
                    debug!(instance = %name, phase = ?entry.phase, "instance is not running");
                    self.evict(&mut instance, &mut report).await;
                }
                Target::Skip => {
                    debug!(instance = %name, "instance pending, skipping");
                }
                Target::Connect(address) => {
                    self.drive(&mut instance, address, &mut report).await;
                }
            }
            report.instances.push(instance);
        }

        self.snapshot
            .send_replace(report.instances.iter().map(Instance::status).collect());
        report
    }

    /// Seed the hand-off channel from escrow when nothing was published yet.
    async fn adopt_escrowed_root_token(&self) {
        if self.publisher.current().is_some() {
            return;
        }
        let secret = &self.config.token_secret;
        match self
            .store
            .get(&secret.name, &secret.key, &self.config.namespace)
            .await
        {
            Ok(value) => {
                if let Some(token) = RootToken::from_optional(value.as_deref()) {
                    info!(location = %secret, "adopted escrowed root token");
                    self.publisher.publish(token);
                }
            }
            Err(e) => debug!(error = %e, "could not read escrowed root token"),
        }
    }

    async fn drive(&mut self, instance: &mut Instance, address: &str, report: &mut CycleReport) {
        let url = self.config.instance_url(address);
        let token = self.publisher.current();
        let api = match self.connector.connect(&url, token.as_ref()) {
            Ok(api) => api,
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "cannot build instance client");
                return;
            }
        };
        let client = InstanceClient::new(api, self.retry);

        let initialized = match client.init_status().await {
            Ok(initialized) => initialized,
            Err(e) => return self.status_failure(instance, &e, report).await,
        };

        if !initialized {
            instance.transition(InstanceState::Uninitialized);
            match self.initialize(&client, instance).await {
                InitOutcome::Initialized => report.initialized.push(instance.name.clone()),
                InitOutcome::Skipped => {
                    self.failures.remove(&instance.name);
                    return;
                }
            }
        }
        instance.transition(InstanceState::Initialized);

        let status = match client.seal_status().await {
            Ok(status) => status,
            Err(e) => return self.status_failure(instance, &e, report).await,
        };
        self.failures.remove(&instance.name);

        if status.sealed {
            instance.transition(InstanceState::Sealed);
            let Some(keys) = self.resolve_unseal_keys().await else {
                warn!(instance = %instance.name, "instance is sealed and no unseal keys are available");
                return;
            };
            match client.unseal(&keys).await {
                Ok(_) => {
                    instance.transition(InstanceState::Unsealed);
                    report.unsealed.push(instance.name.clone());
                }
                Err(e @ ClusterError::InsufficientShares { .. }) => {
                    warn!(instance = %instance.name, error = %e, "instance remains sealed");
                    return;
                }
                Err(e) => {
                    warn!(instance = %instance.name, error = %e, "unseal failed");
                    return;
                }
            }
        } else {
            instance.transition(InstanceState::Unsealed);
        }

        match client.leader_status().await {
            Ok(true) => {
                instance.transition(InstanceState::Leader);
                debug!(instance = %instance.name, "instance is the active node");
            }
            Ok(false) => instance.transition(InstanceState::Follower),
            Err(e) => debug!(instance = %instance.name, error = %e, "leader status unavailable"),
        }
    }

    async fn initialize(&mut self, client: &InstanceClient, instance: &Instance) -> InitOutcome {
        let unseal = &self.config.unseal_secret;
        let ns = &self.config.namespace;

        match self.store.get(&unseal.name, &unseal.key, ns).await {
            Ok(Some(escrowed)) if count_keys(&escrowed) >= usize::from(self.config.threshold) => {
                let skip = ClusterError::QuorumAlreadyEstablished {
                    location: format!("{ns}/{unseal}"),
                    shares: count_keys(&escrowed),
                };
                warn!(instance = %instance.name, reason = %skip, "instance reports uninitialized, not initializing");
                return InitOutcome::Skipped;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(instance = %instance.name, error = %e, "escrow lookup failed, not initializing this cycle");
                return InitOutcome::Skipped;
            }
        }

        let secret = match client
            .initialize(self.config.shares, self.config.threshold)
            .await
        {
            Ok(secret) => secret,
            Err(e) => {
                error!(instance = %instance.name, error = %e, "initialize failed");
                return InitOutcome::Skipped;
            }
        };

        let joined = Zeroizing::new(secret.joined_shares());
        if let Err(e) = self.store.put(&unseal.name, &unseal.key, &joined, ns).await {
            error!(
                instance = %instance.name,
                error = %e,
                "failed to escrow unseal shares, keeping them in memory only"
            );
        }
        let token_secret = &self.config.token_secret;
        if let Err(e) = self
            .store
            .put(
                &token_secret.name,
                &token_secret.key,
                secret.root_token.expose(),
                ns,
            )
            .await
        {
            error!(instance = %instance.name, error = %e, "failed to escrow root token");
        }

        info!(
            instance = %instance.name,
            shares = secret.shares.len(),
            threshold = secret.threshold,
            "instance initialized, publishing new root token"
        );
        self.fresh_shares = Some(joined);
        self.publisher.publish(secret.root_token.clone());
        InitOutcome::Initialized
    }

    /// Escrow first, then shares from a fresh initialize, then static keys.
    async fn resolve_unseal_keys(&self) -> Option<Zeroizing<String>> {
        let unseal = &self.config.unseal_secret;
        match self
            .store
            .get(&unseal.name, &unseal.key, &self.config.namespace)
            .await
        {
            Ok(Some(keys)) if count_keys(&keys) > 0 => return Some(Zeroizing::new(keys)),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read escrowed unseal keys"),
        }
        self.fresh_shares
            .clone()
            .or_else(|| self.config.static_unseal_keys.clone())
            .filter(|k| count_keys(k) > 0)
    }

    async fn status_failure(
        &mut self,
        instance: &mut Instance,
        err: &ClusterError,
        report: &mut CycleReport,
    ) {
        let streak = self.failures.entry(instance.name.clone()).or_insert(0);
        *streak = streak.saturating_add(1);
        let streak = *streak;
        warn!(
            instance = %instance.name,
            consecutive_failures = streak,
            error = %err,
            "status query failed"
        );
        if streak >= self.config.evict_after_failures.max(1) {
            self.evict(instance, report).await;
        }
    }

    async fn evict(&mut self, instance: &mut Instance, report: &mut CycleReport) {
        if !self.config.eviction {
            info!(instance = %instance.name, "eviction disabled, leaving instance in place");
            return;
        }
        match self.registry.evict(&instance.name).await {
            Ok(()) => {
                info!(instance = %instance.name, "instance evicted");
                instance.transition(InstanceState::Evicted);
                self.failures.remove(&instance.name);
                report.evicted.push(instance.name.clone());
            }
            Err(e) => warn!(instance = %instance.name, error = %e, "eviction failed"),
        }
    }
}
