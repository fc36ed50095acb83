//! Behavioral tests for the bootstrap coordinator against simulated
//! instances, a fixed registry, and the in-memory secret store.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use keeper_core::bootstrap::{BootstrapConfig, BootstrapCoordinator};
use keeper_core::instance::{Discovered, InstanceState, Phase, count_keys};
use keeper_core::retry::RetryPolicy;
use keeper_core::root_token::{self, RootToken, RootTokenWatch};
use keeper_core::sim::{FixedRegistry, SimCluster, SimInstance};
use keeper_storage::{MemorySecretStore, SecretStore, StoreError};
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

const NS: &str = "kube-system";

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        interval: Duration::from_millis(1),
        max_attempts: 2,
        timeout: Duration::from_secs(1),
    }
}

struct Harness {
    cluster: Arc<SimCluster>,
    registry: Arc<FixedRegistry>,
    store: MemorySecretStore,
    coordinator: BootstrapCoordinator,
    token: RootTokenWatch,
}

fn harness_with(config: BootstrapConfig, store: Arc<dyn SecretStore>, memory: MemorySecretStore) -> Harness {
    let cluster = SimCluster::new();
    let registry = FixedRegistry::new();
    let (publisher, token) = root_token::channel(None);
    let coordinator = BootstrapCoordinator::new(
        config,
        registry.clone(),
        cluster.clone(),
        store,
        fast_retry(),
        publisher,
    );
    Harness {
        cluster,
        registry,
        store: memory,
        coordinator,
        token,
    }
}

fn harness(config: BootstrapConfig) -> Harness {
    let store = MemorySecretStore::new();
    harness_with(config, Arc::new(store.clone()), store)
}

impl Harness {
    /// Register a running pod `name` at `ip` backed by a fresh simulated instance.
    fn pod(&self, name: &str, ip: &str) -> Arc<SimInstance> {
        let sim = self.cluster.add(&format!("https://{ip}:8243"));
        self.registry.set(name, Discovered::running(ip));
        sim
    }

    async fn escrowed_shares(&self) -> Option<String> {
        self.store
            .get("vault-unseal-keys", "unseal-keys", NS)
            .await
            .unwrap()
    }

    async fn escrowed_root(&self) -> Option<String> {
        self.store.get("vault-tokens", "root-token", NS).await.unwrap()
    }
}

/// Store whose reads or writes can be made to fail.
#[derive(Clone)]
struct FlakyStore {
    inner: MemorySecretStore,
    fail_get: bool,
    fail_put: bool,
}

#[async_trait::async_trait]
impl SecretStore for FlakyStore {
    async fn get(&self, name: &str, key: &str, namespace: &str) -> Result<Option<String>, StoreError> {
        if self.fail_get {
            return Err(StoreError::Read {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                key: key.to_owned(),
                reason: "apiserver unavailable".to_owned(),
            });
        }
        self.inner.get(name, key, namespace).await
    }

    async fn put(&self, name: &str, key: &str, value: &str, namespace: &str) -> Result<(), StoreError> {
        if self.fail_put {
            return Err(StoreError::Write {
                namespace: namespace.to_owned(),
                name: name.to_owned(),
                key: key.to_owned(),
                reason: "forbidden".to_owned(),
            });
        }
        self.inner.put(name, key, value, namespace).await
    }
}

// ── Initialization ───────────────────────────────────────────────────

#[tokio::test]
async fn fresh_instance_is_initialized_escrowed_and_unsealed() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(sim.init_calls(), 1);
    assert!(sim.is_initialized());
    assert!(!sim.is_sealed());
    assert_eq!(report.initialized, ["vault-0"]);
    assert_eq!(report.unsealed, ["vault-0"]);

    let shares = h.escrowed_shares().await.expect("shares escrowed");
    assert_eq!(count_keys(&shares), 5);
    // Threshold 3: unsealing stopped after the third share.
    assert_eq!(sim.unseal_calls(), 3);
    assert_eq!(h.escrowed_root().await, sim.root_token());

    let inst = report.instance("vault-0").unwrap();
    assert_eq!(
        inst.trail(),
        &[
            InstanceState::Unknown,
            InstanceState::Uninitialized,
            InstanceState::Initialized,
            InstanceState::Sealed,
            InstanceState::Unsealed,
            InstanceState::Follower,
        ]
    );
    assert!(inst.initialized());
    assert!(!inst.sealed());
}

#[tokio::test]
async fn initialize_publishes_new_root_token() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    assert!(h.token.current().is_none());

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(h.token.has_changed());
    let published = h.token.current().unwrap();
    assert_eq!(Some(published.expose().to_owned()), sim.root_token());
}

#[tokio::test]
async fn requested_share_count_and_threshold_are_used() {
    let mut h = harness(BootstrapConfig {
        shares: 3,
        threshold: 2,
        ..BootstrapConfig::default()
    });
    let sim = h.pod("vault-0", "10.0.0.1");

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(count_keys(&h.escrowed_shares().await.unwrap()), 3);
    assert_eq!(sim.unseal_calls(), 2);
}

#[tokio::test]
async fn escrowed_quorum_prevents_initialize() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    h.store
        .put("vault-unseal-keys", "unseal-keys", "a,b,c", NS)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(sim.init_calls(), 0);
    assert!(!sim.is_initialized());
    assert!(report.initialized.is_empty());
    assert_eq!(
        report.instance("vault-0").unwrap().state(),
        InstanceState::Uninitialized
    );
    // Escrow untouched.
    assert_eq!(h.escrowed_shares().await.as_deref(), Some("a,b,c"));
}

#[tokio::test]
async fn escrow_below_threshold_does_not_block_initialize() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    h.store
        .put("vault-unseal-keys", "unseal-keys", "stale1,stale2", NS)
        .await
        .unwrap();

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(sim.init_calls(), 1);
    assert_eq!(count_keys(&h.escrowed_shares().await.unwrap()), 5);
}

#[tokio::test]
async fn escrow_lookup_failure_skips_initialize() {
    let memory = MemorySecretStore::new();
    let flaky = FlakyStore {
        inner: memory.clone(),
        fail_get: true,
        fail_put: false,
    };
    let mut h = harness_with(BootstrapConfig::default(), Arc::new(flaky), memory);
    let sim = h.pod("vault-0", "10.0.0.1");

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(sim.init_calls(), 0);
}

#[tokio::test]
async fn persist_failure_still_unseals_from_memory() {
    let memory = MemorySecretStore::new();
    let flaky = FlakyStore {
        inner: memory.clone(),
        fail_get: false,
        fail_put: true,
    };
    let mut h = harness_with(BootstrapConfig::default(), Arc::new(flaky), memory);
    let sim = h.pod("vault-0", "10.0.0.1");

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(sim.init_calls(), 1);
    assert!(!sim.is_sealed());
    assert!(h.escrowed_shares().await.is_none());
    assert_eq!(report.unsealed, ["vault-0"]);
    assert!(h.token.current().is_some());

    // After a restart of the instance the in-memory shares still unseal it.
    sim.reseal();
    h.coordinator.run_cycle(&CancellationToken::new()).await;
    assert!(!sim.is_sealed());
    assert_eq!(sim.init_calls(), 1);
}

#[tokio::test]
async fn only_first_instance_initializes_the_quorum() {
    let mut h = harness(BootstrapConfig::default());
    let first = h.pod("vault-0", "10.0.0.1");
    let second = h.pod("vault-1", "10.0.0.2");

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(first.init_calls(), 1);
    assert_eq!(second.init_calls(), 0);
}

// ── Unseal ───────────────────────────────────────────────────────────

#[tokio::test]
async fn sealed_instance_is_unsealed_from_escrow() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    let (keys, _) = sim.preinitialize(5, 3);
    h.store
        .put("vault-unseal-keys", "unseal-keys", &keys.join(","), NS)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(!sim.is_sealed());
    assert_eq!(sim.init_calls(), 0);
    assert_eq!(
        report.instance("vault-0").unwrap().trail(),
        &[
            InstanceState::Unknown,
            InstanceState::Initialized,
            InstanceState::Sealed,
            InstanceState::Unsealed,
            InstanceState::Follower,
        ]
    );
}

#[tokio::test]
async fn too_few_keys_leave_instance_sealed() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    let (keys, _) = sim.preinitialize(5, 3);
    h.store
        .put("vault-unseal-keys", "unseal-keys", &keys[..2].join(","), NS)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(sim.is_sealed());
    assert!(report.unsealed.is_empty());
    assert_eq!(
        report.instance("vault-0").unwrap().state(),
        InstanceState::Sealed
    );
}

#[tokio::test]
async fn static_keys_are_the_last_fallback() {
    let sim = SimInstance::new("https://10.0.0.1:8243");
    let (keys, _) = sim.preinitialize(3, 2);
    let mut h = harness(BootstrapConfig {
        static_unseal_keys: Some(Zeroizing::new(keys.join(","))),
        ..BootstrapConfig::default()
    });
    h.cluster.alias("https://10.0.0.1:8243", &sim);
    h.registry.set("vault-0", Discovered::running("10.0.0.1"));

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(!sim.is_sealed());
    assert_eq!(report.unsealed, ["vault-0"]);
}

#[tokio::test]
async fn no_keys_at_all_leaves_instance_sealed() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    sim.preinitialize(5, 3);

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(sim.is_sealed());
    assert_eq!(sim.unseal_calls(), 0);
    assert_eq!(
        report.instance("vault-0").unwrap().state(),
        InstanceState::Sealed
    );
}

#[tokio::test]
async fn leader_is_tracked() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    sim.set_leader(true);

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    let inst = report.instance("vault-0").unwrap();
    assert_eq!(inst.state(), InstanceState::Leader);
    assert!(inst.is_leader());
}

// ── Eviction ─────────────────────────────────────────────────────────

#[tokio::test]
async fn failed_pod_is_left_alone_without_eviction() {
    let mut h = harness(BootstrapConfig::default());
    h.registry
        .set("vault-0", Discovered::unreachable(Phase::Failed));

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(h.registry.evictions().is_empty());
    assert_eq!(
        report.instance("vault-0").unwrap().state(),
        InstanceState::Unknown
    );
}

#[tokio::test]
async fn failed_and_unknown_pods_are_evicted_when_permitted() {
    let mut h = harness(BootstrapConfig {
        eviction: true,
        ..BootstrapConfig::default()
    });
    h.registry
        .set("vault-0", Discovered::unreachable(Phase::Failed));
    h.registry
        .set("vault-1", Discovered::unreachable(Phase::Unknown));

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(h.registry.evictions(), ["vault-0", "vault-1"]);
    assert_eq!(report.evicted, ["vault-0", "vault-1"]);
    assert_eq!(
        report.instance("vault-1").unwrap().state(),
        InstanceState::Evicted
    );
    assert!(h.cluster.connections().is_empty());
}

#[tokio::test]
async fn unreachable_instance_is_evicted_after_failure_streak() {
    let mut h = harness(BootstrapConfig {
        eviction: true,
        evict_after_failures: 2,
        ..BootstrapConfig::default()
    });
    // Running with an address no simulated instance answers on.
    h.registry.set("vault-0", Discovered::running("10.0.0.9"));

    h.coordinator.run_cycle(&CancellationToken::new()).await;
    assert!(h.registry.evictions().is_empty());

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;
    assert_eq!(h.registry.evictions(), ["vault-0"]);
    assert_eq!(
        report.instance("vault-0").unwrap().state(),
        InstanceState::Evicted
    );
}

#[tokio::test]
async fn recovery_resets_failure_streak() {
    let mut h = harness(BootstrapConfig {
        eviction: true,
        evict_after_failures: 2,
        ..BootstrapConfig::default()
    });
    let sim = h.pod("vault-0", "10.0.0.1");

    sim.set_reachable(false);
    h.coordinator.run_cycle(&CancellationToken::new()).await;
    sim.set_reachable(true);
    h.coordinator.run_cycle(&CancellationToken::new()).await;
    sim.set_reachable(false);
    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(h.registry.evictions().is_empty());
}

// ── Cycle behavior ───────────────────────────────────────────────────

#[tokio::test]
async fn pending_pod_is_skipped() {
    let mut h = harness(BootstrapConfig::default());
    h.registry.set("vault-0", Discovered::pending());

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(h.cluster.connections().is_empty());
    assert_eq!(
        report.instance("vault-0").unwrap().trail(),
        &[InstanceState::Unknown]
    );
}

#[tokio::test]
async fn discovery_failure_runs_an_empty_cycle() {
    let mut h = harness(BootstrapConfig::default());
    h.pod("vault-0", "10.0.0.1");
    h.registry.fail_discovery(true);

    let report = h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(report.discovery_failed);
    assert!(report.instances.is_empty());
    assert!(h.cluster.connections().is_empty());
}

#[tokio::test]
async fn cancelled_cycle_processes_nothing() {
    let mut h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = h.coordinator.run_cycle(&cancel).await;

    assert!(report.cancelled);
    assert_eq!(sim.init_calls(), 0);
}

#[tokio::test]
async fn escrowed_root_token_is_adopted() {
    let mut h = harness(BootstrapConfig::default());
    h.store
        .put("vault-tokens", "root-token", "s.escrowed", NS)
        .await
        .unwrap();

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert_eq!(
        h.token.current().as_ref().map(RootToken::expose),
        Some("s.escrowed")
    );
}

#[tokio::test]
async fn snapshot_is_published_after_cycle() {
    let mut h = harness(BootstrapConfig::default());
    h.pod("vault-0", "10.0.0.1");
    let mut snapshot = h.coordinator.snapshot();

    h.coordinator.run_cycle(&CancellationToken::new()).await;

    assert!(snapshot.has_changed().unwrap());
    let rows = snapshot.borrow_and_update().clone();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "vault-0");
    assert!(rows[0].initialized);
    assert!(!rows[0].sealed);
}

#[tokio::test(start_paused = true)]
async fn run_loop_stops_on_cancel() {
    let h = harness(BootstrapConfig::default());
    let sim = h.pod("vault-0", "10.0.0.1");
    let cancel = CancellationToken::new();

    let task = tokio::spawn(
        h.coordinator
            .run(Duration::from_secs(30), cancel.clone()),
    );
    // First tick fires immediately.
    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(sim.init_calls(), 1);
}
