//! In-process simulated cluster for behavioral tests.
//!
//! [`SimInstance`] models the parts of a Vault server the keeper drives:
//! init and Shamir unseal progress, plus policies and tokens with a
//! settable remaining TTL. Authenticated calls must carry the instance's
//! current root token. Every call is counted so tests can assert on what was
//! sent. [`SimCluster`] is a [`Connector`] over a set of instances, and
//! [`FixedRegistry`] is an [`InstanceRegistry`] whose snapshot tests control.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::api::{
    Connector, InitResponse, SealStatus, TokenInfo, TokenLifetime, TokenRequest, VaultApi,
};
use crate::error::{ClusterError, DiscoveryError};
use crate::instance::Discovered;
use crate::registry::InstanceRegistry;
use crate::root_token::RootToken;

/// A token the simulated instance issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimToken {
    /// Policies attached at creation.
    pub policies: Vec<String>,
    /// Display name given at creation.
    pub display_name: String,
    /// Remaining seconds.
    pub ttl: u64,
    /// Whether renew is allowed.
    pub renewable: bool,
    /// Whether created with a period.
    pub periodic: bool,
}

#[derive(Debug, Default)]
struct SimState {
    reachable: bool,
    initialized: bool,
    sealed: bool,
    threshold: u32,
    keys: Vec<String>,
    submitted: Vec<String>,
    root_token: Option<String>,
    leader: bool,
    policies: BTreeMap<String, String>,
    tokens: HashMap<String, SimToken>,
    fail_next: u32,
    failed_calls: u32,
    init_calls: u32,
    unseal_calls: u32,
    put_policy_calls: u32,
    token_create_calls: u32,
    token_renew_calls: u32,
    auth_seen: Vec<String>,
}

/// A simulated Vault server.
#[derive(Debug)]
pub struct SimInstance {
    address: String,
    state: Mutex<SimState>,
}

impl SimInstance {
    /// A reachable, uninitialized instance.
    pub fn new(address: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            state: Mutex::new(SimState {
                reachable: true,
                sealed: true,
                ..SimState::default()
            }),
        })
    }

    /// An instance that refuses every connection.
    pub fn unreachable(address: impl Into<String>) -> Arc<Self> {
        let sim = Self::new(address);
        sim.set_reachable(false);
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // A poisoned lock only means another test thread panicked.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// A transport over this instance authenticating with `token`.
    pub fn session(self: &Arc<Self>, token: Option<&RootToken>) -> Arc<dyn VaultApi> {
        Arc::new(SimSession {
            instance: Arc::clone(self),
            token: token.map(|t| t.expose().to_owned()),
        })
    }

    /// Address the instance was created with.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    // ── Fault injection and setup ────────────────────────────────────

    /// Fail the next `n` calls with a transient 503.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Toggle connection refusal.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Mark the instance as active node.
    pub fn set_leader(&self, leader: bool) {
        self.state().leader = leader;
    }

    /// Seal the instance again, as after a restart.
    pub fn reseal(&self) {
        let mut s = self.state();
        s.sealed = true;
        s.submitted.clear();
    }

    /// Initialize out of band, returning the shares and root token.
    pub fn preinitialize(&self, shares: u8, threshold: u8) -> (Vec<String>, String) {
        let mut s = self.state();
        Self::do_init(&mut s, shares, threshold)
    }

    /// Register a token directly, as if issued earlier.
    pub fn insert_token(&self, token: &str, sim: SimToken) {
        self.state().tokens.insert(token.to_owned(), sim);
    }

    /// Set the remaining TTL of an issued token.
    pub fn set_token_ttl(&self, token: &str, ttl: u64) {
        if let Some(t) = self.state().tokens.get_mut(token) {
            t.ttl = ttl;
        }
    }

    /// Revoke a token.
    pub fn revoke_token(&self, token: &str) {
        self.state().tokens.remove(token);
    }

    // ── Observations ─────────────────────────────────────────────────

    /// Whether the instance is sealed.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state().sealed
    }

    /// Whether the instance is initialized.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// Current root token.
    #[must_use]
    pub fn root_token(&self) -> Option<String> {
        self.state().root_token.clone()
    }

    /// Successful init calls.
    #[must_use]
    pub fn init_calls(&self) -> u32 {
        self.state().init_calls
    }

    /// Unseal key submissions.
    #[must_use]
    pub fn unseal_calls(&self) -> u32 {
        self.state().unseal_calls
    }

    /// Calls failed by [`fail_next`](Self::fail_next).
    #[must_use]
    pub fn failed_calls(&self) -> u32 {
        self.state().failed_calls
    }

    /// Policy writes.
    #[must_use]
    pub fn put_policy_calls(&self) -> u32 {
        self.state().put_policy_calls
    }

    /// Token creations.
    #[must_use]
    pub fn token_create_calls(&self) -> u32 {
        self.state().token_create_calls
    }

    /// Token renewals.
    #[must_use]
    pub fn token_renew_calls(&self) -> u32 {
        self.state().token_renew_calls
    }

    /// Body of a stored policy.
    #[must_use]
    pub fn policy(&self, name: &str) -> Option<String> {
        self.state().policies.get(name).cloned()
    }

    /// A token as the instance knows it.
    #[must_use]
    pub fn token(&self, token: &str) -> Option<SimToken> {
        self.state().tokens.get(token).cloned()
    }

    /// Every token that authenticated a call, in order.
    #[must_use]
    pub fn auth_seen(&self) -> Vec<String> {
        self.state().auth_seen.clone()
    }

    fn do_init(s: &mut SimState, shares: u8, threshold: u8) -> (Vec<String>, String) {
        s.keys = (0..shares)
            .map(|_| STANDARD.encode(uuid::Uuid::new_v4().as_bytes()))
            .collect();
        s.threshold = u32::from(threshold);
        s.initialized = true;
        s.sealed = true;
        s.submitted.clear();
        let root = format!("s.{}", uuid::Uuid::new_v4().simple());
        s.root_token = Some(root.clone());
        (s.keys.clone(), root)
    }
}

/// One authenticated connection to a [`SimInstance`].
#[derive(Debug)]
struct SimSession {
    instance: Arc<SimInstance>,
    token: Option<String>,
}

impl SimSession {
    fn transient(&self, operation: &'static str, reason: &str) -> ClusterError {
        ClusterError::Transient {
            address: self.instance.address.clone(),
            operation,
            reason: reason.to_owned(),
        }
    }

    fn rejected(&self, operation: &'static str, status: u16, message: &str) -> ClusterError {
        ClusterError::Rejected {
            address: self.instance.address.clone(),
            operation,
            status,
            message: message.to_owned(),
        }
    }

    /// Connectivity and fault injection shared by every call.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, SimState>, ClusterError> {
        let mut s = self.instance.state();
        if !s.reachable {
            return Err(self.transient(operation, "connection refused"));
        }
        if s.fail_next > 0 {
            s.fail_next -= 1;
            s.failed_calls += 1;
            return Err(self.transient(operation, "HTTP 503: injected failure"));
        }
        Ok(s)
    }

    /// [`enter`](Self::enter) plus unsealed-and-authenticated checks.
    fn enter_authenticated(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, SimState>, ClusterError> {
        let mut s = self.enter(operation)?;
        if s.sealed {
            return Err(self.transient(operation, "HTTP 503: Vault is sealed"));
        }
        let Some(token) = self.token.as_deref() else {
            return Err(self.rejected(operation, 400, "missing client token"));
        };
        s.auth_seen.push(token.to_owned());
        if s.root_token.as_deref() != Some(token) {
            return Err(self.rejected(operation, 403, "permission denied"));
        }
        Ok(s)
    }

    fn seal_status_of(s: &SimState) -> SealStatus {
        SealStatus {
            sealed: s.sealed,
            threshold: s.threshold,
            shares: u32::try_from(s.keys.len()).unwrap_or(u32::MAX),
            progress: u32::try_from(s.submitted.len()).unwrap_or(u32::MAX),
        }
    }
}

#[async_trait::async_trait]
impl VaultApi for SimSession {
    fn address(&self) -> &str {
        &self.instance.address
    }

    async fn init_status(&self) -> Result<bool, ClusterError> {
        Ok(self.enter("init-status")?.initialized)
    }

    async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse, ClusterError> {
        let mut s = self.enter("init")?;
        if s.initialized {
            return Err(self.rejected("init", 400, "Vault is already initialized"));
        }
        if threshold == 0 || threshold > shares {
            return Err(self.rejected("init", 400, "invalid share configuration"));
        }
        let (keys, root) = SimInstance::do_init(&mut s, shares, threshold);
        s.init_calls += 1;
        Ok(InitResponse {
            keys_base64: keys,
            root_token: root,
        })
    }

    async fn seal_status(&self) -> Result<SealStatus, ClusterError> {
        let s = self.enter("seal-status")?;
        Ok(Self::seal_status_of(&s))
    }

    async fn unseal_key(&self, key: &str) -> Result<SealStatus, ClusterError> {
        let mut s = self.enter("unseal")?;
        if !s.initialized {
            return Err(self.rejected("unseal", 400, "Vault is not initialized"));
        }
        if !s.keys.iter().any(|k| k == key) {
            return Err(self.rejected("unseal", 400, "invalid key"));
        }
        s.unseal_calls += 1;
        if s.sealed && !s.submitted.iter().any(|k| k == key) {
            s.submitted.push(key.to_owned());
            if u32::try_from(s.submitted.len()).unwrap_or(u32::MAX) >= s.threshold {
                s.sealed = false;
                s.submitted.clear();
            }
        }
        Ok(Self::seal_status_of(&s))
    }

    async fn leader(&self) -> Result<bool, ClusterError> {
        let s = self.enter("leader-status")?;
        if s.sealed {
            return Err(self.transient("leader-status", "HTTP 503: Vault is sealed"));
        }
        Ok(s.leader)
    }

    async fn put_policy(&self, name: &str, rules: &str) -> Result<(), ClusterError> {
        let mut s = self.enter_authenticated("put-policy")?;
        s.put_policy_calls += 1;
        s.policies.insert(name.to_owned(), rules.to_owned());
        Ok(())
    }

    async fn create_token(&self, request: &TokenRequest) -> Result<String, ClusterError> {
        let mut s = self.enter_authenticated("token-create")?;
        if let Some(missing) = request
            .policies
            .iter()
            .find(|p| !s.policies.contains_key(p.as_str()))
        {
            return Err(self.rejected(
                "token-create",
                400,
                &format!("policy '{missing}' does not exist"),
            ));
        }
        s.token_create_calls += 1;
        let token = format!("s.{}", uuid::Uuid::new_v4().simple());
        s.tokens.insert(
            token.clone(),
            SimToken {
                policies: request.policies.clone(),
                display_name: request.display_name.clone(),
                ttl: request.lifetime.seconds(),
                renewable: true,
                periodic: matches!(request.lifetime, TokenLifetime::Period(_)),
            },
        );
        Ok(token)
    }

    async fn lookup_token(&self, token: &str) -> Result<TokenInfo, ClusterError> {
        let s = self.enter_authenticated("token-lookup")?;
        match s.tokens.get(token) {
            Some(t) => Ok(TokenInfo {
                ttl_seconds: t.ttl,
                renewable: t.renewable,
            }),
            None => Err(self.rejected("token-lookup", 403, "bad token")),
        }
    }

    async fn renew_token(&self, token: &str, increment: u64) -> Result<(), ClusterError> {
        let mut s = self.enter_authenticated("token-renew")?;
        let Some(t) = s.tokens.get_mut(token) else {
            return Err(self.rejected("token-renew", 403, "bad token"));
        };
        if !t.renewable {
            return Err(self.rejected("token-renew", 400, "token not renewable"));
        }
        t.ttl = increment;
        s.token_renew_calls += 1;
        Ok(())
    }
}

/// A [`Connector`] over simulated instances keyed by base URL.
///
/// Unknown addresses connect to a fresh unreachable instance.
#[derive(Debug, Default)]
pub struct SimCluster {
    instances: Mutex<HashMap<String, Arc<SimInstance>>>,
    connections: Mutex<Vec<(String, Option<String>)>>,
}

impl SimCluster {
    /// An empty cluster.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add an instance reachable at `address`.
    pub fn add(&self, address: &str) -> Arc<SimInstance> {
        let sim = SimInstance::new(address);
        self.alias(address, &sim);
        sim
    }

    /// Make an existing instance reachable under another address as well.
    pub fn alias(&self, address: &str, sim: &Arc<SimInstance>) {
        self.instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(address.to_owned(), Arc::clone(sim));
    }

    /// Every `(address, token)` pair passed to [`Connector::connect`].
    #[must_use]
    pub fn connections(&self) -> Vec<(String, Option<String>)> {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl Connector for SimCluster {
    fn connect(
        &self,
        address: &str,
        token: Option<&RootToken>,
    ) -> Result<Arc<dyn VaultApi>, ClusterError> {
        self.connections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((address.to_owned(), token.map(|t| t.expose().to_owned())));

        let sim = self
            .instances
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(address)
            .cloned()
            .unwrap_or_else(|| SimInstance::unreachable(address));
        Ok(sim.session(token))
    }
}

/// An [`InstanceRegistry`] returning a snapshot tests set directly.
///
/// Evicting removes the entry, as an orchestrator deleting the pod would.
#[derive(Debug, Default)]
pub struct FixedRegistry {
    entries: Mutex<BTreeMap<String, Discovered>>,
    evictions: Mutex<Vec<String>>,
    fail_discovery: Mutex<bool>,
}

impl FixedRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert or replace an entry.
    pub fn set(&self, name: &str, discovered: Discovered) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_owned(), discovered);
    }

    /// Remove an entry.
    pub fn remove(&self, name: &str) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(name);
    }

    /// Make [`discover`](InstanceRegistry::discover) fail.
    pub fn fail_discovery(&self, fail: bool) {
        *self
            .fail_discovery
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = fail;
    }

    /// Names evicted so far, in order.
    #[must_use]
    pub fn evictions(&self) -> Vec<String> {
        self.evictions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait::async_trait]
impl InstanceRegistry for FixedRegistry {
    async fn discover(&self) -> Result<BTreeMap<String, Discovered>, DiscoveryError> {
        if *self
            .fail_discovery
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
        {
            return Err(DiscoveryError::Listing {
                selector: "fixed".to_owned(),
                reason: "injected failure".to_owned(),
            });
        }
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }

    async fn evict(&self, name: &str) -> Result<(), DiscoveryError> {
        self.evictions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(name.to_owned());
        self.remove(name);
        Ok(())
    }
}
