//! Instance model and per-instance state machine states.
//!
//! Discovery produces a [`Discovered`] entry per instance name each cycle.
//! The coordinator turns each entry into an [`Instance`] whose
//! [`InstanceState`] is the single source of truth for the derived
//! `initialized` / `sealed` / `is_leader` flags. The states visited during a
//! cycle are kept in order so callers can assert on transitions.

use serde::Serialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::root_token::RootToken;

/// Address sentinel for Failed/Unknown instances: evict, do not connect.
pub const ERROR_ADDRESS: &str = "error";

/// Orchestrator-reported lifecycle phase of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not yet schedulable; address is empty.
    Pending,
    /// Scheduled and carrying a routable address.
    Running,
    /// Terminally failed.
    Failed,
    /// The orchestrator cannot report a phase.
    Unknown,
}

/// One discovery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    /// Routable address, empty for Pending, [`ERROR_ADDRESS`] for Failed/Unknown.
    pub address: String,
    /// Orchestrator phase.
    pub phase: Phase,
}

/// What the coordinator should do with a discovered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    /// Connect to the given address.
    Connect(&'a str),
    /// Not schedulable yet; skip this cycle.
    Skip,
    /// Terminal; ask the orchestrator to replace it.
    Evict,
}

impl Discovered {
    /// A Running entry with the given address.
    pub fn running(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            phase: Phase::Running,
        }
    }

    /// A Pending entry.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            address: String::new(),
            phase: Phase::Pending,
        }
    }

    /// A Failed or Unknown entry carrying the eviction sentinel.
    #[must_use]
    pub fn unreachable(phase: Phase) -> Self {
        Self {
            address: ERROR_ADDRESS.to_owned(),
            phase,
        }
    }

    /// Classify the entry.
    #[must_use]
    pub fn target(&self) -> Target<'_> {
        match self.phase {
            Phase::Failed | Phase::Unknown => Target::Evict,
            _ if self.address == ERROR_ADDRESS => Target::Evict,
            Phase::Running if !self.address.is_empty() => Target::Connect(&self.address),
            Phase::Running | Phase::Pending => Target::Skip,
        }
    }
}

/// Per-instance state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Status not yet known this cycle.
    Unknown,
    /// Reports not initialized.
    Uninitialized,
    /// Reports initialized; seal state not yet read.
    Initialized,
    /// Initialized and sealed.
    Sealed,
    /// Initialized and unsealed; leadership not yet read.
    Unsealed,
    /// Unsealed standby.
    Follower,
    /// Unsealed active node.
    Leader,
    /// Handed to the orchestrator for deletion.
    Evicted,
}

impl InstanceState {
    /// Whether the instance reached initialization.
    #[must_use]
    pub fn is_initialized(self) -> bool {
        matches!(
            self,
            Self::Initialized | Self::Sealed | Self::Unsealed | Self::Follower | Self::Leader
        )
    }

    /// Whether the instance is known to be unsealed.
    #[must_use]
    pub fn is_unsealed(self) -> bool {
        matches!(self, Self::Unsealed | Self::Follower | Self::Leader)
    }
}

/// An instance as seen during one coordinator cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Instance {
    /// Orchestrator name (pod name or hostname).
    pub name: String,
    /// Address as discovered.
    pub address: String,
    /// Orchestrator phase as discovered.
    pub phase: Phase,
    state: InstanceState,
    #[serde(skip)]
    trail: Vec<InstanceState>,
}

impl Instance {
    /// Start tracking a discovered entry in the [`InstanceState::Unknown`] state.
    pub fn new(name: impl Into<String>, discovered: &Discovered) -> Self {
        Self {
            name: name.into(),
            address: discovered.address.clone(),
            phase: discovered.phase,
            state: InstanceState::Unknown,
            trail: vec![InstanceState::Unknown],
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        self.state
    }

    /// Move to `next`, recording it on the trail. Repeats are collapsed.
    pub fn transition(&mut self, next: InstanceState) {
        if self.state != next {
            self.state = next;
            self.trail.push(next);
        }
    }

    /// States visited this cycle, in order, starting at `Unknown`.
    #[must_use]
    pub fn trail(&self) -> &[InstanceState] {
        &self.trail
    }

    /// Derived flag: initialized.
    #[must_use]
    pub fn initialized(&self) -> bool {
        self.state.is_initialized()
    }

    /// Derived flag: sealed (anything not known to be unsealed).
    #[must_use]
    pub fn sealed(&self) -> bool {
        !self.state.is_unsealed()
    }

    /// Derived flag: leader.
    #[must_use]
    pub fn is_leader(&self) -> bool {
        self.state == InstanceState::Leader
    }

    /// Serializable view including the derived flags.
    #[must_use]
    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            name: self.name.clone(),
            address: self.address.clone(),
            phase: self.phase,
            state: self.state,
            initialized: self.initialized(),
            sealed: self.sealed(),
            is_leader: self.is_leader(),
        }
    }
}

/// Snapshot row published for the status surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub address: String,
    pub phase: Phase,
    pub state: InstanceState,
    pub initialized: bool,
    pub sealed: bool,
    pub is_leader: bool,
}

/// Result of initializing an instance: its unseal shares and root token.
///
/// Created once per successful initialize and never mutated. Shares are
/// zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct QuorumSecret {
    /// Base64-encoded unseal shares, in the order the instance returned them.
    pub shares: Vec<String>,
    /// Shares required to unseal.
    #[zeroize(skip)]
    pub threshold: u8,
    /// Root token issued by the initialize call.
    #[zeroize(skip)]
    pub root_token: RootToken,
}

impl QuorumSecret {
    /// Shares comma-joined, the persisted and `unseal` input form.
    #[must_use]
    pub fn joined_shares(&self) -> String {
        self.shares.join(",")
    }
}

impl std::fmt::Debug for QuorumSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuorumSecret")
            .field("shares", &self.shares.len())
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

/// Count the usable (non-empty) keys of a comma-delimited key set.
#[must_use]
pub fn count_keys(keys: &str) -> usize {
    keys.split(',').filter(|k| !k.trim().is_empty()).count()
}
