//! Shared state for the status server.
//!
//! The control loops publish a snapshot after every cycle; handlers only
//! read the latest one.

use keeper_core::instance::InstanceStatus;
use keeper_core::policy_controller::PolicyStatus;
use keeper_core::root_token::RootTokenWatch;
use tokio::sync::watch;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Latest instance statuses from the bootstrap coordinator.
    pub instances: watch::Receiver<Vec<InstanceStatus>>,
    /// Latest policy outcomes from the policy controller.
    pub policies: watch::Receiver<Vec<PolicyStatus>>,
    /// Root token hand-off, read only to report whether a token exists.
    pub root_token: RootTokenWatch,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("instances", &self.instances.borrow().len())
            .field("policies", &self.policies.borrow().len())
            .finish_non_exhaustive()
    }
}
