//! `vault-keeper` controller.
//!
//! Wires the `keeper-core` control loops to Kubernetes (pod discovery,
//! `VaultPolicy` resources, secret escrow) and serves their status over HTTP.

pub mod config;
pub mod error;
pub mod pods;
pub mod policies;
pub mod routes;
pub mod shutdown;
pub mod state;
