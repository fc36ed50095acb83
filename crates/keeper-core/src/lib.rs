//! Core library for `vault-keeper`.
//!
//! Two control loops share this crate:
//!
//! - [`bootstrap::BootstrapCoordinator`] discovers cluster instances,
//!   initializes an uninitialized cluster once, escrows the quorum secret,
//!   unseals every sealed instance, and evicts instances that cannot be
//!   driven.
//! - [`policy_controller::PolicyController`] writes declared policies and
//!   keeps one live token per policy, renewing or recreating it on the
//!   declared thresholds.
//!
//! The coordinator is the only writer of the root token; the controller reads
//! it through [`root_token::RootTokenWatch`]. Everything that talks to the
//! outside world sits behind a trait: [`registry::InstanceRegistry`],
//! [`api::VaultApi`] / [`api::Connector`], [`policy::PolicySource`], and
//! `keeper_storage::SecretStore`. With the `sim` feature, the `sim` module
//! provides in-process implementations for tests.

pub mod api;
pub mod bootstrap;
pub mod client;
pub mod duration;
pub mod error;
pub mod http;
pub mod instance;
pub mod lifecycle;
pub mod policy;
pub mod policy_controller;
pub mod registry;
pub mod retry;
pub mod root_token;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
