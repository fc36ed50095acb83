//! Instance discovery.
//!
//! An [`InstanceRegistry`] returns a snapshot of every known instance keyed
//! by name, with an address and a phase. The Kubernetes label-selector
//! implementation lives in the controller crate; [`StaticRegistry`] resolves
//! a fixed host list through DNS.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::DiscoveryError;
use crate::instance::Discovered;

/// How a registry finds instances. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Pods matching `key=value` in a namespace.
    Label {
        key: String,
        value: String,
        namespace: String,
    },
    /// A fixed list of hostnames.
    Hosts(Vec<String>),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Label {
                key,
                value,
                namespace,
            } => write!(f, "{namespace}/{key}={value}"),
            Self::Hosts(hosts) => write!(f, "hosts[{}]", hosts.join(",")),
        }
    }
}

/// Source of the instance set.
#[async_trait::async_trait]
pub trait InstanceRegistry: Send + Sync + 'static {
    /// List every instance the selector matches.
    ///
    /// Entries are classified: `Running` with a non-empty address, `Pending`
    /// with an empty address, `Failed`/`Unknown` with
    /// [`ERROR_ADDRESS`](crate::instance::ERROR_ADDRESS). Never returns a
    /// partial mapping silently.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] if the listing fails.
    async fn discover(&self) -> Result<BTreeMap<String, Discovered>, DiscoveryError>;

    /// Ask the orchestrator to delete an instance so it is rescheduled.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Eviction`] if the delete fails, or
    /// [`DiscoveryError::EvictionUnsupported`] if there is no orchestrator.
    async fn evict(&self, name: &str) -> Result<(), DiscoveryError>;
}

/// Registry over a fixed host list, resolved with the system resolver.
#[derive(Debug, Clone)]
pub struct StaticRegistry {
    hosts: Vec<String>,
}

impl StaticRegistry {
    /// Build from hostnames. Blank entries are dropped.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(Into::into)
                .map(|h: String| h.trim().to_owned())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Parse a comma-delimited host list.
    #[must_use]
    pub fn from_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    /// Configured hosts.
    #[must_use]
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// The selector this registry was built from.
    #[must_use]
    pub fn selector(&self) -> Selector {
        Selector::Hosts(self.hosts.clone())
    }
}

#[async_trait::async_trait]
impl InstanceRegistry for StaticRegistry {
    async fn discover(&self) -> Result<BTreeMap<String, Discovered>, DiscoveryError> {
        let mut found = BTreeMap::new();

        for host in &self.hosts {
            match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(mut addrs) => {
                    if let Some(addr) = addrs.next() {
                        debug!(host = %host, ip = %addr.ip(), "resolved instance host");
                        found.insert(host.clone(), Discovered::running(addr.ip().to_string()));
                    } else {
                        warn!(host = %host, "host resolved to no addresses");
                    }
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "failed to resolve instance host");
                }
            }
        }

        if found.is_empty() && !self.hosts.is_empty() {
            return Err(DiscoveryError::NoHostResolved {
                hosts: self.hosts.len(),
            });
        }
        Ok(found)
    }

    async fn evict(&self, name: &str) -> Result<(), DiscoveryError> {
        Err(DiscoveryError::EvictionUnsupported {
            name: name.to_owned(),
        })
    }
}
