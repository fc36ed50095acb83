//! Pod discovery by label selector.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use keeper_core::error::DiscoveryError;
use keeper_core::instance::{Discovered, Phase};
use keeper_core::registry::{InstanceRegistry, Selector};
use kube::api::{Api, DeleteParams, ListParams};
use kube::Client;
use tracing::{debug, info};

/// Instance registry over pods matching `key=value` in one namespace.
#[derive(Clone)]
pub struct PodRegistry {
    api: Api<Pod>,
    key: String,
    value: String,
    namespace: String,
}

impl PodRegistry {
    #[must_use]
    pub fn new(client: Client, key: &str, value: &str, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            key: key.to_owned(),
            value: value.to_owned(),
            namespace: namespace.to_owned(),
        }
    }

    fn selector(&self) -> Selector {
        Selector::Label {
            key: self.key.clone(),
            value: self.value.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl std::fmt::Debug for PodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodRegistry")
            .field("selector", &self.selector().to_string())
            .finish_non_exhaustive()
    }
}

/// Classify a pod by its phase and IP.
///
/// A Running pod without an IP is not reachable yet and counts as Pending.
#[must_use]
pub fn classify(pod: &Pod) -> Discovered {
    let status = pod.status.as_ref();
    let phase = status.and_then(|s| s.phase.as_deref()).unwrap_or_default();
    let ip = status
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty());

    match (phase, ip) {
        ("Running", Some(ip)) => Discovered::running(ip),
        ("Running" | "Pending", _) => Discovered::pending(),
        ("Failed" | "Succeeded", _) => Discovered::unreachable(Phase::Failed),
        _ => Discovered::unreachable(Phase::Unknown),
    }
}

#[async_trait::async_trait]
impl InstanceRegistry for PodRegistry {
    async fn discover(&self) -> Result<BTreeMap<String, Discovered>, DiscoveryError> {
        let labels = format!("{}={}", self.key, self.value);
        let pods = self
            .api
            .list(&ListParams::default().labels(&labels))
            .await
            .map_err(|e| DiscoveryError::Listing {
                selector: self.selector().to_string(),
                reason: e.to_string(),
            })?;

        let found: BTreeMap<String, Discovered> = pods
            .items
            .iter()
            .filter_map(|pod| pod.metadata.name.clone().map(|name| (name, classify(pod))))
            .collect();
        debug!(selector = %self.selector(), pods = found.len(), "pods discovered");
        Ok(found)
    }

    async fn evict(&self, name: &str) -> Result<(), DiscoveryError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(pod = %name, namespace = %self.namespace, "pod deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "pod already gone");
                Ok(())
            }
            Err(e) => Err(DiscoveryError::Eviction {
                name: name.to_owned(),
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::PodStatus;

    use super::*;

    fn pod(phase: Option<&str>, ip: Option<&str>) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: phase.map(str::to_owned),
                pod_ip: ip.map(str::to_owned),
                ..PodStatus::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn running_with_ip_is_reachable() {
        assert_eq!(
            classify(&pod(Some("Running"), Some("10.0.0.7"))),
            Discovered::running("10.0.0.7")
        );
    }

    #[test]
    fn running_without_ip_is_pending() {
        assert_eq!(classify(&pod(Some("Running"), None)), Discovered::pending());
        assert_eq!(classify(&pod(Some("Running"), Some(""))), Discovered::pending());
    }

    #[test]
    fn pending_has_no_address() {
        assert_eq!(
            classify(&pod(Some("Pending"), Some("10.0.0.7"))),
            Discovered::pending()
        );
    }

    #[test]
    fn terminal_phases_are_failed() {
        for phase in ["Failed", "Succeeded"] {
            assert_eq!(
                classify(&pod(Some(phase), Some("10.0.0.7"))),
                Discovered::unreachable(Phase::Failed)
            );
        }
    }

    #[test]
    fn anything_else_is_unknown() {
        assert_eq!(
            classify(&pod(Some("Unknown"), None)),
            Discovered::unreachable(Phase::Unknown)
        );
        assert_eq!(classify(&pod(None, None)), Discovered::unreachable(Phase::Unknown));
        assert_eq!(
            classify(&Pod::default()),
            Discovered::unreachable(Phase::Unknown)
        );
    }
}
