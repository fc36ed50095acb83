//! Policy declaration sources.
//!
//! Under Kubernetes, declarations are `VaultPolicy` resources
//! (`vault.local/v1`, namespaced); the resource name is the policy name and
//! its namespace receives the token secret. Off the cluster a JSON file holding
//! a list of declarations takes their place. Both are reread every cycle.

use std::path::PathBuf;

use keeper_core::error::SourceError;
use keeper_core::policy::{PolicyDeclaration, PolicyRule, PolicySource};
use kube::api::{Api, ListParams};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One rule of a `VaultPolicy`.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct VaultPolicyRule {
    /// Path pattern, e.g. `secret/data/app/*`.
    pub path: String,
    /// One of `create`, `read`, `update`, `patch`, `delete`, `list`, `sudo`, `deny`.
    #[serde(alias = "permission")]
    pub capability: String,
}

/// Desired policy and token lifetime.
///
/// `ttl` and `period` are mutually exclusive. Durations are an integer with a
/// unit of `s`, `m`, `h` or `d`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[kube(
    group = "vault.local",
    version = "v1",
    kind = "VaultPolicy",
    plural = "vaultpolicies",
    shortname = "vp",
    namespaced,
    printcolumn = r#"{"name":"TTL","type":"string","jsonPath":".spec.ttl"}"#,
    printcolumn = r#"{"name":"Period","type":"string","jsonPath":".spec.period"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VaultPolicySpec {
    #[serde(default)]
    pub rules: Vec<VaultPolicyRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recreate_after: Option<String>,
}

impl VaultPolicy {
    /// Convert to a declaration. `None` when the resource has no name or
    /// namespace.
    #[must_use]
    pub fn to_declaration(&self) -> Option<PolicyDeclaration> {
        let name = self.metadata.name.clone()?;
        let namespace = self.metadata.namespace.clone()?;
        Some(PolicyDeclaration {
            name,
            namespace,
            rules: self
                .spec
                .rules
                .iter()
                .map(|r| PolicyRule {
                    path: r.path.clone(),
                    capability: r.capability.clone(),
                })
                .collect(),
            ttl: self.spec.ttl.clone(),
            period: self.spec.period.clone(),
            renew_after: self.spec.renew_after.clone(),
            recreate_after: self.spec.recreate_after.clone(),
        })
    }
}

/// Lists `VaultPolicy` resources in every namespace.
#[derive(Clone)]
pub struct KubePolicySource {
    api: Api<VaultPolicy>,
}

impl KubePolicySource {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

impl std::fmt::Debug for KubePolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubePolicySource").finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl PolicySource for KubePolicySource {
    async fn list(&self) -> Result<Vec<PolicyDeclaration>, SourceError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| SourceError {
                source_name: "VaultPolicy resources".to_owned(),
                reason: e.to_string(),
            })?;

        let declarations: Vec<PolicyDeclaration> = list
            .items
            .iter()
            .filter_map(|p| {
                let decl = p.to_declaration();
                if decl.is_none() {
                    warn!("VaultPolicy without name or namespace ignored");
                }
                decl
            })
            .collect();
        debug!(policies = declarations.len(), "VaultPolicy resources listed");
        Ok(declarations)
    }
}

/// Reads a JSON list of declarations from a file.
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    path: PathBuf,
}

impl FilePolicySource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn error(&self, reason: String) -> SourceError {
        SourceError {
            source_name: self.path.display().to_string(),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl PolicySource for FilePolicySource {
    async fn list(&self) -> Result<Vec<PolicyDeclaration>, SourceError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| self.error(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| self.error(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use kube::CustomResourceExt;

    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "vault-keeper-{}-{name}.json",
            std::process::id()
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    // ── VaultPolicy ──────────────────────────────────────────────────

    #[test]
    fn crd_is_namespaced_under_vault_local() {
        let crd = VaultPolicy::crd();
        assert_eq!(crd.spec.group, "vault.local");
        assert_eq!(crd.spec.names.kind, "VaultPolicy");
        assert_eq!(crd.spec.names.plural, "vaultpolicies");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.versions[0].name, "v1");
    }

    #[test]
    fn resource_converts_to_declaration() {
        let json = serde_json::json!({
            "apiVersion": "vault.local/v1",
            "kind": "VaultPolicy",
            "metadata": { "name": "app-reader", "namespace": "apps" },
            "spec": {
                "rules": [
                    { "path": "secret/data/app/*", "capability": "read" },
                    { "path": "secret/metadata/app/*", "permission": "list" }
                ],
                "ttl": "1h",
                "renewAfter": "10m",
                "recreateAfter": "1m"
            }
        });
        let policy: VaultPolicy = serde_json::from_value(json).unwrap();
        let decl = policy.to_declaration().unwrap();

        assert_eq!(decl.name, "app-reader");
        assert_eq!(decl.namespace, "apps");
        assert_eq!(decl.rules.len(), 2);
        assert_eq!(decl.rules[1].capability, "list");
        assert_eq!(decl.ttl.as_deref(), Some("1h"));
        assert_eq!(decl.period, None);
        assert_eq!(decl.renew_after.as_deref(), Some("10m"));
        assert_eq!(decl.recreate_after.as_deref(), Some("1m"));
        assert!(decl.validate(86_400).is_ok());
    }

    #[test]
    fn resource_without_namespace_is_ignored() {
        let policy = VaultPolicy::new("orphan", VaultPolicySpec {
            rules: Vec::new(),
            ttl: None,
            period: None,
            renew_after: None,
            recreate_after: None,
        });
        assert!(policy.to_declaration().is_none());
    }

    // ── FilePolicySource ─────────────────────────────────────────────

    #[tokio::test]
    async fn file_source_reads_declarations() {
        let path = temp_file(
            "ok",
            r#"[{"name":"app","namespace":"apps","rules":[{"path":"secret/*","capability":"read"}],"period":"30m"}]"#,
        );
        let listed = FilePolicySource::new(&path).list().await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "app");
        assert_eq!(listed[0].period.as_deref(), Some("30m"));
    }

    #[tokio::test]
    async fn file_source_reports_malformed_json() {
        let path = temp_file("bad", "{ not json");
        let err = FilePolicySource::new(&path).list().await.unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(err.source_name.ends_with("-bad.json"));
    }

    #[tokio::test]
    async fn file_source_reports_missing_file() {
        let err = FilePolicySource::new("/nonexistent/vault-keeper/policies.json")
            .list()
            .await
            .unwrap_err();
        assert!(err.source_name.contains("policies.json"));
    }
}
