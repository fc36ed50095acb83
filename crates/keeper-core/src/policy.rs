//! Policy declarations.
//!
//! A [`PolicyDeclaration`] is what an operator writes: a name, a namespace,
//! ordered path rules, and the token lifetime settings as duration strings.
//! [`PolicyDeclaration::validate`] turns it into a [`ValidatedPolicy`] with
//! every duration in seconds and the TTL/period choice resolved. Rendering
//! produces the HCL body sent to `sys/policy/<name>`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::TokenLifetime;
use crate::duration;
use crate::error::{PolicyError, SourceError};
use crate::lifecycle::Thresholds;

/// An access capability on a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Create new data.
    Create,
    /// Read data.
    Read,
    /// Update existing data.
    Update,
    /// Partially update existing data.
    Patch,
    /// Delete data.
    Delete,
    /// List keys under a prefix.
    List,
    /// Root-protected operations.
    Sudo,
    /// Explicit deny, overriding everything else.
    Deny,
}

impl Capability {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Sudo => "sudo",
            Self::Deny => "deny",
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "patch" => Ok(Self::Patch),
            "delete" => Ok(Self::Delete),
            "list" => Ok(Self::List),
            "sudo" => Ok(Self::Sudo),
            "deny" => Ok(Self::Deny),
            other => Err(format!("unknown capability '{other}'")),
        }
    }
}

/// One `{path, capability}` rule as declared.
///
/// The capability is kept as a string so one bad rule invalidates only its
/// own declaration instead of failing the whole listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Path pattern.
    pub path: String,
    /// Capability name.
    #[serde(alias = "permission")]
    pub capability: String,
}

impl PolicyRule {
    /// Build a rule.
    pub fn new(path: impl Into<String>, capability: Capability) -> Self {
        Self {
            path: path.into(),
            capability: capability.as_str().to_owned(),
        }
    }
}

/// A declared policy and its token lifetime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDeclaration {
    /// Policy name on the cluster; also the name of the token secret.
    pub name: String,
    /// Namespace the token secret is written to.
    pub namespace: String,
    /// Ordered rules.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Hard token TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
    /// Periodic token period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    /// Renew when the remaining TTL drops below this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renew_after: Option<String>,
    /// Recreate when the remaining TTL drops to or below this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recreate_after: Option<String>,
}

/// A declaration with every setting checked and converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPolicy {
    /// Policy name.
    pub name: String,
    /// Token secret namespace.
    pub namespace: String,
    /// Rules with parsed capabilities.
    pub rules: Vec<(String, Capability)>,
    /// Token lifetime.
    pub lifetime: TokenLifetime,
    /// Renew/recreate thresholds.
    pub thresholds: Thresholds,
}

impl PolicyDeclaration {
    /// Check and convert every field.
    ///
    /// With neither `ttl` nor `period`, `default_ttl` seconds apply.
    ///
    /// # Errors
    ///
    /// [`PolicyError::InvalidDuration`] for any malformed duration,
    /// [`PolicyError::InvalidDeclaration`] for an empty name, a rule path
    /// that is empty or holds a quote or control character, an unknown
    /// capability, or both `ttl` and `period` set.
    pub fn validate(&self, default_ttl: u64) -> Result<ValidatedPolicy, PolicyError> {
        let invalid = |reason: String| PolicyError::InvalidDeclaration {
            policy: self.name.clone(),
            reason,
        };
        let seconds = |value: &Option<String>| -> Result<Option<u64>, PolicyError> {
            value
                .as_deref()
                .map(duration::to_seconds)
                .transpose()
                .map_err(|source| PolicyError::InvalidDuration {
                    policy: self.name.clone(),
                    source,
                })
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name is empty".to_owned()));
        }
        if self.name.contains('/') {
            return Err(invalid("name must not contain '/'".to_owned()));
        }

        let rules = self
            .rules
            .iter()
            .map(|r| {
                if r.path.trim().is_empty() {
                    return Err(invalid("rule path is empty".to_owned()));
                }
                if r.path.contains('"') || r.path.chars().any(char::is_control) {
                    return Err(invalid(format!(
                        "rule path {:?} contains a quote or control character",
                        r.path
                    )));
                }
                r.capability
                    .parse::<Capability>()
                    .map(|c| (r.path.clone(), c))
                    .map_err(&invalid)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let lifetime = match (seconds(&self.ttl)?, seconds(&self.period)?) {
            (Some(_), Some(_)) => {
                return Err(invalid("ttl and period are mutually exclusive".to_owned()));
            }
            (None, Some(period)) => TokenLifetime::Period(period),
            (Some(ttl), None) => TokenLifetime::Ttl(ttl),
            (None, None) => TokenLifetime::Ttl(default_ttl),
        };

        let thresholds = Thresholds {
            renew_after: seconds(&self.renew_after)?,
            recreate_after: seconds(&self.recreate_after)?,
        };

        Ok(ValidatedPolicy {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            rules,
            lifetime,
            thresholds,
        })
    }
}

impl ValidatedPolicy {
    /// HCL body for the policy object, one rule per line.
    #[must_use]
    pub fn render_rules(&self) -> String {
        self.rules
            .iter()
            .map(|(path, cap)| format!("path \"{path}\" {{ capabilities = [\"{}\"] }}", cap.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Read-only source of the declared policy set, re-read every cycle.
#[async_trait::async_trait]
pub trait PolicySource: Send + Sync + 'static {
    /// Current declarations.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] if the listing fails.
    async fn list(&self) -> Result<Vec<PolicyDeclaration>, SourceError>;
}

/// A fixed declaration set, swappable at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicySource {
    declarations: Arc<std::sync::RwLock<Vec<PolicyDeclaration>>>,
}

impl StaticPolicySource {
    /// Build from a declaration list.
    #[must_use]
    pub fn new(declarations: Vec<PolicyDeclaration>) -> Self {
        Self {
            declarations: Arc::new(std::sync::RwLock::new(declarations)),
        }
    }

    /// Replace the declaration set.
    pub fn replace(&self, declarations: Vec<PolicyDeclaration>) {
        if let Ok(mut guard) = self.declarations.write() {
            *guard = declarations;
        }
    }
}

#[async_trait::async_trait]
impl PolicySource for StaticPolicySource {
    async fn list(&self) -> Result<Vec<PolicyDeclaration>, SourceError> {
        self.declarations
            .read()
            .map(|d| d.clone())
            .map_err(|_| SourceError {
                source_name: "static".to_owned(),
                reason: "declaration lock poisoned".to_owned(),
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn decl() -> PolicyDeclaration {
        PolicyDeclaration {
            name: "app".to_owned(),
            namespace: "apps".to_owned(),
            rules: vec![
                PolicyRule::new("secret/data/app/*", Capability::Read),
                PolicyRule::new("secret/metadata/app/*", Capability::List),
            ],
            ttl: None,
            period: None,
            renew_after: None,
            recreate_after: None,
        }
    }

    // ── validate ─────────────────────────────────────────────────────

    #[test]
    fn default_ttl_applies_when_neither_set() {
        let v = decl().validate(86_400).unwrap();
        assert_eq!(v.lifetime, TokenLifetime::Ttl(86_400));
        assert_eq!(v.thresholds, Thresholds::default());
    }

    #[test]
    fn period_and_thresholds_parse() {
        let mut d = decl();
        d.period = Some("1h".to_owned());
        d.renew_after = Some("10m".to_owned());
        d.recreate_after = Some("1m".to_owned());

        let v = d.validate(86_400).unwrap();
        assert_eq!(v.lifetime, TokenLifetime::Period(3_600));
        assert_eq!(v.thresholds.renew_after, Some(600));
        assert_eq!(v.thresholds.recreate_after, Some(60));
    }

    #[test]
    fn ttl_and_period_together_rejected() {
        let mut d = decl();
        d.ttl = Some("1h".to_owned());
        d.period = Some("1h".to_owned());
        assert!(matches!(
            d.validate(60),
            Err(PolicyError::InvalidDeclaration { .. })
        ));
    }

    #[test]
    fn bad_duration_rejected() {
        let mut d = decl();
        d.renew_after = Some("5x".to_owned());
        let err = d.validate(60).unwrap_err();
        match err {
            PolicyError::InvalidDuration { policy, source } => {
                assert_eq!(policy, "app");
                assert_eq!(source.input, "5x");
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_capability_rejected() {
        let mut d = decl();
        d.rules.push(PolicyRule {
            path: "sys/*".to_owned(),
            capability: "root".to_owned(),
        });
        assert!(matches!(
            d.validate(60),
            Err(PolicyError::InvalidDeclaration { .. })
        ));
    }

    #[test]
    fn quoted_path_rejected_before_rendering() {
        for path in ["secret/\" } path \"sys/*", "secret/a\nb", " "] {
            let mut d = decl();
            d.rules.push(PolicyRule::new(path, Capability::Read));
            assert!(
                matches!(d.validate(60), Err(PolicyError::InvalidDeclaration { .. })),
                "accepted {path:?}"
            );
        }
    }

    #[test]
    fn empty_name_rejected() {
        let mut d = decl();
        d.name = "  ".to_owned();
        assert!(d.validate(60).is_err());
    }

    // ── render ───────────────────────────────────────────────────────

    #[test]
    fn rules_render_one_per_line_in_order() {
        let v = decl().validate(60).unwrap();
        assert_eq!(
            v.render_rules(),
            "path \"secret/data/app/*\" { capabilities = [\"read\"] }\n\
             path \"secret/metadata/app/*\" { capabilities = [\"list\"] }"
        );
    }

    // ── serde ────────────────────────────────────────────────────────

    #[test]
    fn declaration_reads_camel_case_and_permission_alias() {
        let d: PolicyDeclaration = serde_json::from_str(
            r#"{
                "name": "app",
                "namespace": "apps",
                "rules": [{"path": "secret/*", "permission": "read"}],
                "renewAfter": "5m",
                "recreateAfter": "1m"
            }"#,
        )
        .unwrap();
        assert_eq!(d.rules[0].capability, "read");
        assert_eq!(d.renew_after.as_deref(), Some("5m"));
        assert_eq!(d.recreate_after.as_deref(), Some("1m"));
    }

    #[tokio::test]
    async fn static_source_replace() {
        let source = StaticPolicySource::new(vec![decl()]);
        assert_eq!(source.list().await.unwrap().len(), 1);
        source.replace(Vec::new());
        assert!(source.list().await.unwrap().is_empty());
    }
}
