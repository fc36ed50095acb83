//! Token lifetime decisions and the persisted token record.
//!
//! [`decide`] is pure: it maps the live remaining TTL and renewability against
//! the declared thresholds to a [`TokenAction`]. Recreate is checked
//! first, so a token inside both windows is replaced rather than extended.

use chrono::{DateTime, SecondsFormat, Utc};
use keeper_storage::{SecretStore, StoreError};
use zeroize::Zeroizing;

/// Key holding `created-at` inside a token secret.
pub const CREATED_AT_KEY: &str = "created-at";
/// Key holding the lifetime seconds inside a token secret.
pub const TTL_KEY: &str = "ttl";

/// Renew/recreate thresholds in seconds. Unset means never.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Thresholds {
    /// Renew when remaining is strictly below this.
    pub renew_after: Option<u64>,
    /// Recreate when remaining is at or below this.
    pub recreate_after: Option<u64>,
}

/// What to do with an existing token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenAction {
    /// Issue a fresh token and abandon the old one.
    Recreate,
    /// Extend the current token.
    Renew,
    /// Leave it alone.
    Keep,
}

/// Pick the action for a token with `remaining` seconds left.
#[must_use]
pub fn decide(remaining: u64, renewable: bool, thresholds: Thresholds) -> TokenAction {
    if thresholds.recreate_after.is_some_and(|t| remaining <= t) {
        return TokenAction::Recreate;
    }
    if renewable && thresholds.renew_after.is_some_and(|t| remaining < t) {
        return TokenAction::Renew;
    }
    TokenAction::Keep
}

/// A token issued for a policy, as persisted.
///
/// The raw token is stored under a key named after the policy so existing
/// consumers of the secret keep working.
#[derive(Clone)]
pub struct IssuedToken {
    /// Policy the token carries.
    pub policy_name: String,
    /// The client token.
    pub token: Zeroizing<String>,
    /// When it was issued.
    pub created_at: DateTime<Utc>,
    /// Lifetime requested at creation.
    pub ttl_seconds: u64,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("policy_name", &self.policy_name)
            .field("created_at", &self.created_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

impl IssuedToken {
    /// A token issued now.
    pub fn issued_now(policy_name: impl Into<String>, token: String, ttl_seconds: u64) -> Self {
        Self {
            policy_name: policy_name.into(),
            token: Zeroizing::new(token),
            created_at: Utc::now(),
            ttl_seconds,
        }
    }

    /// Load the token for `policy_name` from its secret in `namespace`.
    ///
    /// Missing or malformed metadata keys fall back to the Unix epoch and
    /// zero; only the token itself is required.
    ///
    /// # Errors
    ///
    /// Any store read error.
    pub async fn load(
        store: &dyn SecretStore,
        policy_name: &str,
        namespace: &str,
    ) -> Result<Option<Self>, StoreError> {
        let Some(token) = store.get(policy_name, policy_name, namespace).await? else {
            return Ok(None);
        };
        if token.is_empty() {
            return Ok(None);
        }

        let created_at = store
            .get(policy_name, CREATED_AT_KEY, namespace)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map_or(DateTime::UNIX_EPOCH, |d| d.with_timezone(&Utc));
        let ttl_seconds = store
            .get(policy_name, TTL_KEY, namespace)
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        Ok(Some(Self {
            policy_name: policy_name.to_owned(),
            token: Zeroizing::new(token),
            created_at,
            ttl_seconds,
        }))
    }

    /// Persist the token, then its metadata.
    ///
    /// # Errors
    ///
    /// Any store write error. A failure after the token key was written
    /// leaves stale metadata, which [`load`](Self::load) tolerates.
    pub async fn persist(&self, store: &dyn SecretStore, namespace: &str) -> Result<(), StoreError> {
        let name = &self.policy_name;
        store.put(name, name, &self.token, namespace).await?;
        store
            .put(
                name,
                CREATED_AT_KEY,
                &self.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                namespace,
            )
            .await?;
        store
            .put(name, TTL_KEY, &self.ttl_seconds.to_string(), namespace)
            .await
    }
}
