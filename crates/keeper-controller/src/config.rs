//! Controller configuration.
//!
//! Every setting is a command-line flag with an environment fallback.
//! [`Args`] is the raw surface; [`ControllerConfig::from_args`] validates it
//! into the typed settings the control loops are built from.
//!
//! Environment variables:
//! - `VAULT_LABEL_KEY` / `VAULT_LABEL_VALUE`: pod label selector (default: `k8s-app=vault`)
//! - `VAULT_NAMESPACE`: namespace of the pods and escrow secrets (default: `kube-system`)
//! - `VAULT_ADDR`: cluster service address used by the policy controller
//! - `VAULT_SCHEME` / `VAULT_PORT`: how instance URLs are built (default: `https`, `8243`)
//! - `VAULT_TOKEN`: root token known at startup (optional)
//! - `VAULT_INIT_SHARES` / `VAULT_INIT_THRESHOLD`: quorum requested at initialize (default: `5`/`3`)
//! - `VAULT_UNSEAL_KEYS`: comma-separated keys used when nothing is escrowed (optional)
//! - `VAULT_INSTANCES`: comma-separated static host list, replaces pod discovery (optional)
//! - `VAULT_UNSEAL_SECRET_NAME` / `VAULT_UNSEAL_SECRET_KEY`: unseal share escrow
//! - `VAULT_TOKEN_SECRET_NAME` / `VAULT_TOKEN_SECRET_KEY`: root token escrow
//! - `RELOAD_FREQUENCY`: bootstrap cycle interval (default: `30s`)
//! - `POLICY_REFRESH_INTERVAL`: policy cycle interval (default: `30s`)
//! - `VAULT_RETRY_INTERVAL` / `VAULT_RETRY_ATTEMPTS` / `VAULT_RETRY_TIMEOUT`: retry bounds
//! - `VAULT_REQUEST_TIMEOUT`: per-request HTTP timeout (default: `10s`)
//! - `VAULT_EVICTION`: allow pod eviction (default: on under Kubernetes, off otherwise)
//! - `VAULT_EVICT_AFTER_FAILURES`: failed cycles before a reachable pod is evicted (default: `1`)
//! - `VAULT_SKIP_VERIFY`: accept invalid TLS certificates (default: `false`)
//! - `VAULT_DEFAULT_TOKEN_TTL`: TTL for policies without `ttl` or `period` (default: `24h`)
//! - `VAULT_POLICY_FILE`: JSON declaration list, replaces the `VaultPolicy` resources (optional)
//! - `KEEPER_BIND_ADDR`: status server address (default: `0.0.0.0:8300`)
//! - `KEEPER_LOG_LEVEL`: log filter when `RUST_LOG` is unset (default: `info`)
//! - `DEBUG`: force the `debug` level

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::builder::BoolishValueParser;
use keeper_core::bootstrap::BootstrapConfig;
use keeper_core::duration;
use keeper_core::policy_controller::PolicyControllerConfig;
use keeper_core::registry::Selector;
use keeper_core::retry::RetryPolicy;
use keeper_core::root_token::RootToken;
use keeper_storage::SecretRef;
use zeroize::Zeroizing;

use crate::error::ConfigError;

/// Command-line and environment surface.
#[derive(Parser)]
#[command(
    name = "vault-keeper",
    version,
    about = "Initializes, unseals and keeps policy tokens alive for a Vault cluster"
)]
pub struct Args {
    /// Pod label key selecting cluster instances.
    #[arg(long, env = "VAULT_LABEL_KEY", default_value = "k8s-app")]
    pub label_key: String,

    /// Pod label value selecting cluster instances.
    #[arg(long, env = "VAULT_LABEL_VALUE", default_value = "vault")]
    pub label_value: String,

    /// Namespace of the instances and the escrow secrets.
    #[arg(long, env = "VAULT_NAMESPACE", default_value = "kube-system")]
    pub namespace: String,

    /// Cluster service address.
    #[arg(
        long,
        env = "VAULT_ADDR",
        default_value = "https://vault.kube-system.svc.cluster.local:8243"
    )]
    pub vault_addr: String,

    /// Scheme of instance URLs.
    #[arg(long, env = "VAULT_SCHEME", default_value = "https")]
    pub scheme: String,

    /// Port of instance URLs.
    #[arg(long, env = "VAULT_PORT", default_value_t = 8243)]
    pub port: u16,

    /// Root token known at startup.
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Shares requested at initialize.
    #[arg(long, env = "VAULT_INIT_SHARES", default_value_t = 5)]
    pub shares: u8,

    /// Shares required to unseal.
    #[arg(long, env = "VAULT_INIT_THRESHOLD", default_value_t = 3)]
    pub threshold: u8,

    /// Comma-separated unseal keys, used when nothing is escrowed.
    #[arg(long, env = "VAULT_UNSEAL_KEYS", hide_env_values = true)]
    pub unseal_keys: Option<String>,

    /// Comma-separated static host list.
    #[arg(long, env = "VAULT_INSTANCES")]
    pub instances: Option<String>,

    #[arg(long, env = "VAULT_UNSEAL_SECRET_NAME", default_value = "vault-unseal-keys")]
    pub unseal_secret_name: String,

    #[arg(long, env = "VAULT_UNSEAL_SECRET_KEY", default_value = "unseal-keys")]
    pub unseal_secret_key: String,

    #[arg(long, env = "VAULT_TOKEN_SECRET_NAME", default_value = "vault-tokens")]
    pub token_secret_name: String,

    #[arg(long, env = "VAULT_TOKEN_SECRET_KEY", default_value = "root-token")]
    pub token_secret_key: String,

    /// Bootstrap cycle interval.
    #[arg(long, env = "RELOAD_FREQUENCY", default_value = "30s")]
    pub reload_frequency: String,

    /// Policy cycle interval.
    #[arg(long, env = "POLICY_REFRESH_INTERVAL", default_value = "30s")]
    pub policy_refresh_interval: String,

    /// Delay between retried calls.
    #[arg(long, env = "VAULT_RETRY_INTERVAL", default_value = "2s")]
    pub retry_interval: String,

    /// Attempts per call, including the first.
    #[arg(long, env = "VAULT_RETRY_ATTEMPTS", default_value_t = 5)]
    pub retry_attempts: u32,

    /// Total time budget per retried call.
    #[arg(long, env = "VAULT_RETRY_TIMEOUT", default_value = "30s")]
    pub retry_timeout: String,

    /// Per-request HTTP timeout.
    #[arg(long, env = "VAULT_REQUEST_TIMEOUT", default_value = "10s")]
    pub request_timeout: String,

    /// Allow deleting pods that cannot be driven.
    #[arg(long, env = "VAULT_EVICTION", value_parser = BoolishValueParser::new())]
    pub eviction: Option<bool>,

    /// Failed cycles before a reachable pod is evicted.
    #[arg(long, env = "VAULT_EVICT_AFTER_FAILURES", default_value_t = 1)]
    pub evict_after_failures: u32,

    /// Accept invalid TLS certificates.
    #[arg(
        long,
        env = "VAULT_SKIP_VERIFY",
        value_parser = BoolishValueParser::new(),
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    pub skip_verify: bool,

    /// TTL for policies that declare neither `ttl` nor `period`.
    #[arg(long, env = "VAULT_DEFAULT_TOKEN_TTL", default_value = "24h")]
    pub default_token_ttl: String,

    /// JSON file with a list of policy declarations.
    #[arg(long, env = "VAULT_POLICY_FILE")]
    pub policy_file: Option<PathBuf>,

    /// Status server bind address.
    #[arg(long, env = "KEEPER_BIND_ADDR", default_value = "0.0.0.0:8300")]
    pub bind_addr: SocketAddr,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, env = "KEEPER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Force debug logging.
    #[arg(
        long,
        env = "DEBUG",
        value_parser = BoolishValueParser::new(),
        default_value = "false",
        action = clap::ArgAction::Set
    )]
    pub debug: bool,
}

/// Validated controller settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Status server bind address.
    pub bind_addr: SocketAddr,
    /// Effective log filter.
    pub log_level: String,
    /// Whether the process runs inside Kubernetes.
    pub on_orchestrator: bool,
    /// How instances are discovered.
    pub selector: Selector,
    /// Coordinator settings.
    pub bootstrap: BootstrapConfig,
    /// Policy controller settings.
    pub policy: PolicyControllerConfig,
    /// Root token to seed the hand-off channel with.
    pub root_token: Option<RootToken>,
    /// Retry bounds for instance calls.
    pub retry: RetryPolicy,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Accept invalid TLS certificates.
    pub skip_verify: bool,
    /// Bootstrap cycle interval.
    pub reload_frequency: Duration,
    /// Policy cycle interval.
    pub policy_refresh_interval: Duration,
    /// JSON declaration file, if any.
    pub policy_file: Option<PathBuf>,
}

fn parse_duration(setting: &'static str, value: &str) -> Result<Duration, ConfigError> {
    duration::parse(value).map_err(|source| ConfigError::Duration { setting, source })
}

fn positive_duration(setting: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let parsed = parse_duration(setting, value)?;
    if parsed.is_zero() {
        return Err(ConfigError::Invalid {
            setting,
            reason: "must be greater than zero".to_owned(),
        });
    }
    Ok(parsed)
}

/// Host part of the cluster address, checked to be an `http(s)` URL.
fn address_host(address: &str) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::Address {
        address: address.to_owned(),
        reason: reason.to_owned(),
    };

    let url = reqwest::Url::parse(address).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    url.host_str()
        .map(|h| h.trim_matches(['[', ']']).to_owned())
        .ok_or_else(|| invalid("missing host"))
}

impl ControllerConfig {
    /// Validate raw arguments.
    ///
    /// `on_orchestrator` selects the eviction default and, with no static
    /// host list, whether pods are discovered by label. Off the orchestrator
    /// without `VAULT_INSTANCES`, the host of `VAULT_ADDR` is the only
    /// instance.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a threshold outside `1..=shares`, an
    /// unparseable duration, an unknown scheme, or an unusable cluster
    /// address.
    pub fn from_args(args: Args, on_orchestrator: bool) -> Result<Self, ConfigError> {
        if args.threshold == 0 || args.threshold > args.shares {
            return Err(ConfigError::Threshold {
                shares: args.shares,
                threshold: args.threshold,
            });
        }
        if !matches!(args.scheme.as_str(), "http" | "https") {
            return Err(ConfigError::Invalid {
                setting: "VAULT_SCHEME",
                reason: format!("'{}' is not http or https", args.scheme),
            });
        }
        if args.port == 0 {
            return Err(ConfigError::Invalid {
                setting: "VAULT_PORT",
                reason: "port must be non-zero".to_owned(),
            });
        }

        let vault_host = address_host(&args.vault_addr)?;

        let reload_frequency = positive_duration("RELOAD_FREQUENCY", &args.reload_frequency)?;
        let policy_refresh_interval =
            positive_duration("POLICY_REFRESH_INTERVAL", &args.policy_refresh_interval)?;
        let retry = RetryPolicy {
            interval: parse_duration("VAULT_RETRY_INTERVAL", &args.retry_interval)?,
            max_attempts: args.retry_attempts.max(1),
            timeout: positive_duration("VAULT_RETRY_TIMEOUT", &args.retry_timeout)?,
        };
        let request_timeout = positive_duration("VAULT_REQUEST_TIMEOUT", &args.request_timeout)?;
        let default_ttl =
            positive_duration("VAULT_DEFAULT_TOKEN_TTL", &args.default_token_ttl)?.as_secs();

        let hosts: Vec<String> = args
            .instances
            .as_deref()
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|h| !h.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let selector = if !hosts.is_empty() {
            Selector::Hosts(hosts)
        } else if on_orchestrator {
            Selector::Label {
                key: args.label_key,
                value: args.label_value,
                namespace: args.namespace.clone(),
            }
        } else {
            Selector::Hosts(vec![vault_host])
        };

        let bootstrap = BootstrapConfig {
            shares: args.shares,
            threshold: args.threshold,
            namespace: args.namespace,
            unseal_secret: SecretRef::new(args.unseal_secret_name, args.unseal_secret_key),
            token_secret: SecretRef::new(args.token_secret_name, args.token_secret_key),
            scheme: args.scheme,
            port: args.port,
            eviction: args.eviction.unwrap_or(on_orchestrator),
            evict_after_failures: args.evict_after_failures.max(1),
            static_unseal_keys: args
                .unseal_keys
                .filter(|k| !k.trim().is_empty())
                .map(Zeroizing::new),
        };

        let log_level = if args.debug {
            "debug".to_owned()
        } else {
            args.log_level
        };

        Ok(Self {
            bind_addr: args.bind_addr,
            log_level,
            on_orchestrator,
            selector,
            bootstrap,
            policy: PolicyControllerConfig {
                vault_addr: args.vault_addr,
                default_ttl,
            },
            root_token: RootToken::from_optional(args.token.as_deref()),
            retry,
            request_timeout,
            skip_verify: args.skip_verify,
            reload_frequency,
            policy_refresh_interval,
            policy_file: args.policy_file,
        })
    }
}
