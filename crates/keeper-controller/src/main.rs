//! `vault-keeper` entry point.
//!
//! Loads configuration, initializes structured logging, builds the
//! collaborators for either Kubernetes or a static host list, then runs the
//! bootstrap coordinator and the policy controller as background tasks next
//! to the status server. SIGINT or SIGTERM cancels both loops and drains the
//! server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use keeper_controller::config::{Args, ControllerConfig};
use keeper_controller::pods::PodRegistry;
use keeper_controller::policies::{FilePolicySource, KubePolicySource};
use keeper_controller::{routes, shutdown};
use keeper_controller::state::AppState;
use keeper_core::bootstrap::BootstrapCoordinator;
use keeper_core::http::HttpConnector;
use keeper_core::policy::{PolicySource, StaticPolicySource};
use keeper_core::policy_controller::PolicyController;
use keeper_core::registry::{InstanceRegistry, Selector, StaticRegistry};
use keeper_core::root_token;
use keeper_storage::{KubeSecretStore, MemorySecretStore, SecretStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Time the control loops get to finish their current call after shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// External collaborators of the two control loops.
struct Backends {
    registry: Arc<dyn InstanceRegistry>,
    store: Arc<dyn SecretStore>,
    source: Arc<dyn PolicySource>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let on_orchestrator = std::env::var_os("KUBERNETES_SERVICE_HOST").is_some();
    let config =
        ControllerConfig::from_args(args, on_orchestrator).context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(
        selector = %config.selector,
        vault_addr = %config.policy.vault_addr,
        on_orchestrator,
        eviction = config.bootstrap.eviction,
        "vault-keeper starting"
    );

    resolve_cluster_address(&config.policy.vault_addr).await?;
    let backends = build_backends(&config).await?;
    let connector = Arc::new(
        HttpConnector::new(config.request_timeout, config.skip_verify)
            .context("failed to build HTTP client")?,
    );

    let (publisher, root_watch) = root_token::channel(config.root_token.clone());
    let coordinator = BootstrapCoordinator::new(
        config.bootstrap.clone(),
        backends.registry,
        connector.clone(),
        Arc::clone(&backends.store),
        config.retry,
        publisher,
    );
    let controller = PolicyController::new(
        config.policy.clone(),
        backends.source,
        connector,
        backends.store,
        config.retry,
        root_watch.clone(),
    );

    let state = Arc::new(AppState {
        instances: coordinator.snapshot(),
        policies: controller.snapshot(),
        root_token: root_watch,
    });

    let cancel = CancellationToken::new();
    let coordinator_handle = tokio::spawn(coordinator.run(config.reload_frequency, cancel.clone()));
    let controller_handle =
        tokio::spawn(controller.run(config.policy_refresh_interval, cancel.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "status server listening");

    let served = axum::serve(listener, routes::app(state))
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await;
    cancel.cancel();

    let unclean = shutdown::drain(
        vec![
            ("bootstrap-coordinator", coordinator_handle),
            ("policy-controller", controller_handle),
        ],
        SHUTDOWN_GRACE,
    )
    .await;
    if unclean > 0 {
        warn!(unclean, "control loops did not stop cleanly");
    }

    served.context("server error")?;
    info!("vault-keeper stopped");
    Ok(())
}

/// Fail fast when the cluster service name does not resolve.
async fn resolve_cluster_address(address: &str) -> anyhow::Result<()> {
    let url = reqwest::Url::parse(address)
        .with_context(|| format!("cluster address '{address}' is not a URL"))?;
    let host = url
        .host_str()
        .with_context(|| format!("cluster address '{address}' has no host"))?
        .trim_matches(['[', ']']);
    let port = url.port_or_known_default().unwrap_or(443);

    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("cluster address '{address}' does not resolve"))?
        .next()
        .with_context(|| format!("cluster address '{address}' resolved to nothing"))?;
    Ok(())
}

async fn build_backends(config: &ControllerConfig) -> anyhow::Result<Backends> {
    if config.on_orchestrator {
        let client = kube::Client::try_default()
            .await
            .context("failed to build Kubernetes client")?;

        let registry: Arc<dyn InstanceRegistry> = match &config.selector {
            Selector::Label {
                key,
                value,
                namespace,
            } => Arc::new(PodRegistry::new(client.clone(), key, value, namespace)),
            Selector::Hosts(hosts) => Arc::new(StaticRegistry::new(hosts.iter().cloned())),
        };
        let source: Arc<dyn PolicySource> = match &config.policy_file {
            Some(path) => Arc::new(FilePolicySource::new(path)),
            None => Arc::new(KubePolicySource::new(client.clone())),
        };

        return Ok(Backends {
            registry,
            store: Arc::new(KubeSecretStore::new(client)),
            source,
        });
    }

    let Selector::Hosts(hosts) = &config.selector else {
        anyhow::bail!("label discovery requires running inside Kubernetes");
    };
    warn!("not running inside Kubernetes, escrowed secrets are kept in memory only");

    let source: Arc<dyn PolicySource> = if let Some(path) = &config.policy_file {
        Arc::new(FilePolicySource::new(path))
    } else {
        info!("no policy file configured, policy controller has nothing to manage");
        Arc::new(StaticPolicySource::default())
    };

    Ok(Backends {
        registry: Arc::new(StaticRegistry::new(hosts.iter().cloned())),
        store: Arc::new(MemorySecretStore::new()),
        source,
    })
}

/// Wait for SIGINT or SIGTERM, then cancel the control loops.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping");
    cancel.cancel();
}
