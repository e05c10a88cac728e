//! # upstreamd entry point
//!
//! Control plane daemon for a weight-adaptive nginx load balancer.
//!
//! ## Usage
//!
//! ```bash
//! # Start the daemon with a config file
//! upstreamd run -c /etc/upstreamd/config.toml
//!
//! # Override the API bind address and instance id
//! upstreamd run -c config.toml -b 0.0.0.0:9090 --instance-id lb-2
//!
//! # Render the current shared-state weights to stdout
//! upstreamd render -c config.toml
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use argh::FromArgs;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use upstreamd_api::{ApiContext, ApiServer};
use upstreamd_common::DaemonConfig;
use upstreamd_control::{
    Coordinator, DriftReconciler, MetricsIngestor, NginxMaterializer, PolicyStore, Scheduler,
    ServerRegistry, WeightEngine,
};
use upstreamd_store::{MemoryStore, MetricsArchive, RedisStore, SharedState, StateStore};

/// upstreamd - adaptive weight control plane for nginx upstreams
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Run(RunArgs),
    Render(RenderArgs),
}

/// run the control plane daemon
#[derive(FromArgs)]
#[argh(subcommand, name = "run")]
struct RunArgs {
    /// path to the configuration file (TOML/YAML); environment variables
    /// prefixed UPSTREAMD_ overlay it
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// bind address for the HTTP API, overriding the configured one
    #[argh(option, short = 'b')]
    bind: Option<String>,

    /// identity of this instance in the shared store, overriding the
    /// configured one
    #[argh(option, long = "instance-id")]
    instance_id: Option<String>,
}

/// render the current shared-state weights as an nginx config to stdout
#[derive(FromArgs)]
#[argh(subcommand, name = "render")]
struct RenderArgs {
    /// path to the configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Run(args) => run_daemon(args).await,
        Commands::Render(args) => render_weights(args).await,
    }
}

/// Connects to the configured shared store, degrading to the in-memory
/// backend when Redis is unreachable so a store outage never prevents boot.
async fn open_state_store(config: &DaemonConfig) -> Arc<dyn StateStore> {
    match RedisStore::connect(&config.redis.url).await {
        Ok(store) => {
            info!(url = %config.redis.url, "connected to shared state store");
            Arc::new(store)
        }
        Err(e) => {
            warn!(
                url = %config.redis.url,
                error = %e,
                "shared store unreachable, degrading to in-memory state \
                 (single-instance operation)"
            );
            Arc::new(MemoryStore::new())
        }
    }
}

async fn run_daemon(args: RunArgs) -> Result<()> {
    let mut config =
        DaemonConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.api_bind = bind;
    }
    if let Some(instance_id) = args.instance_id {
        config.instance_id = instance_id;
    }

    let addr: SocketAddr = config
        .api_bind
        .parse()
        .with_context(|| format!("invalid bind address {}", config.api_bind))?;

    info!(
        instance_id = %config.instance_id,
        incoming = config.incoming_servers.len(),
        outgoing = config.outgoing_servers.len(),
        "starting upstreamd"
    );

    let store = open_state_store(&config).await;
    let shared = Arc::new(SharedState::new(
        store,
        config.redis.keys.clone(),
        config.redis.ttl,
        config.instance_id.clone(),
    ));
    let archive = Arc::new(
        MetricsArchive::open(&config.archive.dir).context("failed to open metrics archive")?,
    );

    let registry = Arc::new(ServerRegistry::new(
        config.incoming_servers.clone(),
        config.outgoing_servers.clone(),
    ));
    let policies = Arc::new(PolicyStore::new(shared.clone()));
    policies.hydrate().await;
    let factors = Arc::new(RwLock::new(config.weight_factors));

    let (recompute_tx, recompute_rx) = mpsc::channel(8);
    let ingestor = Arc::new(MetricsIngestor::new(
        registry.clone(),
        policies.clone(),
        shared.clone(),
        archive.clone(),
        config.ewma_alpha,
        recompute_tx.clone(),
    ));
    let engine = Arc::new(WeightEngine::new(
        registry.clone(),
        policies.clone(),
        factors.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        engine,
        shared.clone(),
        archive.clone(),
    ));
    let materializer = Arc::new(NginxMaterializer::new(
        config.nginx.clone(),
        shared.clone(),
    ));
    let reconciler = Arc::new(DriftReconciler::new(shared.clone(), materializer.clone()));

    // Register with the fleet before the first scheduled heartbeat.
    shared.heartbeat().await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let scheduler = Arc::new(Scheduler::new(
        shared.clone(),
        coordinator,
        materializer.clone(),
        reconciler.clone(),
        archive.clone(),
        config.redis.intervals,
        config.archive.retention_days,
    ));
    let task_handles = scheduler.spawn_all(recompute_rx, &shutdown_tx);

    let context = Arc::new(ApiContext {
        ingestor,
        registry,
        policies,
        factors,
        shared,
        archive,
        materializer,
        reconciler,
        recompute_tx,
    });
    let server = ApiServer::new(context);

    // Signal handling: first SIGINT/SIGTERM stops the timers and drains the
    // API server, then the process exits 0.
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        });
    }

    server.run(addr, shutdown_tx).await?;

    for handle in task_handles {
        let _ = handle.await;
    }
    info!("upstreamd stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

async fn render_weights(args: RenderArgs) -> Result<()> {
    let config =
        DaemonConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let store = open_state_store(&config).await;
    let shared = SharedState::new(
        store,
        config.redis.keys.clone(),
        config.redis.ttl,
        config.instance_id.clone(),
    );

    let weights = shared.get_weights().await.unwrap_or_default();
    let registry = ServerRegistry::new(config.incoming_servers, config.outgoing_servers);
    let mut incoming = Vec::new();
    let mut outgoing = Vec::new();
    for allocation in weights {
        match registry.get(&allocation.server_id) {
            Some((_, upstreamd_common::model::Pool::Incoming)) => incoming.push(allocation),
            Some((_, upstreamd_common::model::Pool::Outgoing)) => outgoing.push(allocation),
            None => warn!(server_id = %allocation.server_id, "allocation for unknown server"),
        }
    }

    let rendered =
        upstreamd_control::render_dual_upstream(&incoming, &outgoing, chrono::Utc::now());
    println!("{rendered}");
    Ok(())
}
