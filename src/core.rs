use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context, Error};
use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures::future::TryFutureExt;
use prometheus::Registry as MetricsRegistry;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    check::HttpProber,
    cli::Cli,
    cluster::{resolve_local_ip, ClusterRunner, ClusterView},
    http::ReqwestClient,
    metrics::{metrics_handler, MetricParams, MetricsHandlerArgs, MetricsRunner, WithMetrics},
    persist::{self, FileStore, Persister, Store},
    registry::RegistryState,
    replicate::{HttpSnapshotFetcher, Replicator},
    routes::{self, ApiState},
    sweep::Sweeper,
};

pub const SERVICE_NAME: &str = "registryd";
pub const AUTHOR_NAME: &str = "Registry Team";

// How long in-flight ticks get to drain on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Source of wall-clock milliseconds. Swappable so tests can drive time.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|x| x.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[async_trait]
pub trait Run: Send + Sync {
    async fn run(&mut self) -> Result<(), Error>;
}

pub struct ThrottleParams {
    pub throttle_duration: Duration,
    pub next_time: Option<Instant>,
}

impl ThrottleParams {
    pub fn new(throttle_duration: Duration) -> Self {
        Self {
            throttle_duration,
            next_time: None,
        }
    }
}

pub struct WithThrottle<T>(pub T, pub ThrottleParams);

#[async_trait]
impl<T: Run> Run for WithThrottle<T> {
    async fn run(&mut self) -> Result<(), Error> {
        let current_time = Instant::now();
        let next_time = self.1.next_time.unwrap_or(current_time);

        if next_time > current_time {
            tokio::time::sleep(next_time - current_time).await;
        }
        self.1.next_time = Some(Instant::now() + self.1.throttle_duration);

        self.0.run().await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut x) => {
                x.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if cli.cluster.cluster_mode && cli.cluster.server_list.is_empty() {
        bail!("--server-list is required in cluster mode");
    }
    if cli.health.node_timeout_ms <= cli.health.sweep_interval_ms {
        bail!("--node-timeout-ms must exceed --sweep-interval-ms");
    }

    let metrics_registry = MetricsRegistry::new_custom(Some(SERVICE_NAME.into()), None)
        .context("unable to create metrics registry")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(RegistryState::new(clock.clone()));

    // Durable snapshot store; a missing blob is an empty start
    let store: Arc<dyn Store> = Arc::new(FileStore::new(cli.persist.snapshot_path.clone()));
    match persist::restore(&registry, store.as_ref()) {
        Ok(true) => info!(
            version = registry.snapshot_version(),
            "registry restored from durable snapshot"
        ),
        Ok(false) => info!("no durable snapshot found, starting empty"),
        Err(e) => warn!(error = %e, "unable to restore durable snapshot, starting empty"),
    }

    let local_ip = match resolve_local_ip() {
        Ok(x) => x,
        Err(e) => {
            warn!(error = %e, "unable to resolve local address, assuming loopback");
            std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
        }
    };

    let view = Arc::new(if cli.cluster.cluster_mode {
        ClusterView::new(&cli.cluster.server_list, cli.cluster.my_url.as_ref(), local_ip)?
    } else {
        // Standalone nodes form a single-member cluster and lead it
        ClusterView::standalone(cli.cluster.my_url.as_ref(), local_ip, cli.listen.http_port)?
    });

    let (shutdown_tx, _) = watch::channel(false);
    let mut tasks = vec![];

    let mut runners: Vec<(&str, Box<dyn Run>)> = vec![];

    // Liveness sweeper: evicts instances whose heartbeat went stale
    let sweeper = Sweeper::new(
        registry.clone(),
        clock.clone(),
        Duration::from_millis(cli.health.node_timeout_ms),
    );
    runners.push((
        "sweep",
        Box::new(WithThrottle(
            WithMetrics(sweeper, MetricParams::new(&metrics_registry, "sweep")),
            ThrottleParams::new(Duration::from_millis(cli.health.sweep_interval_ms)),
        )),
    ));

    // Cluster loop: probe peers -> maybe reelect -> maybe replicate
    if cli.cluster.cluster_mode {
        let http_client = Arc::new(
            ReqwestClient::new(Duration::from_millis(cli.listen.peer_timeout_ms))
                .context("unable to build peer HTTP client")?,
        );

        let runner = ClusterRunner::new(
            view.clone(),
            registry.clone(),
            Arc::new(HttpProber::new(http_client.clone())),
            Replicator::new(
                registry.clone(),
                Arc::new(HttpSnapshotFetcher::new(http_client)),
            ),
        );
        runners.push((
            "cluster",
            Box::new(WithThrottle(
                WithMetrics(runner, MetricParams::new(&metrics_registry, "cluster")),
                ThrottleParams::new(Duration::from_millis(cli.cluster.heartbeat_interval_ms)),
            )),
        ));
    }

    // Periodic durable persistence
    let persister = Persister::new(registry.clone(), store.clone());
    runners.push((
        "persist",
        Box::new(WithThrottle(
            WithMetrics(persister, MetricParams::new(&metrics_registry, "persist")),
            ThrottleParams::new(Duration::from_secs(cli.persist.snapshot_interval)),
        )),
    ));

    // Gauge refresh
    let metrics_runner = MetricsRunner::new(&metrics_registry, registry.clone(), view.clone());
    runners.push((
        "metrics",
        Box::new(WithThrottle(
            metrics_runner,
            ThrottleParams::new(Duration::from_secs(10)),
        )),
    ));

    for (name, mut runner) in runners {
        let mut rx = shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = rx.changed() => break,
                    _ = runner.run() => {}
                }
            }
            debug!(task = name, "task stopped");
        }));
    }

    // Main API server
    let api_state = Arc::new(ApiState {
        registry: registry.clone(),
        cluster: view.clone(),
    });
    let router = routes::setup_router(api_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.listen.http_port));
    let mut rx = shutdown_tx.subscribe();
    let server = axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = rx.changed().await;
        });
    tasks.push(tokio::spawn(
        server.unwrap_or_else(|e| error!(error = %e, "API server failed")),
    ));

    // Metrics server on the monitoring address
    let metrics_router = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(MetricsHandlerArgs {
            registry: metrics_registry,
        });
    let mut rx = shutdown_tx.subscribe();
    let metrics_server = axum::Server::bind(&cli.monitoring.metrics_addr)
        .serve(metrics_router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = rx.changed().await;
        });
    tasks.push(tokio::spawn(
        metrics_server.unwrap_or_else(|e| error!(error = %e, "metrics server failed")),
    ));

    info!(
        listen = %addr,
        metrics = %cli.monitoring.metrics_addr,
        cluster_mode = cli.cluster.cluster_mode,
        "started",
    );

    shutdown_signal().await;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_DRAIN, drain).await.is_err() {
        warn!("tasks did not drain in time, terminating");
    }

    // Final durable snapshot before exit
    if let Err(e) = persist::persist(&registry, store.as_ref()) {
        error!(error = %e, "unable to write final snapshot");
    }

    Ok(())
}
