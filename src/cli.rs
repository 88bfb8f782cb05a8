use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser};
use url::Url;

use crate::core::{AUTHOR_NAME, SERVICE_NAME};

#[derive(Parser)]
#[clap(name = SERVICE_NAME)]
#[clap(author = AUTHOR_NAME)]
pub struct Cli {
    #[command(flatten, next_help_heading = "cluster")]
    pub cluster: ClusterConfig,

    #[command(flatten, next_help_heading = "health")]
    pub health: HealthConfig,

    #[command(flatten, next_help_heading = "persist")]
    pub persist: PersistConfig,

    #[command(flatten, next_help_heading = "listen")]
    pub listen: ListenConfig,

    #[command(flatten, next_help_heading = "monitoring")]
    pub monitoring: MonitoringConfig,
}

#[derive(Args)]
pub struct ClusterConfig {
    /// Comma separated list of peer URLs forming the cluster
    #[clap(long, value_delimiter = ',')]
    pub server_list: Vec<Url>,

    /// This node's own URL; optional if the local IP matches a server-list entry
    #[clap(long)]
    pub my_url: Option<Url>,

    /// Whether to join the configured cluster or run standalone
    #[clap(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub cluster_mode: bool,

    /// The delay between cluster loop ticks in milliseconds
    #[clap(long, default_value = "5000")]
    pub heartbeat_interval_ms: u64,
}

#[derive(Args)]
pub struct HealthConfig {
    /// How frequently to run liveness sweeps in milliseconds
    #[clap(long, default_value = "10000")]
    pub sweep_interval_ms: u64,

    /// Instance liveness threshold in milliseconds; must exceed the sweep interval
    #[clap(long, default_value = "20000")]
    pub node_timeout_ms: u64,
}

#[derive(Args)]
pub struct PersistConfig {
    /// Filesystem path of the durable snapshot blob
    #[clap(long, default_value = "registry_snapshot.json")]
    pub snapshot_path: PathBuf,

    /// The delay between durable snapshot saves in seconds
    #[clap(long, default_value = "30")]
    pub snapshot_interval: u64,
}

#[derive(Args)]
pub struct ListenConfig {
    // Port to listen for HTTP
    #[clap(long, default_value = "8080")]
    pub http_port: u16,

    // Timeout for outgoing peer requests in milliseconds
    #[clap(long, default_value = "500")]
    pub peer_timeout_ms: u64,
}

#[derive(Args)]
pub struct MonitoringConfig {
    /// The socket used to export metrics.
    #[clap(long, default_value = "127.0.0.1:9090")]
    pub metrics_addr: SocketAddr,
}
