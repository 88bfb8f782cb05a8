use std::{net::IpAddr, sync::Arc};

use anyhow::{anyhow, Context, Error};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    check::Probe,
    core::Run,
    election,
    registry::RegistryState,
    replicate::{ReplicateStatus, Replicator},
};

/// One cluster peer as seen from this node. `url` is the identity, the other
/// fields track the last observed state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub url: String,
    pub status: bool,
    pub leader: bool,
    pub version: u64,
}

// Canonical "scheme://host:port" form used as peer identity
fn canonical_url(url: &Url) -> Result<String, Error> {
    let host = url.host_str().context("peer URL has no host")?;
    let port = url
        .port_or_known_default()
        .context("peer URL has no port")?;

    Ok(format!("{}://{}:{}", url.scheme(), host, port))
}

// Loopback hosts are rewritten to the resolved local IP so that peers agree
// on each other's identity
fn rewrite_loopback(url: &Url, local_ip: IpAddr) -> Result<Url, Error> {
    let mut url = url.clone();
    if matches!(url.host_str(), Some("localhost") | Some("127.0.0.1")) {
        url.set_ip_host(local_ip)
            .map_err(|_| anyhow!("unable to rewrite loopback host in '{url}'"))?;
    }

    Ok(url)
}

/// Resolves the local IP by opening a UDP socket towards a public address.
/// Nothing is sent; connect() only selects the source address.
pub fn resolve_local_ip() -> Result<IpAddr, Error> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").context("unable to bind probe socket")?;
    socket
        .connect("198.51.100.1:80")
        .context("unable to select a route")?;

    Ok(socket
        .local_addr()
        .context("unable to read local address")?
        .ip())
}

/// The fixed peer set of the cluster.
///
/// Initialized once from configuration; afterwards only status, leader and
/// version fields change. The set is published through an `ArcSwap` so request
/// handlers and the admission check read it lock-free while the cluster loop
/// updates it.
pub struct ClusterView {
    servers: ArcSwap<Vec<Arc<Server>>>,
    self_url: String,
}

impl ClusterView {
    pub fn new(server_list: &[Url], my_url: Option<&Url>, local_ip: IpAddr) -> Result<Self, Error> {
        let mut entries: Vec<(String, String)> = vec![];
        for url in server_list {
            let url = rewrite_loopback(url, local_ip)?;
            let host = url.host_str().context("peer URL has no host")?.to_string();
            let canonical = canonical_url(&url)?;

            if entries.iter().any(|(x, _)| *x == canonical) {
                continue;
            }
            entries.push((canonical, host));
        }

        let self_url = match my_url {
            Some(x) => canonical_url(&rewrite_loopback(x, local_ip)?)?,
            None => {
                let ip = local_ip.to_string();
                entries
                    .iter()
                    .find(|(_, host)| *host == ip)
                    .map(|(x, _)| x.clone())
                    .context("unable to identify this node in the server list, set --my-url")?
            }
        };

        // A self URL outside the configured list joins the view
        if !entries.iter().any(|(x, _)| *x == self_url) {
            entries.push((self_url.clone(), String::new()));
        }

        let servers = entries
            .into_iter()
            .map(|(url, _)| {
                Arc::new(Server {
                    url,
                    status: true,
                    leader: false,
                    version: 0,
                })
            })
            .collect::<Vec<_>>();

        Ok(Self {
            servers: ArcSwap::from_pointee(servers),
            self_url,
        })
    }

    // Single-member view that leads itself, for nodes running outside a cluster
    pub fn standalone(my_url: Option<&Url>, local_ip: IpAddr, http_port: u16) -> Result<Self, Error> {
        let url = match my_url {
            Some(x) => canonical_url(&rewrite_loopback(x, local_ip)?)?,
            None => match local_ip {
                IpAddr::V4(x) => format!("http://{}:{}", x, http_port),
                IpAddr::V6(x) => format!("http://[{}]:{}", x, http_port),
            },
        };

        Ok(Self {
            servers: ArcSwap::from_pointee(vec![Arc::new(Server {
                url: url.clone(),
                status: true,
                leader: true,
                version: 0,
            })]),
            self_url: url,
        })
    }

    pub fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.load_full().as_ref().clone()
    }

    pub fn online(&self) -> Vec<Arc<Server>> {
        self.servers().into_iter().filter(|x| x.status).collect()
    }

    pub fn self_url(&self) -> &str {
        &self.self_url
    }

    pub fn self_server(&self) -> Option<Arc<Server>> {
        self.by_url(&self.self_url)
    }

    pub fn leader(&self) -> Option<Arc<Server>> {
        self.servers().into_iter().find(|x| x.leader)
    }

    pub fn is_self_leader(&self) -> bool {
        self.self_server().map(|x| x.leader).unwrap_or(false)
    }

    pub fn by_url(&self, url: &str) -> Option<Arc<Server>> {
        self.servers().into_iter().find(|x| x.url == url)
    }

    pub fn set_status(&self, url: &str, status: bool, version: Option<u64>) {
        self.servers.rcu(|current| {
            current
                .iter()
                .map(|server| {
                    if server.url != url {
                        return server.clone();
                    }

                    let mut updated = (**server).clone();
                    updated.status = status;
                    if let Some(x) = version {
                        updated.version = x;
                    }
                    Arc::new(updated)
                })
                .collect::<Vec<_>>()
        });
    }

    /// Clears the leader flag everywhere, then sets it on the given URL.
    pub fn set_leader(&self, url: Option<&str>) {
        self.servers.rcu(|current| {
            current
                .iter()
                .map(|server| {
                    let leader = url == Some(server.url.as_str());
                    if server.leader == leader {
                        return server.clone();
                    }

                    let mut updated = (**server).clone();
                    updated.leader = leader;
                    Arc::new(updated)
                })
                .collect::<Vec<_>>()
        });
    }

    // Sets a leader flag without clearing the others, to reproduce the
    // pathological multi-leader state the election repairs
    #[cfg(test)]
    pub fn force_leader_flag(&self, url: &str) {
        self.servers.rcu(|current| {
            current
                .iter()
                .map(|server| {
                    if server.url != url {
                        return server.clone();
                    }

                    let mut updated = (**server).clone();
                    updated.leader = true;
                    Arc::new(updated)
                })
                .collect::<Vec<_>>()
        });
    }
}

/// Fixed-period driver of the cluster control plane:
/// probe peers -> maybe reelect -> maybe replicate.
pub struct ClusterRunner {
    view: Arc<ClusterView>,
    registry: Arc<RegistryState>,
    prober: Arc<dyn Probe>,
    replicator: Replicator,
}

impl ClusterRunner {
    pub fn new(
        view: Arc<ClusterView>,
        registry: Arc<RegistryState>,
        prober: Arc<dyn Probe>,
        replicator: Replicator,
    ) -> Self {
        Self {
            view,
            registry,
            prober,
            replicator,
        }
    }

    async fn probe_peers(&self) {
        let peers: Vec<_> = self
            .view
            .servers()
            .into_iter()
            .filter(|x| x.url != self.view.self_url())
            .collect();

        let checks = peers.iter().map(|server| {
            let prober = self.prober.clone();
            let url = server.url.clone();
            async move {
                let result = prober.probe(&url).await;
                (url, result)
            }
        });

        for (url, result) in join_all(checks).await {
            match result {
                Ok(peer) => self.view.set_status(&url, true, Some(peer.version)),
                Err(e) => {
                    debug!(peer = %url, error = %e, "peer unreachable");
                    self.view.set_status(&url, false, None);
                }
            }
        }

        // The local node is never marked down
        self.view.set_status(
            self.view.self_url(),
            true,
            Some(self.registry.global_version()),
        );
    }

    async fn replicate_if_follower(&self) {
        if self.view.is_self_leader() {
            return;
        }

        let leader = match self.view.leader() {
            Some(x) if x.status => x,
            _ => return,
        };

        match self.replicator.replicate(&leader.url).await {
            Ok(ReplicateStatus::Applied {
                version,
                services,
                instances,
            }) => info!(
                leader = %leader.url,
                version,
                services,
                instances,
                "snapshot replicated from leader"
            ),
            Ok(_) => {}
            Err(e) => warn!(leader = %leader.url, error = %e, "snapshot replication failed"),
        }
    }
}

#[async_trait]
impl Run for ClusterRunner {
    async fn run(&mut self) -> Result<(), Error> {
        self.probe_peers().await;

        if election::should_reelect(&self.view) {
            match election::elect_leader(&self.view) {
                Some(leader) => info!(leader = %leader.url, "leader elected"),
                None => warn!("no peers online, cluster left without a leader"),
            }
        }

        self.replicate_if_follower().await;

        Ok(())
    }
}

#[cfg(test)]
pub mod test;
