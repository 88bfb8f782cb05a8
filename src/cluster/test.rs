use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr},
};

use anyhow::Error;
use bytes::Bytes;

use super::*;
use crate::{
    check::PeerView,
    registry::test::ManualClock,
    registry::InstanceMeta,
    replicate::FetchSnapshot,
};

const LOCAL_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

fn urls(raw: &[&str]) -> Vec<Url> {
    raw.iter().map(|x| Url::parse(x).unwrap()).collect()
}

#[test]
fn test_view_rewrites_loopback() {
    let view = ClusterView::new(
        &urls(&["http://localhost:4100", "http://127.0.0.1:4200"]),
        Some(&Url::parse("http://localhost:4100").unwrap()),
        LOCAL_IP,
    )
    .unwrap();

    let peer_urls: Vec<_> = view.servers().into_iter().map(|x| x.url.clone()).collect();
    assert_eq!(peer_urls, vec!["http://10.0.0.1:4100", "http://10.0.0.1:4200"]);
    assert_eq!(view.self_url(), "http://10.0.0.1:4100");
}

#[test]
fn test_view_identifies_self_by_local_ip() {
    let view = ClusterView::new(
        &urls(&["http://10.0.0.9:4100", "http://10.0.0.1:4100"]),
        None,
        LOCAL_IP,
    )
    .unwrap();

    assert_eq!(view.self_url(), "http://10.0.0.1:4100");
    assert!(view.self_server().is_some());
}

#[test]
fn test_view_requires_identifiable_self() {
    let result = ClusterView::new(&urls(&["http://10.0.0.9:4100"]), None, LOCAL_IP);
    assert!(result.is_err());
}

#[test]
fn test_view_synthesizes_self_outside_server_list() {
    let view = ClusterView::new(
        &urls(&["http://10.0.0.9:4100"]),
        Some(&Url::parse("http://10.0.0.1:4100").unwrap()),
        LOCAL_IP,
    )
    .unwrap();

    assert_eq!(view.servers().len(), 2);
    assert_eq!(view.self_url(), "http://10.0.0.1:4100");
}

#[test]
fn test_view_deduplicates_server_list() {
    let view = ClusterView::new(
        &urls(&["http://10.0.0.1:4100", "http://10.0.0.1:4100"]),
        None,
        LOCAL_IP,
    )
    .unwrap();

    assert_eq!(view.servers().len(), 1);
}

#[test]
fn test_default_port_is_made_explicit() {
    let view = ClusterView::new(
        &urls(&["http://10.0.0.1/"]),
        None,
        LOCAL_IP,
    )
    .unwrap();

    assert_eq!(view.self_url(), "http://10.0.0.1:80");
}

#[test]
fn test_status_and_leader_flags() {
    let view = ClusterView::new(
        &urls(&["http://10.0.0.1:4100", "http://10.0.0.2:4100"]),
        None,
        LOCAL_IP,
    )
    .unwrap();

    view.set_status("http://10.0.0.2:4100", false, None);
    assert_eq!(view.online().len(), 1);
    assert!(!view.by_url("http://10.0.0.2:4100").unwrap().status);

    view.set_status("http://10.0.0.2:4100", true, Some(7));
    assert_eq!(view.online().len(), 2);
    assert_eq!(view.by_url("http://10.0.0.2:4100").unwrap().version, 7);

    view.set_leader(Some("http://10.0.0.2:4100"));
    assert_eq!(view.leader().unwrap().url, "http://10.0.0.2:4100");
    assert!(!view.is_self_leader());

    // Installing a new leader clears the old flag
    view.set_leader(Some("http://10.0.0.1:4100"));
    assert!(view.is_self_leader());
    let leaders = view.servers().into_iter().filter(|x| x.leader).count();
    assert_eq!(leaders, 1);

    view.set_leader(None);
    assert!(view.leader().is_none());
}

#[test]
fn test_standalone_view_leads_itself() {
    let view = ClusterView::standalone(None, LOCAL_IP, 8080).unwrap();

    assert_eq!(view.self_url(), "http://10.0.0.1:8080");
    assert!(view.is_self_leader());
    assert_eq!(view.servers().len(), 1);
}

struct StaticProber {
    // URL -> version; absent peers are unreachable
    alive: HashMap<String, u64>,
}

#[async_trait]
impl Probe for StaticProber {
    async fn probe(&self, url: &str) -> Result<PeerView, Error> {
        match self.alive.get(url) {
            Some(version) => Ok(PeerView { version: *version }),
            None => Err(anyhow!("connection refused")),
        }
    }
}

struct StaticFetcher(Vec<u8>);

#[async_trait]
impl FetchSnapshot for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<Bytes, Error> {
        Ok(Bytes::from(self.0.clone()))
    }
}

fn leader_blob() -> Vec<u8> {
    let leader = RegistryState::new(Arc::new(ManualClock::new(0)));
    leader.register("user.service", InstanceMeta::new("http", "10.0.0.5", 8080, ""));
    leader.renew(
        "user.service",
        &InstanceMeta::new("http", "10.0.0.5", 8080, ""),
    );
    serde_json::to_vec(&leader.snapshot()).unwrap()
}

// Full cluster tick: probe -> elect -> replicate
#[tokio::test]
async fn test_runner_tick() {
    let all = ["http://10.0.0.1:4100", "http://10.0.0.2:4100", "http://10.0.0.3:4100"];
    let view = Arc::new(ClusterView::new(&urls(&all), None, LOCAL_IP).unwrap());
    let registry = Arc::new(RegistryState::new(Arc::new(ManualClock::new(0))));

    // Peer .2 responds, peer .3 is down
    let prober = StaticProber {
        alive: HashMap::from([("http://10.0.0.2:4100".to_string(), 17)]),
    };

    let mut runner = ClusterRunner::new(
        view.clone(),
        registry.clone(),
        Arc::new(prober),
        Replicator::new(registry.clone(), Arc::new(StaticFetcher(leader_blob()))),
    );
    runner.run().await.unwrap();

    // Probing marked .3 down, captured .2's version, kept self up
    assert!(!view.by_url("http://10.0.0.3:4100").unwrap().status);
    assert_eq!(view.by_url("http://10.0.0.2:4100").unwrap().version, 17);
    assert!(view.self_server().unwrap().status);

    // A leader was elected among the two online peers
    let leader = view.leader().unwrap();
    assert!(leader.status);

    // If we ended up a follower, the leader snapshot must have been applied
    if !view.is_self_leader() {
        assert_eq!(registry.version("user.service"), 1);
        assert_eq!(registry.get_all("user.service").unwrap().len(), 1);
    }
}

// A follower whose leader goes unreachable does not pull from it
#[tokio::test]
async fn test_runner_skips_replication_without_online_leader() {
    let all = ["http://10.0.0.1:4100", "http://10.0.0.2:4100"];
    let view = Arc::new(ClusterView::new(&urls(&all), None, LOCAL_IP).unwrap());
    let registry = Arc::new(RegistryState::new(Arc::new(ManualClock::new(0))));

    // Pretend .2 currently leads but probing finds it dead
    view.set_leader(Some("http://10.0.0.2:4100"));

    let mut runner = ClusterRunner::new(
        view.clone(),
        registry.clone(),
        Arc::new(StaticProber {
            alive: HashMap::new(),
        }),
        Replicator::new(registry.clone(), Arc::new(StaticFetcher(leader_blob()))),
    );
    runner.run().await.unwrap();

    // The dead leader was replaced by the only online node: us
    assert!(view.is_self_leader());
    // And nothing was replicated into our registry
    assert_eq!(registry.version("user.service"), 0);
}
