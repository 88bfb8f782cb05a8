use std::{str::FromStr, sync::Arc};

use anyhow::{bail, Context, Error};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use url::Url;

use crate::{
    http::HttpClient,
    registry::{RegistrySnapshot, RegistryState},
};

/// Retrieves a peer's snapshot as an opaque byte blob.
#[async_trait]
pub trait FetchSnapshot: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, Error>;
}

/// Fetches snapshots over the peer's `/snapshot` endpoint.
pub struct HttpSnapshotFetcher {
    http_client: Arc<dyn HttpClient>,
}

impl HttpSnapshotFetcher {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl FetchSnapshot for HttpSnapshotFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, Error> {
        let url = Url::from_str(&format!("{url}/snapshot")).context("unable to build fetch URL")?;

        let request = reqwest::Request::new(Method::GET, url);
        let response = self
            .http_client
            .execute(request)
            .await
            .context("snapshot request failed")?;

        if !response.status().is_success() {
            bail!("snapshot request returned status {}", response.status());
        }

        response
            .bytes()
            .await
            .context("unable to read snapshot body")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicateStatus {
    SkippedEmpty,
    SkippedNotNewer { local: u64, remote: u64 },
    Applied {
        version: u64,
        services: usize,
        instances: usize,
    },
}

/// Follower-side snapshot pull.
///
/// Never mutates the registry directly; a fetched snapshot is applied through
/// `restore`, and only when it is newer than what this node has already seen.
pub struct Replicator {
    registry: Arc<RegistryState>,
    fetcher: Arc<dyn FetchSnapshot>,
}

impl Replicator {
    pub fn new(registry: Arc<RegistryState>, fetcher: Arc<dyn FetchSnapshot>) -> Self {
        Self { registry, fetcher }
    }

    pub async fn replicate(&self, leader_url: &str) -> Result<ReplicateStatus, Error> {
        let blob = self.fetcher.fetch(leader_url).await?;
        if blob.is_empty() {
            return Ok(ReplicateStatus::SkippedEmpty);
        }

        let snapshot: RegistrySnapshot =
            serde_json::from_slice(&blob).context("unable to decode snapshot")?;

        let local = self.registry.snapshot_version();
        if snapshot.version <= local {
            return Ok(ReplicateStatus::SkippedNotNewer {
                local,
                remote: snapshot.version,
            });
        }

        let status = ReplicateStatus::Applied {
            version: snapshot.version,
            services: snapshot.registry.len(),
            instances: snapshot.registry.values().map(Vec::len).sum(),
        };
        self.registry.restore(snapshot);

        Ok(status)
    }
}
