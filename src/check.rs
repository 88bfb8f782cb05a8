use std::{str::FromStr, sync::Arc};

use anyhow::{bail, Context, Error};
use async_trait::async_trait;
use reqwest::Method;
use url::Url;

use crate::{cluster::Server, http::HttpClient};

/// What a successful probe learned about the peer.
pub struct PeerView {
    pub version: u64,
}

/// Reachability probe for one peer URL.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<PeerView, Error>;
}

/// Probes peers over their `/info` endpoint.
pub struct HttpProber {
    http_client: Arc<dyn HttpClient>,
}

impl HttpProber {
    pub fn new(http_client: Arc<dyn HttpClient>) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Probe for HttpProber {
    async fn probe(&self, url: &str) -> Result<PeerView, Error> {
        let url = Url::from_str(&format!("{url}/info")).context("unable to build probe URL")?;

        let request = reqwest::Request::new(Method::GET, url);
        let response = self
            .http_client
            .execute(request)
            .await
            .context("probe request failed")?;

        if !response.status().is_success() {
            bail!("probe returned status {}", response.status());
        }

        let server: Server = response
            .json()
            .await
            .context("unable to decode probe response")?;

        Ok(PeerView {
            version: server.version,
        })
    }
}
