use std::time::Duration;

use anyhow::{Context, Error};
use async_trait::async_trait;

use crate::core::SERVICE_NAME;

/// Thin seam over the outgoing HTTP client so that peer probing and snapshot
/// fetching can be substituted in tests.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error>;
}

pub struct ReqwestClient(reqwest::Client);

impl ReqwestClient {
    // Bounded pool and short timeouts keep the cluster loop bounded in duration
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .user_agent(format!("{}/{}", SERVICE_NAME, env!("CARGO_PKG_VERSION")))
            .build()
            .context("unable to build HTTP client")?;

        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, reqwest::Error> {
        self.0.execute(request).await
    }
}
