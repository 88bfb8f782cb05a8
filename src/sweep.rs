use std::{sync::Arc, time::Duration};

use anyhow::Error;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::{
    core::{Clock, Run},
    registry::RegistryState,
};

/// Periodic liveness sweep.
///
/// Evicts instances whose last heartbeat is older than the threshold. The
/// timestamp entry itself is left in place; later sweeps tolerate entries that
/// no longer match a registered instance.
pub struct Sweeper {
    registry: Arc<RegistryState>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl Sweeper {
    pub fn new(registry: Arc<RegistryState>, clock: Arc<dyn Clock>, threshold: Duration) -> Self {
        Self {
            registry,
            clock,
            threshold,
        }
    }
}

#[async_trait]
impl Run for Sweeper {
    async fn run(&mut self) -> Result<(), Error> {
        let now = self.clock.now_ms();
        let threshold = self.threshold.as_millis() as u64;

        for (key, last_ms) in self.registry.timestamps() {
            if now.saturating_sub(last_ms) <= threshold {
                continue;
            }

            // Heartbeat keys have the form "{service}@{instance url}"
            let (service, url) = match key.split_once('@') {
                Some((service, url)) if !service.is_empty() => (service, url),
                _ => {
                    warn!(key, "malformed heartbeat key, skipping");
                    continue;
                }
            };

            let instances = match self.registry.get_all(service) {
                Some(x) => x,
                None => continue,
            };

            if let Some(instance) = instances.into_iter().find(|x| x.url() == url) {
                info!(
                    service,
                    instance = %instance,
                    age_ms = now.saturating_sub(last_ms),
                    "evicting instance past liveness threshold"
                );
                self.registry.unregister(service, &instance);
            }
        }

        Ok(())
    }
}
