use std::{sync::Arc, time::Instant};

use anyhow::Error;
use async_trait::async_trait;
use axum::{extract::State, http::header::CONTENT_TYPE, response::IntoResponse};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry, Encoder, HistogramVec, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use tracing::info;

use crate::{cluster::ClusterView, core::Run, registry::RegistryState};

pub struct MetricParams {
    pub action: String,
    pub counter: IntCounterVec,
    pub recorder: HistogramVec,
}

impl MetricParams {
    pub fn new(registry: &Registry, action: &str) -> Self {
        Self {
            action: action.to_string(),

            counter: register_int_counter_vec_with_registry!(
                format!("{action}_total"),
                format!("Counts occurrences of {action} ticks"),
                &["status"],
                registry
            )
            .unwrap(),

            recorder: register_histogram_vec_with_registry!(
                format!("{action}_duration_sec"),
                format!("Records the duration of {action} ticks in seconds"),
                &["status"],
                registry
            )
            .unwrap(),
        }
    }
}

pub struct WithMetrics<T>(pub T, pub MetricParams);

#[async_trait]
impl<T: Run> Run for WithMetrics<T> {
    async fn run(&mut self) -> Result<(), Error> {
        let start_time = Instant::now();
        let out = self.0.run().await;
        let duration = start_time.elapsed().as_secs_f64();

        let status = if out.is_ok() { "ok" } else { "fail" };

        let MetricParams {
            action,
            counter,
            recorder,
        } = &self.1;

        counter.with_label_values(&[status]).inc();
        recorder.with_label_values(&[status]).observe(duration);

        info!(action, status, duration, error = ?out.as_ref().err());

        out
    }
}

/// Refreshes the state gauges exported on the monitoring address.
pub struct MetricsRunner {
    registry_state: Arc<RegistryState>,
    cluster: Arc<ClusterView>,

    services: IntGauge,
    instances: IntGauge,
    peers_online: IntGauge,
    leader: IntGauge,
}

impl MetricsRunner {
    pub fn new(
        registry: &Registry,
        registry_state: Arc<RegistryState>,
        cluster: Arc<ClusterView>,
    ) -> Self {
        Self {
            registry_state,
            cluster,

            services: register_int_gauge_with_registry!(
                "services",
                "Number of registered services",
                registry
            )
            .unwrap(),

            instances: register_int_gauge_with_registry!(
                "instances",
                "Number of registered instances",
                registry
            )
            .unwrap(),

            peers_online: register_int_gauge_with_registry!(
                "peers_online",
                "Number of reachable cluster peers",
                registry
            )
            .unwrap(),

            leader: register_int_gauge_with_registry!(
                "leader",
                "Whether this node is the cluster leader",
                registry
            )
            .unwrap(),
        }
    }
}

#[async_trait]
impl Run for MetricsRunner {
    async fn run(&mut self) -> Result<(), Error> {
        let (services, instances) = self.registry_state.counts();
        self.services.set(services as i64);
        self.instances.set(instances as i64);

        self.peers_online.set(self.cluster.online().len() as i64);
        self.leader.set(self.cluster.is_self_leader() as i64);

        Ok(())
    }
}

#[derive(Clone)]
pub struct MetricsHandlerArgs {
    pub registry: Registry,
}

pub async fn metrics_handler(
    State(MetricsHandlerArgs { registry }): State<MetricsHandlerArgs>,
) -> impl IntoResponse {
    let metric_families = registry.gather();

    let mut buffer = vec![];
    if TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .is_err()
    {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "unable to encode metrics".to_string(),
        )
            .into_response();
    }

    ([(CONTENT_TYPE, "text/plain")], buffer).into_response()
}
