use std::time::{Duration, Instant};

use config::HealthCheckConfig;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::cluster::node::NodeTable;
use crate::http_client::http_client;

/// Background prober keeping the node table's health state current.
///
/// Probes run concurrently on a fixed interval with independent per-probe
/// timeouts, so a hung node never blocks request dispatch or the probing
/// of its peers.
pub struct HealthSupervisor {
    table: NodeTable,
    config: HealthCheckConfig,
    client: reqwest::Client,
}

impl HealthSupervisor {
    /// Create a supervisor over the given node table.
    pub fn new(table: NodeTable, config: HealthCheckConfig) -> Self {
        Self {
            table,
            config,
            client: http_client(),
        }
    }

    /// Spawn the probe loop; it stops when `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(self.config.check_interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        log::debug!("Health supervisor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.probe_all().await;
                    }
                }
            }
        })
    }

    /// Probe every node once, concurrently.
    pub async fn probe_all(&self) {
        let probes = self.table.all().iter().map(|node| {
            let node = node.clone();
            let client = self.client.clone();
            let timeout = Duration::from_millis(self.config.timeout_ms.max(1));
            let max_failures = self.config.max_consecutive_failures;

            async move {
                let url = format!("{}/v1/models", node.base_url());
                let started = Instant::now();

                let outcome = tokio::time::timeout(timeout, client.get(&url).send()).await;

                match outcome {
                    Ok(Ok(response)) if response.status().is_success() => {
                        node.record_success(started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64);
                    }
                    Ok(Ok(response)) => {
                        log::debug!("Probe of node {} returned {}", node.id(), response.status());
                        node.record_failure(max_failures);
                    }
                    Ok(Err(error)) => {
                        log::debug!("Probe of node {} failed: {error}", node.id());
                        node.record_failure(max_failures);
                    }
                    Err(_) => {
                        log::debug!("Probe of node {} timed out", node.id());
                        node.record_failure(max_failures);
                    }
                }
            }
        });

        join_all(probes).await;
    }
}
