use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use config::{RoutingConfig, RoutingStrategy};
use rand::Rng;

use crate::cluster::node::{ClusterNode, NodeTable};
use crate::error::{LlmError, Result};

/// Strategy-driven node selection with bounded, jittered retries.
pub struct Router {
    table: NodeTable,
    config: RoutingConfig,
    counter: AtomicUsize,
}

impl Router {
    /// Create a router over the given node table.
    pub fn new(table: NodeTable, config: RoutingConfig) -> Self {
        Self {
            table,
            config,
            counter: AtomicUsize::new(0),
        }
    }

    /// The node table backing this router.
    pub fn table(&self) -> &NodeTable {
        &self.table
    }

    /// Pick a node for a request by the configured strategy.
    ///
    /// Only healthy or not-yet-probed nodes are considered; returns `None`
    /// when every node is unhealthy.
    pub fn select(&self, fingerprint: Option<&str>) -> Option<Arc<ClusterNode>> {
        self.select_excluding(fingerprint, &HashSet::new())
    }

    fn select_excluding(&self, fingerprint: Option<&str>, excluded: &HashSet<String>) -> Option<Arc<ClusterNode>> {
        let mut candidates: Vec<Arc<ClusterNode>> = self
            .table
            .eligible()
            .into_iter()
            .filter(|node| !excluded.contains(node.id()))
            .collect();

        if candidates.is_empty() {
            // Every eligible node already failed this request; allow
            // re-selection rather than giving up with retries to spare.
            candidates = self.table.eligible();
        }

        if candidates.is_empty() {
            return None;
        }

        let selected = match self.config.strategy {
            RoutingStrategy::RoundRobin => self.round_robin(&candidates),
            RoutingStrategy::LeastLoaded => self.least_loaded(&candidates),
            RoutingStrategy::LatencyBased => self.latency_based(&candidates),
            RoutingStrategy::CacheAware => self.cache_aware(&candidates, fingerprint),
        };

        Some(selected)
    }

    fn round_robin(&self, candidates: &[Arc<ClusterNode>]) -> Arc<ClusterNode> {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Arc::clone(&candidates[index])
    }

    fn least_loaded(&self, candidates: &[Arc<ClusterNode>]) -> Arc<ClusterNode> {
        let min_load = candidates.iter().map(|node| node.load()).min().unwrap_or(0);

        let tied: Vec<Arc<ClusterNode>> = candidates
            .iter()
            .filter(|node| node.load() == min_load)
            .cloned()
            .collect();

        self.round_robin(&tied)
    }

    fn latency_based(&self, candidates: &[Arc<ClusterNode>]) -> Arc<ClusterNode> {
        // Nodes without a sample yet sort first so fresh nodes get traffic.
        candidates
            .iter()
            .min_by(|a, b| {
                let a = a.latency_ewma().unwrap_or(0.0);
                let b = b.latency_ewma().unwrap_or(0.0);
                a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
            .unwrap_or_else(|| Arc::clone(&candidates[0]))
    }

    fn cache_aware(&self, candidates: &[Arc<ClusterNode>], fingerprint: Option<&str>) -> Arc<ClusterNode> {
        if let Some(fingerprint) = fingerprint {
            let affine: Vec<Arc<ClusterNode>> = candidates
                .iter()
                .filter(|node| node.has_affinity(fingerprint))
                .cloned()
                .collect();

            if !affine.is_empty() {
                return self.least_loaded(&affine);
            }
        }

        self.least_loaded(candidates)
    }

    /// Dispatch `attempt` against a selected node, retrying on a different
    /// eligible node up to `max_retries` times with jittered pauses.
    ///
    /// Failed nodes accrue dispatch failures toward their health state.
    /// The final failure surfaces as [`LlmError::ClusterExhausted`].
    pub async fn dispatch<T, F, Fut>(&self, fingerprint: Option<&str>, attempt: F) -> Result<T>
    where
        F: Fn(Arc<ClusterNode>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut excluded = HashSet::new();
        let mut last_error = "no eligible cluster nodes".to_string();

        for attempt_index in 0..attempts {
            if attempt_index > 0 {
                tokio::time::sleep(self.retry_pause()).await;
            }

            let Some(node) = self.select_excluding(fingerprint, &excluded) else {
                break;
            };

            let _load = node.begin_request();
            let started = std::time::Instant::now();

            match attempt(Arc::clone(&node)).await {
                Ok(value) => {
                    node.record_success(started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64);

                    if let Some(fingerprint) = fingerprint {
                        node.record_affinity(fingerprint);
                    }

                    return Ok(value);
                }
                Err(error) => {
                    log::warn!(
                        "Dispatch to cluster node {} failed (attempt {}/{attempts}): {error}",
                        node.id(),
                        attempt_index + 1
                    );

                    if error.counts_as_backend_failure() {
                        // Three dispatch strikes mirror the probe policy.
                        node.record_failure(3);
                    }

                    last_error = format!("node {}: {error}", node.id());
                    excluded.insert(node.id().to_string());

                    // Client errors will fail identically everywhere.
                    if !error.counts_as_backend_failure() && !matches!(error, LlmError::CircuitOpen { .. }) {
                        return Err(error);
                    }
                }
            }
        }

        Err(LlmError::ClusterExhausted { attempts, last_error })
    }

    fn retry_pause(&self) -> Duration {
        let base = self.config.retry_delay_ms;
        if base == 0 {
            return Duration::ZERO;
        }

        // +/- 20% jitter keeps synchronized retries from stampeding.
        let jitter = rand::rng().random_range(0.8..1.2);
        Duration::from_millis((base as f64 * jitter) as u64)
    }
}

#[cfg(test)]
mod tests {
    use config::NodeEntry;

    use super::*;

    fn table(count: usize) -> NodeTable {
        let entries: Vec<NodeEntry> = (0..count)
            .map(|i| NodeEntry {
                url: format!("http://10.0.0.{i}:8081"),
                id: format!("worker-{i}"),
            })
            .collect();

        NodeTable::new(&entries)
    }

    fn router(table: NodeTable, strategy: RoutingStrategy) -> Router {
        Router::new(
            table,
            RoutingConfig {
                strategy,
                max_retries: 2,
                retry_delay_ms: 0,
            },
        )
    }

    #[test]
    fn round_robin_cycles_through_nodes() {
        let router = router(table(3), RoutingStrategy::RoundRobin);

        let picks: Vec<String> = (0..6)
            .map(|_| router.select(None).unwrap().id().to_string())
            .collect();

        assert_eq!(picks, vec!["worker-0", "worker-1", "worker-2", "worker-0", "worker-1", "worker-2"]);
    }

    #[test]
    fn unhealthy_nodes_are_skipped() {
        let table = table(3);
        table.all()[1].record_failure(1);

        let router = router(table, RoutingStrategy::RoundRobin);

        for _ in 0..10 {
            let picked = router.select(None).unwrap();
            assert_ne!(picked.id(), "worker-1");
        }
    }

    #[test]
    fn all_unhealthy_selects_nothing() {
        let table = table(2);
        for node in table.all() {
            node.record_failure(1);
        }

        let router = router(table, RoutingStrategy::RoundRobin);
        assert!(router.select(None).is_none());
    }

    #[test]
    fn least_loaded_prefers_idle_nodes() {
        let table = table(3);
        let busy = Arc::clone(&table.all()[0]);
        let _guard_a = busy.begin_request();
        let _guard_b = busy.begin_request();

        let router = router(table, RoutingStrategy::LeastLoaded);

        for _ in 0..4 {
            assert_ne!(router.select(None).unwrap().id(), "worker-0");
        }
    }

    #[test]
    fn latency_based_prefers_fast_nodes() {
        let table = table(2);
        table.all()[0].record_success(500);
        table.all()[1].record_success(20);

        let router = router(table, RoutingStrategy::LatencyBased);
        assert_eq!(router.select(None).unwrap().id(), "worker-1");
    }

    #[test]
    fn cache_aware_prefers_affine_nodes_then_falls_back() {
        let table = table(3);
        table.all()[2].record_affinity("fp-abc");

        let router = router(table, RoutingStrategy::CacheAware);

        assert_eq!(router.select(Some("fp-abc")).unwrap().id(), "worker-2");

        // Without a matching fingerprint the choice falls back to load.
        let fallback = router.select(Some("fp-other")).unwrap();
        assert!(["worker-0", "worker-1", "worker-2"].contains(&fallback.id()));
    }

    #[tokio::test]
    async fn dispatch_retries_on_a_different_node() {
        let router = router(table(3), RoutingStrategy::RoundRobin);
        let attempted = std::sync::Mutex::new(Vec::new());

        let result = router
            .dispatch(None, |node| {
                attempted.lock().unwrap().push(node.id().to_string());
                let fail = node.id() == "worker-0";
                async move {
                    if fail {
                        Err(LlmError::Transport {
                            kind: crate::error::TransportKind::Connect,
                            message: "refused".into(),
                        })
                    } else {
                        Ok(node.id().to_string())
                    }
                }
            })
            .await
            .unwrap();

        let attempted = attempted.lock().unwrap();
        assert_eq!(attempted.first().map(String::as_str), Some("worker-0"));
        assert_ne!(result, "worker-0");
        assert!(attempted.len() >= 2);
    }

    #[tokio::test]
    async fn dispatch_exhaustion_reports_last_node_failure() {
        let router = router(table(2), RoutingStrategy::RoundRobin);

        let error = router
            .dispatch(None, |node| async move {
                Err::<(), _>(LlmError::Upstream {
                    status: 500,
                    message: format!("{} exploded", node.id()),
                    retry_after: None,
                })
            })
            .await
            .unwrap_err();

        let LlmError::ClusterExhausted { attempts, last_error } = error else {
            unreachable!("expected exhaustion, got {error}");
        };
        assert_eq!(attempts, 3);
        assert!(last_error.contains("exploded"));
    }

    #[tokio::test]
    async fn dispatch_does_not_retry_client_errors() {
        let router = router(table(3), RoutingStrategy::RoundRobin);
        let calls = std::sync::atomic::AtomicU32::new(0);

        let error = router
            .dispatch(None, |_node| {
                calls.fetch_add(1, Ordering::Relaxed);
                async { Err::<(), _>(LlmError::Validation("bad request".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(error, LlmError::Validation(_)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn successful_dispatch_records_affinity() {
        let router = router(table(1), RoutingStrategy::CacheAware);

        router
            .dispatch(Some("fp-1"), |_node| async { Ok(()) })
            .await
            .unwrap();

        assert!(router.table().all()[0].has_affinity("fp-1"));
    }
}
