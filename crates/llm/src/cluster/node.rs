use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use config::NodeEntry;

use crate::backend::normalize_base_url;

/// Weight of the newest latency sample in the EWMA.
const EWMA_ALPHA: f64 = 0.3;

/// Most recent cache fingerprints remembered per node.
const AFFINITY_CAPACITY: usize = 32;

/// Probe-derived health of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    /// No probe has completed yet; the node is still routable.
    Unknown,
    /// The last probe succeeded.
    Healthy,
    /// Too many consecutive probe failures; skipped by the router.
    Unhealthy,
}

#[derive(Debug)]
struct NodeState {
    health: NodeHealth,
    last_probe_at: Option<Instant>,
    consecutive_failures: u32,
    latency_ewma: Option<f64>,
    affinity: VecDeque<String>,
}

/// A single cluster worker node and its mutable routing state.
#[derive(Debug)]
pub struct ClusterNode {
    id: String,
    base_url: String,
    state: Mutex<NodeState>,
    load: AtomicU32,
}

impl ClusterNode {
    /// Build a node from its configuration entry.
    pub fn new(entry: &NodeEntry) -> Self {
        Self {
            id: entry.id.clone(),
            base_url: normalize_base_url(&entry.url),
            state: Mutex::new(NodeState {
                health: NodeHealth::Unknown,
                last_probe_at: None,
                consecutive_failures: 0,
                latency_ewma: None,
                affinity: VecDeque::new(),
            }),
            load: AtomicU32::new(0),
        }
    }

    /// Stable node identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Normalized base URL for dispatching to this node.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Current probe-derived health.
    pub fn health(&self) -> NodeHealth {
        self.lock().health
    }

    /// Whether the router may pick this node.
    pub fn is_eligible(&self) -> bool {
        matches!(self.health(), NodeHealth::Healthy | NodeHealth::Unknown)
    }

    /// In-flight request gauge.
    pub fn load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    /// Observed latency EWMA in milliseconds; `None` before the first
    /// sample.
    pub fn latency_ewma(&self) -> Option<f64> {
        self.lock().latency_ewma
    }

    /// When the node was last probed or dispatched to.
    pub fn last_probe_at(&self) -> Option<Instant> {
        self.lock().last_probe_at
    }

    /// Record a successful probe or dispatch with its latency.
    pub fn record_success(&self, latency_ms: u64) {
        let mut state = self.lock();
        state.health = NodeHealth::Healthy;
        state.consecutive_failures = 0;
        state.last_probe_at = Some(Instant::now());

        let sample = latency_ms as f64;
        state.latency_ewma = Some(match state.latency_ewma {
            Some(previous) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * previous,
            None => sample,
        });
    }

    /// Record a failed probe or dispatch; the node turns unhealthy after
    /// `max_consecutive_failures` in a row.
    pub fn record_failure(&self, max_consecutive_failures: u32) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        state.last_probe_at = Some(Instant::now());

        if state.consecutive_failures >= max_consecutive_failures {
            if state.health != NodeHealth::Unhealthy {
                log::warn!(
                    "Cluster node {} marked unhealthy after {} consecutive failures",
                    self.id,
                    state.consecutive_failures
                );
            }
            state.health = NodeHealth::Unhealthy;
        }
    }

    /// Remember that this node served a request with the given cache
    /// fingerprint. The set is bounded; oldest entries fall off.
    pub fn record_affinity(&self, fingerprint: &str) {
        let mut state = self.lock();

        if let Some(position) = state.affinity.iter().position(|existing| existing == fingerprint) {
            state.affinity.remove(position);
        } else if state.affinity.len() >= AFFINITY_CAPACITY {
            state.affinity.pop_front();
        }

        state.affinity.push_back(fingerprint.to_string());
    }

    /// Whether this node recently served the given cache fingerprint.
    pub fn has_affinity(&self, fingerprint: &str) -> bool {
        self.lock().affinity.iter().any(|existing| existing == fingerprint)
    }

    /// Increment the load gauge for the duration of the returned guard.
    pub fn begin_request(self: &Arc<Self>) -> LoadGuard {
        self.load.fetch_add(1, Ordering::Relaxed);
        LoadGuard { node: Arc::clone(self) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().expect("node state poisoned")
    }
}

/// Decrements the owning node's load gauge on drop.
pub struct LoadGuard {
    node: Arc<ClusterNode>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.node.load.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The live set of cluster nodes, fixed from configuration parse to
/// process exit. Health state mutates continuously.
#[derive(Debug, Clone)]
pub struct NodeTable {
    nodes: Arc<Vec<Arc<ClusterNode>>>,
}

impl NodeTable {
    /// Build the table from configuration entries.
    pub fn new(entries: &[NodeEntry]) -> Self {
        Self {
            nodes: Arc::new(entries.iter().map(|entry| Arc::new(ClusterNode::new(entry))).collect()),
        }
    }

    /// All nodes, regardless of health.
    pub fn all(&self) -> &[Arc<ClusterNode>] {
        &self.nodes
    }

    /// Nodes the router may currently pick.
    pub fn eligible(&self) -> Vec<Arc<ClusterNode>> {
        self.nodes.iter().filter(|node| node.is_eligible()).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ClusterNode {
        ClusterNode::new(&NodeEntry {
            url: "http://10.0.0.1:8081/v1".to_string(),
            id: "worker-1".to_string(),
        })
    }

    #[test]
    fn new_nodes_are_unknown_and_eligible() {
        let node = node();
        assert_eq!(node.health(), NodeHealth::Unknown);
        assert!(node.is_eligible());
        assert_eq!(node.base_url(), "http://10.0.0.1:8081");
    }

    #[test]
    fn failures_flip_unhealthy_and_success_restores() {
        let node = node();

        node.record_failure(3);
        node.record_failure(3);
        assert!(node.is_eligible());

        node.record_failure(3);
        assert_eq!(node.health(), NodeHealth::Unhealthy);
        assert!(!node.is_eligible());

        node.record_success(40);
        assert_eq!(node.health(), NodeHealth::Healthy);
        assert!(node.is_eligible());
    }

    #[test]
    fn ewma_blends_samples() {
        let node = node();

        node.record_success(100);
        assert_eq!(node.latency_ewma(), Some(100.0));

        node.record_success(200);
        // 0.3 * 200 + 0.7 * 100
        assert_eq!(node.latency_ewma(), Some(130.0));
    }

    #[test]
    fn affinity_set_is_bounded() {
        let node = node();

        for i in 0..40 {
            node.record_affinity(&format!("fp-{i}"));
        }

        assert!(!node.has_affinity("fp-0"));
        assert!(node.has_affinity("fp-39"));
    }

    #[test]
    fn load_guard_tracks_in_flight_requests() {
        let node = Arc::new(node());

        let guard_a = node.begin_request();
        let guard_b = node.begin_request();
        assert_eq!(node.load(), 2);

        drop(guard_a);
        assert_eq!(node.load(), 1);
        drop(guard_b);
        assert_eq!(node.load(), 0);
    }
}
