//! Cluster worker routing: node state, strategy-driven selection, and the
//! background health supervisor.

mod health;
mod node;
mod router;

pub use health::HealthSupervisor;
pub use node::{ClusterNode, NodeHealth, NodeTable};
pub use router::Router;
