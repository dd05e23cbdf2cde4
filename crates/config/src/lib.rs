//! anyclaude configuration structures to map the anyclaude.toml configuration.

#![deny(missing_docs)]

mod backend;
mod breaker;
mod cluster;
mod context;
mod loader;
mod server;

use std::path::Path;

pub use backend::{BackendConfig, BackendMode};
pub use breaker::{CircuitBreakerConfig, ResolvedCircuitBreakerConfig};
pub use cluster::{
    CacheConfig, ClusterConfig, ClusterConfigError, ClusterErrorCode, ClusterParseResult, DiscoveryConfig,
    DiscoveryMode, EnvOverrides, HealthCheckConfig, NodeEntry, RoutingConfig, RoutingStrategy, apply_env_overrides,
    load_cluster_config, merge_with_defaults, parse_cluster_config,
};
pub use context::ContextConfig;
pub use server::{DEFAULT_PORT, ServerConfig, resolve_port};

use serde::Deserialize;

/// Main configuration structure for the anyclaude proxy.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server configuration settings.
    pub server: ServerConfig,
    /// Backend selection and connection settings.
    pub backend: BackendConfig,
    /// Circuit breaker overrides, resolved against per-mode defaults.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Context window management settings.
    pub context: ContextConfig,
    /// Cluster configuration, required when `backend.mode = "mlx-cluster"`.
    pub cluster: Option<ClusterConfig>,
}

impl Config {
    /// Load configuration from a file path.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }

    /// The circuit breaker settings for the configured backend mode.
    pub fn resolved_circuit_breaker(&self) -> ResolvedCircuitBreakerConfig {
        self.circuit_breaker.resolve(self.backend.mode.effective())
    }
}
