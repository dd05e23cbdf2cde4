//! Backend selection: a single upstream client or the cluster router.

use std::collections::HashMap;
use std::sync::Arc;

use circuit_breaker::CircuitBreaker;
use config::{BackendMode, Config};
use llm::backend::{Backend, ClaudeBackend, OpenAiCompatBackend};
use llm::cluster::{HealthSupervisor, NodeTable, Router};
use llm::protocol::anthropic::{Request, Response};
use llm::stream::SourceEventStream;
use llm::{LlmError, Result};
use tokio_util::sync::CancellationToken;

/// Routes requests to the configured backend, hiding whether that is one
/// upstream or a cluster of worker nodes.
pub enum Dispatcher {
    /// A single backend client.
    Single(Arc<dyn Backend>),
    /// Cluster routing over per-node clients.
    Cluster {
        /// Node selection and retry policy.
        router: Arc<Router>,
        /// One chat-completions client per node, keyed by node id.
        backends: HashMap<String, Arc<OpenAiCompatBackend>>,
    },
}

impl Dispatcher {
    /// Build the dispatcher for the configured backend mode. For the
    /// cluster mode this also spawns the health supervisor on the given
    /// shutdown token.
    pub fn from_config(config: &Config, breaker: CircuitBreaker, shutdown: CancellationToken) -> Result<Self> {
        let base_url = config.backend.base_url.as_deref();
        let api_key = config.backend.api_key.clone();

        let dispatcher = match config.backend.mode.effective() {
            BackendMode::Local | BackendMode::Lmstudio => {
                Self::Single(Arc::new(OpenAiCompatBackend::local(base_url, api_key, breaker)))
            }
            BackendMode::Openrouter => {
                Self::Single(Arc::new(OpenAiCompatBackend::openrouter(base_url, api_key, breaker)))
            }
            BackendMode::Claude => Self::Single(Arc::new(ClaudeBackend::new(base_url, api_key, breaker))),
            BackendMode::MlxCluster => {
                let cluster = config
                    .cluster
                    .as_ref()
                    .ok_or_else(|| LlmError::Internal(Some("cluster mode without cluster config".to_string())))?;

                // Re-run the pure pipeline so environment overrides and
                // validation apply to the embedded section as well.
                let value = serde_json::to_value(cluster)
                    .map_err(|e| LlmError::Internal(Some(format!("cluster config does not serialize: {e}"))))?;
                let parsed = config::parse_cluster_config(&value, &config::EnvOverrides::from_env());

                for warning in &parsed.warnings {
                    log::warn!("{warning}");
                }

                let cluster = parsed.config.ok_or_else(|| {
                    let message = parsed
                        .error
                        .map(|error| error.message)
                        .unwrap_or_else(|| "invalid cluster configuration".to_string());
                    LlmError::Internal(Some(message))
                })?;

                if !cluster.enabled {
                    log::warn!("Cluster routing is disabled, falling back to the local backend");
                    return Ok(Self::Single(Arc::new(OpenAiCompatBackend::local(
                        base_url, api_key, breaker,
                    ))));
                }

                let entries = cluster.discovery.nodes.clone().unwrap_or_default();
                let table = NodeTable::new(&entries);

                let backends = table
                    .all()
                    .iter()
                    .map(|node| {
                        let backend =
                            OpenAiCompatBackend::cluster_node(node.id(), node.base_url(), breaker.clone());
                        (node.id().to_string(), Arc::new(backend))
                    })
                    .collect();

                let _probe_task = HealthSupervisor::new(table.clone(), cluster.health.clone()).spawn(shutdown);

                Self::Cluster {
                    router: Arc::new(Router::new(table, cluster.routing.clone())),
                    backends,
                }
            }
        };

        Ok(dispatcher)
    }

    /// Non-streaming dispatch.
    pub async fn chat(&self, request: Request, fingerprint: Option<&str>) -> Result<Response> {
        match self {
            Dispatcher::Single(backend) => backend.chat(request).await,
            Dispatcher::Cluster { router, backends } => {
                router
                    .dispatch(fingerprint, |node| {
                        let request = request.clone();
                        let backend = backends.get(node.id()).cloned();

                        async move {
                            let Some(backend) = backend else {
                                return Err(LlmError::Internal(Some(format!(
                                    "no client for cluster node {}",
                                    node.id()
                                ))));
                            };
                            backend.chat(request).await
                        }
                    })
                    .await
            }
        }
    }

    /// Streaming dispatch. Cluster retries apply only to establishing the
    /// stream; once producing, a stream is never silently restarted.
    pub async fn chat_stream(&self, request: Request, fingerprint: Option<&str>) -> Result<SourceEventStream> {
        match self {
            Dispatcher::Single(backend) => backend.chat_stream(request).await,
            Dispatcher::Cluster { router, backends } => {
                router
                    .dispatch(fingerprint, |node| {
                        let request = request.clone();
                        let backend = backends.get(node.id()).cloned();

                        async move {
                            let Some(backend) = backend else {
                                return Err(LlmError::Internal(Some(format!(
                                    "no client for cluster node {}",
                                    node.id()
                                ))));
                            };
                            backend.chat_stream(request).await
                        }
                    })
                    .await
            }
        }
    }

    /// Discover the model's context window from whichever backend would
    /// serve the request.
    pub async fn discover_context_window(&self, model: &str) -> Option<u32> {
        match self {
            Dispatcher::Single(backend) => backend.discover_context_window(model).await,
            Dispatcher::Cluster { router, backends } => {
                let node = router.select(None)?;
                let backend = backends.get(node.id())?;
                backend.discover_context_window(model).await
            }
        }
    }
}
