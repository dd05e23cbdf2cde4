//! MLX cluster configuration and its parse pipeline.
//!
//! The pipeline is pure: every stage takes a JSON value by reference and
//! returns a new one, so callers can re-run or compose stages without
//! surprises. The flow is load -> merge with defaults -> apply environment
//! overrides -> validate -> deserialize.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Cluster configuration after a successful parse.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Master switch for cluster routing.
    pub enabled: bool,
    /// How worker nodes are discovered.
    pub discovery: DiscoveryConfig,
    /// Health probing parameters.
    pub health: HealthCheckConfig,
    /// Prompt-cache affinity parameters.
    pub cache: CacheConfig,
    /// Node selection and retry parameters.
    pub routing: RoutingConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        serde_json::from_value(default_cluster_value()).expect("cluster defaults must deserialize")
    }
}

/// Node discovery settings.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery mode.
    pub mode: DiscoveryMode,
    /// Static node list, required when `mode = "static"`.
    pub nodes: Option<Vec<NodeEntry>>,
}

/// Supported node discovery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Nodes listed directly in the configuration.
    #[default]
    Static,
    /// Nodes discovered from Kubernetes endpoints.
    Kubernetes,
}

/// A statically configured worker node.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NodeEntry {
    /// Base URL of the node.
    pub url: String,
    /// Stable identifier used in logs and routing decisions.
    pub id: String,
}

/// Health probing parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Interval between probes, in milliseconds.
    pub check_interval_ms: u64,
    /// Per-probe timeout, in milliseconds.
    pub timeout_ms: u64,
    /// Probe failures before a node is marked unhealthy.
    pub max_consecutive_failures: u32,
    /// Fraction of unhealthy nodes above which the cluster degrades.
    pub unhealthy_threshold: f64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 10_000,
            timeout_ms: 5_000,
            max_consecutive_failures: 3,
            unhealthy_threshold: 0.5,
        }
    }
}

/// Prompt-cache affinity parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Seconds after which an affinity entry is considered stale.
    pub max_age_sec: u64,
    /// Minimum hit rate for affinity routing to stay worthwhile.
    pub min_hit_rate: f64,
    /// Upper bound on tracked cached-prefix size, in tokens.
    pub max_size_tokens: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_sec: 300,
            min_hit_rate: 0.3,
            max_size_tokens: 100_000,
        }
    }
}

/// Node selection and retry parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Node selection strategy.
    pub strategy: RoutingStrategy,
    /// Dispatch retries before the failure surfaces to the caller.
    pub max_retries: u32,
    /// Pause between retries, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::RoundRobin,
            max_retries: 2,
            retry_delay_ms: 500,
        }
    }
}

/// Node selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    /// Monotonic index modulo the live node set.
    RoundRobin,
    /// Minimum load gauge, round-robin tie-break.
    LeastLoaded,
    /// Prefer the node with affinity for the request's cache fingerprint.
    CacheAware,
    /// Minimum observed latency EWMA.
    LatencyBased,
}

impl RoutingStrategy {
    /// Canonical kebab-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingStrategy::RoundRobin => "round-robin",
            RoutingStrategy::LeastLoaded => "least-loaded",
            RoutingStrategy::CacheAware => "cache-aware",
            RoutingStrategy::LatencyBased => "latency-based",
        }
    }
}

impl FromStr for RoutingStrategy {
    type Err = ();

    /// Accepts any case and either `-` or `_` separators.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" => Ok(RoutingStrategy::RoundRobin),
            "least-loaded" => Ok(RoutingStrategy::LeastLoaded),
            "cache-aware" => Ok(RoutingStrategy::CacheAware),
            "latency-based" => Ok(RoutingStrategy::LatencyBased),
            _ => Err(()),
        }
    }
}

/// Outcome of the cluster config parse pipeline.
#[derive(Debug)]
pub struct ClusterParseResult {
    /// Whether parsing produced a usable configuration.
    pub success: bool,
    /// The parsed configuration on success.
    pub config: Option<ClusterConfig>,
    /// The first fatal error encountered.
    pub error: Option<ClusterConfigError>,
    /// Non-fatal findings worth surfacing to the operator.
    pub warnings: Vec<String>,
}

impl ClusterParseResult {
    fn failure(error: ClusterConfigError, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            config: None,
            error: Some(error),
            warnings,
        }
    }
}

/// A fatal cluster configuration error.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterConfigError {
    /// Machine-readable error code.
    pub code: ClusterErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Offending values for diagnostics.
    pub context: Value,
}

/// Closed set of cluster configuration error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterErrorCode {
    /// A field has the wrong type or an out-of-range value.
    InvalidConfig,
    /// Static discovery without a non-empty node list.
    MissingNodes,
    /// A node URL is not a valid http/https URL.
    InvalidUrl,
    /// The routing strategy is not one of the supported four.
    InvalidStrategy,
    /// The source document is not valid JSON.
    ParseError,
    /// The configuration file does not exist.
    FileNotFound,
}

/// Environment overrides consulted by the parse pipeline.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    /// `MLX_CLUSTER_NODES`: JSON array of node objects or URL strings.
    pub nodes: Option<String>,
    /// `MLX_CLUSTER_STRATEGY`: routing strategy name.
    pub strategy: Option<String>,
    /// `MLX_CLUSTER_HEALTH_INTERVAL`: probe interval in milliseconds.
    pub health_interval: Option<String>,
    /// `MLX_CLUSTER_ENABLED`: boolean master switch.
    pub enabled: Option<String>,
}

impl EnvOverrides {
    /// Capture the overrides from the process environment.
    pub fn from_env() -> Self {
        Self {
            nodes: std::env::var("MLX_CLUSTER_NODES").ok(),
            strategy: std::env::var("MLX_CLUSTER_STRATEGY").ok(),
            health_interval: std::env::var("MLX_CLUSTER_HEALTH_INTERVAL").ok(),
            enabled: std::env::var("MLX_CLUSTER_ENABLED").ok(),
        }
    }
}

/// The complete default configuration as a JSON value.
pub fn default_cluster_value() -> Value {
    json!({
        "enabled": true,
        "discovery": {
            "mode": "static",
            "nodes": null,
        },
        "health": {
            "check_interval_ms": 10_000,
            "timeout_ms": 5_000,
            "max_consecutive_failures": 3,
            "unhealthy_threshold": 0.5,
        },
        "cache": {
            "max_age_sec": 300,
            "min_hit_rate": 0.3,
            "max_size_tokens": 100_000,
        },
        "routing": {
            "strategy": "round-robin",
            "max_retries": 2,
            "retry_delay_ms": 500,
        },
    })
}

/// Deep-merge `user` over the built-in defaults.
///
/// Objects merge recursively, any other value replaces the default
/// wholesale. Unknown fields are carried along and ignored downstream.
/// `user` is not mutated.
pub fn merge_with_defaults(user: &Value) -> Value {
    let mut merged = default_cluster_value();
    deep_merge(&mut merged, user);
    merged
}

fn deep_merge(base: &mut Value, user: &Value) {
    match (base, user) {
        (Value::Object(base_map), Value::Object(user_map)) => {
            for (key, user_value) in user_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, user_value),
                    None => {
                        base_map.insert(key.clone(), user_value.clone());
                    }
                }
            }
        }
        (base, user) => *base = user.clone(),
    }
}

/// Apply environment overrides on top of `config`, returning a new value.
///
/// Unparseable numeric or boolean values are ignored with a warning. An
/// unparseable `MLX_CLUSTER_NODES` document is fatal, since silently
/// keeping the file's node list would route traffic the operator tried to
/// redirect.
pub fn apply_env_overrides(
    config: &Value,
    env: &EnvOverrides,
    warnings: &mut Vec<String>,
) -> Result<Value, ClusterConfigError> {
    let mut config = config.clone();

    if let Some(raw) = env.nodes.as_deref() {
        let nodes = parse_env_nodes(raw)?;
        config["discovery"]["nodes"] = nodes;
        config["discovery"]["mode"] = json!("static");
    }

    if let Some(raw) = env.strategy.as_deref() {
        // Written verbatim when unknown so validation reports INVALID_STRATEGY.
        let normalized = RoutingStrategy::from_str(raw)
            .map(|strategy| strategy.as_str().to_string())
            .unwrap_or_else(|_| raw.to_string());
        config["routing"]["strategy"] = json!(normalized);
    }

    if let Some(raw) = env.health_interval.as_deref() {
        match raw.trim().parse::<u64>() {
            Ok(interval) => config["health"]["check_interval_ms"] = json!(interval),
            Err(_) => warnings.push(format!("Ignoring non-integer MLX_CLUSTER_HEALTH_INTERVAL: {raw:?}")),
        }
    }

    if let Some(raw) = env.enabled.as_deref() {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => config["enabled"] = json!(true),
            "false" | "0" => config["enabled"] = json!(false),
            _ => warnings.push(format!("Ignoring non-boolean MLX_CLUSTER_ENABLED: {raw:?}")),
        }
    }

    Ok(config)
}

fn parse_env_nodes(raw: &str) -> Result<Value, ClusterConfigError> {
    let parsed: Value = serde_json::from_str(raw).map_err(|e| ClusterConfigError {
        code: ClusterErrorCode::ParseError,
        message: format!("MLX_CLUSTER_NODES is not valid JSON: {e}"),
        context: json!({ "env": "MLX_CLUSTER_NODES" }),
    })?;

    let Value::Array(entries) = parsed else {
        return Err(ClusterConfigError {
            code: ClusterErrorCode::InvalidConfig,
            message: "MLX_CLUSTER_NODES must be a JSON array".to_string(),
            context: json!({ "env": "MLX_CLUSTER_NODES" }),
        });
    };

    let nodes: Vec<Value> = entries
        .into_iter()
        .map(|entry| match entry {
            // Bare URL strings double as their own node id.
            Value::String(url) => json!({ "url": url.clone(), "id": url }),
            other => other,
        })
        .collect();

    Ok(Value::Array(nodes))
}

/// Validate the merged configuration, returning warnings on success.
pub fn validate(config: &Value) -> Result<Vec<String>, ClusterConfigError> {
    let mut warnings = Vec::new();

    let strategy = config["routing"]["strategy"].as_str().unwrap_or_default();
    if RoutingStrategy::from_str(strategy).is_err() {
        return Err(ClusterConfigError {
            code: ClusterErrorCode::InvalidStrategy,
            message: format!(
                "Unknown routing strategy '{strategy}', expected one of round-robin, least-loaded, cache-aware, latency-based"
            ),
            context: json!({ "strategy": strategy }),
        });
    }

    if config["discovery"]["mode"].as_str() == Some("static") {
        let nodes = config["discovery"]["nodes"].as_array();

        match nodes {
            Some(nodes) if !nodes.is_empty() => {
                for node in nodes {
                    validate_node_url(node)?;
                }
            }
            _ => {
                return Err(ClusterConfigError {
                    code: ClusterErrorCode::MissingNodes,
                    message: "Static discovery requires a non-empty discovery.nodes list".to_string(),
                    context: json!({ "discovery": config["discovery"].clone() }),
                });
            }
        }
    }

    for (field, value) in [
        ("health.check_interval_ms", &config["health"]["check_interval_ms"]),
        ("health.timeout_ms", &config["health"]["timeout_ms"]),
        ("health.max_consecutive_failures", &config["health"]["max_consecutive_failures"]),
        ("cache.max_age_sec", &config["cache"]["max_age_sec"]),
        ("cache.max_size_tokens", &config["cache"]["max_size_tokens"]),
        ("routing.max_retries", &config["routing"]["max_retries"]),
        ("routing.retry_delay_ms", &config["routing"]["retry_delay_ms"]),
    ] {
        if value.as_u64().is_none() {
            return Err(ClusterConfigError {
                code: ClusterErrorCode::InvalidConfig,
                message: format!("{field} must be a non-negative integer"),
                context: json!({ "field": field, "value": value.clone() }),
            });
        }
    }

    for (field, value) in [
        ("health.unhealthy_threshold", &config["health"]["unhealthy_threshold"]),
        ("cache.min_hit_rate", &config["cache"]["min_hit_rate"]),
    ] {
        let in_range = value.as_f64().is_some_and(|v| (0.0..=1.0).contains(&v));

        if !in_range {
            return Err(ClusterConfigError {
                code: ClusterErrorCode::InvalidConfig,
                message: format!("{field} must be a number between 0.0 and 1.0"),
                context: json!({ "field": field, "value": value.clone() }),
            });
        }
    }

    if config["health"]["check_interval_ms"].as_u64().unwrap_or(0) > 3_600_000 {
        warnings.push("health.check_interval_ms exceeds one hour; node failures will go unnoticed for a long time".to_string());
    }

    if config["routing"]["max_retries"].as_u64().unwrap_or(0) > 10 {
        warnings.push("routing.max_retries is very high; failed requests will be slow to surface".to_string());
    }

    Ok(warnings)
}

fn validate_node_url(node: &Value) -> Result<(), ClusterConfigError> {
    let raw = node["url"].as_str().unwrap_or_default();

    let valid = url::Url::parse(raw)
        .map(|parsed| matches!(parsed.scheme(), "http" | "https"))
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(ClusterConfigError {
            code: ClusterErrorCode::InvalidUrl,
            message: format!("Node URL '{raw}' must be a valid http or https URL"),
            context: json!({ "url": raw }),
        })
    }
}

/// Run the full pipeline over an in-memory JSON document.
pub fn parse_cluster_config(user: &Value, env: &EnvOverrides) -> ClusterParseResult {
    let merged = merge_with_defaults(user);

    let mut warnings = Vec::new();
    let with_env = match apply_env_overrides(&merged, env, &mut warnings) {
        Ok(config) => config,
        Err(error) => return ClusterParseResult::failure(error, warnings),
    };

    match validate(&with_env) {
        Ok(more_warnings) => warnings.extend(more_warnings),
        Err(error) => return ClusterParseResult::failure(error, warnings),
    }

    match serde_json::from_value::<ClusterConfig>(with_env) {
        Ok(config) => ClusterParseResult {
            success: true,
            config: Some(config),
            error: None,
            warnings,
        },
        Err(e) => ClusterParseResult::failure(
            ClusterConfigError {
                code: ClusterErrorCode::InvalidConfig,
                message: format!("Cluster configuration has an invalid shape: {e}"),
                context: Value::Null,
            },
            warnings,
        ),
    }
}

/// Load a cluster configuration file (JSON) and run the pipeline.
pub fn load_cluster_config<P: AsRef<Path>>(path: P, env: &EnvOverrides) -> ClusterParseResult {
    let path = path.as_ref();

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ClusterParseResult::failure(
                ClusterConfigError {
                    code: ClusterErrorCode::FileNotFound,
                    message: format!("Cluster configuration file not found: {}", path.display()),
                    context: json!({ "path": path.display().to_string() }),
                },
                Vec::new(),
            );
        }
        Err(e) => {
            return ClusterParseResult::failure(
                ClusterConfigError {
                    code: ClusterErrorCode::ParseError,
                    message: format!("Failed to read cluster configuration: {e}"),
                    context: json!({ "path": path.display().to_string() }),
                },
                Vec::new(),
            );
        }
    };

    let user: Value = match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            return ClusterParseResult::failure(
                ClusterConfigError {
                    code: ClusterErrorCode::ParseError,
                    message: format!("Cluster configuration is not valid JSON: {e}"),
                    context: json!({ "path": path.display().to_string() }),
                },
                Vec::new(),
            );
        }
    };

    parse_cluster_config(&user, env)
}
