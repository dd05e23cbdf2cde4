//! HTTP server configuration settings.

use serde::Deserialize;

/// Port used when neither the environment nor the configuration provides
/// a valid one.
pub const DEFAULT_PORT: u16 = 49152;

/// HTTP server configuration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// The port the proxy should listen on. Overridden by `ANYCLAUDE_PORT`.
    pub port: Option<u16>,
    /// Maximum accepted request body size in bytes.
    pub max_body_size: usize,
    /// Interval between SSE keep-alive pings for slow upstreams, in seconds.
    /// Must stay below the idle-close deadline of intermediaries.
    pub keep_alive_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            max_body_size: 10 * 1024 * 1024,
            keep_alive_interval_secs: 15,
        }
    }
}

/// Resolve the listen port: environment > configuration > [`DEFAULT_PORT`].
///
/// The environment value must be an integer in `[1, 65535]`; surrounding
/// whitespace is trimmed, anything else (floats included) is rejected and
/// falls through to the configured port. A configured port of 0 is invalid.
pub fn resolve_port(env_value: Option<&str>, config_port: Option<u16>) -> u16 {
    if let Some(value) = env_value {
        match value.trim().parse::<u32>() {
            Ok(port @ 1..=65535) => return port as u16,
            _ => log::warn!("Ignoring invalid ANYCLAUDE_PORT value: {value:?}"),
        }
    }

    match config_port {
        Some(port) if port > 0 => port,
        _ => DEFAULT_PORT,
    }
}
