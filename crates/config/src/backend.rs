//! Backend selection and connection settings.

use secrecy::SecretString;
use serde::Deserialize;

/// Backend selection and connection settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Which backend dialect requests are dispatched to.
    pub mode: BackendMode,
    /// Base URL of the backend. A trailing `/v1` segment is stripped before
    /// use. Defaults depend on the mode.
    pub base_url: Option<String>,
    /// API key forwarded to backends that require authentication.
    pub api_key: Option<SecretString>,
    /// Drop client-side web-search tool calls from transcoded streams.
    pub strip_web_search: bool,
}

/// Supported backend dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendMode {
    /// An OpenAI-compatible local inference server.
    #[default]
    Local,
    /// A cluster of local inference workers behind the node router.
    MlxCluster,
    /// The OpenRouter cloud aggregator.
    Openrouter,
    /// The upstream Anthropic API.
    Claude,
    /// Deprecated alias for [`BackendMode::Local`].
    Lmstudio,
}

impl BackendMode {
    /// The mode after deprecated aliases are collapsed.
    pub fn effective(self) -> BackendMode {
        match self {
            BackendMode::Lmstudio => BackendMode::Local,
            other => other,
        }
    }

    /// Stable lowercase name used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            BackendMode::Local => "local",
            BackendMode::MlxCluster => "mlx-cluster",
            BackendMode::Openrouter => "openrouter",
            BackendMode::Claude => "claude",
            BackendMode::Lmstudio => "lmstudio",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lmstudio_alias_collapses_to_local() {
        let config: BackendConfig = toml::from_str(r#"mode = "lmstudio""#).unwrap();
        assert_eq!(config.mode, BackendMode::Lmstudio);
        assert_eq!(config.mode.effective(), BackendMode::Local);
    }

    #[test]
    fn kebab_case_modes_deserialize() {
        let config: BackendConfig = toml::from_str(r#"mode = "mlx-cluster""#).unwrap();
        assert_eq!(config.mode, BackendMode::MlxCluster);
        assert_eq!(config.mode.effective(), BackendMode::MlxCluster);
    }
}
