use std::path::Path;

use anyhow::bail;
use indoc::indoc;

use crate::{BackendMode, Config};

pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: Config = toml::from_str(&content)?;

    validate(&config)?;

    if config.backend.mode == BackendMode::Lmstudio {
        log::warn!("backend.mode = \"lmstudio\" is deprecated, use \"local\" instead");
    }

    Ok(config)
}

pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&config.context.compress_threshold) {
        bail!(
            "context.compress_threshold must be between 0.0 and 1.0, got {}",
            config.context.compress_threshold
        );
    }

    if config.context.keep_recent_messages == 0 {
        bail!("context.keep_recent_messages must be a positive integer");
    }

    if config.context.tool_result_max_tokens == 0 {
        bail!("context.tool_result_max_tokens must be a positive integer");
    }

    if config.server.keep_alive_interval_secs == 0 || config.server.keep_alive_interval_secs >= 30 {
        bail!(
            "server.keep_alive_interval_secs must be between 1 and 29 to beat intermediary idle timeouts, got {}",
            config.server.keep_alive_interval_secs
        );
    }

    if config.backend.mode.effective() == BackendMode::MlxCluster && config.cluster.is_none() {
        bail!(indoc! {r#"
            backend.mode = "mlx-cluster" requires a [cluster] section.

            Example configuration:

              [cluster.discovery]
              mode = "static"
              nodes = [
                { url = "http://10.0.0.1:8081", id = "worker-1" },
              ]
        "#});
    }

    Ok(())
}
