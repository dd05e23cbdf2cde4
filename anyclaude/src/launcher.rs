//! Executable resolution and client process launch.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

/// Installation locations tried for the `claude` CLI before falling back
/// to `PATH` lookup.
const CLAUDE_KNOWN_PATHS: [&str; 4] = [
    "~/.claude/local/claude",
    "~/.local/bin/claude",
    "/usr/local/bin/claude",
    "/opt/homebrew/bin/claude",
];

/// Resolve a bare command name against an ordered list of known paths.
///
/// `~` expands to the user home. The first existing path wins; when none
/// exists (or no list is given) the bare name is returned, delegating the
/// lookup to `PATH`.
pub fn resolve_executable(command: &str, known_paths: Option<&[&str]>) -> String {
    let Some(paths) = known_paths else {
        return command.to_string();
    };

    for path in paths {
        let expanded = expand_home(path);
        if expanded.exists() {
            return expanded.to_string_lossy().into_owned();
        }
    }

    command.to_string()
}

fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }

    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    PathBuf::from(path)
}

/// Spawn the client command with its Anthropic endpoint pointed at the
/// proxy, and wait for it to exit or for shutdown.
pub async fn launch_client(command: &str, proxy_addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    let known_paths = (command == "claude").then_some(CLAUDE_KNOWN_PATHS.as_slice());
    let program = resolve_executable(command, known_paths);

    log::info!("Launching '{program}' against http://{proxy_addr}");

    let mut child = tokio::process::Command::new(&program)
        .env("ANTHROPIC_BASE_URL", format!("http://{proxy_addr}"))
        .spawn()
        .with_context(|| format!("spawning {program}"))?;

    tokio::select! {
        status = child.wait() => {
            let status = status.context("waiting for client process")?;
            log::info!("Client process exited with {status}");
        }
        _ = shutdown.cancelled() => {
            log::info!("Shutting down, stopping client process");
            let _ = child.kill().await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_list_short_circuits_to_bare_name() {
        assert_eq!(resolve_executable("claude", None), "claude");
    }

    #[test]
    fn first_existing_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        std::fs::write(&first, "").unwrap();
        std::fs::write(&second, "").unwrap();

        let first_str = first.to_string_lossy().into_owned();
        let second_str = second.to_string_lossy().into_owned();
        let missing = dir.path().join("missing").to_string_lossy().into_owned();

        let paths = [missing.as_str(), first_str.as_str(), second_str.as_str()];
        assert_eq!(resolve_executable("cmd", Some(paths.as_slice())), first_str);
    }

    #[test]
    fn no_existing_path_falls_back_to_bare_name() {
        let paths = ["/nonexistent/a", "/nonexistent/b"];
        assert_eq!(resolve_executable("cmd", Some(paths.as_slice())), "cmd");
    }

    #[test]
    fn tilde_expands_to_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };

        assert_eq!(expand_home("~/bin/tool"), home.join("bin/tool"));
        assert_eq!(expand_home("~"), home);
        assert_eq!(expand_home("/absolute/path"), PathBuf::from("/absolute/path"));
    }
}
