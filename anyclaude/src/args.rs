use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Anthropic-compatibility proxy for local and cloud model backends.
#[derive(Debug, Parser)]
#[command(name = "anyclaude", version)]
pub struct Args {
    /// Path to the anyclaude.toml configuration file.
    #[arg(short, long, env = "ANYCLAUDE_CONFIG", default_value = "anyclaude.toml")]
    pub config: PathBuf,

    /// Address to bind. The port comes from ANYCLAUDE_PORT or the config.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,

    /// Log filter, e.g. "info" or "server=debug,llm=debug".
    #[arg(long, default_value = "info")]
    pub log_filter: String,

    /// Launch this client command once the proxy is listening, with its
    /// Anthropic base URL pointed at the proxy.
    #[arg(long)]
    pub launch: Option<String>,
}
