use std::net::SocketAddr;

use anyhow::Context;
use args::Args;
use clap::Parser;
use tokio_util::sync::CancellationToken;

mod args;
mod launcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = if args.config.exists() {
        config::Config::load(&args.config).with_context(|| format!("loading {}", args.config.display()))?
    } else {
        config::Config::default()
    };

    let port = config::resolve_port(std::env::var("ANYCLAUDE_PORT").ok().as_deref(), config.server.port);
    let listen_address = SocketAddr::new(args.host, port);

    let shutdown = CancellationToken::new();

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let (bound_tx, bound_rx) = tokio::sync::oneshot::channel();

    if let Some(command) = args.launch.clone() {
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let Ok(bound_addr) = bound_rx.await else {
                return;
            };

            if let Err(error) = launcher::launch_client(&command, bound_addr, shutdown.clone()).await {
                log::error!("Failed to launch '{command}': {error}");
            }

            // The proxy has no reason to outlive the client it fronts.
            shutdown.cancel();
        });
    }

    server::serve(server::ServeConfig {
        listen_address,
        config,
        shutdown_signal: shutdown,
        log_filter: args.log_filter,
        version: env!("CARGO_PKG_VERSION").to_string(),
        bound_addr_sender: Some(bound_tx),
    })
    .await
}
