// ABOUTME: shellbox binary serving the sandbox engine over HTTP
// ABOUTME: Loads config from SHELLBOX_* variables, brings the container up, and shuts down on Ctrl-C

use anyhow::Context;
use clap::{Parser, Subcommand};
use shellbox_sandbox::{DockerProvider, EngineConfig, SandboxEngine};
use shellbox_server::create_router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "shellbox")]
#[command(about = "Run shell commands inside a managed sandbox container")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    // Options for the default `serve` command
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug, PartialEq)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1", help = "Address to bind")]
    host: String,
    #[arg(long, default_value = "4780", help = "Port to listen on")]
    port: u16,
    #[arg(long, help = "Host workspace directory (overrides SHELLBOX_WORKSPACE_DIR)")]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    serve(Cli::parse().into_serve_args()).await
}

impl Cli {
    fn into_serve_args(self) -> ServeArgs {
        match self.command {
            Some(Commands::Serve(args)) => args,
            None => self.serve,
        }
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = EngineConfig::from_env().context("invalid SHELLBOX_* configuration")?;
    if let Some(workspace) = args.workspace {
        config.workspace_dir = workspace;
    }

    let provider = Arc::new(DockerProvider::new().context("failed to connect to Docker")?);
    let engine = Arc::new(SandboxEngine::new(config, provider)?);
    let container_id = engine.start().await?;
    info!("Sandbox ready in container {}", container_id);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, create_router(engine.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = engine.shutdown().await {
        warn!("Engine shutdown reported an error: {}", e);
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> ServeArgs {
        Cli::try_parse_from(args).unwrap().into_serve_args()
    }

    #[test]
    fn test_bare_invocation_matches_serve_defaults() {
        assert_eq!(parse(&["shellbox"]), parse(&["shellbox", "serve"]));
        assert_eq!(parse(&["shellbox"]).port, 4780);
    }

    #[test]
    fn test_options_apply_with_or_without_subcommand() {
        let top = parse(&["shellbox", "--port", "9000", "--workspace", "/tmp/ws"]);
        let sub = parse(&["shellbox", "serve", "--port", "9000", "--workspace", "/tmp/ws"]);

        assert_eq!(top, sub);
        assert_eq!(top.host, "127.0.0.1");
        assert_eq!(top.workspace, Some(PathBuf::from("/tmp/ws")));
    }
}
