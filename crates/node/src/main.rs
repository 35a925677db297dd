use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use nacc_domain::config::{ConfigSeverity, NodeConfig};
use nacc_node::cli::{Cli, Command, ConfigCommand};
use nacc_node::server;
use nacc_node::state::AppState;
use nacc_tools::RootContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = nacc_node::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = nacc_node::cli::load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                println!("{:?}: {issue}", issue.severity);
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("config ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = nacc_node::cli::load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("nacc-node {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nacc_node=debug,nacc_tools=debug")),
        )
        .json()
        .init();
}

/// Start the tool server with the given configuration.
async fn run_server(config: Arc<NodeConfig>) -> anyhow::Result<()> {
    tracing::info!(node_id = %config.node_id, "nacc-node starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Root context ─────────────────────────────────────────────────
    let root = Arc::new(
        RootContext::new(
            config.node_id.clone(),
            &config.root_dir,
            config.allowed_commands.clone(),
            config.path_env.clone(),
            config.tags.clone(),
            config.sync_targets.clone(),
        )
        .context("building root context")?,
    );
    tracing::info!(
        root = %root.root().display(),
        allowed_commands = config.allowed_commands.len(),
        "root context ready"
    );

    // ── Bearer token (read once, hash for constant-time comparison) ──
    let token_hash = match std::env::var(&config.bearer_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(env_var = %config.bearer_token_env, "bearer-token auth enabled");
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.bearer_token_env,
                "bearer-token auth DISABLED — set the env var to enable"
            );
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        root,
        token_hash,
    };

    // ── Router ───────────────────────────────────────────────────────
    let app = server::router(state).layer(tower_http::trace::TraceLayer::new_for_http());

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, node_id = %config.node_id, "nacc-node listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}
