use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use sha2::{Digest, Sha256};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use nacc_backends::ActiveBackend;
use nacc_domain::config::{ConfigSeverity, CorsConfig, OrchestratorConfig};
use nacc_orchestrator::api;
use nacc_orchestrator::audit::AuditLog;
use nacc_orchestrator::cli::{Cli, Command, ConfigCommand};
use nacc_orchestrator::planner::Planner;
use nacc_orchestrator::registry::NodeRegistry;
use nacc_orchestrator::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = nacc_orchestrator::cli::load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = nacc_orchestrator::cli::load_config(&cli.config)?;
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
            let config = nacc_orchestrator::cli::load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("nacc {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,nacc_orchestrator=debug")),
        )
        .json()
        .init();
}

/// Start the orchestrator with the given configuration.
async fn run_server(config: Arc<OrchestratorConfig>) -> anyhow::Result<()> {
    tracing::info!("nacc orchestrator starting");

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

    // ── Audit log (writer task + startup recovery/trim) ──────────────
    let audit = AuditLog::open(&config.audit.path, config.audit.retention_bytes)
        .context("opening audit log")?;
    tracing::info!(
        path = %config.audit.path.display(),
        retention_bytes = config.audit.retention_bytes,
        "audit log ready"
    );

    // ── Active backend ───────────────────────────────────────────────
    let backends = Arc::new(
        ActiveBackend::from_config(&config.backend).context("initializing active backend")?,
    );
    tracing::info!(kind = %backends.current_kind(), "active backend ready");

    // ── Planner ──────────────────────────────────────────────────────
    let planner = Arc::new(Planner::new(backends.clone()));

    // ── Node registry ────────────────────────────────────────────────
    let registry = Arc::new(NodeRegistry::new());
    let probe_timeout = std::time::Duration::from_secs(config.health.probe_timeout_seconds.max(1));
    for def in &config.nodes {
        // A node that fails to register (bad transport parameters, missing
        // env secrets) is skipped, not fatal; the fleet runs without it.
        if let Err(e) = registry.register(def.clone(), probe_timeout, &audit).await {
            tracing::warn!(node_id = %def.node_id, error = %e, "failed to register node, skipping");
        }
    }
    tracing::info!(
        nodes = registry.len(),
        healthy = registry.healthy_snapshot().len(),
        "node registry ready"
    );

    // ── Health loops (one task per node) ─────────────────────────────
    let health_handles = registry.spawn_health_loops(audit.clone(), config.health.clone());
    tracing::info!(
        loops = health_handles.len(),
        interval_seconds = config.health.interval_seconds,
        "health loops started"
    );

    // ── Operator token (read once, hash for constant-time comparison) ─
    let operator_token_hash = match std::env::var(&config.security.operator_token_env) {
        Ok(token) if !token.is_empty() => {
            tracing::info!(
                env_var = %config.security.operator_token_env,
                "operator-token auth enabled for /backends/switch"
            );
            Some(Sha256::digest(token.as_bytes()).to_vec())
        }
        _ => {
            tracing::warn!(
                env_var = %config.security.operator_token_env,
                "operator-token auth DISABLED — set the env var to enable"
            );
            None
        }
    };

    let state = AppState {
        config: config.clone(),
        registry,
        audit,
        backends,
        planner,
        operator_token_hash,
    };

    // ── Router ───────────────────────────────────────────────────────
    let max_concurrent = std::env::var("NACC_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    let app = api::router(state)
        .layer(build_cors_layer(&config.server.cors))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent));

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "nacc orchestrator listening");

    axum::serve(listener, app)
        .await
        .context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins. A literal
/// `"*"` allows all origins (not recommended outside development).
fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    use axum::http::header;

    let allow_origin = if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = cors
            .allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(hv) => Some(hv),
                Err(_) => {
                    tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
