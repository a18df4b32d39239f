use anyhow::Context;
use carewatch_core::config::{CarewatchConfig, UpstreamConfig, UpstreamKind};
use carewatch_gateway::{app, registry::SiteRegistry};
use carewatch_upstream::{ChangeSource, FirebaseOptions, FirebaseSource, MemorySource};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "carewatch_gateway=info,carewatch_upstream=info,tower_http=debug".into()
            }),
        )
        .init();

    // load config: CAREWATCH_CONFIG env > ~/.carewatch/carewatch.toml
    let config_path = std::env::var("CAREWATCH_CONFIG").ok();
    let config = CarewatchConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CarewatchConfig::default()
    });

    let source = build_source(&config.upstream)?;
    info!(source = source.name(), template = %config.upstream.path_template, "upstream ready");
    if config.sense.enabled {
        info!(auth_mode = ?config.sense.auth_mode, "sense ingest enabled");
    }

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port)
        .parse()
        .context("invalid gateway bind address")?;
    let ws_path = config.gateway.ws_path.clone();

    let registry = SiteRegistry::new(source, config.upstream.clone());
    let state = Arc::new(app::AppState::new(config, registry));
    let router = app::build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Carewatch gateway listening on {} (ws path {})", addr, ws_path);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway exited unexpectedly")
}

/// Pick the change source named by `upstream.kind`.
fn build_source(upstream: &UpstreamConfig) -> anyhow::Result<Arc<dyn ChangeSource>> {
    match upstream.kind {
        UpstreamKind::Memory => {
            warn!("upstream.kind = memory: live state only changes via sense events");
            Ok(Arc::new(MemorySource::new()))
        }
        UpstreamKind::Firebase => {
            let database_url = upstream
                .database_url
                .clone()
                .context("upstream.database_url is required for the firebase source")?;
            let source = FirebaseSource::new(FirebaseOptions {
                database_url,
                auth_token: upstream.auth_token.clone(),
                reconnect_base: Duration::from_secs(upstream.reconnect_base_secs),
                reconnect_max: Duration::from_secs(upstream.reconnect_max_secs),
            })?;
            Ok(Arc::new(source))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
