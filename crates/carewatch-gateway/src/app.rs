use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use carewatch_core::config::CarewatchConfig;
use carewatch_core::types::ConnId;
use dashmap::DashMap;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::warn;

use crate::registry::SiteRegistry;
use crate::ws::send::ConnectionHandle;

/// Central shared state, passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: CarewatchConfig,
    pub registry: SiteRegistry,
    /// Open WS connections: conn_id -> outbound handle.
    pub ws_clients: DashMap<ConnId, ConnectionHandle>,
}

impl AppState {
    pub fn new(config: CarewatchConfig, registry: SiteRegistry) -> Self {
        Self {
            config,
            registry,
            ws_clients: DashMap::new(),
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.gateway.ws_path.clone();
    let cors = cors_layer(&state.config.gateway.allowed_origins);

    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(&ws_path, get(crate::ws::connection::ws_handler))
        .route(
            "/webhooks/sense/{site_id}",
            post(crate::http::webhooks::sense_handler),
        )
        .with_state(state)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Empty origin list means any origin may connect.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}
