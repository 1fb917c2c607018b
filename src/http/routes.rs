//! HTTP route definitions

use axum::{
    extract::State,
    http::{header, Method},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::app::AppState;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&state.config.client_origin))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `*` allows any origin; otherwise a comma-separated list
fn allowed_origins(raw: &str) -> AllowOrigin {
    if raw.split(',').any(|s| s.trim() == "*") {
        return AllowOrigin::any();
    }
    let origins: Vec<header::HeaderValue> = raw
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();
    AllowOrigin::list(origins)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    active_players: usize,
    alive_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime_secs(),
        active_sessions: state.sessions.active_sessions(),
        active_players: state.sessions.total_players(),
        alive_players: state.sessions.total_alive(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_origin_allows_any() {
        let any = format!("{:?}", AllowOrigin::any());
        assert_eq!(format!("{:?}", allowed_origins("*")), any);
        assert_eq!(format!("{:?}", allowed_origins("https://a.test, *")), any);
        assert_ne!(format!("{:?}", allowed_origins("https://a.test")), any);
    }

    #[tokio::test]
    async fn health_reports_empty_server() {
        let state = AppState::for_tests();
        let Json(health) = health_handler(State(state)).await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_sessions, 0);
        assert_eq!(health.active_players, 0);
    }
}
