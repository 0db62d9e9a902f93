/**
 * HTTP - Surface d'observation du nervous system
 *
 * RÔLE :
 * - GET /health      : snapshot JSON (compteurs, agents, connexions)
 * - GET /health/live : "ok" tant que le process répond
 * - GET /metrics     : exposition texte Prometheus
 *
 * Lecture seule, pas d'authentification. Arrêt gracieux sur le jeton
 * d'annulation partagé avec les boucles de routage.
 */

use crate::metrics::SharedMetrics;
use crate::status::{StatusAggregator, StatusSnapshot};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct AppState {
    pub status: StatusAggregator,
    pub metrics: SharedMetrics,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/health/live", get(|| async { "ok" }))
        .route("/metrics", get(get_metrics))
        .with_state(app_state)
}

async fn get_health(State(app): State<AppState>) -> Json<StatusSnapshot> {
    Json(app.status.snapshot())
}

async fn get_metrics(State(app): State<AppState>) -> Response {
    match app.metrics.export() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "metrics export failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Sert jusqu'à l'annulation du jeton
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "health endpoint listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}
