//! Minimal scrape-metrics HTTP endpoint. Absent `autofc2.metrics` config the
//! server task stalls indefinitely: no socket is bound, no error raised.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::MetricsConfig;
use crate::metrics::{MetricsCollector, PrometheusExporter};

#[derive(Clone)]
struct AppState {
    collector: Arc<MetricsCollector>,
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let body = PrometheusExporter::export(&state.collector.snapshot());
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Serve the configured metrics endpoint until cancelled. If `config` is
/// `None`, never returns and never binds a socket.
pub async fn run(config: Option<MetricsConfig>, collector: Arc<MetricsCollector>) -> anyhow::Result<()> {
    let Some(config) = config else {
        std::future::pending::<()>().await;
        unreachable!("pending future never resolves");
    };

    let state = AppState { collector };
    let app = Router::new()
        .route(&config.path, get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, path = %config.path, "metrics endpoint listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;

    #[tokio::test]
    async fn metrics_handler_renders_snapshot() {
        let collector = Arc::new(MetricsCollector::new());
        collector.record_event("123", &fc2_core::CallbackEvent::StreamOnline);
        let state = AppState { collector };
        let response = metrics_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
