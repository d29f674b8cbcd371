//! Liveness endpoint
//!
//! A plain HTTP `GET /health` served next to the controller so the pod's
//! liveness probe has something to hit.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Router serving `/health`
pub fn health_router(port: u16) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .with_state(port)
}

async fn health_handler(State(port): State<u16>) -> String {
    format!("Listening on {port}")
}

/// Serve the health endpoint until `shutdown` is cancelled
pub async fn serve_health(port: u16, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health endpoint listening");

    axum::serve(listener, health_router(port))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_port() {
        let response = health_router(8080)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"Listening on 8080");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = health_router(8080)
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn server_stops_on_shutdown() {
        let token = CancellationToken::new();
        token.cancel();
        // Port 0 binds an ephemeral port
        serve_health(0, token).await.unwrap();
    }
}
