//! Liveness and readiness probes
//!
//! - `GET /healthz` - always 200 while the process serves requests
//! - `GET /readyz` - 200 once the readiness check passes, 503 before

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Readiness predicate polled by `/readyz`
pub type ReadinessCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// Build the probe router
pub fn health_routes(ready: ReadinessCheck) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn readyz(State(ready): State<ReadinessCheck>) -> (StatusCode, &'static str) {
    if ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve the probes on `addr` until `cancel` fires
pub async fn serve_probes(
    addr: SocketAddr,
    ready: ReadinessCheck,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "health probes listening");
    axum::serve(listener, health_routes(ready))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    fn flag_check(flag: Arc<AtomicBool>) -> ReadinessCheck {
        Arc::new(move || flag.load(Ordering::SeqCst))
    }

    async fn status_of(router: Router, path: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_healthz_always_ok() {
        let router = health_routes(flag_check(Arc::new(AtomicBool::new(false))));
        assert_eq!(status_of(router, "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_follows_check() {
        let flag = Arc::new(AtomicBool::new(false));
        let router = health_routes(flag_check(flag.clone()));
        assert_eq!(
            status_of(router.clone(), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        flag.store(true, Ordering::SeqCst);
        assert_eq!(status_of(router, "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let router = health_routes(flag_check(Arc::new(AtomicBool::new(true))));
        assert_eq!(status_of(router, "/metrics").await, StatusCode::NOT_FOUND);
    }
}
