//! Metrics registry for the provider
//!
//! Provides OpenTelemetry metrics for:
//! - Reconcile passes (duration, errors) per object kind
//! - Node lifecycle (additions, deletions)
//! - Scheduler queue depth
//!
//! The instruments are scraped in the Prometheus text format from
//! `GET /metrics` (see [`serve_metrics`]).

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::registry::Kind;

/// Global meter for provider metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("capmk"));

// ============================================================================
// Reconcile Metrics
// ============================================================================

/// Histogram of reconcile pass duration
///
/// Labels:
/// - `kind`: MinikubeCluster, MinikubeMachine
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("capmk_reconcile_duration_seconds")
        .with_description("Duration of reconcile passes in seconds")
        .with_unit("s")
        .build()
});

/// Counter of failed reconcile passes
///
/// Labels:
/// - `kind`: MinikubeCluster, MinikubeMachine
/// - `error_type`: transient, permanent
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capmk_reconcile_errors_total")
        .with_description("Total number of failed reconcile passes")
        .with_unit("{errors}")
        .build()
});

/// Number of objects with a pass running or pending
pub static RECONCILE_IN_FLIGHT: Lazy<UpDownCounter<i64>> = Lazy::new(|| {
    METER
        .i64_up_down_counter("capmk_reconcile_in_flight")
        .with_description("Objects with a reconcile pass running")
        .with_unit("{objects}")
        .build()
});

// ============================================================================
// Node Metrics
// ============================================================================

/// Counter of nodes added to profiles
///
/// Labels:
/// - `profile`: minikube profile
pub static NODES_PROVISIONED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capmk_nodes_provisioned_total")
        .with_description("Total number of nodes added")
        .with_unit("{nodes}")
        .build()
});

/// Counter of node deletions
///
/// Labels:
/// - `profile`: minikube profile
/// - `result`: deleted, absent, failed
pub static NODE_DELETIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("capmk_node_deletions_total")
        .with_description("Total number of node deletion attempts")
        .with_unit("{nodes}")
        .build()
});

/// Outcome of a node deletion request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionResult {
    /// The node was deleted
    Deleted,
    /// The node was already gone
    Absent,
    /// The provisioner failed; the finalizer was released anyway
    Failed,
}

impl DeletionResult {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::Absent => "absent",
            Self::Failed => "failed",
        }
    }
}

/// Record a node addition
pub fn record_node_provisioned(profile: &str) {
    NODES_PROVISIONED.add(1, &[KeyValue::new("profile", profile.to_string())]);
}

/// Record a node deletion attempt
pub fn record_node_deletion(profile: &str, result: DeletionResult) {
    NODE_DELETIONS.add(
        1,
        &[
            KeyValue::new("profile", profile.to_string()),
            KeyValue::new("result", result.as_str()),
        ],
    );
}

/// Timer for one reconcile pass
pub struct ReconcileTimer {
    kind: Kind,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconcile pass
    pub fn start(kind: Kind) -> Self {
        Self {
            kind,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("kind", self.kind.kind_str()),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, retryable: bool) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("kind", self.kind.kind_str()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", self.kind.kind_str()),
                KeyValue::new(
                    "error_type",
                    if retryable { "transient" } else { "permanent" },
                ),
            ],
        );
    }
}

// ============================================================================
// Scrape Endpoint
// ============================================================================

/// Build the router serving `GET /metrics` from `registry`
pub fn metrics_routes(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(scrape))
        .with_state(registry)
}

async fn scrape(State(registry): State<Registry>) -> Response {
    let mut buffer = Vec::new();
    match TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        Ok(()) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], buffer).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Serve the metrics endpoint on `addr` until `cancel` fires
pub async fn serve_metrics(
    addr: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "metrics endpoint listening");
    axum::serve(listener, metrics_routes(registry))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use tower::ServiceExt;

    async fn get_metrics(registry: Registry) -> (StatusCode, String) {
        let response = metrics_routes(registry)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_deletion_result_as_str() {
        assert_eq!(DeletionResult::Deleted.as_str(), "deleted");
        assert_eq!(DeletionResult::Absent.as_str(), "absent");
        assert_eq!(DeletionResult::Failed.as_str(), "failed");
    }

    #[test]
    fn test_reconcile_timer() {
        let timer = ReconcileTimer::start(Kind::MinikubeMachine);
        assert_eq!(timer.kind, Kind::MinikubeMachine);
        // Just ensure it doesn't panic
        timer.success();
        ReconcileTimer::start(Kind::MinikubeCluster).error(true);
    }

    #[test]
    fn test_node_counters() {
        record_node_provisioned("dev");
        record_node_deletion("dev", DeletionResult::Failed);
    }

    #[tokio::test]
    async fn test_scrape_serves_recorded_instruments() {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .unwrap();
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();
        provider
            .meter("capmk-test")
            .u64_counter("capmk_test_deletions")
            .build()
            .add(3, &[KeyValue::new("result", "absent")]);

        let (status, body) = get_metrics(registry).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("capmk_test_deletions_total"));
        assert!(body.contains("result=\"absent\""));
    }

    #[tokio::test]
    async fn test_scrape_of_empty_registry_is_ok() {
        let (status, body) = get_metrics(Registry::new()).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }
}
