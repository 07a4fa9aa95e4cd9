//! HTTP endpoints reporting readiness, liveness and metrics.
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{metrics::Metrics, signal::StoppableWaitGroup};

/// What the endpoints report on.
#[derive(Clone)]
pub struct HealthState {
    pub synced: StoppableWaitGroup,
    pub metrics: Arc<Metrics>,
}

/// Routes `/readyz`, `/healthz` and `/metrics`.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/readyz", get(readyz))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Ready once every cluster completed its initial synchronization.
async fn readyz(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.synced.is_complete() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "NotReady")
    }
}

async fn healthz() -> &'static str {
    "OK"
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "failed to render metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

/// Serve the health endpoints on `listener` until `cancel` fires.
#[tracing::instrument(skip_all)]
pub async fn serve(
    listener: TcpListener,
    state: HealthState,
    cancel: CancellationToken,
) -> Result<()> {
    info!(addr = %listener.local_addr()?, "health server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::{body::Body, http::Request};
    use test_log::test;
    use tower::ServiceExt;

    fn state() -> HealthState {
        HealthState {
            synced: StoppableWaitGroup::new(),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test(tokio::test)]
    async fn readiness_follows_the_barrier() {
        let state = state();
        let slot = state.synced.add();
        let app = router(state.clone());

        assert_eq!(
            get(app.clone(), "/readyz").await,
            (StatusCode::INTERNAL_SERVER_ERROR, "NotReady".to_owned())
        );
        slot.done();
        assert_eq!(
            get(app.clone(), "/readyz").await,
            (StatusCode::INTERNAL_SERVER_ERROR, "NotReady".to_owned()),
            "not ready until the barrier is stopped"
        );
        state.synced.stop();
        assert_eq!(
            get(app, "/readyz").await,
            (StatusCode::OK, "Ready".to_owned())
        );
    }

    #[test(tokio::test)]
    async fn liveness_and_metrics() {
        let state = state();
        state
            .metrics
            .record_write("cluster-001", "nodes", "upsert", true);
        let app = router(state);

        assert_eq!(
            get(app.clone(), "/healthz").await,
            (StatusCode::OK, "OK".to_owned())
        );
        let (status, body) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(
            r#"mocker_kvstore_operations_total{action="upsert",cluster="cluster-001",kind="nodes"} 1"#
        ));
    }

    #[test(tokio::test)]
    async fn server_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = tokio::spawn(serve(listener, state(), cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
