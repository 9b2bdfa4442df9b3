use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::db::Store;

/// Latest successful tick timestamps, recorded by each loop and exposed
/// via /metrics.
#[derive(Default)]
pub struct HealthState {
    activity_last_tick: RwLock<Option<DateTime<Utc>>>,
    snapshot_last_tick: RwLock<Option<DateTime<Utc>>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_activity_tick(&self, ts: DateTime<Utc>) {
        *self.activity_last_tick.write().await = Some(ts);
    }

    pub async fn record_snapshot_tick(&self, ts: DateTime<Utc>) {
        *self.snapshot_last_tick.write().await = Some(ts);
    }

    pub async fn activity_last_tick(&self) -> Option<DateTime<Utc>> {
        *self.activity_last_tick.read().await
    }

    pub async fn snapshot_last_tick(&self) -> Option<DateTime<Utc>> {
        *self.snapshot_last_tick.read().await
    }
}

struct HealthApp<S> {
    store: Arc<S>,
    state: Arc<HealthState>,
}

impl<S> Clone for HealthApp<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            state: self.state.clone(),
        }
    }
}

/// Build the health router: liveness, store readiness, last-tick metrics.
pub fn router<S: Store + 'static>(store: Arc<S>, state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/ready", get(handle_ready::<S>))
        .route("/metrics", get(handle_metrics::<S>))
        .with_state(HealthApp { store, state })
}

/// Serve the health endpoints until the token is cancelled.
pub async fn serve<S: Store + 'static>(
    port: u16,
    store: Arc<S>,
    state: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = router(store, state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind health server on port {}", port))?;

    info!(port, "health server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("health server")?;

    info!("health server stopped");
    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_ready<S: Store>(State(app): State<HealthApp<S>>) -> Response {
    match app.store.ping().await {
        Ok(()) => (StatusCode::OK, "ready").into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("store not ready: {}", e),
        )
            .into_response(),
    }
}

async fn handle_metrics<S: Store>(State(app): State<HealthApp<S>>) -> Json<serde_json::Value> {
    let mut body = serde_json::json!({ "status": "running" });

    if let Some(ts) = app.state.activity_last_tick().await {
        body["activity_last_tick"] = serde_json::json!(ts.to_rfc3339());
    }
    if let Some(ts) = app.state.snapshot_last_tick().await {
        body["snapshot_last_tick"] = serde_json::json!(ts.to_rfc3339());
    }

    Json(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::mock::MockStore;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    fn request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health_always_ok() {
        let app = router(Arc::new(MockStore::new()), Arc::new(HealthState::new()));
        let resp = app.oneshot(request("/health")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_reflects_store_reachability() {
        let store = Arc::new(MockStore::new());
        let state = Arc::new(HealthState::new());

        let resp = router(store.clone(), state.clone())
            .oneshot(request("/ready"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        store.fail_ping.store(true, Ordering::SeqCst);
        let resp = router(store, state)
            .oneshot(request("/ready"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_reports_recorded_ticks() {
        let state = Arc::new(HealthState::new());
        let ts = Utc::now();
        state.record_activity_tick(ts).await;

        assert_eq!(state.activity_last_tick().await, Some(ts));
        assert_eq!(state.snapshot_last_tick().await, None);

        let resp = router(Arc::new(MockStore::new()), state)
            .oneshot(request("/metrics"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
