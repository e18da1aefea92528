use axum::{
    extract::{rejection::JsonRejection, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use http::{header, StatusCode};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

use super::AppState;
use crate::metrics::gather_metrics;
use crate::models::{sanitize_input, AlertStatus, HookMessage};

const DEFAULT_QUERY_LIMIT: usize = 100;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Alertmanager probes the receiver with GET.
pub async fn alerts_get() -> &'static str {
    "OK"
}

pub async fn alerts_post(
    State(state): State<AppState>,
    payload: Result<Json<HookMessage>, JsonRejection>,
) -> Response {
    let Json(message) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Rejecting webhook payload: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid request body").into_response();
        }
    };

    let raw_status = sanitize_input(&message.status);
    let status: AlertStatus = match raw_status.parse() {
        Ok(status) => status,
        Err(e) => {
            warn!(status = %raw_status, "Ignoring webhook: {}", e);
            return StatusCode::OK.into_response();
        }
    };

    debug!(
        %status,
        group_key = %message.group_key,
        alerts = message.alerts.len(),
        "Received webhook"
    );
    // Handles are dropped: the dispatch tasks outlive this request.
    let _ = state
        .dispatcher
        .dispatch_batch(message.alerts, status, &message.group_key);

    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
pub struct AlertStoreQuery {
    #[serde(default)]
    q: String,
    limit: Option<usize>,
}

pub async fn alert_store(
    State(state): State<AppState>,
    Query(query): Query<AlertStoreQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
    match state.store.get_alerts(query.q.trim(), limit).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            error!("Failed to read alert store: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}
