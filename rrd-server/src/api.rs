//! HTTP API over the record service.
//!
//! Endpoints:
//!
//! - `PUT /metrics` with body `{"timestamp": <i64>, "metric_value": <number>}`
//! - `GET /metrics?start=<i64>&end=<i64>` — records in `[start, end]`;
//!   missing bounds default to 0 and `(0, 0)` reads everything up to now
//!
//! Other methods on `/metrics` get 405 from the router.

use std::collections::HashMap;
use std::num::ParseIntError;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Json, Router};
use rrd::{Context, Record, RecordGetter, RecordSetter, validate_range};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    setter: Arc<dyn RecordSetter>,
    getter: Arc<dyn RecordGetter>,
    request_timeout: Duration,
}

impl AppState {
    /// Creates handler state; every request gets `request_timeout` to finish.
    pub fn new(
        setter: Arc<dyn RecordSetter>,
        getter: Arc<dyn RecordGetter>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            setter,
            getter,
            request_timeout,
        }
    }

    fn request_context(&self) -> RequestContext {
        RequestContext(Context::background().with_timeout(self.request_timeout))
    }
}

/// Cancels the request context when the handler future is dropped, which
/// is what happens when the client goes away.
struct RequestContext(Context);

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", put(create).get(get_by_range))
        .with_state(state)
}

/// `PUT /metrics` — stores one record.
///
/// 200 on success, 400 if the body is not a record, 500 if it was not stored.
async fn create(State(state): State<AppState>, body: Bytes) -> StatusCode {
    let record: Record = match serde_json::from_slice(&body) {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(error = %e, "failed to create record, failed to decode request");
            return StatusCode::BAD_REQUEST;
        }
    };

    let ctx = state.request_context();
    match state.setter.create(&ctx.0, record).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::error!(
                timestamp = record.timestamp,
                value = %record.value,
                error = %e,
                cause = %e.cause(),
                "failed to create record"
            );
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// `GET /metrics` — returns the records in a range.
///
/// 200 with a JSON array, 204 when nothing matched, 400 for malformed or
/// invalid bounds, 500 if the read failed.
async fn get_by_range(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (start, end) = match (bound(&params, "start"), bound(&params, "end")) {
        (Ok(start), Ok(end)) => (start, end),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(
                start = params.get("start").map(String::as_str),
                end = params.get("end").map(String::as_str),
                error = %e,
                "failed to get records, failed to parse int64"
            );
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if let Err(e) = validate_range(start, end) {
        tracing::error!(start, end, error = %e, "failed to get records, invalid range");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let ctx = state.request_context();
    let records = match state.getter.get_by_range(&ctx.0, start, end).await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!(start, end, error = %e, cause = %e.cause(), "failed to get records");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if records.is_empty() {
        tracing::debug!(start, end, "no records in range");
        return StatusCode::NO_CONTENT.into_response();
    }

    (StatusCode::OK, Json(records)).into_response()
}

/// Missing or empty bounds read as 0.
fn bound(params: &HashMap<String, String>, name: &str) -> Result<i64, ParseIntError> {
    match params.get(name).map(String::as_str) {
        None | Some("") => Ok(0),
        Some(raw) => raw.parse(),
    }
}
