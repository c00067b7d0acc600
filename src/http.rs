//! HTTP surface of the service.
//!
//! # Purpose
//! Builds the axum router under `/system/icc`, translates engine errors
//! into the `{"error":"<kind>","msg":"..."}` envelope and adapts the
//! engines' session loops to streaming response bodies. Every streamed
//! line leaves as its own HTTP data frame, which is the flush discipline
//! long-polling clients rely on.
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::applause::Applause;
use crate::auth::Authenticater;
use crate::errors::IccError;
use crate::notify::Notify;

/// Base path of every handler of this service.
pub const BASE_PATH: &str = "/system/icc";

const OCTET_STREAM: &str = "application/octet-stream";
const JSON: &str = "application/json";

/// Buffered lines per streaming session before backpressure kicks in.
const SESSION_BUFFER: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub notify: Arc<Notify>,
    pub applause: Arc<Applause>,
    pub auth: Arc<dyn Authenticater>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(&format!("{BASE_PATH}/health"), get(health))
        .route(&format!("{BASE_PATH}/notify"), get(receive_notify))
        .route(
            &format!("{BASE_PATH}/notify/publish"),
            get(publish_notify).post(publish_notify),
        )
        .route(&format!("{BASE_PATH}/applause"), get(receive_applause))
        .route(&format!("{BASE_PATH}/applause/send"), get(send_applause))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Response {
    (
        [(CONTENT_TYPE, OCTET_STREAM)],
        "{\"healthy\": true}\n",
    )
        .into_response()
}

async fn receive_notify(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let uid = match state.auth.authenticate(&headers).await {
        Ok(uid) => uid,
        Err(err) => return error_response(&err),
    };
    if uid == 0 {
        return anonymous_response("Anonymous user can not receive notify messages.");
    }

    let meeting_id = match optional_int_param(&params, "meeting_id") {
        Ok(meeting_id) => meeting_id,
        Err(err) => return error_response(&err),
    };

    let (tx, rx) = mpsc::channel::<Bytes>(SESSION_BUFFER);
    let notify = Arc::clone(&state.notify);
    tokio::spawn(async move {
        if let Err(err) = notify.receive(tx.clone(), meeting_id, uid).await {
            end_stream_with_error(&tx, &err).await;
        }
    });

    stream_response(rx, false)
}

async fn publish_notify(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let uid = match state.auth.authenticate(&headers).await {
        Ok(uid) => uid,
        Err(err) => return error_response(&err),
    };
    if uid == 0 {
        return anonymous_response("Anonymous user can not publish notify messages.");
    }

    match state.notify.publish(&body, uid).await {
        Ok(()) => ([(CONTENT_TYPE, JSON)], "").into_response(),
        Err(err) => error_response(&err),
    }
}

async fn receive_applause(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let uid = match state.auth.authenticate(&headers).await {
        Ok(uid) => uid,
        Err(err) => return error_response(&err),
    };

    let meeting_id = match required_int_param(&params, "meeting_id") {
        Ok(meeting_id) => meeting_id,
        Err(err) => return error_response(&err),
    };

    if let Err(err) = state.applause.can_receive(meeting_id, uid).await {
        return error_response(&err);
    }

    let (tx, rx) = mpsc::channel::<Bytes>(SESSION_BUFFER);
    let applause = Arc::clone(&state.applause);
    tokio::spawn(async move {
        let mut tid = 0;
        loop {
            let received = tokio::select! {
                received = applause.receive(tid, meeting_id) => received,
                _ = tx.closed() => return,
            };
            let (next_tid, message) = match received {
                Ok(received) => received,
                Err(err) => return end_stream_with_error(&tx, &err).await,
            };
            tid = next_tid;

            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(err) => {
                    return end_stream_with_error(&tx, &IccError::Internal(err.into())).await
                }
            };
            line.push(b'\n');
            if tx.send(Bytes::from(line)).await.is_err() {
                return;
            }
        }
    });

    stream_response(rx, true)
}

async fn send_applause(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let uid = match state.auth.authenticate(&headers).await {
        Ok(uid) => uid,
        Err(err) => return error_response(&err),
    };
    if uid == 0 {
        return anonymous_response("Anonymous user can not send applause.");
    }

    let meeting_id = match required_int_param(&params, "meeting_id") {
        Ok(meeting_id) => meeting_id,
        Err(err) => return error_response(&err),
    };

    match state.applause.send(meeting_id, uid).await {
        Ok(()) => ([(CONTENT_TYPE, JSON)], "").into_response(),
        Err(err) => error_response(&err),
    }
}

/// Streaming body over the session channel; each received chunk becomes
/// one HTTP data frame.
fn stream_response(rx: mpsc::Receiver<Bytes>, no_store: bool) -> Response {
    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, OCTET_STREAM);
    if no_store {
        builder = builder.header(CACHE_CONTROL, "no-store, max-age=0");
    }
    builder
        .body(Body::from_stream(stream))
        .expect("build streaming response")
}

/// Last words of a broken session: the error envelope without a status
/// (headers are long gone), then the stream ends. Internal details are
/// logged, not sent.
async fn end_stream_with_error(tx: &mpsc::Sender<Bytes>, err: &IccError) {
    if matches!(err, IccError::Internal(_)) {
        tracing::warn!(error = %err, "streaming session failed");
    }
    let _ = tx.send(Bytes::from(err.envelope())).await;
}

/// Error response with the envelope body. Unclassified errors are logged
/// with their detail and reported generically.
pub fn error_response(err: &IccError) -> Response {
    let status = match err {
        IccError::Invalid(_) | IccError::NotAllowed(_) => StatusCode::BAD_REQUEST,
        IccError::Auth(_) => StatusCode::UNAUTHORIZED,
        IccError::Internal(detail) => {
            tracing::error!(error = ?detail, "internal error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    tracing::debug!(status = %status, "returning error status");
    (status, [(CONTENT_TYPE, JSON)], err.envelope()).into_response()
}

/// 401 with a not-allowed envelope, used where a signed-in user is
/// required.
fn anonymous_response(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(CONTENT_TYPE, JSON)],
        IccError::not_allowed(msg).envelope(),
    )
        .into_response()
}

fn optional_int_param(params: &HashMap<String, String>, name: &str) -> Result<i32, IccError> {
    match params.get(name) {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| IccError::invalid(format!("url query {name} has to be an int"))),
    }
}

fn required_int_param(params: &HashMap<String, String>, name: &str) -> Result<i32, IccError> {
    params
        .get(name)
        .ok_or_else(|| IccError::invalid(format!("url query {name} is required")))?
        .parse()
        .map_err(|_| IccError::invalid(format!("url query {name} has to be an int")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applause::Applause;
    use crate::auth::StaticAuth;
    use crate::backend::MemoryBackend;
    use crate::datastore::MemoryDatastore;
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router_with_uid(uid: i32) -> Router {
        let backend = Arc::new(MemoryBackend::new());
        let datastore = Arc::new(MemoryDatastore::new());
        let state = AppState {
            notify: Arc::new(Notify::new(backend.clone())),
            applause: Arc::new(Applause::new(backend, datastore)),
            auth: Arc::new(StaticAuth::new(uid)),
        };
        build_router(state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let response = router_with_uid(1)
            .oneshot(
                Request::builder()
                    .uri("/system/icc/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE],
            OCTET_STREAM,
        );
        let payload = body_json(response).await;
        assert_eq!(payload["healthy"], true);
    }

    #[tokio::test]
    async fn publish_with_invalid_channel_is_a_400() {
        let request = Request::builder()
            .method("POST")
            .uri("/system/icc/notify/publish")
            .body(Body::from(
                r#"{"channel_id":"abc","name":"x","to_users":[1]}"#,
            ))
            .unwrap();
        let response = router_with_uid(1).oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "invalid");
    }

    #[tokio::test]
    async fn anonymous_publish_is_a_401() {
        let request = Request::builder()
            .method("POST")
            .uri("/system/icc/notify/publish")
            .body(Body::from(r#"{}"#))
            .unwrap();
        let response = router_with_uid(0).oneshot(request).await.expect("request");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "not-allowed");
    }

    #[tokio::test]
    async fn anonymous_notify_stream_is_a_401() {
        let response = router_with_uid(0)
            .oneshot(
                Request::builder()
                    .uri("/system/icc/notify")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn notify_stream_rejects_bad_meeting_id() {
        let response = router_with_uid(1)
            .oneshot(
                Request::builder()
                    .uri("/system/icc/notify?meeting_id=abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "invalid");
    }

    #[tokio::test]
    async fn applause_stream_requires_meeting_id() {
        let response = router_with_uid(1)
            .oneshot(
                Request::builder()
                    .uri("/system/icc/applause")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn applause_stream_rejects_non_members() {
        let response = router_with_uid(5)
            .oneshot(
                Request::builder()
                    .uri("/system/icc/applause?meeting_id=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "not-allowed");
    }

    #[tokio::test]
    async fn applause_send_checks_permissions() {
        let response = router_with_uid(5)
            .oneshot(
                Request::builder()
                    .uri("/system/icc/applause/send?meeting_id=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("request");
        // Applause is not enabled in the test meeting.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
