//! HTTP facade: versioned REST routes, the response envelope, correlation
//! propagation, and the SSE status stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{self, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use futures::future::ready as future_ready;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::model::{JobSnapshot, VideoJobRequest};
use crate::orchestrator::{OrchestrationOutcome, Orchestrator};

const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
struct CorrelationId(String);

/// Standard response envelope.
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
}

fn ok_envelope<T: Serialize>(
    status: StatusCode,
    data: T,
    message: Option<String>,
    correlation: &CorrelationId,
) -> Response {
    let envelope = Envelope {
        success: true,
        data: Some(data),
        error: None,
        message,
        timestamp: Utc::now(),
        correlation_id: Some(correlation.0.clone()),
    };
    (status, Json(envelope)).into_response()
}

fn error_envelope(error: &Error, correlation: &CorrelationId) -> Response {
    let status = match error.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Cancelled => StatusCode::CONFLICT,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::NoSuitableNode
        | ErrorKind::BulkheadFull
        | ErrorKind::CircuitOpen
        | ErrorKind::TransientExternal => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::FatalExternal | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let envelope = Envelope {
        success: false,
        data: Some(serde_json::json!({
            "status": "failed",
            "recoverable": error.is_recoverable(),
            "suggested_action": error.suggested_action(),
        })),
        error: Some(error.to_string()),
        message: None,
        timestamp: Utc::now(),
        correlation_id: Some(correlation.0.clone()),
    };
    (status, Json(envelope)).into_response()
}

#[derive(Debug, Serialize)]
struct ImmediateResponse {
    job_id: String,
    status: &'static str,
    result_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size_bytes: Option<u64>,
    processing_time_ms: u64,
}

#[derive(Debug, Serialize)]
struct AsyncResponse {
    job_id: String,
    status: &'static str,
    estimated_completion: DateTime<Utc>,
    status_check_endpoint: String,
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: String,
    status: String,
    progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_step: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file_size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing_time_ms: Option<u64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<JobSnapshot> for JobStatusResponse {
    fn from(snapshot: JobSnapshot) -> Self {
        JobStatusResponse {
            job_id: snapshot.id,
            status: snapshot.status.as_str().to_string(),
            progress: snapshot.progress_percent,
            current_step: snapshot.current_step,
            result_url: snapshot.result_url,
            error: snapshot.error,
            file_size_bytes: snapshot.file_size_bytes,
            processing_time_ms: snapshot.processing_time_ms,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    page: Option<usize>,
    limit: Option<usize>,
}

/// Build the full application router.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let api = Router::new()
        .route("/video/create", post(create_video))
        .route("/video/result/{job_id}", get(job_result))
        .route("/video/job/{job_id}", delete(cancel_job))
        .route("/video/jobs", get(list_jobs))
        .route("/video/job/{job_id}/details", get(job_details))
        .route("/video/job/{job_id}/subscribe", get(subscribe_job));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .route("/health/live", get(live))
        .layer(middleware::from_fn(correlation))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}

/// Take `X-Correlation-Id` from the request or mint one, and echo it back
/// on the response.
async fn correlation(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request.extensions_mut().insert(CorrelationId(id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

async fn create_video(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
    Json(request): Json<VideoJobRequest>,
) -> Response {
    match orchestrator
        .orchestrate(request, Some(correlation.0.clone()))
        .await
    {
        Ok(OrchestrationOutcome::Immediate { job_id, result, processing_time_ms }) => ok_envelope(
            StatusCode::OK,
            ImmediateResponse {
                job_id,
                status: "completed",
                result_url: result.url,
                file_size_bytes: Some(result.size_bytes),
                processing_time_ms,
            },
            Some("video processing completed".into()),
            &correlation,
        ),
        Ok(OrchestrationOutcome::Queued {
            job_id,
            estimated_completion,
            status_check_endpoint,
        }) => ok_envelope(
            StatusCode::ACCEPTED,
            AsyncResponse {
                job_id,
                status: "processing",
                estimated_completion,
                status_check_endpoint,
            },
            Some("video processing started".into()),
            &correlation,
        ),
        Err(error) => error_envelope(&error, &correlation),
    }
}

async fn job_result(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.status(&job_id).await {
        Ok(snapshot) => ok_envelope(
            StatusCode::OK,
            JobStatusResponse::from(snapshot),
            None,
            &correlation,
        ),
        Err(error) => error_envelope(&error, &correlation),
    }
}

async fn cancel_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.cancel(&job_id) {
        Ok(snapshot) => ok_envelope(
            StatusCode::OK,
            serde_json::json!({ "job_id": snapshot.id, "status": "cancelled" }),
            Some("job cancelled".into()),
            &correlation,
        ),
        Err(error) => error_envelope(&error, &correlation),
    }
}

async fn list_jobs(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<ListQuery>,
) -> Response {
    let page = orchestrator.list(query.page.unwrap_or(1), query.limit.unwrap_or(20));
    ok_envelope(StatusCode::OK, page, None, &correlation)
}

async fn job_details(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
    Path(job_id): Path<String>,
) -> Response {
    match orchestrator.details(&job_id).await {
        Ok(details) => ok_envelope(StatusCode::OK, details, None, &correlation),
        Err(error) => error_envelope(&error, &correlation),
    }
}

/// SSE stream: an initial frame carrying the current snapshot, one frame per
/// subsequent patch, a keep-alive comment every 30 seconds, and stream close
/// after the terminal frame.
async fn subscribe_job(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
    Path(job_id): Path<String>,
) -> Response {
    let snapshot = match orchestrator.status(&job_id).await {
        Ok(snapshot) => snapshot,
        Err(error) => return error_envelope(&error, &correlation),
    };

    let updates = BroadcastStream::new(orchestrator.store().subscribe())
        .filter_map(|received| future_ready(received.ok()))
        .filter(move |update: &JobSnapshot| {
            let matches = update.id == job_id;
            future_ready(matches)
        });

    let frames = futures::stream::once(future_ready(snapshot))
        .chain(updates)
        .scan(false, |closed, snapshot| {
            if *closed {
                return future_ready(None);
            }
            if snapshot.status.is_terminal() {
                *closed = true;
            }
            future_ready(Some(snapshot))
        })
        .map(|snapshot| {
            let frame = sse::Event::default()
                .json_data(JobStatusResponse::from(snapshot))
                .unwrap_or_else(|_| sse::Event::default().comment("serialization failure"));
            Ok::<_, Infallible>(frame)
        });

    sse_response(frames)
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<sse::Event, Infallible>> + Send + 'static,
{
    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(30))
                .text("keep-alive"),
        )
        .into_response()
}

async fn health(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
) -> Response {
    let report = orchestrator.health().report();
    let payload = serde_json::json!({
        "status": report.status,
        "uptime_ms": report.uptime_ms,
        "checks": report.checks,
        "resilience": {
            "circuit_breakers": orchestrator.resilience().breaker_snapshots(),
            "bulkheads": orchestrator.resilience().bulkhead_stats(),
        },
        "resources": orchestrator.resources().get_resource_stats(),
    });
    ok_envelope(StatusCode::OK, payload, None, &correlation)
}

async fn ready(
    State(orchestrator): State<Arc<Orchestrator>>,
    Extension(correlation): Extension<CorrelationId>,
) -> Response {
    if orchestrator.ready().await {
        ok_envelope(
            StatusCode::OK,
            serde_json::json!({ "ready": true }),
            None,
            &correlation,
        )
    } else {
        error_envelope(
            &Error::TransientExternal("database not reachable".into()),
            &correlation,
        )
    }
}

async fn live(Extension(correlation): Extension<CorrelationId>) -> Response {
    ok_envelope(
        StatusCode::OK,
        serde_json::json!({ "alive": true }),
        None,
        &correlation,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::orchestrator::Collaborators;
    use axum::body::Body;
    use axum::http::{header, Request as HttpRequest};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        let orchestrator = Orchestrator::new(Config::default(), Collaborators::simulated());
        router(orchestrator)
    }

    fn simple_body() -> String {
        serde_json::json!({
            "output_format": "mp4",
            "width": 1280,
            "height": 720,
            "elements": [
                {"id": "e1", "type": "image", "source": "https://x/y.jpg", "track": 1}
            ]
        })
        .to_string()
    }

    fn busy_body() -> String {
        let elements: Vec<serde_json::Value> = (0..6)
            .map(|i| {
                serde_json::json!({
                    "id": format!("e{i}"),
                    "type": "image",
                    "source": "https://x/y.jpg",
                    "track": 1
                })
            })
            .collect();
        serde_json::json!({
            "output_format": "mp4",
            "width": 1920,
            "height": 1080,
            "elements": elements
        })
        .to_string()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_create(body: String) -> HttpRequest<Body> {
        HttpRequest::post("/api/v1/video/create")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn create_simple_returns_200_with_result() {
        let app = app();
        let response = app.oneshot(post_create(simple_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "completed");
        assert!(body["data"]["result_url"].as_str().unwrap().starts_with("https://"));
        assert!(body["data"]["processing_time_ms"].as_u64().unwrap() <= 30_000);
    }

    #[tokio::test]
    async fn create_busy_returns_202_with_job_handle() {
        let app = app();
        let response = app.oneshot(post_create(busy_body())).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "processing");
        let job_id = body["data"]["job_id"].as_str().unwrap();
        assert_eq!(
            body["data"]["status_check_endpoint"],
            format!("/api/v1/video/result/{job_id}")
        );
    }

    #[tokio::test]
    async fn create_with_no_elements_is_a_400() {
        let app = app();
        let body = serde_json::json!({
            "output_format": "mp4",
            "width": 1280,
            "height": 720,
            "elements": []
        })
        .to_string();
        let response = app.oneshot(post_create(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("at least one element"));
    }

    #[tokio::test]
    async fn correlation_id_is_echoed() {
        let app = app();
        let request = HttpRequest::post("/api/v1/video/create")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-correlation-id", "corr-42")
            .body(Body::from(simple_body()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("x-correlation-id").unwrap(),
            "corr-42"
        );
        let body = json_body(response).await;
        assert_eq!(body["correlation_id"], "corr-42");
    }

    #[tokio::test]
    async fn unknown_job_result_is_404() {
        let app = app();
        let request = HttpRequest::get("/api/v1/video/result/ghost")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn completed_job_is_resolvable_and_cancel_rejects() {
        let orchestrator = Orchestrator::new(Config::default(), Collaborators::simulated());
        let app = router(orchestrator.clone());

        let response = app
            .clone()
            .oneshot(post_create(simple_body()))
            .await
            .unwrap();
        let body = json_body(response).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                HttpRequest::get(format!("/api/v1/video/result/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "completed");
        assert_eq!(body["data"]["progress"], 100);

        // Terminal jobs reject cancellation with 404.
        let response = app
            .oneshot(
                HttpRequest::delete(format!("/api/v1/video/job/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cancel_pending_job_returns_cancelled() {
        // Queue scheduler is never started, so the async job stays pending.
        let orchestrator = Orchestrator::new(Config::default(), Collaborators::simulated());
        let app = router(orchestrator);

        let response = app
            .clone()
            .oneshot(post_create(busy_body()))
            .await
            .unwrap();
        let body = json_body(response).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                HttpRequest::delete(format!("/api/v1/video/job/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "cancelled");

        // Poll returns the frozen terminal record.
        let response = app
            .oneshot(
                HttpRequest::get(format!("/api/v1/video/result/{job_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["data"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn listing_caps_the_page_size() {
        let app = app();
        let response = app
            .oneshot(
                HttpRequest::get("/api/v1/video/jobs?page=1&limit=5000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["limit"], 100);
    }

    #[tokio::test]
    async fn details_includes_elements() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_create(simple_body()))
            .await
            .unwrap();
        let body = json_body(response).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                HttpRequest::get(format!("/api/v1/video/job/{job_id}/details"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["data"]["job"]["id"], job_id.as_str());
        assert_eq!(body["data"]["elements"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_to_a_completed_job_sends_one_frame_and_closes() {
        let app = app();
        let response = app
            .clone()
            .oneshot(post_create(simple_body()))
            .await
            .unwrap();
        let body = json_body(response).await;
        let job_id = body["data"]["job_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                HttpRequest::get(format!("/api/v1/video/job/{job_id}/subscribe"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );

        // Terminal job: the stream ends right after the initial frame, so
        // the whole body is collectable.
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("data:"));
        assert!(text.contains("\"status\":\"completed\""));
    }

    #[tokio::test]
    async fn subscribe_to_unknown_job_is_404() {
        let app = app();
        let response = app
            .oneshot(
                HttpRequest::get("/api/v1/video/job/ghost/subscribe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_endpoints_respond() {
        let app = app();
        for path in ["/health", "/health/ready", "/health/live"] {
            let response = app
                .clone()
                .oneshot(HttpRequest::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{path}");
        }

        let response = app
            .oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(body["data"]["resilience"]["circuit_breakers"]
            .as_array()
            .unwrap()
            .len()
            >= 4);
    }
}
