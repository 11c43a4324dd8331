//! HTTP + SSE transport (SPEC_FULL.md §6), gated behind the `http-api`
//! feature.
//!
//! Router composition and the `utoipa`/`SwaggerUi`/`axum::serve` shape are
//! grounded in `api/server.rs`; constant-time bearer-token comparison is
//! grounded in `api/ws_handler.rs`'s `validate_token`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json,
    },
    routing::{get, patch, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio_stream::{wrappers::ReceiverStream, StreamExt as _};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bus::EventBus;
use crate::config::ResearchConfig;
use crate::dispatch::{Dispatch, StatusFormat, SubmitOutcome};
use crate::store::SearchScope;
use crate::types::{JobId, ReportId};

#[derive(Clone)]
struct AppState {
    dispatch: Arc<Dispatch>,
    bus: Arc<EventBus>,
    config: Arc<ResearchConfig>,
    start_time: Instant,
}

fn validate_token(token: &str, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) => bool::from(token.as_bytes().ct_eq(expected.as_bytes())),
        // stdio is implicitly trusted; an HTTP server with no configured
        // token accepts none either, it simply has no auth to enforce.
        None => true,
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let k = parts.next()?;
        let v = parts.next().unwrap_or("");
        (k == key).then_some(v)
    })
}

fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(stripped) = s.strip_prefix("Bearer ") {
                return Some(stripped.to_string());
            }
        }
    }
    query_token.map(|s| s.to_string())
}

async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    if state.config.auth_token.is_none() {
        return next.run(req).await;
    }
    let query_token = req.uri().query().and_then(|q| query_param(q, "token").map(|s| s.to_string()));
    let token = extract_token(&headers, query_token.as_deref());
    match token {
        Some(t) if validate_token(&t, state.config.auth_token.as_deref()) => next.run(req).await,
        _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response(),
    }
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

async fn submit_research(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let idempotency_key = body
        .get("idempotencyKey")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    match state.dispatch.submit_research(body, idempotency_key).await {
        Ok(SubmitOutcome::Queued { job_id, existing }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": job_id.to_string(),
                "status": "queued",
                "existing": existing,
                "sse_url": format!("/api/v1/jobs/{job_id}/events"),
                "ui_url": format!("/api/v1/jobs/{job_id}"),
            })),
        )
            .into_response(),
        Ok(SubmitOutcome::Completed { job_id, status, result }) => (
            StatusCode::OK,
            Json(json!({"job_id": job_id.to_string(), "status": status.as_str(), "result": result})),
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn batch_research(
    State(state): State<AppState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    match state.dispatch.batch_research(body).await {
        Ok(results) => {
            let mut job_ids = Vec::with_capacity(results.len());
            let jobs: Vec<_> = results
                .into_iter()
                .map(|(query, outcome)| match outcome {
                    Ok(SubmitOutcome::Queued { job_id, existing }) => {
                        job_ids.push(job_id.to_string());
                        json!({"query": query, "job_id": job_id.to_string(), "status": "queued", "existing": existing})
                    }
                    Ok(SubmitOutcome::Completed { job_id, status, result }) => {
                        job_ids.push(job_id.to_string());
                        json!({"query": query, "job_id": job_id.to_string(), "status": status.as_str(), "result": result})
                    }
                    Err(e) => json!({"query": query, "error": e.to_string()}),
                })
                .collect();
            (
                StatusCode::ACCEPTED,
                Json(json!({"batch": {"jobIds": job_ids, "jobs": jobs}})),
            )
                .into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Deserialize)]
struct StatusQuery {
    format: Option<String>,
    max_events: Option<usize>,
    since_event_id: Option<i64>,
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(q): Query<StatusQuery>,
) -> impl IntoResponse {
    let job_id: JobId = match job_id.parse() {
        Ok(id) => id,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid job_id"}))).into_response(),
    };
    let format = match q.format.as_deref() {
        Some("full") => StatusFormat::Full,
        Some("events") => StatusFormat::Events,
        _ => StatusFormat::Summary,
    };
    match state
        .dispatch
        .status(job_id, format, q.since_event_id, q.max_events.unwrap_or(50))
        .await
    {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<String>) -> impl IntoResponse {
    let job_id: JobId = match job_id.parse() {
        Ok(id) => id,
        Err(_) => return (StatusCode::BAD_REQUEST, Json(json!({"error": "invalid job_id"}))).into_response(),
    };
    match state.dispatch.cancel(job_id).await {
        Ok(previous) => (
            StatusCode::OK,
            Json(json!({"job_id": job_id.to_string(), "previous_status": previous.as_str()})),
        )
            .into_response(),
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
    k: Option<usize>,
    scope: Option<String>,
    rerank: Option<bool>,
}

async fn search(State(state): State<AppState>, Query(q): Query<SearchQuery>) -> impl IntoResponse {
    let scope = match q.scope.as_deref() {
        Some("reports") => SearchScope::ReportsOnly,
        Some("docs") => SearchScope::DocsOnly,
        _ => SearchScope::Both,
    };
    match state
        .dispatch
        .search(&q.q, q.k.unwrap_or(10), scope, q.rerank.unwrap_or(false))
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(json!({"hits": result.hits, "degraded": result.degraded})),
        )
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Deserialize)]
struct RateReportBody {
    rating: Option<u8>,
}

async fn rate_report(
    State(state): State<AppState>,
    Path(report_id): Path<i64>,
    Json(body): Json<RateReportBody>,
) -> impl IntoResponse {
    match state.dispatch.rate_report(ReportId(report_id), body.rating).await {
        Ok(()) => (StatusCode::OK, Json(json!({"report_id": report_id, "rating": body.rating}))).into_response(),
        Err(e @ crate::types::ResearchError::InvalidParams(_)) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(rename = "since_event_id")]
    since_event_id: Option<i64>,
}

/// Server-Sent Events stream for a job. Supports resuming via the standard
/// `Last-Event-ID` header or a `since_event_id` query parameter
/// (SPEC_FULL.md §6).
async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(q): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let job_id: JobId = job_id.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    let since = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .or(q.since_event_id)
        .unwrap_or(0);

    let rx = state.bus.subscribe(job_id, since).await;
    let stream = ReceiverStream::new(rx).map(|event| {
        let data = serde_json::json!({
            "event_id": event.event_id.0,
            "type": event.event_type,
            "payload": event.payload,
            "ts": event.ts,
        });
        Ok(Event::default()
            .id(event.event_id.0.to_string())
            .event(event.event_type.clone())
            .data(data.to_string()))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub fn router(
    dispatch: Arc<Dispatch>,
    bus: Arc<EventBus>,
    config: Arc<ResearchConfig>,
) -> Router {
    let state = AppState {
        dispatch,
        bus,
        config,
        start_time: Instant::now(),
    };

    let protected = Router::new()
        .route("/api/v1/jobs", post(submit_research))
        .route("/api/v1/jobs/batch", post(batch_research))
        .route("/api/v1/jobs/:id", get(get_job_status))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/events", get(job_events))
        .route("/api/v1/search", get(search))
        .route("/api/v1/reports/:id/rating", patch(rate_report))
        .layer(axum::middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .route("/api/v1/health", get(health_check))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    dispatch: Arc<Dispatch>,
    bus: Arc<EventBus>,
    config: Arc<ResearchConfig>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("{}:{}", config.http_host, config.http_port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "http transport listening");
    let app = router(dispatch.clone(), bus.clone(), config.clone())
        .merge(super::ws::router(dispatch, bus, config));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
