//! WebSocket transport (SPEC_FULL.md §6), gated behind the `http-api`
//! feature. Same tool surface as the stdio/HTTP transports, reached over a
//! single persistent connection with explicit subscribe-by-`since_event_id`
//! reconnect.
//!
//! Constant-time bearer/query token comparison is grounded in
//! `api/ws_handler.rs`'s `validate_token`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use subtle::ConstantTimeEq;

use crate::bus::EventBus;
use crate::config::ResearchConfig;
use crate::dispatch::{Dispatch, StatusFormat, SubmitOutcome};
use crate::store::SearchScope;
use crate::types::JobId;

fn validate_token(token: &str, expected: Option<&str>) -> bool {
    match expected {
        Some(expected) => bool::from(token.as_bytes().ct_eq(expected.as_bytes())),
        None => true,
    }
}

#[derive(Clone)]
struct WsState {
    dispatch: Arc<Dispatch>,
    bus: Arc<EventBus>,
    config: Arc<ResearchConfig>,
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let authorized = match (&state.config.auth_token, &query.token) {
        (None, _) => true,
        (Some(expected), Some(token)) => validate_token(token, Some(expected)),
        (Some(_), None) => false,
    };
    if !authorized {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// One request-response message over the socket: `{"tool": "...", "args": {...}}`.
#[derive(Deserialize)]
struct WsRequest {
    tool: String,
    #[serde(default)]
    args: Value,
}

async fn handle_socket(mut socket: WebSocket, state: WsState, addr: SocketAddr) {
    tracing::debug!(%addr, "websocket connected");
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else { continue };
        let request: WsRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(e) => {
                let _ = socket
                    .send(Message::Text(json!({"error": format!("malformed request: {e}")}).to_string()))
                    .await;
                continue;
            }
        };

        let response = dispatch_tool(&state, &request.tool, request.args).await;
        if socket.send(Message::Text(response.to_string())).await.is_err() {
            break;
        }

        // If the request was a subscription, stream events until the
        // subscriber's receiver closes or the socket errors.
        if request.tool == "subscribe" {
            if let Some(job_id) = response.get("job_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<JobId>().ok())
            {
                let since = response.get("since_event_id").and_then(|v| v.as_i64()).unwrap_or(0);
                let mut rx = state.bus.subscribe(job_id, since).await;
                while let Some(event) = rx.recv().await {
                    let payload = json!({
                        "event_id": event.event_id.0,
                        "type": event.event_type,
                        "payload": event.payload,
                        "ts": event.ts,
                    });
                    if socket.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(%addr, "websocket disconnected");
}

async fn dispatch_tool(state: &WsState, tool: &str, args: Value) -> Value {
    match tool {
        "submit_research" => {
            let key = args.get("idempotencyKey").and_then(|v| v.as_str()).map(|s| s.to_string());
            match state.dispatch.submit_research(args, key).await {
                Ok(SubmitOutcome::Queued { job_id, existing }) => json!({
                    "job_id": job_id.to_string(),
                    "status": "queued",
                    "existing": existing,
                }),
                Ok(SubmitOutcome::Completed { job_id, status, result }) => json!({
                    "job_id": job_id.to_string(),
                    "status": status.as_str(),
                    "result": result,
                }),
                Err(e) => json!({"error": e.to_string()}),
            }
        }
        "batch_research" => match state.dispatch.batch_research(args).await {
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
                json!({"batch": {"jobIds": job_ids, "jobs": jobs}})
            }
            Err(e) => json!({"error": e.to_string()}),
        },
        "get_job_status" | "subscribe" => {
            let job_id = match args.get("job_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<JobId>().ok()) {
                Some(id) => id,
                None => return json!({"error": "invalid or missing job_id"}),
            };
            let since_event_id = args.get("since_event_id").and_then(|v| v.as_i64());
            let format = match args.get("format").and_then(|v| v.as_str()) {
                Some("full") => StatusFormat::Full,
                Some("events") => StatusFormat::Events,
                _ => StatusFormat::Summary,
            };
            let max_events = args.get("max_events").and_then(|v| v.as_u64()).unwrap_or(50) as usize;
            match state.dispatch.status(job_id, format, since_event_id, max_events).await {
                Ok(view) => {
                    let mut body = serde_json::to_value(&view).unwrap_or_else(|_| json!({}));
                    body["job_id"] = json!(job_id.to_string());
                    body["since_event_id"] = json!(since_event_id.unwrap_or(0));
                    body
                }
                Err(e) => json!({"error": e.to_string()}),
            }
        }
        "cancel_job" => {
            let job_id = match args.get("job_id").and_then(|v| v.as_str()).and_then(|s| s.parse::<JobId>().ok()) {
                Some(id) => id,
                None => return json!({"error": "invalid or missing job_id"}),
            };
            match state.dispatch.cancel(job_id).await {
                Ok(previous) => json!({"job_id": job_id.to_string(), "previous_status": previous.as_str()}),
                Err(e) => json!({"error": e.to_string()}),
            }
        }
        "search" => {
            let q = match args.get("q").and_then(|v| v.as_str()) {
                Some(q) => q.to_string(),
                None => return json!({"error": "missing q"}),
            };
            let k = args.get("k").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
            let scope = match args.get("scope").and_then(|v| v.as_str()) {
                Some("reports") => SearchScope::ReportsOnly,
                Some("docs") => SearchScope::DocsOnly,
                _ => SearchScope::Both,
            };
            let rerank = args.get("rerank").and_then(|v| v.as_bool()).unwrap_or(false);
            match state.dispatch.search(&q, k, scope, rerank).await {
                Ok(result) => json!({"hits": result.hits, "degraded": result.degraded}),
                Err(e) => json!({"error": e.to_string()}),
            }
        }
        other => json!({"error": format!("unknown tool: {other}")}),
    }
}

pub fn router(dispatch: Arc<Dispatch>, bus: Arc<EventBus>, config: Arc<ResearchConfig>) -> Router {
    let state = WsState { dispatch, bus, config };
    Router::new().route("/ws", get(ws_upgrade)).with_state(state)
}
