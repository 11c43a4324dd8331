//! stdio MCP transport (SPEC_FULL.md §6): exposes the five research tools
//! over JSON-RPC via `rmcp`.
//!
//! Grounded directly in `src/mcp_server/mod.rs`'s `#[tool_router]`/
//! `#[tool_handler]`/`stdio()` idiom. Tool business logic is delegated to
//! [`crate::dispatch::Dispatch`] — this module is wire-format translation
//! only.

use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router,
    ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::json;

use crate::dispatch::{
    BatchResearchParams, Dispatch, ResearchParams, StatusFormat, SubmitOutcome,
};
use crate::store::SearchScope;
use crate::types::JobId;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GetJobStatusParams {
    /// Id of a previously submitted job.
    pub job_id: String,
    /// How much detail to return: `summary`, `full`, or `events`.
    #[serde(default = "default_format")]
    pub format: String,
    /// Maximum number of events to return when `format` includes events.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Resume an event stream after this event id.
    pub since_event_id: Option<i64>,
}

fn default_format() -> String {
    "summary".to_string()
}

fn default_max_events() -> usize {
    50
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CancelJobParams {
    /// Id of the job to cancel.
    pub job_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Free-text search query.
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
    /// Which corpora to scan: `both`, `reports`, or `docs`.
    #[serde(default = "default_scope")]
    pub scope: String,
    #[serde(default)]
    pub rerank: bool,
}

fn default_k() -> usize {
    10
}

fn default_scope() -> String {
    "both".to_string()
}

fn parse_status_format(s: &str) -> StatusFormat {
    match s {
        "full" => StatusFormat::Full,
        "events" => StatusFormat::Events,
        _ => StatusFormat::Summary,
    }
}

fn parse_search_scope(s: &str) -> SearchScope {
    match s {
        "reports" => SearchScope::ReportsOnly,
        "docs" => SearchScope::DocsOnly,
        _ => SearchScope::Both,
    }
}

fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

#[derive(Clone)]
pub struct ResearchMcpServer {
    dispatch: Arc<Dispatch>,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl ResearchMcpServer {
    pub fn new(dispatch: Arc<Dispatch>) -> Self {
        Self {
            dispatch,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Submit a research query for autonomous investigation. Returns a job id \
                        immediately unless `async` is set to false, in which case it blocks \
                        until the job reaches a terminal state and returns the final report."
    )]
    async fn submit_research(
        &self,
        Parameters(params): Parameters<ResearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let key = params.idempotency_key.clone();
        let raw = match serde_json::to_value(&params) {
            Ok(v) => v,
            Err(e) => return Ok(error_result(format!("invalid parameters: {e}"))),
        };
        match self.dispatch.submit_research(raw, key).await {
            Ok(SubmitOutcome::Queued { job_id, existing }) => {
                let body = json!({
                    "job_id": job_id.to_string(),
                    "status": "queued",
                    "existing": existing,
                    "sse_url": format!("/api/v1/jobs/{}/events", job_id),
                });
                Ok(CallToolResult::success(vec![Content::text(body.to_string())]))
            }
            Ok(SubmitOutcome::Completed { job_id, status, result }) => {
                let body = json!({
                    "job_id": job_id.to_string(),
                    "status": status.as_str(),
                    "result": result,
                });
                Ok(CallToolResult::success(vec![Content::text(body.to_string())]))
            }
            Err(e) => Ok(error_result(e.to_string())),
        }
    }

    #[tool(
        description = "Submit up to 10 research queries at once. Each query becomes its own \
                        async job; returns the list of job ids."
    )]
    async fn batch_research(
        &self,
        Parameters(params): Parameters<BatchResearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let raw = match serde_json::to_value(&params) {
            Ok(v) => v,
            Err(e) => return Ok(error_result(format!("invalid parameters: {e}"))),
        };
        match self.dispatch.batch_research(raw).await {
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
                let body = json!({"batch": {"jobIds": job_ids, "jobs": jobs}});
                Ok(CallToolResult::success(vec![Content::text(body.to_string())]))
            }
            Err(e) => Ok(error_result(e.to_string())),
        }
    }

    #[tool(description = "Fetch the status, progress, report id, and (optionally) events of a job.")]
    async fn get_job_status(
        &self,
        Parameters(params): Parameters<GetJobStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        let job_id: JobId = match params.job_id.parse() {
            Ok(id) => id,
            Err(_) => return Ok(error_result(format!("invalid job_id: {}", params.job_id))),
        };
        match self
            .dispatch
            .status(
                job_id,
                parse_status_format(&params.format),
                params.since_event_id,
                params.max_events,
            )
            .await
        {
            Ok(view) => Ok(CallToolResult::success(vec![Content::text(
                serde_json::to_string(&view).unwrap_or_default(),
            )])),
            Err(e) => Ok(error_result(e.to_string())),
        }
    }

    #[tool(description = "Request cancellation of a running or queued job. Idempotent.")]
    async fn cancel_job(
        &self,
        Parameters(params): Parameters<CancelJobParams>,
    ) -> Result<CallToolResult, McpError> {
        let job_id: JobId = match params.job_id.parse() {
            Ok(id) => id,
            Err(_) => return Ok(error_result(format!("invalid job_id: {}", params.job_id))),
        };
        match self.dispatch.cancel(job_id).await {
            Ok(previous) => {
                let body = json!({"job_id": job_id.to_string(), "previous_status": previous.as_str()});
                Ok(CallToolResult::success(vec![Content::text(body.to_string())]))
            }
            Err(e) => Ok(error_result(e.to_string())),
        }
    }

    #[tool(description = "Hybrid (BM25 + vector) search over stored reports and indexed documents.")]
    async fn search(
        &self,
        Parameters(params): Parameters<SearchParams>,
    ) -> Result<CallToolResult, McpError> {
        match self
            .dispatch
            .search(&params.q, params.k, parse_search_scope(&params.scope), params.rerank)
            .await
        {
            Ok(result) => {
                let body = json!({
                    "hits": result.hits,
                    "degraded": result.degraded,
                });
                Ok(CallToolResult::success(vec![Content::text(body.to_string())]))
            }
            Err(e) => Ok(error_result(e.to_string())),
        }
    }
}

#[tool_handler]
impl ServerHandler for ResearchMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Async research orchestration over stdio: submit queries, poll or stream \
                 status, cancel in-flight work, and search prior reports."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Serve `server` over stdio until the client disconnects. Logging must go
/// to stderr — stdout is the JSON-RPC channel.
pub async fn serve_stdio(server: ResearchMcpServer) -> Result<(), Box<dyn std::error::Error>> {
    use rmcp::{transport::stdio, ServiceExt};
    let service = server.serve(stdio()).await?;
    service.waiting().await?;
    Ok(())
}
