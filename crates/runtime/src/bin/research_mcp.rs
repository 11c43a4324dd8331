//! stdio entry point for the research MCP server.
//!
//! Grounded in `src/mcp_server/mod.rs`'s `start_mcp_server`: tracing goes to
//! stderr only, since stdout carries the JSON-RPC transport.

use std::sync::Arc;

use symbi_runtime::config::ResearchConfig;
use symbi_runtime::pipeline::{HttpLlmProvider, LlmProvider, MockLlmProvider};
use symbi_runtime::transport::mcp::{serve_stdio, ResearchMcpServer};
use symbi_runtime::{embedding, ResearchServer, ResearchServerDeps};

fn resolve_llm_provider(config: &ResearchConfig) -> Arc<dyn LlmProvider> {
    match std::env::var("RESEARCH_LLM_PROVIDER").ok().as_deref() {
        Some("http") | Some("openai") => Arc::new(HttpLlmProvider::new(
            std::env::var("RESEARCH_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            std::env::var("RESEARCH_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            std::env::var("RESEARCH_LLM_API_KEY").ok(),
        )),
        _ => {
            let _ = config;
            Arc::new(MockLlmProvider)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = match std::env::var("RESEARCH_CONFIG_FILE") {
        Ok(path) => ResearchConfig::from_file(path)?,
        Err(_) => ResearchConfig::from_env()?,
    };

    let deps = ResearchServerDeps {
        llm_provider: resolve_llm_provider(&config),
        embedding_provider: embedding::resolve_provider(
            &config.embedding_provider,
            config.embedding_api_base_url.as_deref(),
            config.embedding_model.as_deref(),
        )
        .into(),
    };

    let server = ResearchServer::new(config, deps).await?;
    let mcp_server = ResearchMcpServer::new(server.dispatch.clone());

    tracing::info!("research MCP server ready on stdio");
    serve_stdio(mcp_server).await?;

    server.shutdown().await;
    Ok(())
}
