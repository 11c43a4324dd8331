//! Entry point for the research MCP server: boots a [`ResearchServer`] and
//! serves it over whichever transport the caller selects.

use clap::{Parser, ValueEnum};
use symbi_runtime::config::ResearchConfig;
use symbi_runtime::pipeline::{HttpLlmProvider, LlmProvider, MockLlmProvider};
use symbi_runtime::{embedding, transport, ResearchServer, ResearchServerDeps};
use std::sync::Arc;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Transport {
    /// JSON-RPC over stdio (for MCP clients such as Claude Desktop/Code).
    Stdio,
    /// HTTP+SSE and WebSocket, served together on one listener.
    Http,
}

#[derive(Parser)]
#[command(name = "symbi-research", version, about = "Async research orchestration MCP server")]
struct Cli {
    /// Which transport to serve on.
    #[arg(long, value_enum, default_value = "stdio")]
    transport: Transport,

    /// Path to a TOML config file. Falls back to environment variables when omitted.
    #[arg(long)]
    config: Option<String>,
}

fn resolve_llm_provider() -> Arc<dyn LlmProvider> {
    match std::env::var("RESEARCH_LLM_PROVIDER").ok().as_deref() {
        Some("http") | Some("openai") => Arc::new(HttpLlmProvider::new(
            std::env::var("RESEARCH_LLM_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            std::env::var("RESEARCH_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
            std::env::var("RESEARCH_LLM_API_KEY").ok(),
        )),
        _ => Arc::new(MockLlmProvider),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdio is the JSON-RPC channel for the Stdio transport, so logs must go
    // to stderr regardless of which transport ends up serving.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let config = match cli.config {
        Some(path) => ResearchConfig::from_file(path)?,
        None => ResearchConfig::from_env()?,
    };

    let deps = ResearchServerDeps {
        llm_provider: resolve_llm_provider(),
        embedding_provider: embedding::resolve_provider(
            &config.embedding_provider,
            config.embedding_api_base_url.as_deref(),
            config.embedding_model.as_deref(),
        )
        .into(),
    };

    let server = ResearchServer::new(config, deps).await?;

    match cli.transport {
        Transport::Stdio => {
            let mcp_server = transport::mcp::ResearchMcpServer::new(server.dispatch.clone());
            tracing::info!("research MCP server ready on stdio");
            transport::mcp::serve_stdio(mcp_server).await?;
        }
        Transport::Http => {
            transport::http::serve(server.dispatch.clone(), server.bus.clone(), server.config.clone())
                .await?;
        }
    }

    server.shutdown().await;
    Ok(())
}
