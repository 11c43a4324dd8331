//! Transport Adapter (SPEC_FULL.md §1, §6): stdio (MCP/JSON-RPC), HTTP+SSE,
//! and WebSocket front ends over the same [`crate::dispatch::Dispatch`].
//! Each transport is wire-format translation only; all behavior lives in
//! `dispatch.rs`, `pipeline.rs`, and the store layer.

pub mod mcp;

#[cfg(feature = "http-api")]
pub mod http;

#[cfg(feature = "http-api")]
pub mod ws;
