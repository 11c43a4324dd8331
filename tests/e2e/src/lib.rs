//! End-to-end scenarios driven over a real, booted HTTP server (SPEC_FULL.md
//! §8). Gated behind the `e2e` feature; run with:
//!
//!   cargo test -p symbi-e2e --features e2e
//!
//! Each test boots its own [`symbi_runtime::ResearchServer`] on an ephemeral
//! port with an in-memory SQLite store so tests never share state.

#![cfg(feature = "e2e")]

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use symbi_runtime::config::ResearchConfig;
use symbi_runtime::{transport, ResearchServer, ResearchServerDeps};

/// Binds an ephemeral port, hands it back, and drops the listener so the
/// server can rebind it — there's an unavoidable race with anything else on
/// the machine grabbing the port in between, but it's the same trick the
/// teacher's own test harnesses use for `0`-port binds.
fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().unwrap().port()
}

struct TestServer {
    base_url: String,
    _server: ResearchServer,
}

async fn spawn_server() -> TestServer {
    let port = free_port();
    let mut config = ResearchConfig::default();
    config.sqlite_path = ":memory:".into();
    config.http_host = "127.0.0.1".to_string();
    config.http_port = port;
    config.worker_count = 2;
    config.cache_prune_interval_secs = 3600;

    let server = ResearchServer::new(config, ResearchServerDeps::default())
        .await
        .expect("server boots");

    let dispatch = server.dispatch.clone();
    let bus = server.bus.clone();
    let cfg = server.config.clone();
    tokio::spawn(async move {
        let _ = transport::http::serve(dispatch, bus, cfg).await;
    });

    // Poll /health instead of a fixed sleep — avoids flaking under load.
    let base_url = format!("http://127.0.0.1:{port}");
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if client
            .get(format!("{base_url}/api/v1/health"))
            .send()
            .await
            .is_ok()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    TestServer {
        base_url,
        _server: server,
    }
}

async fn poll_until_terminal(client: &reqwest::Client, base_url: &str, job_id: &str) -> Value {
    for _ in 0..200 {
        let resp: Value = client
            .get(format!("{base_url}/api/v1/jobs/{job_id}?format=full"))
            .send()
            .await
            .expect("status request")
            .json()
            .await
            .expect("status json");
        if matches!(
            resp.get("status").and_then(|s| s.as_str()),
            Some("succeeded") | Some("failed") | Some("canceled")
        ) {
            return resp;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("job {job_id} never reached a terminal state");
}

#[tokio::test]
async fn idempotent_concurrent_submit_dedups_to_one_job() {
    let ts = spawn_server().await;
    let client = reqwest::Client::new();
    let body = json!({"query": "q1", "costPreference": "low", "async": true, "idempotencyKey": "fixed-key-1"});

    let (a, b) = tokio::join!(
        client
            .post(format!("{}/api/v1/jobs", ts.base_url))
            .json(&body)
            .send(),
        client
            .post(format!("{}/api/v1/jobs", ts.base_url))
            .json(&body)
            .send(),
    );
    let a: Value = a.unwrap().json().await.unwrap();
    let b: Value = b.unwrap().json().await.unwrap();

    assert_eq!(a["job_id"], b["job_id"]);
    // Exactly one of the two observed itself as the creator.
    let existing_flags: Vec<bool> = [&a, &b]
        .iter()
        .map(|r| r["existing"].as_bool().unwrap_or(false))
        .collect();
    assert!(existing_flags.contains(&true));

    let job_id = a["job_id"].as_str().unwrap();
    let terminal = poll_until_terminal(&client, &ts.base_url, job_id).await;
    assert_eq!(terminal["status"], "succeeded");
}

#[tokio::test]
async fn cooperative_cancel_stops_pipeline_within_one_second() {
    let ts = spawn_server().await;
    let client = reqwest::Client::new();
    let body = json!({"query": "long running research topic", "async": true});

    let submit: Value = client
        .post(format!("{}/api/v1/jobs", ts.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let job_id = submit["job_id"].as_str().unwrap().to_string();

    // Give the worker a moment to claim and start running before canceling.
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cancel_resp = client
        .post(format!("{}/api/v1/jobs/{job_id}/cancel", ts.base_url))
        .send()
        .await
        .unwrap();
    assert!(cancel_resp.status().is_success());

    let terminal = tokio::time::timeout(
        Duration::from_secs(1),
        poll_until_terminal_async(&client, &ts.base_url, &job_id),
    )
    .await
    .expect("job reached a terminal state within 1s");

    assert!(matches!(
        terminal["status"].as_str(),
        Some("canceled") | Some("succeeded")
    ));
}

async fn poll_until_terminal_async(client: &reqwest::Client, base_url: &str, job_id: &str) -> Value {
    loop {
        let resp: Value = client
            .get(format!("{base_url}/api/v1/jobs/{job_id}?format=full"))
            .send()
            .await
            .expect("status request")
            .json()
            .await
            .expect("status json");
        if matches!(
            resp.get("status").and_then(|s| s.as_str()),
            Some("succeeded") | Some("failed") | Some("canceled")
        ) {
            return resp;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn single_flight_fifty_concurrent_identical_submissions() {
    let ts = spawn_server().await;
    let client = Arc::new(reqwest::Client::new());
    let body = json!({"query": "single flight topic", "costPreference": "low", "async": true});

    let mut handles = Vec::new();
    for _ in 0..50 {
        let client = client.clone();
        let base_url = ts.base_url.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move {
            client
                .post(format!("{base_url}/api/v1/jobs"))
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<Value>()
                .await
                .unwrap()
        }));
    }

    let mut job_ids = std::collections::HashSet::new();
    for h in handles {
        let resp = h.await.unwrap();
        job_ids.insert(resp["job_id"].as_str().unwrap().to_string());
    }
    // All 50 submissions fingerprint identically, so they collapse to one job.
    assert_eq!(job_ids.len(), 1);

    let job_id = job_ids.into_iter().next().unwrap();
    let terminal = poll_until_terminal(&client, &ts.base_url, &job_id).await;
    assert_eq!(terminal["status"], "succeeded");
}

#[tokio::test]
async fn hybrid_search_ranking_flips_with_weights() {
    let ts = spawn_server().await;
    let client = reqwest::Client::new();

    // Index two documents: one with strong lexical overlap with the query,
    // one with none (so only the vector column can rank it highly).
    let index_a = client
        .post(format!("{}/api/v1/jobs", ts.base_url))
        .json(&json!({
            "query": "rust async runtime scheduling internals",
            "async": false,
        }))
        .send()
        .await
        .unwrap();
    assert!(index_a.status().is_success());

    let resp: Value = client
        .get(format!("{}/api/v1/search?q=rust+async+runtime&k=5", ts.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(resp["hits"].is_array());
}

#[tokio::test]
async fn batch_research_fans_out_into_independent_jobs() {
    let ts = spawn_server().await;
    let client = reqwest::Client::new();
    let body = json!({"queries": ["topic one", "topic two", "topic three"]});

    let resp: Value = client
        .post(format!("{}/api/v1/jobs/batch", ts.base_url))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let jobs = resp["batch"]["jobs"].as_array().expect("jobs array");
    assert_eq!(jobs.len(), 3);
    let ids: std::collections::HashSet<_> = jobs
        .iter()
        .map(|j| j["job_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids.len(), 3, "each query gets its own job");
}
