//! Thin stdio-framed binary over the `mcp` tool surface.
//!
//! Reads one JSON request per line from stdin (`{"op":"ingest","path":"..."}`
//! or `{"op":"query","query":"..."}`), dispatches to the ingestion or
//! retrieval orchestrator, and writes one JSON response per line to stdout.
//! Process-wide concerns that the library itself never touches — tracing
//! subscriber init, config loading — live here, not in `raglite::wiring`.

use raglite::config::{RagLiteConfig, ServiceCredentials};
use raglite::mcp::{self, IngestRequest, QueryRequest, ToolError};
use raglite::wiring::RagLiteSystem;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Ingest(IngestRequest),
    Query(QueryRequest),
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Ingest(mcp::IngestResponse),
    Query(mcp::QueryResponse),
    Error(ToolError),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RagLiteConfig::default();
    let credentials = ServiceCredentials::from_env();
    let system = RagLiteSystem::build(config, credentials).await?;

    tracing::info!("raglite-server ready, reading requests from stdin");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Ingest(req)) => match mcp::handle_ingest(&system, req).await {
                Ok(resp) => Response::Ingest(resp),
                Err(err) => Response::Error(err),
            },
            Ok(Request::Query(req)) => match mcp::handle_query(&system, req).await {
                Ok(resp) => Response::Query(resp),
                Err(err) => Response::Error(err),
            },
            Err(err) => Response::Error(ToolError {
                category: "invalid_request".to_string(),
                message: err.to_string(),
            }),
        };

        let serialized = serde_json::to_string(&response)?;
        writeln!(out, "{}", serialized)?;
        out.flush()?;
    }

    Ok(())
}
