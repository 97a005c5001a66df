// src/main.rs
//! Signal Engine
//!
//! Reads newline-delimited JSON signals from stdin, classifies them through
//! the engine and prints one JSON result per line on stdout. Runs against the
//! offline dry-run provider; real model backends plug in through the
//! library's `ModelProvider` trait.
//!
//! Usage: `signal-engine [GUIDELINE_DIR] < signals.ndjson`

use anyhow::{Context, Result};
use serde::Deserialize;
use signal_engine::budget::ContextData;
use signal_engine::guideline::InMemoryGuidelines;
use signal_engine::observability::{init_metrics, init_tracing};
use signal_engine::provider::DryRunProvider;
use signal_engine::{BuildInfo, EngineConfig, Signal, SignalEngine, SubmitOptions};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Guideline directory when none is given
const DEFAULT_GUIDELINE_DIR: &str = "guidelines";

/// One input line: a signal with optional context
#[derive(Debug, Deserialize)]
struct InputLine {
    #[serde(flatten)]
    signal: Signal,

    #[serde(default)]
    context: ContextData,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the configured level applies
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    let build = BuildInfo::current();
    info!(
        "Starting Signal Engine v{} ({}, {})",
        build.version, build.git_hash, build.rustc_version
    );

    let guideline_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_GUIDELINE_DIR.to_string());
    let guidelines = InMemoryGuidelines::load_dir(&guideline_dir)
        .with_context(|| format!("failed to load guidelines from {}", guideline_dir))?;
    if guidelines.is_empty() {
        warn!("No guidelines found in {}; every signal will fail", guideline_dir);
    }

    let engine = SignalEngine::start(config, Arc::new(DryRunProvider), Arc::new(guidelines))?;

    // Ctrl-C stops reading; in-flight work still drains
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, cleaning up...");
                shutdown.cancel();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();
    let mut line_no = 0usize;

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else {
            break;
        };
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let input: InputLine = match serde_json::from_str(&line) {
            Ok(input) => input,
            Err(e) => {
                error!("Skipping line {}: {}", line_no, e);
                let line = serde_json::json!({
                    "line": line_no,
                    "ok": false,
                    "error": e.to_string(),
                    "kind": "invalid_input",
                });
                println!("{}", line);
                continue;
            }
        };

        let engine = engine.clone();
        inflight.spawn(async move {
            let options = SubmitOptions::default().with_context(input.context);
            let outcome = engine.submit(&input.signal, options).await;
            (input.signal.id, outcome)
        });

        // Print whatever already finished
        while let Some(done) = inflight.try_join_next() {
            print_result(done);
        }
    }

    while let Some(done) = inflight.join_next().await {
        print_result(done);
    }

    engine.shutdown().await?;
    info!("Signal Engine stopped");
    Ok(())
}

fn print_result(
    done: std::result::Result<
        (String, signal_engine::Result<signal_engine::ClassificationResult>),
        tokio::task::JoinError,
    >,
) {
    let line = match done {
        Ok((signal_id, Ok(result))) => serde_json::json!({
            "signal_id": signal_id,
            "ok": true,
            "result": result,
        }),
        Ok((signal_id, Err(e))) => serde_json::json!({
            "signal_id": signal_id,
            "ok": false,
            "error": e.to_string(),
            "kind": e.kind(),
        }),
        Err(e) => {
            error!("Submission task panicked: {}", e);
            return;
        }
    };
    println!("{}", line);
}
