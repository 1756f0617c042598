//! EdgeLLM Runtime - serializing inference queue in front of a local Ollama.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the queue until Ctrl-C (Ollama at localhost:11434)
//! edgellm-runtime
//!
//! # One-shot prompt through the queue, tokens printed as they stream
//! edgellm-runtime "Why is the sky blue?"
//!
//! # Custom configuration
//! OLLAMA_HOST=http://192.168.1.100:11434 EDGELLM_DEFAULT_MODEL=qwen2.5:7b edgellm-runtime
//! ```

use std::io::Write;

use anyhow::Context;
use edgellm_core::{EnqueueOptions, StreamEvent};
use edgellm_runtime::{print_banner, Runtime, RuntimeConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = RuntimeConfig::from_env();

    // Initialize logging
    let default_filter = if config.verbose {
        "edgellm_runtime=debug,edgellm_core=debug"
    } else {
        "edgellm_runtime=info,edgellm_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");

    if prompt.is_empty() {
        print_banner(&config);
    }
    let runtime = Runtime::start(config).await.context("Failed to start runtime")?;

    let result = if prompt.is_empty() {
        info!("Queue ready, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")
    } else {
        run_prompt(&runtime, &prompt).await
    };

    runtime.shutdown().await;
    result
}

/// Send one prompt through the queue and print the reply as it streams
async fn run_prompt(runtime: &Runtime, prompt: &str) -> anyhow::Result<()> {
    let manager = runtime.manager();
    let job = manager
        .enqueue(0, "chat", serde_json::json!({ "prompt": prompt }), EnqueueOptions::default())
        .await?;
    info!(job_id = %job.job_id, model = %job.model, position = job.queue_position, "Prompt queued");

    let (_subscription, mut events) = manager.subscribe_channel(job.job_id).await?;
    let mut stdout = std::io::stdout();
    let mut failure = None;

    while let Some(event) = events.recv().await {
        if write_event(&mut stdout, &event, &mut failure)? {
            break;
        }
    }

    match failure {
        Some(message) => anyhow::bail!("Job failed: {}", message),
        None => Ok(()),
    }
}

/// Print one stream event; returns true once the job is done.
///
/// Output produced before the subscription attached arrives as the
/// `reconnect` snapshot and is printed ahead of the live tokens.
fn write_event(
    out: &mut impl Write,
    event: &StreamEvent,
    failure: &mut Option<String>,
) -> std::io::Result<bool> {
    match event {
        StreamEvent::Reconnect { content, .. } | StreamEvent::Response { token: content, .. } => {
            write!(out, "{}", content)?;
            out.flush()?;
        }
        StreamEvent::Error { message } => *failure = Some(message.clone()),
        StreamEvent::Done { .. } => {
            writeln!(out)?;
            return Ok(true);
        }
        _ => {}
    }
    Ok(false)
}
