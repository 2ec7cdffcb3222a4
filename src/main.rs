//! Example binary demonstrating the comfyfleet library.
//!
//! Boots a dispatcher for the Ghibli volume, runs a single prompt round
//! trip and writes the artifact next to the binary.
//!
//! ## Usage
//!
//! 1. Create a `.env` file with your configuration
//! 2. Run: `cargo run -- [workflow] [input_url]`
//!
//! Defaults: workflow `Ghibli`, input URL `ORIGIN_IMAGE_URL`.

#![allow(clippy::print_stdout)] // Allow println! in the binary example

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use comfyfleet::{
    DispatcherConfig, GpuType, PodManager, PromptOutput, RunpodClient, SshExec, VolumeType,
    WorkflowStore, WorkflowType,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Load configuration from environment
    let cfg = Arc::new(DispatcherConfig::from_env()?);
    println!("Configuration loaded:");
    println!("  REST URL: {}", cfg.rest_url);
    println!("  Fleet bounds: {}..={}", cfg.min_pods, cfg.max_pods);
    println!("  Workflows dir: {}", cfg.workflows_dir.display());

    let workflow: WorkflowType = std::env::args()
        .nth(1)
        .map_or(Ok(WorkflowType::Ghibli), |arg| arg.parse())?;
    let input_url = std::env::args()
        .nth(2)
        .unwrap_or_else(|| cfg.origin_image_url.clone());

    // Assemble the dispatcher
    let provider = Arc::new(RunpodClient::new(&cfg)?);
    let runner = Arc::new(SshExec::new(&cfg));
    let store = Arc::new(WorkflowStore::new(cfg.workflows_dir.clone()));
    let manager = PodManager::new(
        Arc::clone(&cfg),
        provider,
        runner,
        store,
        GpuType::RtxA6000,
        VolumeType::Ghibli,
    )?;

    println!("\nQueueing {workflow:?} prompt for {input_url}");
    let result = manager.queue_prompt(workflow, input_url).await;

    match result.output {
        PromptOutput::Data(bytes) => {
            let path = "output.jpg";
            std::fs::write(path, &bytes)?;
            println!("\nPrompt completed: {} bytes written to {path}", bytes.len());
        }
        PromptOutput::Reason(reason) => {
            println!("\nPrompt failed: {reason}");
        }
    }

    println!("\nDispatcher state:");
    println!("{}", serde_json::to_string_pretty(&manager.get_state())?);

    manager.stop().await;
    Ok(())
}
