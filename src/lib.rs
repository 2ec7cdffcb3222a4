//! Comfyfleet - autoscaling `RunPod` dispatcher for ComfyUI workloads.
//!
//! A library for turning a stream of image/video generation requests into
//! work executed on ephemeral `RunPod` GPU pods:
//! - **Provisioning**: rent pods with a network volume via the REST API
//! - **Warm-up**: install and start ComfyUI over SSH, absorb model load
//! - **Scheduling**: match queued prompts to free pods, FIFO, one at a time
//! - **Autoscaling**: size the fleet from queue-depth history
//! - **Deadlines**: destroy and replace pods stuck in any state
//!
//! ## Quick Start
//!
//! All configuration is loaded from environment variables. Create a `.env`
//! file:
//!
//! ```text
//! RUNPOD_API=your_api_key_here
//! ORIGIN_IMAGE_URL=https://cdn.example.com/warmup.png
//! VOLUME_ID1=your_network_volume_id
//! ```
//!
//! Then build a manager and queue prompts against it:
//!
//! ```ignore
//! use std::sync::Arc;
//! use comfyfleet::{
//!     DispatcherConfig, GpuType, PodManager, RunpodClient, SshExec,
//!     VolumeType, WorkflowStore, WorkflowType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Arc::new(DispatcherConfig::from_env()?);
//!     let provider = Arc::new(RunpodClient::new(&cfg)?);
//!     let runner = Arc::new(SshExec::new(&cfg));
//!     let store = Arc::new(WorkflowStore::new(cfg.workflows_dir.clone()));
//!
//!     let manager = PodManager::new(
//!         cfg, provider, runner, store,
//!         GpuType::RtxA6000, VolumeType::Ghibli,
//!     )?;
//!
//!     let result = manager.queue_prompt(WorkflowType::Ghibli, "https://…").await;
//!     println!("output state: {:?}", result.output_state);
//!     Ok(())
//! }
//! ```

// ============================================================================
// Modules
// ============================================================================

/// Core data model: prompts, results, pod identity, state enums.
pub mod types;

/// Configuration loaded from environment variables.
pub mod config;

/// Workflow template tags and the cached template store.
pub mod workflows;

/// `RunPod` REST client for pod create/get/delete.
pub mod runpod_client;

/// Remote command execution on pods over SSH.
pub mod ssh_exec;

/// ComfyUI inference client (HTTP + websocket progress stream).
pub mod comfy_client;

/// One rented GPU instance and its lifecycle state machine.
pub mod pod;

/// The scheduler: fleet sizing, prompt matching, deadline enforcement.
pub mod pod_manager;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use comfy_client::{ComfyClient, ComfyError};
pub use config::{ConfigError, DispatcherConfig};
pub use pod::{Pod, PodError};
pub use pod_manager::{ManagerSnapshot, PodManager};
pub use runpod_client::{CreatePodSpec, RunpodClient, RunpodError};
pub use ssh_exec::{CommandOutput, CommandRunner, SshError, SshExec};
pub use types::{
    GpuType, OutputState, PodInfo, PodManagerState, PodState, Prompt, PromptOutput, PromptResult,
    VolumeType,
};
pub use workflows::{WorkflowError, WorkflowStore, WorkflowType};
