//! Core data model for the dispatcher.
//!
//! Unique responsibility: the types shared between the scheduler, the pods
//! and the inference client.
//!
//! This module defines:
//! - `Prompt` / `PromptResult`: one generation request and its outcome
//! - `PodInfo`: the network identity of a provisioned instance
//! - The pod, output and manager state enums
//!
//! A `Prompt` travels between the scheduler's containers as `Arc<Prompt>`;
//! its `result` slot is interior-mutable because the pod worker writes it
//! while the scheduler still holds the other reference. The slot accepts
//! exactly one write.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflows::WorkflowType;

/// GPU hardware tier a pod is rented with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GpuType {
    /// NVIDIA `GeForce` RTX 4090.
    Rtx4090,
    /// NVIDIA RTX A6000.
    RtxA6000,
}

impl GpuType {
    /// The GPU type id the provider expects in `gpuTypeIds`.
    #[must_use]
    pub const fn provider_id(self) -> &'static str {
        match self {
            Self::Rtx4090 => "NVIDIA RTX 4090",
            Self::RtxA6000 => "NVIDIA RTX A6000",
        }
    }
}

/// Network-volume family a pod is attached to.
///
/// Each volume carries the models for one workflow family; the warm-up
/// prompt of a pod runs that family's workflow. The numeric index selects
/// the `VOLUME_ID{n}` configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeType {
    /// Volume with the Ghibli-style image models.
    Ghibli,
    /// Volume with the Snoopy-style image models.
    Snoopy,
    /// Volume with the video generation models.
    MagicVideo,
}

impl VolumeType {
    /// Every volume type, in `VOLUME_ID{n}` index order.
    pub const ALL: [Self; 3] = [Self::Ghibli, Self::Snoopy, Self::MagicVideo];

    /// Index used in the `VOLUME_ID{n}` configuration key.
    #[must_use]
    pub const fn index(self) -> u8 {
        match self {
            Self::Ghibli => 1,
            Self::Snoopy => 2,
            Self::MagicVideo => 3,
        }
    }

    /// Configuration key holding this volume's network-volume id.
    #[must_use]
    pub fn env_key(self) -> String {
        format!("VOLUME_ID{}", self.index())
    }

    /// The workflow executed as this volume's warm-up prompt.
    #[must_use]
    pub const fn workflow(self) -> WorkflowType {
        match self {
            Self::Ghibli => WorkflowType::Ghibli,
            Self::Snoopy => WorkflowType::Snoopy,
            Self::MagicVideo => WorkflowType::MagicVideo,
        }
    }

    /// Lowercase tag used in pod names.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Ghibli => "ghibli",
            Self::Snoopy => "snoopy",
            Self::MagicVideo => "magicvideo",
        }
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Lifecycle state of a pod (see the state machine in `pod.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodState {
    /// Waiting for the provider to create the instance and expose its network.
    Initializing,
    /// Instance is up; the inference server is being installed and probed.
    Starting,
    /// Ready for a prompt.
    Free,
    /// A prompt (or the warm-up) is running on the instance.
    Processing,
    /// The bound prompt finished; the scheduler has not consumed it yet.
    Completed,
    /// Marked for teardown; removed from the fleet on the next tick.
    Terminated,
}

/// Terminal state of one prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputState {
    /// The workflow produced an artifact.
    Completed,
    /// The workflow failed; the result carries a reason.
    Failed,
}

/// Run state of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodManagerState {
    /// Background loops are running and prompts are accepted.
    Running,
    /// Loops cancelled, fleet destroyed, queues cleared.
    Stopped,
}

/// Network identity of a provisioned instance.
///
/// Built from the provider's pod record once `publicIp` and `portMappings`
/// are populated; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Public IP (or host) of the instance.
    pub public_ip: String,
    /// Internal port -> externally reachable port.
    pub port_mappings: HashMap<u16, u16>,
}

impl PodInfo {
    /// External port of the inference HTTP/websocket server (internal 8188).
    #[must_use]
    pub fn comfy_port(&self) -> u16 {
        self.port_mappings.get(&8188).copied().unwrap_or(8188)
    }

    /// External SSH port (internal 22).
    #[must_use]
    pub fn ssh_port(&self) -> u16 {
        self.port_mappings.get(&22).copied().unwrap_or(22)
    }

    /// Base HTTP URL of the inference server.
    #[must_use]
    pub fn comfy_http_url(&self) -> String {
        format!("http://{}:{}", self.public_ip, self.comfy_port())
    }

    /// Base websocket URL of the inference server.
    #[must_use]
    pub fn comfy_ws_url(&self) -> String {
        format!("ws://{}:{}", self.public_ip, self.comfy_port())
    }
}

/// Payload of a finished prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutput {
    /// Artifact bytes (JPEG image or raw gif container).
    Data(Vec<u8>),
    /// Human-readable failure reason.
    Reason(String),
}

/// Outcome of one prompt, set exactly once by the pod worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptResult {
    /// Id of the prompt this result belongs to.
    pub prompt_id: String,
    /// Whether the prompt completed or failed.
    pub output_state: OutputState,
    /// Artifact bytes or failure reason.
    pub output: PromptOutput,
}

impl PromptResult {
    /// A successful result carrying the produced artifact.
    #[must_use]
    pub fn completed(prompt_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            output_state: OutputState::Completed,
            output: PromptOutput::Data(data),
        }
    }

    /// A failed result carrying a reason.
    #[must_use]
    pub fn failed(prompt_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            output_state: OutputState::Failed,
            output: PromptOutput::Reason(reason.into()),
        }
    }

    /// True if the prompt completed with an artifact.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.output_state, OutputState::Completed)
    }
}

/// One generation request travelling through the scheduler.
#[derive(Debug)]
pub struct Prompt {
    /// Unique id assigned at enqueue time.
    pub prompt_id: String,
    /// Workflow template this prompt runs.
    pub workflow_type: WorkflowType,
    /// Opaque input URL patched into the workflow.
    pub input_url: String,
    result: Mutex<Option<PromptResult>>,
}

impl Prompt {
    /// Create a prompt with a fresh uuid.
    #[must_use]
    pub fn new(workflow_type: WorkflowType, input_url: impl Into<String>) -> Self {
        Self {
            prompt_id: Uuid::new_v4().to_string(),
            workflow_type,
            input_url: input_url.into(),
            result: Mutex::new(None),
        }
    }

    /// The warm-up prompt for a freshly started pod.
    #[must_use]
    pub fn warm_up(volume_type: VolumeType, origin_image_url: impl Into<String>) -> Self {
        Self::new(volume_type.workflow(), origin_image_url)
    }

    /// Store the result. The first write wins; later writes are discarded
    /// (at-most-one outcome per prompt).
    pub fn set_result(&self, result: PromptResult) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
    }

    /// Remove and return the result, if set.
    #[must_use]
    pub fn take_result(&self) -> Option<PromptResult> {
        self.result.lock().take()
    }

    /// Terminal state of the result, if set.
    #[must_use]
    pub fn result_state(&self) -> Option<OutputState> {
        self.result.lock().as_ref().map(|r| r.output_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_env_keys_follow_index_order() {
        assert_eq!(VolumeType::Ghibli.env_key(), "VOLUME_ID1");
        assert_eq!(VolumeType::Snoopy.env_key(), "VOLUME_ID2");
        assert_eq!(VolumeType::MagicVideo.env_key(), "VOLUME_ID3");
    }

    #[test]
    fn pod_info_falls_back_to_internal_ports() {
        let info = PodInfo {
            public_ip: "10.0.0.1".to_string(),
            port_mappings: HashMap::new(),
        };
        assert_eq!(info.comfy_port(), 8188);
        assert_eq!(info.ssh_port(), 22);

        let mapped = PodInfo {
            public_ip: "10.0.0.1".to_string(),
            port_mappings: HashMap::from([(8188, 40_001), (22, 40_002)]),
        };
        assert_eq!(mapped.comfy_http_url(), "http://10.0.0.1:40001");
        assert_eq!(mapped.comfy_ws_url(), "ws://10.0.0.1:40001");
        assert_eq!(mapped.ssh_port(), 40_002);
    }

    #[test]
    fn prompt_result_is_write_once() {
        let prompt = Prompt::new(WorkflowType::Ghibli, "u1");
        prompt.set_result(PromptResult::failed(&prompt.prompt_id, "first"));
        prompt.set_result(PromptResult::completed(&prompt.prompt_id, vec![1, 2, 3]));

        let result = prompt.take_result().expect("result was set");
        assert_eq!(result.output_state, OutputState::Failed);
        assert_eq!(result.output, PromptOutput::Reason("first".to_string()));
        assert!(prompt.take_result().is_none());
    }

    #[test]
    fn distinct_prompts_get_distinct_ids() {
        let a = Prompt::new(WorkflowType::Ghibli, "u1");
        let b = Prompt::new(WorkflowType::Ghibli, "u1");
        assert_ne!(a.prompt_id, b.prompt_id);
    }
}
