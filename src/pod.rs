//! One rented GPU instance and its lifecycle.
//!
//! Unique responsibility: drive a single pod from creation through
//! warm-up into prompt processing, and tear it down again.
//!
//! State machine:
//!
//! ```text
//! Initializing -> Starting -> Processing (warm-up) -> Free
//!       \            \             \                    |  assigned prompt
//!        \            \             \ warm-up error     v
//!         +------------+-------------+-----------> Processing
//!                      |                                |
//!                  Terminated <---- deadline            v
//!                      ^                            Completed -> Free
//!                      +--- destroy / scheduler consumption ---+
//! ```
//!
//! The constructor spawns an async initialization task (create the pod,
//! wait for its network identity, install and start the inference server
//! over SSH, run the warm-up prompt). Deadlines are *not* checked here;
//! the scheduler ticks `count` and terminates stuck pods.
//!
//! Mutable pod fields sit behind one small mutex; nothing holds it across
//! an await point.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::comfy_client::{ComfyClient, ComfyError};
use crate::config::DispatcherConfig;
use crate::runpod_client::{CreatePodSpec, RunpodClient, RunpodError};
use crate::ssh_exec::{CommandRunner, SshError};
use crate::types::{GpuType, PodInfo, PodState, Prompt, PromptResult, VolumeType};
use crate::workflows::WorkflowStore;

/// One pod: immutable configuration plus lock-guarded lifecycle fields.
pub struct Pod {
    cfg: Arc<DispatcherConfig>,
    provider: Arc<RunpodClient>,
    runner: Arc<dyn CommandRunner>,
    store: Arc<WorkflowStore>,
    gpu_type: GpuType,
    volume_type: VolumeType,
    volume_id: String,
    name: String,
    cancel: CancellationToken,
    inner: Mutex<PodInner>,
    init_task: Mutex<Option<JoinHandle<()>>>,
}

struct PodInner {
    state: PodState,
    init: bool,
    pod_id: String,
    pod_info: Option<PodInfo>,
    current_prompt: Option<Arc<Prompt>>,
    count: u64,
}

impl Pod {
    /// Create a pod and spawn its initialization task.
    #[must_use]
    pub fn spawn(
        cfg: Arc<DispatcherConfig>,
        provider: Arc<RunpodClient>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<WorkflowStore>,
        gpu_type: GpuType,
        volume_type: VolumeType,
        volume_id: String,
    ) -> Arc<Self> {
        let name = format!("pod-{}-{}", volume_type.tag(), Uuid::new_v4());
        let pod = Arc::new(Self {
            cfg,
            provider,
            runner,
            store,
            gpu_type,
            volume_type,
            volume_id,
            name,
            cancel: CancellationToken::new(),
            inner: Mutex::new(PodInner {
                state: PodState::Initializing,
                init: true,
                pod_id: String::new(),
                pod_info: None,
                current_prompt: None,
                count: 0,
            }),
            init_task: Mutex::new(None),
        });

        let task = tokio::spawn({
            let pod = Arc::clone(&pod);
            async move { pod.initialize().await }
        });
        *pod.init_task.lock() = Some(task);

        pod
    }

    /// Process one user prompt to completion.
    ///
    /// Accepted when the pod is Free (the scheduler guarantees this for
    /// user prompts); the warm-up prompt runs through the same inference
    /// path inside the initialization task. Writes the prompt's result
    /// and transitions to Completed; never returns an error to the
    /// dispatching worker.
    pub async fn queue_prompt(&self, prompt: Arc<Prompt>) {
        {
            let mut inner = self.inner.lock();
            inner.current_prompt = Some(Arc::clone(&prompt));
            inner.state = PodState::Processing;
        }

        let result = match self.run_inference(&prompt, false).await {
            Ok(data) => PromptResult::completed(&prompt.prompt_id, data),
            Err(e) => {
                warn!(pod = %self.name, prompt_id = %prompt.prompt_id, error = %e, "prompt failed");
                PromptResult::failed(&prompt.prompt_id, e.to_string())
            }
        };
        prompt.set_result(result);

        let mut inner = self.inner.lock();
        inner.count = 0;
        inner.state = PodState::Completed;
    }

    /// Best-effort teardown: cancel in-flight work, abort the
    /// initialization task, delete the remote instance.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        if let Some(task) = self.init_task.lock().take() {
            task.abort();
        }

        let pod_id = self.inner.lock().pod_id.clone();
        if pod_id.is_empty() {
            return;
        }
        if let Err(e) = self.provider.delete_pod(&pod_id).await {
            warn!(%pod_id, error = %e, "pod delete failed");
        } else {
            info!(%pod_id, pod = %self.name, "pod destroyed");
        }
    }

    // ------------------------------------------------------------------
    // Fields observed and driven by the scheduler
    // ------------------------------------------------------------------

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PodState {
        self.inner.lock().state
    }

    /// Transition to `state`, resetting the tick counter.
    pub fn set_state(&self, state: PodState) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.count = 0;
    }

    /// True until the warm-up prompt has completed.
    #[must_use]
    pub fn init(&self) -> bool {
        self.inner.lock().init
    }

    /// Ticks since the last state transition.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.inner.lock().count
    }

    /// Increment the tick counter.
    pub fn bump_count(&self) {
        self.inner.lock().count += 1;
    }

    /// The prompt currently bound to this pod, if any.
    #[must_use]
    pub fn current_prompt(&self) -> Option<Arc<Prompt>> {
        self.inner.lock().current_prompt.clone()
    }

    /// Unbind and return the current prompt.
    #[must_use]
    pub fn take_current_prompt(&self) -> Option<Arc<Prompt>> {
        self.inner.lock().current_prompt.take()
    }

    /// Bind `prompt` and enter Processing; called by the scheduler under
    /// its own mutex right before dispatching the worker.
    pub fn begin_prompt(&self, prompt: &Arc<Prompt>) {
        let mut inner = self.inner.lock();
        inner.current_prompt = Some(Arc::clone(prompt));
        inner.state = PodState::Processing;
        inner.count = 0;
    }

    /// Provider-assigned pod id (empty until creation succeeded).
    #[must_use]
    pub fn pod_id(&self) -> String {
        self.inner.lock().pod_id.clone()
    }

    /// Pod name sent to the provider.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    async fn initialize(self: Arc<Self>) {
        match self.run_init().await {
            Ok(()) => info!(pod = %self.name, "pod warmed up and free"),
            Err(e) if e.is_cancellation() => {
                debug!(pod = %self.name, "pod initialization cancelled");
            }
            Err(e) => {
                warn!(pod = %self.name, error = %e, "pod initialization failed");
                self.set_state(PodState::Terminated);
            }
        }
    }

    async fn run_init(&self) -> Result<(), PodError> {
        let create_spec = self.create_spec();
        let pod_id = tokio::select! {
            () = self.cancel.cancelled() => return Err(PodError::Cancelled),
            res = self.provider.create_pod(&create_spec) => res?,
        };
        self.inner.lock().pod_id = pod_id.clone();

        let info = self
            .provider
            .wait_for_pod_info(
                &pod_id,
                self.cfg.pod_info_retries,
                self.cfg.pod_info_delay(),
                &self.cancel,
            )
            .await?;
        {
            let mut inner = self.inner.lock();
            inner.pod_info = Some(info.clone());
            inner.state = PodState::Starting;
            inner.count = 0;
        }

        self.setup_server(&info).await?;
        self.set_state(PodState::Processing);

        self.warm_up().await
    }

    /// Install dependencies and start the inference server detached in a
    /// screen session, then probe its HTTP port until it answers.
    async fn setup_server(&self, info: &PodInfo) -> Result<(), PodError> {
        let ssh_port = info.ssh_port();
        for cmd in setup_commands(&self.cfg.output_directory) {
            let output = tokio::select! {
                () = self.cancel.cancelled() => return Err(PodError::Cancelled),
                res = self.runner.run(&cmd, &info.public_ip, ssh_port) => res?,
            };
            if !output.success() {
                return Err(PodError::StartupFailed {
                    exit_code: output.exit_code,
                    stderr: output.stderr,
                });
            }
        }

        let http = reqwest::Client::builder()
            .timeout(self.cfg.http_timeout())
            .build()
            .map_err(PodError::Http)?;
        let url = info.comfy_http_url();
        for _ in 0..self.cfg.server_check_retries {
            match http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(_) | Err(_) => {}
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Err(PodError::Cancelled),
                () = tokio::time::sleep(self.cfg.server_check_delay()) => {}
            }
        }
        Err(PodError::ServerNotReady(self.cfg.server_check_retries))
    }

    /// Run the warm-up prompt with the extended cold budget. Success
    /// clears the `init` flag and frees the pod; any failure terminates
    /// initialization (the caller marks the pod Terminated).
    async fn warm_up(&self) -> Result<(), PodError> {
        let prompt = Prompt::warm_up(self.volume_type, self.cfg.origin_image_url.clone());
        let _artifact = self.run_inference(&prompt, true).await?;

        let mut inner = self.inner.lock();
        inner.init = false;
        inner.state = PodState::Free;
        inner.count = 0;
        Ok(())
    }

    async fn run_inference(&self, prompt: &Prompt, is_warmup: bool) -> Result<Vec<u8>, PodError> {
        let info = self
            .inner
            .lock()
            .pod_info
            .clone()
            .ok_or(PodError::NotProvisioned)?;
        let client = ComfyClient::new(
            info.comfy_http_url(),
            info.comfy_ws_url(),
            &self.store,
            &self.cfg,
        )?;
        Ok(client.prompt(prompt, is_warmup, &self.cancel).await?)
    }

    fn create_spec(&self) -> CreatePodSpec {
        CreatePodSpec {
            name: self.name.clone(),
            network_volume_id: self.volume_id.clone(),
            gpu_type_ids: vec![self.gpu_type.provider_id().to_string()],
            gpu_count: 1,
            image_name: self.cfg.pod_image_name.clone(),
            ports: self.cfg.pod_ports.clone(),
            env: HashMap::new(),
        }
    }

    /// A pod with no initialization task, for scheduler tests.
    #[cfg(test)]
    pub(crate) fn stub(
        cfg: Arc<DispatcherConfig>,
        provider: Arc<RunpodClient>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<WorkflowStore>,
        volume_type: VolumeType,
        state: PodState,
        init: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            provider,
            runner,
            store,
            gpu_type: GpuType::RtxA6000,
            volume_type,
            volume_id: "vol-test".to_string(),
            name: format!("pod-{}-stub", volume_type.tag()),
            cancel: CancellationToken::new(),
            inner: Mutex::new(PodInner {
                state,
                init,
                pod_id: String::new(),
                pod_info: None,
                current_prompt: None,
                count: 0,
            }),
            init_task: Mutex::new(None),
        })
    }
}

/// Setup command sequence run over SSH after the instance is reachable.
fn setup_commands(output_directory: &str) -> Vec<String> {
    vec![
        "apt update -qq".to_string(),
        "apt install -y screen".to_string(),
        format!("mkdir -p {output_directory}"),
        format!("chmod 666 {output_directory}"),
        format!(
            "cd /workspace/ComfyUI && \
             screen -dmS comfyui /workspace/ComfyUI/venv/bin/python3 \
             /workspace/ComfyUI/main.py --listen --disable-metadata \
             --output-directory {output_directory}"
        ),
    ]
}

// ============================================================================
// Error type
// ============================================================================

/// Error type for pod lifecycle operations.
#[derive(Debug, Error)]
pub enum PodError {
    /// Provider REST failure.
    #[error("provider error: {0}")]
    Provider(#[from] RunpodError),
    /// SSH failure during server setup.
    #[error("ssh error: {0}")]
    Ssh(#[from] SshError),
    /// A setup command exited non-zero.
    #[error("setup command failed with status {exit_code}: {stderr}")]
    StartupFailed {
        /// Exit status of the failing command.
        exit_code: i32,
        /// Its captured stderr.
        stderr: String,
    },
    /// The inference server never answered its HTTP probe.
    #[error("inference server not ready after {0} probes")]
    ServerNotReady(u64),
    /// Inference exchange failure.
    #[error(transparent)]
    Comfy(#[from] ComfyError),
    /// HTTP client could not be built.
    #[error("http error: {0}")]
    Http(reqwest::Error),
    /// The instance info is not available yet.
    #[error("pod has no provisioned instance info")]
    NotProvisioned,
    /// The operation was cancelled by teardown.
    #[error("operation cancelled")]
    Cancelled,
}

impl PodError {
    /// True when the failure is a cooperative-cancellation signal rather
    /// than a real fault.
    fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Provider(RunpodError::Cancelled)
                | Self::Comfy(ComfyError::Cancelled)
        )
    }
}
