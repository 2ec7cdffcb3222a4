//! The scheduler: fleet sizing, prompt matching, deadline enforcement.
//!
//! Unique responsibility: own the prompt queue and the pod fleet, and run
//! the two background loops that keep both moving:
//!
//! - the **manage loop** (every `MANAGE_DELAY` ms) samples the load,
//!   feeds the demand predictor and provisions missing pods;
//! - the **process loop** (every `SERVER_CHECK_DELAY` ms, one "tick")
//!   advances pod states, assigns queued prompts to free pods, enforces
//!   per-state deadlines and removes terminated pods.
//!
//! Every mutation of the queue, the prompt maps, the fleet and the pod
//! fields the scheduler observes goes through one mutex. Worker tasks
//! take it only to publish results; the long inference exchange runs
//! outside it. Scale-down is lazy: the manage loop never tears a pod
//! down, pods leave the fleet only through deadline rules or the
//! free-and-oversize rule.
//!
//! Neither loop can die while the manager is Running: every fallible
//! step is handled in place and logged.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, DispatcherConfig};
use crate::pod::Pod;
use crate::runpod_client::RunpodClient;
use crate::ssh_exec::CommandRunner;
use crate::types::{
    GpuType, OutputState, PodManagerState, PodState, Prompt, PromptResult, VolumeType,
};
use crate::workflows::{WorkflowStore, WorkflowType};

/// Failure reason used for every deadline-driven prompt failure.
const TIMEOUT_REASON: &str = "Time out error";

/// Autoscaling scheduler for one volume family.
pub struct PodManager {
    cfg: Arc<DispatcherConfig>,
    provider: Arc<RunpodClient>,
    runner: Arc<dyn CommandRunner>,
    store: Arc<WorkflowStore>,
    gpu_type: GpuType,
    volume_type: VolumeType,
    volume_id: String,
    shared: Mutex<Shared>,
}

struct Shared {
    state: PodManagerState,
    pods: Vec<Arc<Pod>>,
    queued: VecDeque<Arc<Prompt>>,
    processing: HashMap<String, Arc<Prompt>>,
    completed: HashMap<String, Arc<Prompt>>,
    failed: HashMap<String, Arc<Prompt>>,
    history: VecDeque<usize>,
    num_pods: usize,
    cancel: CancellationToken,
}

/// Observable counters of the scheduler, for the HTTP front-end.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    /// Run state of the scheduler.
    pub state: PodManagerState,
    /// Pods currently in the fleet.
    pub total_pods: usize,
    /// Last target fleet size computed by the predictor.
    pub ideal_pods: usize,
    /// Pods waiting on the provider.
    pub initializing_pods: usize,
    /// Pods installing/probing the inference server.
    pub starting_pods: usize,
    /// Pods ready for a prompt.
    pub free_pods: usize,
    /// Pods running a prompt or warming up.
    pub processing_pods: usize,
    /// Pods with an unconsumed result.
    pub completed_pods: usize,
    /// Pods marked for teardown this tick.
    pub terminated_pods: usize,
    /// Prompts waiting for a pod.
    pub queued_prompts: usize,
    /// Prompts currently running.
    pub processing_prompts: usize,
    /// Prompts finished successfully, not yet collected.
    pub completed_prompts: usize,
    /// Prompts finished unsuccessfully, not yet collected.
    pub failed_prompts: usize,
}

impl PodManager {
    /// Create a manager and start its background loops.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if no volume id is configured for `volume_type`.
    pub fn new(
        cfg: Arc<DispatcherConfig>,
        provider: Arc<RunpodClient>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<WorkflowStore>,
        gpu_type: GpuType,
        volume_type: VolumeType,
    ) -> Result<Arc<Self>, ConfigError> {
        let manager = Self::build(cfg, provider, runner, store, gpu_type, volume_type)?;
        let cancel = manager.shared.lock().cancel.clone();
        manager.spawn_loops(cancel);
        Ok(manager)
    }

    /// Create the manager without starting the loops.
    fn build(
        cfg: Arc<DispatcherConfig>,
        provider: Arc<RunpodClient>,
        runner: Arc<dyn CommandRunner>,
        store: Arc<WorkflowStore>,
        gpu_type: GpuType,
        volume_type: VolumeType,
    ) -> Result<Arc<Self>, ConfigError> {
        let volume_id = cfg.volume_id(volume_type)?.to_string();
        let history_window = cfg.history_window;

        Ok(Arc::new(Self {
            cfg,
            provider,
            runner,
            store,
            gpu_type,
            volume_type,
            volume_id,
            shared: Mutex::new(Shared {
                state: PodManagerState::Running,
                pods: Vec::new(),
                queued: VecDeque::new(),
                processing: HashMap::new(),
                completed: HashMap::new(),
                failed: HashMap::new(),
                history: VecDeque::with_capacity(history_window),
                num_pods: 0,
                cancel: CancellationToken::new(),
            }),
        }))
    }

    // ------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------

    /// Queue a prompt and block until its result is available.
    ///
    /// Returns a synthesized `Failed("Time out error")` if no result
    /// arrives within `SERVER_CHECK_RETRIES` ticks, and
    /// `Failed("backpressure")` when the queue is full.
    pub async fn queue_prompt(
        &self,
        workflow_type: WorkflowType,
        input_url: impl Into<String>,
    ) -> PromptResult {
        let prompt = Arc::new(Prompt::new(workflow_type, input_url));
        let prompt_id = prompt.prompt_id.clone();

        {
            let mut shared = self.shared.lock();
            if shared.state != PodManagerState::Running {
                return PromptResult::failed(prompt_id, "dispatcher stopped");
            }
            if shared.queued.len() >= self.cfg.queue_capacity {
                return PromptResult::failed(prompt_id, "backpressure");
            }
            shared.queued.push_back(Arc::clone(&prompt));
        }
        debug!(%prompt_id, ?workflow_type, "prompt queued");

        for _ in 0..self.cfg.server_check_retries {
            if let Some(result) = self.try_take_result(&prompt_id) {
                return result;
            }
            tokio::time::sleep(self.cfg.server_check_delay()).await;
        }

        // caller-side timeout: drop every trace of the prompt
        {
            let mut shared = self.shared.lock();
            shared.queued.retain(|p| p.prompt_id != prompt_id);
            shared.processing.remove(&prompt_id);
            shared.completed.remove(&prompt_id);
            shared.failed.remove(&prompt_id);
        }
        warn!(%prompt_id, "no result within the caller budget");
        PromptResult::failed(prompt_id, TIMEOUT_REASON)
    }

    /// Snapshot of pod and prompt counters.
    #[must_use]
    pub fn get_state(&self) -> ManagerSnapshot {
        let shared = self.shared.lock();
        let mut snapshot = ManagerSnapshot {
            state: shared.state,
            total_pods: shared.pods.len(),
            ideal_pods: shared.num_pods,
            initializing_pods: 0,
            starting_pods: 0,
            free_pods: 0,
            processing_pods: 0,
            completed_pods: 0,
            terminated_pods: 0,
            queued_prompts: shared.queued.len(),
            processing_prompts: shared.processing.len(),
            completed_prompts: shared.completed.len(),
            failed_prompts: shared.failed.len(),
        };
        for pod in &shared.pods {
            match pod.state() {
                PodState::Initializing => snapshot.initializing_pods += 1,
                PodState::Starting => snapshot.starting_pods += 1,
                PodState::Free => snapshot.free_pods += 1,
                PodState::Processing => snapshot.processing_pods += 1,
                PodState::Completed => snapshot.completed_pods += 1,
                PodState::Terminated => snapshot.terminated_pods += 1,
            }
        }
        snapshot
    }

    /// Stop the loops, destroy the fleet and clear all prompt tracking.
    pub async fn stop(&self) {
        let pods = {
            let mut shared = self.shared.lock();
            if shared.state != PodManagerState::Running {
                return;
            }
            shared.state = PodManagerState::Stopped;
            shared.cancel.cancel();
            shared.queued.clear();
            shared.processing.clear();
            shared.completed.clear();
            shared.failed.clear();
            shared.history.clear();
            shared.num_pods = 0;
            std::mem::take(&mut shared.pods)
        };

        info!(pods = pods.len(), "stopping dispatcher");
        for pod in pods {
            pod.destroy().await;
        }
    }

    /// Re-arm the background loops after `stop()`.
    pub fn restart(self: &Arc<Self>) {
        let cancel = {
            let mut shared = self.shared.lock();
            if shared.state != PodManagerState::Stopped {
                return;
            }
            shared.state = PodManagerState::Running;
            shared.cancel = CancellationToken::new();
            shared.cancel.clone()
        };
        info!("restarting dispatcher");
        self.spawn_loops(cancel);
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    fn spawn_loops(self: &Arc<Self>, cancel: CancellationToken) {
        let manager = Arc::clone(self);
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(manager.cfg.manage_delay()) => {}
                }
                if manager.run_state() != PodManagerState::Running {
                    break;
                }
                manager.manage_tick();
            }
            debug!("manage loop exited");
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(manager.cfg.server_check_delay()) => {}
                }
                if manager.run_state() != PodManagerState::Running {
                    break;
                }
                for pod in manager.tick() {
                    tokio::spawn(async move { pod.destroy().await });
                }
            }
            debug!("process loop exited");
        });
    }

    /// One manage-loop pass: sample load, predict, provision the deficit.
    fn manage_tick(&self) {
        let mut shared = self.shared.lock();
        if shared.state != PodManagerState::Running {
            return;
        }

        let load = shared.queued.len() + shared.processing.len();
        if shared.history.len() >= self.cfg.history_window {
            shared.history.pop_front();
        }
        shared.history.push_back(load);

        let target = predict_target(
            &shared.history,
            self.cfg.scaling_sensitivity,
            self.cfg.min_pods,
            self.cfg.max_pods,
        );
        shared.num_pods = target;

        let current = shared.pods.len();
        if target > current {
            info!(current, target, "scaling fleet up");
            for _ in current..target {
                let pod = self.spawn_pod();
                shared.pods.push(pod);
            }
        }
    }

    /// One process-loop pass. Returns the pods removed this tick so the
    /// caller can destroy them outside the scheduler mutex.
    fn tick(&self) -> Vec<Arc<Pod>> {
        let mut shared = self.shared.lock();
        if shared.state != PodManagerState::Running {
            return Vec::new();
        }

        let target = shared.num_pods.max(self.cfg.min_pods);
        let mut excess = shared.pods.len().saturating_sub(target);
        let pods: Vec<Arc<Pod>> = shared.pods.clone();

        for pod in &pods {
            pod.bump_count();

            if pod.state() == PodState::Completed {
                consume_completed(pod, &mut shared);
            }

            if pod.state() == PodState::Free && !shared.queued.is_empty() {
                assign_next(pod, &mut shared);
            }

            if deadline_exceeded(pod.state(), pod.init(), pod.count(), &self.cfg) {
                debug!(pod = %pod.name(), state = ?pod.state(), count = pod.count(), "deadline exceeded");
                fail_bound_prompt(pod, &mut shared);
                pod.set_state(PodState::Terminated);
            } else if excess > 0
                && pod.state() == PodState::Free
                && pod.count() > self.cfg.free_max_remains
            {
                debug!(pod = %pod.name(), "fleet oversize, releasing idle pod");
                pod.set_state(PodState::Terminated);
                excess -= 1;
            }
        }

        let mut removed = Vec::new();
        shared.pods.retain(|pod| {
            if pod.state() == PodState::Terminated {
                removed.push(Arc::clone(pod));
                false
            } else {
                true
            }
        });
        removed
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn run_state(&self) -> PodManagerState {
        self.shared.lock().state
    }

    fn try_take_result(&self, prompt_id: &str) -> Option<PromptResult> {
        let mut shared = self.shared.lock();
        let prompt = shared
            .completed
            .remove(prompt_id)
            .or_else(|| shared.failed.remove(prompt_id))?;
        Some(
            prompt
                .take_result()
                .unwrap_or_else(|| PromptResult::failed(prompt_id, "result missing")),
        )
    }

    fn spawn_pod(&self) -> Arc<Pod> {
        Pod::spawn(
            Arc::clone(&self.cfg),
            Arc::clone(&self.provider),
            Arc::clone(&self.runner),
            Arc::clone(&self.store),
            self.gpu_type,
            self.volume_type,
            self.volume_id.clone(),
        )
    }
}

/// Move a completed pod's prompt into the matching result map and free
/// the pod.
fn consume_completed(pod: &Arc<Pod>, shared: &mut Shared) {
    let Some(prompt) = pod.take_current_prompt() else {
        warn!(pod = %pod.name(), "completed pod had no bound prompt");
        pod.set_state(PodState::Free);
        return;
    };

    shared.processing.remove(&prompt.prompt_id);
    let prompt_id = prompt.prompt_id.clone();
    match prompt.result_state() {
        Some(OutputState::Completed) => {
            shared.completed.insert(prompt_id, prompt);
        }
        Some(OutputState::Failed) => {
            shared.failed.insert(prompt_id, prompt);
        }
        None => {
            warn!(%prompt_id, "completed pod carried a prompt without result");
            prompt.set_result(PromptResult::failed(&prompt_id, "result missing"));
            shared.failed.insert(prompt_id, prompt);
        }
    }
    pod.set_state(PodState::Free);
}

/// Pop the next queued prompt, bind it to `pod` and dispatch a worker.
fn assign_next(pod: &Arc<Pod>, shared: &mut Shared) {
    let Some(prompt) = shared.queued.pop_front() else {
        return;
    };
    shared
        .processing
        .insert(prompt.prompt_id.clone(), Arc::clone(&prompt));
    pod.begin_prompt(&prompt);
    debug!(pod = %pod.name(), prompt_id = %prompt.prompt_id, "prompt assigned");

    let worker = Arc::clone(pod);
    tokio::spawn(async move { worker.queue_prompt(prompt).await });
}

/// Fail the prompt bound to a pod that hit its Processing deadline.
/// The worker's eventual result is discarded (first write wins).
fn fail_bound_prompt(pod: &Arc<Pod>, shared: &mut Shared) {
    if pod.state() != PodState::Processing || pod.init() {
        return;
    }
    let Some(prompt) = pod.take_current_prompt() else {
        return;
    };
    shared.processing.remove(&prompt.prompt_id);
    prompt.set_result(PromptResult::failed(&prompt.prompt_id, TIMEOUT_REASON));
    shared.failed.insert(prompt.prompt_id.clone(), prompt);
}

/// Per-state deadline rules, in ticks since the last transition.
fn deadline_exceeded(state: PodState, init: bool, count: u64, cfg: &DispatcherConfig) -> bool {
    match state {
        PodState::Initializing => count > cfg.timeout_retries,
        PodState::Starting => count > cfg.server_check_retries,
        PodState::Processing => {
            if init {
                count > cfg.cold_timeout_retries
            } else {
                count > cfg.timeout_retries
            }
        }
        PodState::Completed => count > cfg.free_max_remains,
        PodState::Free | PodState::Terminated => false,
    }
}

/// Demand predictor: weighted blend of average and peak load over the
/// history window, clamped to the fleet bounds.
fn predict_target(
    history: &VecDeque<usize>,
    sensitivity: u8,
    min_pods: usize,
    max_pods: usize,
) -> usize {
    if history.is_empty() {
        return min_pods;
    }

    let sum: usize = history.iter().sum();
    let avg = sum as f64 / history.len() as f64;
    let peak = history.iter().copied().max().unwrap_or(0) as f64;
    let s = f64::from(sensitivity) / 100.0;

    let target = (avg * (1.0 - s) + peak * s).round() as usize;
    target.clamp(min_pods, max_pods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::ssh_exec::{CommandOutput, SshError};
    use crate::types::PromptOutput;
    use async_trait::async_trait;

    struct OkRunner;

    #[async_trait]
    impl CommandRunner for OkRunner {
        async fn run(&self, _: &str, _: &str, _: u16) -> Result<CommandOutput, SshError> {
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
            })
        }
    }

    fn detached_manager(cfg: DispatcherConfig) -> Arc<PodManager> {
        let cfg = Arc::new(cfg);
        let provider = Arc::new(RunpodClient::new(&cfg).expect("client"));
        let store = Arc::new(WorkflowStore::new(cfg.workflows_dir.clone()));
        PodManager::build(
            cfg,
            provider,
            Arc::new(OkRunner),
            store,
            GpuType::RtxA6000,
            VolumeType::Ghibli,
        )
        .expect("volume configured")
    }

    fn stub_pod(manager: &PodManager, state: PodState, init: bool) -> Arc<Pod> {
        let pod = Pod::stub(
            Arc::clone(&manager.cfg),
            Arc::clone(&manager.provider),
            Arc::clone(&manager.runner),
            Arc::clone(&manager.store),
            manager.volume_type,
            state,
            init,
        );
        manager.shared.lock().pods.push(Arc::clone(&pod));
        pod
    }

    fn history(samples: &[usize]) -> VecDeque<usize> {
        samples.iter().copied().collect()
    }

    #[test]
    fn predictor_blends_average_and_peak() {
        // a burst of 20 prompts in a single sample, sensitivity 50
        assert_eq!(predict_target(&history(&[20]), 50, 1, 30), 20);
        // avg 2, peak 20: 2*0.5 + 20*0.5 = 11
        assert_eq!(predict_target(&history(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 20]), 50, 1, 30), 11);
        // sensitivity 0 follows the average, 100 follows the peak
        assert_eq!(predict_target(&history(&[4, 4, 4, 16]), 0, 1, 30), 7);
        assert_eq!(predict_target(&history(&[4, 4, 4, 16]), 100, 1, 30), 16);
    }

    #[test]
    fn predictor_clamps_to_fleet_bounds() {
        assert_eq!(predict_target(&history(&[0]), 50, 2, 10), 2);
        assert_eq!(predict_target(&history(&[500]), 50, 1, 10), 10);
        assert_eq!(predict_target(&history(&[]), 50, 3, 10), 3);
    }

    #[test]
    fn deadline_table_matches_the_state_machine() {
        let cfg = test_config();
        // timeout_retries 50, server_check_retries 100,
        // cold_timeout_retries 100, free_max_remains 20
        assert!(!deadline_exceeded(PodState::Initializing, true, 50, &cfg));
        assert!(deadline_exceeded(PodState::Initializing, true, 51, &cfg));
        assert!(deadline_exceeded(PodState::Starting, true, 101, &cfg));
        assert!(!deadline_exceeded(PodState::Processing, true, 51, &cfg));
        assert!(deadline_exceeded(PodState::Processing, true, 101, &cfg));
        assert!(deadline_exceeded(PodState::Processing, false, 51, &cfg));
        assert!(deadline_exceeded(PodState::Completed, false, 21, &cfg));
        assert!(!deadline_exceeded(PodState::Free, false, 10_000, &cfg));
    }

    #[tokio::test]
    async fn tick_consumes_completed_pods() {
        let manager = detached_manager(test_config());
        let pod = stub_pod(&manager, PodState::Free, false);

        let prompt = Arc::new(Prompt::new(WorkflowType::Ghibli, "u1"));
        prompt.set_result(PromptResult::completed(&prompt.prompt_id, vec![0xFF]));
        {
            let mut shared = manager.shared.lock();
            shared
                .processing
                .insert(prompt.prompt_id.clone(), Arc::clone(&prompt));
        }
        pod.begin_prompt(&prompt);
        pod.set_state(PodState::Completed);

        let removed = manager.tick();
        assert!(removed.is_empty());
        assert_eq!(pod.state(), PodState::Free);

        let shared = manager.shared.lock();
        assert!(shared.processing.is_empty());
        assert!(shared.completed.contains_key(&prompt.prompt_id));
    }

    #[tokio::test]
    async fn tick_assigns_queued_prompts_to_free_pods() {
        let manager = detached_manager(test_config());
        let pod = stub_pod(&manager, PodState::Free, false);

        let prompt = Arc::new(Prompt::new(WorkflowType::Ghibli, "u1"));
        manager.shared.lock().queued.push_back(Arc::clone(&prompt));

        let removed = manager.tick();
        assert!(removed.is_empty());
        assert_eq!(pod.state(), PodState::Processing);

        let shared = manager.shared.lock();
        assert!(shared.queued.is_empty());
        assert!(shared.processing.contains_key(&prompt.prompt_id));
    }

    #[tokio::test]
    async fn processing_deadline_fails_the_bound_prompt() {
        let mut cfg = test_config();
        cfg.timeout_retries = 3;
        let manager = detached_manager(cfg);
        let pod = stub_pod(&manager, PodState::Free, false);

        let prompt = Arc::new(Prompt::new(WorkflowType::Ghibli, "u1"));
        {
            let mut shared = manager.shared.lock();
            shared
                .processing
                .insert(prompt.prompt_id.clone(), Arc::clone(&prompt));
        }
        pod.begin_prompt(&prompt);

        let mut removed = Vec::new();
        for _ in 0..5 {
            removed.extend(manager.tick());
        }

        assert_eq!(removed.len(), 1);
        let shared = manager.shared.lock();
        assert!(shared.pods.is_empty());
        assert!(shared.processing.is_empty());
        let failed = shared.failed.get(&prompt.prompt_id).expect("failed");
        let result = failed.take_result().expect("result set");
        assert_eq!(result.output, PromptOutput::Reason(TIMEOUT_REASON.to_string()));
    }

    #[tokio::test]
    async fn oversize_fleet_releases_idle_pods_lazily() {
        let mut cfg = test_config();
        cfg.free_max_remains = 2;
        cfg.min_pods = 1;
        let manager = detached_manager(cfg);
        manager.shared.lock().num_pods = 1;
        let a = stub_pod(&manager, PodState::Free, false);
        let b = stub_pod(&manager, PodState::Free, false);

        // under the lingering threshold nothing happens
        assert!(manager.tick().is_empty());
        assert!(manager.tick().is_empty());

        // third tick pushes counts past free_max_remains; one pod goes
        let removed = manager.tick();
        assert_eq!(removed.len(), 1);
        assert_eq!(manager.shared.lock().pods.len(), 1);
        let survivors = [a.state(), b.state()];
        assert!(survivors.contains(&PodState::Free));
    }

    #[tokio::test]
    async fn manage_tick_provisions_the_deficit() {
        let mut cfg = test_config();
        cfg.min_pods = 2;
        // point the provider at a dead socket; spawned pods just fail
        // initialization in the background
        let manager = detached_manager(cfg);

        manager.manage_tick();
        let shared = manager.shared.lock();
        assert_eq!(shared.num_pods, 2);
        assert_eq!(shared.pods.len(), 2);
    }

    #[tokio::test]
    async fn queue_prompt_applies_backpressure() {
        let mut cfg = test_config();
        cfg.queue_capacity = 0;
        let manager = detached_manager(cfg);

        let result = manager.queue_prompt(WorkflowType::Ghibli, "u1").await;
        assert_eq!(result.output_state, OutputState::Failed);
        assert_eq!(result.output, PromptOutput::Reason("backpressure".to_string()));
    }

    #[tokio::test]
    async fn queue_prompt_times_out_and_garbage_collects() {
        let mut cfg = test_config();
        cfg.server_check_retries = 3;
        cfg.server_check_delay_ms = 1;
        let manager = detached_manager(cfg);

        let result = manager.queue_prompt(WorkflowType::Ghibli, "u1").await;
        assert_eq!(result.output_state, OutputState::Failed);
        assert_eq!(result.output, PromptOutput::Reason(TIMEOUT_REASON.to_string()));

        let shared = manager.shared.lock();
        assert!(shared.queued.is_empty());
        assert!(shared.processing.is_empty());
    }

    #[tokio::test]
    async fn stop_clears_everything() {
        let manager = detached_manager(test_config());
        stub_pod(&manager, PodState::Free, false);
        manager
            .shared
            .lock()
            .queued
            .push_back(Arc::new(Prompt::new(WorkflowType::Ghibli, "u1")));

        manager.stop().await;

        let snapshot = manager.get_state();
        assert_eq!(snapshot.state, PodManagerState::Stopped);
        assert_eq!(snapshot.total_pods, 0);
        assert_eq!(snapshot.queued_prompts, 0);

        // stopped manager fast-fails new prompts
        let result = manager.queue_prompt(WorkflowType::Ghibli, "u2").await;
        assert_eq!(result.output_state, OutputState::Failed);
    }

    #[tokio::test]
    async fn restart_rearms_a_stopped_manager() {
        let mut cfg = test_config();
        // loops stay asleep for the duration of the test
        cfg.manage_delay_ms = 600_000;
        cfg.server_check_delay_ms = 600_000;
        let manager = detached_manager(cfg);

        manager.stop().await;
        assert_eq!(manager.get_state().state, PodManagerState::Stopped);

        manager.restart();
        assert_eq!(manager.get_state().state, PodManagerState::Running);
    }

    #[tokio::test]
    async fn snapshot_counts_pods_by_state() {
        let manager = detached_manager(test_config());
        stub_pod(&manager, PodState::Initializing, true);
        stub_pod(&manager, PodState::Starting, true);
        stub_pod(&manager, PodState::Free, false);
        stub_pod(&manager, PodState::Processing, false);

        let snapshot = manager.get_state();
        assert_eq!(snapshot.total_pods, 4);
        assert_eq!(snapshot.initializing_pods, 1);
        assert_eq!(snapshot.starting_pods, 1);
        assert_eq!(snapshot.free_pods, 1);
        assert_eq!(snapshot.processing_pods, 1);
    }
}
