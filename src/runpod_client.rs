//! `RunPod` REST client for pod lifecycle operations.
//!
//! Unique responsibility: create, observe and delete pods on the `RunPod`
//! REST API.
//!
//! REST endpoints used:
//! - POST   <https://rest.runpod.io/v1/pods>
//! - GET    <https://rest.runpod.io/v1/pods/{podId}>
//! - DELETE <https://rest.runpod.io/v1/pods/{podId}>
//! - Header: Authorization: Bearer <token>
//!
//! Transient network errors and retryable statuses (408/409/425/429/5xx)
//! are retried with a doubling backoff capped at 10 seconds; 4xx responses
//! are fatal. `delete_pod` treats 404 as success so teardown stays
//! idempotent from the caller's perspective.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::types::PodInfo;

/// REST client for pod create/get/delete.
pub struct RunpodClient {
    api_key: String,
    rest_url: String,
    retry_max: u32,
    retry_backoff: Duration,
    http: reqwest::Client,
}

/// What a new pod should be created with.
#[derive(Debug, Clone)]
pub struct CreatePodSpec {
    /// Pod name shown in the provider console.
    pub name: String,
    /// Network-volume id holding the models.
    pub network_volume_id: String,
    /// GPU type ids, in preference order.
    pub gpu_type_ids: Vec<String>,
    /// GPU count.
    pub gpu_count: u32,
    /// Container image name.
    pub image_name: String,
    /// Exposed ports ("<port>/<protocol>").
    pub ports: Vec<String>,
    /// Environment variables for the pod.
    pub env: HashMap<String, String>,
}

impl RunpodClient {
    /// Create a client from the dispatcher configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: &DispatcherConfig) -> Result<Self, RunpodError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(RunpodError::Http)?;

        Ok(Self {
            api_key: cfg.api_key.clone(),
            rest_url: cfg.rest_url.trim_end_matches('/').to_string(),
            retry_max: cfg.http_retry_max,
            retry_backoff: cfg.http_retry_backoff(),
            http,
        })
    }

    /// Create a new pod and return its newly assigned pod id.
    ///
    /// # Errors
    ///
    /// Returns an error on non-retryable API failure, on retry budget
    /// exhaustion, or if the response carries no id.
    pub async fn create_pod(&self, spec: &CreatePodSpec) -> Result<String, RunpodError> {
        let url = format!("{}/pods", self.rest_url);
        let req_body = CreatePodRequest {
            env: spec.env.clone(),
            gpuCount: spec.gpu_count,
            gpuTypeIds: spec.gpu_type_ids.clone(),
            imageName: spec.image_name.clone(),
            name: spec.name.clone(),
            networkVolumeId: spec.network_volume_id.clone(),
            supportPublicIp: true,
            ports: spec.ports.clone(),
        };

        let body = self
            .send_with_retry(|| self.http.post(&url).json(&req_body))
            .await?;

        let created: CreatePodResponse =
            serde_json::from_str(&body).map_err(|source| RunpodError::Json { source, body })?;
        if created.id.is_empty() {
            return Err(RunpodError::MissingPodId);
        }
        debug!(pod_id = %created.id, name = %spec.name, "pod created");
        Ok(created.id)
    }

    /// Fetch the pod's network identity, or `None` while the provider has
    /// not scheduled it yet (empty `publicIp` or absent `portMappings`).
    ///
    /// # Errors
    ///
    /// Returns an error on non-retryable API failure or retry exhaustion.
    pub async fn try_pod_info(&self, pod_id: &str) -> Result<Option<PodInfo>, RunpodError> {
        let url = format!("{}/pods/{}", self.rest_url, pod_id);
        let body = self.send_with_retry(|| self.http.get(&url)).await?;

        let record: PodRecord =
            serde_json::from_str(&body).map_err(|source| RunpodError::Json { source, body })?;

        let public_ip = match record.publicIp {
            Some(ip) if !ip.is_empty() => ip,
            _ => return Ok(None),
        };
        let Some(raw_mappings) = record.portMappings else {
            return Ok(None);
        };

        let mut port_mappings = HashMap::new();
        for (internal, external) in raw_mappings {
            if let Ok(port) = internal.parse::<u16>() {
                port_mappings.insert(port, external);
            }
        }

        Ok(Some(PodInfo {
            public_ip,
            port_mappings,
        }))
    }

    /// Poll `try_pod_info` until the pod is scheduled, with a short delay
    /// between probes and a caller-supplied retry budget.
    ///
    /// # Errors
    ///
    /// Returns an error if the budget is exhausted or `cancel` fires.
    pub async fn wait_for_pod_info(
        &self,
        pod_id: &str,
        retries: u64,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<PodInfo, RunpodError> {
        for _ in 0..retries {
            if cancel.is_cancelled() {
                return Err(RunpodError::Cancelled);
            }
            match self.try_pod_info(pod_id).await {
                Ok(Some(info)) => return Ok(info),
                Ok(None) => {}
                // keep probing: the record can flap while the pod schedules
                Err(e) => warn!(pod_id, error = %e, "pod info probe failed"),
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(RunpodError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
        Err(RunpodError::PodInfoTimeout {
            pod_id: pod_id.to_string(),
            attempts: retries,
        })
    }

    /// Delete a pod. A 404 counts as success.
    ///
    /// # Errors
    ///
    /// Returns an error on non-retryable API failure or retry exhaustion.
    pub async fn delete_pod(&self, pod_id: &str) -> Result<(), RunpodError> {
        let url = format!("{}/pods/{}", self.rest_url, pod_id);

        match self.send_with_retry(|| self.http.delete(&url)).await {
            Ok(_) => Ok(()),
            Err(RunpodError::Api { status, .. }) if status == reqwest::StatusCode::NOT_FOUND => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Send a request, retrying transient failures with doubling backoff.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<String, RunpodError> {
        let mut attempt: u32 = 0;
        let mut backoff = self.retry_backoff;

        loop {
            attempt = attempt.saturating_add(1);

            let send_res = build().bearer_auth(&self.api_key).send().await;

            match send_res {
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();

                    if status.is_success() {
                        return Ok(body);
                    }

                    if attempt <= self.retry_max && is_retryable_status(status) {
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(RunpodError::Api { status, body });
                }
                Err(e) => {
                    if attempt <= self.retry_max && is_retryable_reqwest(&e) {
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff);
                        continue;
                    }

                    return Err(RunpodError::Http(e));
                }
            }
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[allow(non_snake_case)]
struct CreatePodRequest {
    env: HashMap<String, String>,
    gpuCount: u32,
    gpuTypeIds: Vec<String>,
    imageName: String,
    name: String,
    networkVolumeId: String,
    supportPublicIp: bool,
    ports: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreatePodResponse {
    #[serde(default)]
    id: String,
}

#[derive(Debug, Deserialize)]
#[allow(non_snake_case)]
struct PodRecord {
    #[serde(default)]
    publicIp: Option<String>,
    #[serde(default)]
    portMappings: Option<HashMap<String, u16>>,
}

// ============================================================================
// Error type
// ============================================================================

/// Error type for provider operations.
#[derive(Debug, Error)]
pub enum RunpodError {
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// API error response.
    #[error("runpod api error: status={status}, body={body}")]
    Api {
        /// HTTP status code.
        status: reqwest::StatusCode,
        /// Response body.
        body: String,
    },
    /// JSON deserialization error.
    #[error("json decode error: {source}")]
    Json {
        /// The JSON parsing error.
        #[source]
        source: serde_json::Error,
        /// The response body.
        body: String,
    },
    /// Pod creation response carried no id.
    #[error("pod create response carried no id")]
    MissingPodId,
    /// The pod never exposed its network identity within the budget.
    #[error("pod {pod_id} not scheduled after {attempts} probes")]
    PodInfoTimeout {
        /// Pod id that was polled.
        pod_id: String,
        /// Number of probes spent.
        attempts: u64,
    },
    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

// ============================================================================
// Helper functions
// ============================================================================

#[inline]
const fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    matches!(
        status.as_u16(),
        408 | 409 | 425 | 429 | 500 | 502 | 503 | 504
    )
}

#[inline]
fn is_retryable_reqwest(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request()
}

#[inline]
fn next_backoff(current: Duration) -> Duration {
    let next = current.saturating_mul(2);
    next.min(Duration::from_secs(10))
}
