//! ComfyUI inference client.
//!
//! Unique responsibility: drive one generation workflow on a pod's
//! ComfyUI server to completion and return the produced artifact.
//!
//! Server surface used (port 8188 on the pod):
//! - POST `/prompt`  body `{prompt: <workflow>, client_id: <uuid>}`
//! - GET  `/history/{prompt_id}`
//! - GET  `/view?filename=&subfolder=&type=`
//! - websocket at `/ws?clientId=<uuid>` streaming progress records
//!
//! A prompt exchange is: patch the workflow template, open the progress
//! stream under a fresh client id, queue the workflow, watch the stream
//! until the server reports success or failure, then fetch the first
//! artifact of the first matching output node. Images are normalized to
//! JPEG; gif containers are returned unchanged.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use image::codecs::jpeg::JpegEncoder;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::types::Prompt;
use crate::workflows::{WorkflowError, WorkflowStore};
use tokio_util::sync::CancellationToken;

/// JPEG quality of normalized image output.
const JPEG_QUALITY: u8 = 85;

/// Client for one pod's ComfyUI server.
pub struct ComfyClient<'a> {
    http_url: String,
    ws_url: String,
    http: reqwest::Client,
    store: &'a WorkflowStore,
    poll_delay: Duration,
    timeout_retries: u64,
    cold_timeout_retries: u64,
}

impl<'a> ComfyClient<'a> {
    /// Create a client for the server behind `http_url` / `ws_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        http_url: impl Into<String>,
        ws_url: impl Into<String>,
        store: &'a WorkflowStore,
        cfg: &DispatcherConfig,
    ) -> Result<Self, ComfyError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(|e| ComfyError::QueueFailed(e.to_string()))?;

        Ok(Self {
            http_url: trim_url(http_url.into()),
            ws_url: trim_url(ws_url.into()),
            http,
            store,
            poll_delay: cfg.server_check_delay(),
            timeout_retries: cfg.timeout_retries,
            cold_timeout_retries: cfg.cold_timeout_retries,
        })
    }

    /// Execute `prompt` and return the resulting artifact bytes
    /// (JPEG for image workflows, raw gif container for video workflows).
    ///
    /// Warm-up prompts get the extended `COLD_TIMEOUT_RETRIES` budget to
    /// absorb model load time.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow cannot be loaded or queued, the
    /// progress stream breaks, the server reports a failure, the budget
    /// runs out, or the output cannot be fetched or decoded.
    pub async fn prompt(
        &self,
        prompt: &Prompt,
        is_warmup: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, ComfyError> {
        let workflow = self.store.prepared(prompt.workflow_type, &prompt.input_url)?;

        let client_id = Uuid::new_v4().to_string();
        let ws_addr = format!("{}/ws?clientId={client_id}", self.ws_url);
        let (mut stream, _) = tokio_tungstenite::connect_async(ws_addr.as_str())
            .await
            .map_err(|e| ComfyError::StreamBroken(e.to_string()))?;

        let prompt_id = self.queue_workflow(&workflow, &client_id).await?;
        debug!(%prompt_id, workflow = ?prompt.workflow_type, "workflow queued");

        self.track_progress(&mut stream, &prompt_id, is_warmup, cancel)
            .await?;

        self.fetch_output(&prompt_id).await
    }

    /// POST the patched workflow and return the server-side prompt id.
    async fn queue_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<String, ComfyError> {
        let body = serde_json::json!({ "prompt": workflow, "client_id": client_id });
        let resp = self
            .http
            .post(format!("{}/prompt", self.http_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ComfyError::QueueFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ComfyError::QueueFailed(format!(
                "status={status}, body={text}"
            )));
        }

        let queued: QueueResponse = resp
            .json()
            .await
            .map_err(|e| ComfyError::QueueFailed(e.to_string()))?;
        if queued.prompt_id.is_empty() {
            return Err(ComfyError::QueueFailed(
                "queue response carried no prompt_id".to_string(),
            ));
        }
        Ok(queued.prompt_id)
    }

    /// Watch the progress stream until the server settles `prompt_id`.
    ///
    /// One read attempt per tick; the budget is `COLD_TIMEOUT_RETRIES`
    /// during warm-up, `TIMEOUT_RETRIES` otherwise.
    async fn track_progress<S>(
        &self,
        stream: &mut S,
        prompt_id: &str,
        is_warmup: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ComfyError>
    where
        S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let budget = if is_warmup {
            self.cold_timeout_retries
        } else {
            self.timeout_retries
        };

        for _ in 0..budget {
            let read = tokio::select! {
                () = cancel.cancelled() => return Err(ComfyError::Cancelled),
                read = tokio::time::timeout(self.poll_delay, stream.next()) => read,
            };

            let message = match read {
                // nothing arrived this tick
                Err(_) => continue,
                Ok(None) => return Err(ComfyError::StreamBroken("stream closed".to_string())),
                Ok(Some(Err(e))) => return Err(ComfyError::StreamBroken(e.to_string())),
                Ok(Some(Ok(message))) => message,
            };

            let Message::Text(text) = message else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<StreamEvent>(text.as_str()) else {
                continue;
            };

            match event.kind.as_str() {
                "executing" => {
                    if event.data.node.is_none()
                        && event.data.prompt_id.as_deref() == Some(prompt_id)
                    {
                        return Ok(());
                    }
                }
                "execution_success" => {
                    if event.data.prompt_id.as_deref() == Some(prompt_id) {
                        return Ok(());
                    }
                }
                "execution_error" => {
                    if event.data.prompt_id.as_deref() == Some(prompt_id) {
                        let reason = event
                            .data
                            .exception_message
                            .unwrap_or_else(|| "execution error".to_string());
                        return Err(ComfyError::ExecutionFailed(reason));
                    }
                }
                "execution_interrupted" => {
                    return Err(ComfyError::ExecutionFailed("interrupted".to_string()));
                }
                _ => {}
            }
        }

        Err(ComfyError::Timeout)
    }

    /// Fetch the artifact for `prompt_id` from the execution history.
    ///
    /// Output nodes are walked in insertion order; the first node carrying
    /// `images` (or `gifs` for video workflows) wins, and only its first
    /// artifact is returned.
    async fn fetch_output(&self, prompt_id: &str) -> Result<Vec<u8>, ComfyError> {
        let resp = self
            .http
            .get(format!("{}/history/{}", self.http_url, prompt_id))
            .send()
            .await
            .map_err(|e| ComfyError::OutputMissing(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ComfyError::OutputMissing(format!(
                "history request returned {}",
                resp.status()
            )));
        }
        let history: Value = resp
            .json()
            .await
            .map_err(|e| ComfyError::OutputMissing(e.to_string()))?;

        let outputs = history
            .get(prompt_id)
            .and_then(|entry| entry.get("outputs"))
            .and_then(Value::as_object)
            .ok_or_else(|| ComfyError::OutputMissing("no execution history".to_string()))?;

        for node_output in outputs.values() {
            if let Some(images) = node_output.get("images").and_then(Value::as_array) {
                let raw = self.fetch_artifact(images).await?;
                return normalize_jpeg(&raw);
            }
            if let Some(gifs) = node_output.get("gifs").and_then(Value::as_array) {
                return self.fetch_artifact(gifs).await;
            }
        }

        Err(ComfyError::OutputMissing(
            "no image or gif output node".to_string(),
        ))
    }

    /// Download the first artifact of an output node via `/view`.
    async fn fetch_artifact(&self, items: &[Value]) -> Result<Vec<u8>, ComfyError> {
        let first = items
            .first()
            .ok_or_else(|| ComfyError::OutputMissing("output node is empty".to_string()))?;
        let artifact: ArtifactRef = serde_json::from_value(first.clone())
            .map_err(|e| ComfyError::OutputMissing(e.to_string()))?;

        let resp = self
            .http
            .get(format!("{}/view", self.http_url))
            .query(&[
                ("filename", artifact.filename.as_str()),
                ("subfolder", artifact.subfolder.as_str()),
                ("type", artifact.kind.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ComfyError::OutputMissing(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ComfyError::OutputMissing(format!(
                "view request returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ComfyError::OutputMissing(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Decode image bytes and re-encode as JPEG at quality 85, flattening any
/// alpha channel to RGB.
fn normalize_jpeg(raw: &[u8]) -> Result<Vec<u8>, ComfyError> {
    let decoded =
        image::load_from_memory(raw).map_err(|e| ComfyError::DecodeFailed(e.to_string()))?;
    let rgb = decoded.to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rgb)
        .map_err(|e| ComfyError::DecodeFailed(e.to_string()))?;
    Ok(jpeg)
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: StreamEventData,
}

#[derive(Debug, Default, Deserialize)]
struct StreamEventData {
    #[serde(default)]
    node: Option<String>,
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    exception_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtifactRef {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    kind: String,
}

// ============================================================================
// Error type
// ============================================================================

/// Error type for one inference exchange.
#[derive(Debug, Error)]
pub enum ComfyError {
    /// The workflow template is missing or unusable.
    #[error(transparent)]
    WorkflowMissing(#[from] WorkflowError),
    /// The workflow could not be queued on the server.
    #[error("queueing workflow failed: {0}")]
    QueueFailed(String),
    /// The progress stream failed or closed early.
    #[error("progress stream broken: {0}")]
    StreamBroken(String),
    /// The server reported the execution as failed.
    #[error("{0}")]
    ExecutionFailed(String),
    /// The progress budget ran out before the server settled the prompt.
    #[error("execution timed out")]
    Timeout,
    /// The artifact bytes could not be decoded or re-encoded.
    #[error("decoding output failed: {0}")]
    DecodeFailed(String),
    /// The history carried no usable output, or fetching it failed.
    #[error("no usable output: {0}")]
    OutputMissing(String),
    /// The exchange was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}
