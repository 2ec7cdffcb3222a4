//! Dispatcher configuration.
//!
//! Unique responsibility: load every tunable of the dispatcher from
//! environment variables (a `.env` file is honored in local dev).
//!
//! All fields are public so tests and embedders can build the struct
//! literally instead of going through the environment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::types::VolumeType;

/// Configuration for the dispatcher and its clients.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Bearer token for the provider REST API.
    /// Env: `RUNPOD_API` (required)
    pub api_key: String,

    /// Provider REST API base URL.
    /// Env: `RUNPOD_REST_URL` (default: "<https://rest.runpod.io/v1>")
    pub rest_url: String,

    /// Default input URL for the warm-up prompt.
    /// Env: `ORIGIN_IMAGE_URL` (required)
    pub origin_image_url: String,

    /// Pod-side directory generated files are written to.
    /// Env: `OUTPUT_DIRECTORY` (default: "/workspace/output")
    pub output_directory: String,

    /// Directory holding `<WorkflowType>.json` templates.
    /// Env: `WORKFLOWS_DIR` (default: "./workflows")
    pub workflows_dir: PathBuf,

    /// Private key used for pod SSH access.
    /// Env: `SSH_KEY_PATH` (default: "./runpod.pem")
    pub ssh_key_path: PathBuf,

    /// Container image new pods boot with.
    /// Env: `POD_IMAGE_NAME` (default: "runpod/vscode-server:0.0.0")
    pub pod_image_name: String,

    /// Ports exposed on new pods (comma-separated "<port>/<protocol>").
    /// Env: `POD_PORTS` (default: "8188/tcp,8888/http,22/tcp")
    pub pod_ports: Vec<String>,

    /// Max ticks per inference/readiness wait, and the caller-side budget
    /// of `queue_prompt`.
    /// Env: `SERVER_CHECK_RETRIES` (default: 6000)
    pub server_check_retries: u64,

    /// Extra ticks allowed while a pod is warming up.
    /// Env: `COLD_TIMEOUT_RETRIES` (default: 2400)
    pub cold_timeout_retries: u64,

    /// Ticks allowed for steady-state processing.
    /// Env: `TIMEOUT_RETRIES` (default: 600)
    pub timeout_retries: u64,

    /// Ticks a Completed/idle Free pod may linger before teardown.
    /// Env: `FREE_MAX_REMAINS` (default: 200)
    pub free_max_remains: u64,

    /// Process-loop period in milliseconds (one tick).
    /// Env: `SERVER_CHECK_DELAY` (default: 50)
    pub server_check_delay_ms: u64,

    /// Manage-loop (demand predictor) period in milliseconds.
    /// Env: `MANAGE_DELAY` (default: 2000)
    pub manage_delay_ms: u64,

    /// Lower fleet bound.
    /// Env: `MIN_PODS` (default: 1)
    pub min_pods: usize,

    /// Upper fleet bound.
    /// Env: `MAX_PODS` (default: 10)
    pub max_pods: usize,

    /// Peak-vs-average weight of the demand predictor, 0..=100.
    /// Env: `SCALING_SENSIVITY` (default: 50)
    pub scaling_sensitivity: u8,

    /// Load samples kept for the demand predictor, 15..=60.
    /// Env: `HISTORY_WINDOW` (default: 60)
    pub history_window: usize,

    /// Max prompts waiting in the queue before backpressure.
    /// Env: `QUEUE_CAPACITY` (default: 1000)
    pub queue_capacity: usize,

    /// Probes while waiting for a created pod's network identity.
    /// Env: `POD_INFO_RETRIES` (default: 600)
    pub pod_info_retries: u64,

    /// Delay between those probes in milliseconds.
    /// Env: `POD_INFO_DELAY` (default: 3000)
    pub pod_info_delay_ms: u64,

    /// HTTP request timeout in milliseconds.
    /// Env: `HTTP_TIMEOUT_MS` (default: 15000)
    pub http_timeout_ms: u64,

    /// Maximum retry attempts for transient provider errors.
    /// Env: `HTTP_RETRY_MAX` (default: 3)
    pub http_retry_max: u32,

    /// Initial backoff between those retries in milliseconds.
    /// Env: `HTTP_RETRY_BACKOFF_MS` (default: 500)
    pub http_retry_backoff_ms: u64,

    /// Network-volume id per volume type.
    /// Env: `VOLUME_ID1`..`VOLUME_ID3`, each optional until used.
    pub volume_ids: HashMap<VolumeType, String>,
}

impl DispatcherConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required environment variable is missing or
    /// a value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let mut volume_ids = HashMap::new();
        for volume_type in VolumeType::ALL {
            if let Ok(id) = env::var(volume_type.env_key())
                && !id.trim().is_empty()
            {
                volume_ids.insert(volume_type, id);
            }
        }

        Ok(Self {
            api_key: must_env("RUNPOD_API")?,
            rest_url: env::var("RUNPOD_REST_URL")
                .unwrap_or_else(|_| "https://rest.runpod.io/v1".to_string()),
            origin_image_url: must_env("ORIGIN_IMAGE_URL")?,
            output_directory: env::var("OUTPUT_DIRECTORY")
                .unwrap_or_else(|_| "/workspace/output".to_string()),
            workflows_dir: PathBuf::from(
                env::var("WORKFLOWS_DIR").unwrap_or_else(|_| "./workflows".to_string()),
            ),
            ssh_key_path: PathBuf::from(
                env::var("SSH_KEY_PATH").unwrap_or_else(|_| "./runpod.pem".to_string()),
            ),
            pod_image_name: env::var("POD_IMAGE_NAME")
                .unwrap_or_else(|_| "runpod/vscode-server:0.0.0".to_string()),
            pod_ports: split_csv_env("POD_PORTS", "8188/tcp,8888/http,22/tcp"),

            server_check_retries: parse_u64_env("SERVER_CHECK_RETRIES", 6000)?,
            cold_timeout_retries: parse_u64_env("COLD_TIMEOUT_RETRIES", 2400)?,
            timeout_retries: parse_u64_env("TIMEOUT_RETRIES", 600)?,
            free_max_remains: parse_u64_env("FREE_MAX_REMAINS", 200)?,
            server_check_delay_ms: parse_u64_env("SERVER_CHECK_DELAY", 50)?,
            manage_delay_ms: parse_u64_env("MANAGE_DELAY", 2000)?,

            min_pods: parse_usize_env("MIN_PODS", 1)?,
            max_pods: parse_usize_env("MAX_PODS", 10)?,
            scaling_sensitivity: clamp_u8(parse_u64_env("SCALING_SENSIVITY", 50)?, 100),
            history_window: parse_usize_env("HISTORY_WINDOW", 60)?.clamp(15, 60),
            queue_capacity: parse_usize_env("QUEUE_CAPACITY", 1000)?,

            pod_info_retries: parse_u64_env("POD_INFO_RETRIES", 600)?,
            pod_info_delay_ms: parse_u64_env("POD_INFO_DELAY", 3000)?,

            http_timeout_ms: parse_u64_env("HTTP_TIMEOUT_MS", 15_000)?,
            http_retry_max: parse_u32_env("HTTP_RETRY_MAX", 3)?,
            http_retry_backoff_ms: parse_u64_env("HTTP_RETRY_BACKOFF_MS", 500)?,

            volume_ids,
        })
    }

    /// Network-volume id for `volume_type`.
    ///
    /// # Errors
    ///
    /// Returns an error if no `VOLUME_ID{n}` was configured for it.
    pub fn volume_id(&self, volume_type: VolumeType) -> Result<&str, ConfigError> {
        self.volume_ids
            .get(&volume_type)
            .map(String::as_str)
            .ok_or(ConfigError::MissingVolumeId(volume_type))
    }

    /// One process-loop tick.
    #[must_use]
    pub const fn server_check_delay(&self) -> Duration {
        Duration::from_millis(self.server_check_delay_ms)
    }

    /// One manage-loop period.
    #[must_use]
    pub const fn manage_delay(&self) -> Duration {
        Duration::from_millis(self.manage_delay_ms)
    }

    /// Delay between pod-info probes.
    #[must_use]
    pub const fn pod_info_delay(&self) -> Duration {
        Duration::from_millis(self.pod_info_delay_ms)
    }

    /// HTTP request timeout.
    #[must_use]
    pub const fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    /// Initial retry backoff for transient provider errors.
    #[must_use]
    pub const fn http_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.http_retry_backoff_ms)
    }
}

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Missing required environment variable.
    #[error("missing required env var: {0}")]
    MissingEnv(&'static str),
    /// Invalid environment variable value.
    #[error("invalid env var {key}: {reason}")]
    InvalidEnv {
        /// The environment variable key.
        key: &'static str,
        /// The reason for invalidity.
        reason: &'static str,
    },
    /// No network-volume id configured for a volume type.
    #[error("no volume id configured for volume type {0}")]
    MissingVolumeId(VolumeType),
}

fn must_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnv(key))
}

fn parse_u64_env(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    env::var(key).map_or_else(
        |_| Ok(default),
        |v| {
            v.parse::<u64>().map_err(|_| ConfigError::InvalidEnv {
                key,
                reason: "expected an unsigned integer",
            })
        },
    )
}

fn parse_u32_env(key: &'static str, default: u32) -> Result<u32, ConfigError> {
    env::var(key).map_or_else(
        |_| Ok(default),
        |v| {
            v.parse::<u32>().map_err(|_| ConfigError::InvalidEnv {
                key,
                reason: "expected an unsigned integer",
            })
        },
    )
}

fn parse_usize_env(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    env::var(key).map_or_else(
        |_| Ok(default),
        |v| {
            v.parse::<usize>().map_err(|_| ConfigError::InvalidEnv {
                key,
                reason: "expected an unsigned integer",
            })
        },
    )
}

fn split_csv_env(key: &'static str, default: &str) -> Vec<String> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn clamp_u8(value: u64, max: u8) -> u8 {
    u8::try_from(value.min(u64::from(max))).unwrap_or(max)
}
