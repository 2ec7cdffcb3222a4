//! Shared fakes for the end-to-end dispatcher tests: an in-process
//! ComfyUI server (HTTP + websocket on one port, like the real one), a
//! wiremock RunPod API, and a no-op command runner.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use comfyfleet::config::DispatcherConfig;
use comfyfleet::ssh_exec::{CommandOutput, CommandRunner, SshError};
use comfyfleet::types::VolumeType;

/// Runner that pretends every setup command succeeded.
pub struct OkRunner;

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

/// How the fake inference server settles prompts. The first prompt a
/// server sees is always the warm-up; scripts that "fail" or go silent
/// do so only for the user prompts after it.
#[derive(Clone)]
pub enum ComfyScript {
    /// Every prompt succeeds.
    AlwaysSucceed,
    /// Warm-up succeeds, user prompts report an execution error.
    FailAfterWarmup(String),
    /// Warm-up succeeds, user prompts never settle.
    SilentAfterWarmup,
}

struct ComfyState {
    script: ComfyScript,
    queued: AtomicUsize,
    artifact: Vec<u8>,
    video: bool,
}

impl ComfyState {
    /// The progress event a websocket should announce for prompt `idx`,
    /// or `None` when the script leaves it unsettled.
    fn event_for(&self, idx: usize) -> Option<Value> {
        let prompt_id = format!("fake-{idx}");
        let success = json!({
            "type": "executing",
            "data": { "node": null, "prompt_id": prompt_id }
        });
        match &self.script {
            ComfyScript::AlwaysSucceed => Some(success),
            ComfyScript::FailAfterWarmup(message) => {
                if idx == 0 {
                    Some(success)
                } else {
                    Some(json!({
                        "type": "execution_error",
                        "data": { "prompt_id": prompt_id, "exception_message": message }
                    }))
                }
            }
            ComfyScript::SilentAfterWarmup => (idx == 0).then_some(success),
        }
    }
}

/// In-process ComfyUI stand-in.
pub struct FakeComfy {
    pub addr: SocketAddr,
    state: Arc<ComfyState>,
}

impl FakeComfy {
    /// Serve an image-producing fake following `script`.
    pub async fn start(script: ComfyScript) -> Self {
        Self::start_inner(script, rgba_png(32, 32), false).await
    }

    /// Serve a video-producing fake (gif bytes pass through unchanged).
    pub async fn start_video(script: ComfyScript, gif: Vec<u8>) -> Self {
        Self::start_inner(script, gif, true).await
    }

    async fn start_inner(script: ComfyScript, artifact: Vec<u8>, video: bool) -> Self {
        let state = Arc::new(ComfyState {
            script,
            queued: AtomicUsize::new(0),
            artifact,
            video,
        });

        let app = Router::new()
            .route("/", get(root))
            .route("/prompt", post(queue_prompt))
            .route("/history/{id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake comfy");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve fake comfy");
        });

        Self { addr, state }
    }

    /// Number of prompts the server has accepted so far.
    pub fn prompts_accepted(&self) -> usize {
        self.state.queued.load(Ordering::SeqCst)
    }
}

async fn root() -> &'static str {
    "ok"
}

async fn queue_prompt(State(state): State<Arc<ComfyState>>) -> Response {
    let idx = state.queued.fetch_add(1, Ordering::SeqCst);
    axum::Json(json!({ "prompt_id": format!("fake-{idx}") })).into_response()
}

async fn history(
    State(state): State<Arc<ComfyState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let artifact_ref = json!({ "filename": "out.bin", "subfolder": "", "type": "output" });
    let node = if state.video {
        json!({ "gifs": [artifact_ref] })
    } else {
        json!({ "images": [artifact_ref] })
    };
    let mut body = serde_json::Map::new();
    body.insert(id, json!({ "outputs": { "9": node } }));
    axum::Json(Value::Object(body)).into_response()
}

async fn view(State(state): State<Arc<ComfyState>>) -> Response {
    state.artifact.clone().into_response()
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<ComfyState>>) -> Response {
    ws.on_upgrade(move |socket| ws_loop(socket, state))
}

/// Announce progress for every accepted prompt to this connection; the
/// client filters by its own prompt id.
async fn ws_loop(mut socket: WebSocket, state: Arc<ComfyState>) {
    let mut announced = 0usize;
    loop {
        let queued = state.queued.load(Ordering::SeqCst);
        while announced < queued {
            if let Some(event) = state.event_for(announced) {
                let sent = socket.send(Message::Text(event.to_string().into())).await;
                if sent.is_err() {
                    return;
                }
            }
            announced += 1;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A 32x32 RGBA PNG for the image path.
pub fn rgba_png(width: u32, height: u32) -> Vec<u8> {
    use std::io::Cursor;
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([10, 200, 30, 128]),
    ));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("png encode");
    out.into_inner()
}

/// Mount a provider that creates `pod-1` and reports it scheduled at
/// 127.0.0.1 with the inference port mapped to `comfy_port`.
pub async fn mount_ready_provider(server: &MockServer, comfy_port: u16) {
    Mock::given(method("POST"))
        .and(path("/pods"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "pod-1" })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/pods/pod-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pod-1",
            "publicIp": "127.0.0.1",
            "portMappings": { "8188": comfy_port, "22": 2201 }
        })))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Mount a provider whose pods never get a public IP.
pub async fn mount_stuck_provider(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/pods"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "pod-1" })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "pod-1",
            "publicIp": "",
            "portMappings": null
        })))
        .mount(server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

/// Write minimal workflow templates into `dir`.
pub fn write_templates(dir: &Path) {
    for name in ["Ghibli", "Snoopy", "MagicVideo"] {
        let body = json!({
            "111": { "inputs": { "url_or_path": "placeholder" } },
            "9": { "inputs": {}, "class_type": "SaveOutput" }
        });
        std::fs::write(dir.join(format!("{name}.json")), body.to_string())
            .expect("write template");
    }
}

/// A configuration with tick periods fast enough for tests.
pub fn fast_config(rest_url: String, workflows_dir: &Path) -> DispatcherConfig {
    DispatcherConfig {
        api_key: "test-key".to_string(),
        rest_url,
        origin_image_url: "http://origin/warmup.png".to_string(),
        output_directory: "/workspace/output".to_string(),
        workflows_dir: workflows_dir.to_path_buf(),
        ssh_key_path: "./runpod.pem".into(),
        pod_image_name: "runpod/vscode-server:0.0.0".to_string(),
        pod_ports: vec![
            "8188/tcp".to_string(),
            "8888/http".to_string(),
            "22/tcp".to_string(),
        ],
        server_check_retries: 500,
        cold_timeout_retries: 500,
        timeout_retries: 300,
        free_max_remains: 500,
        server_check_delay_ms: 10,
        manage_delay_ms: 40,
        min_pods: 1,
        max_pods: 5,
        scaling_sensitivity: 50,
        history_window: 15,
        queue_capacity: 100,
        pod_info_retries: 100,
        pod_info_delay_ms: 10,
        http_timeout_ms: 5000,
        http_retry_max: 2,
        http_retry_backoff_ms: 10,
        volume_ids: HashMap::from([
            (VolumeType::Ghibli, "vol-ghibli".to_string()),
            (VolumeType::MagicVideo, "vol-video".to_string()),
        ]),
    }
}

/// Poll `predicate` against the manager snapshot until it holds or the
/// budget runs out.
pub async fn wait_until<F>(budget: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < budget {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}
