//! Shared fixtures: an in-memory container runtime whose "containers" are
//! tasks speaking JSON-RPC over duplex pipes.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;

use mcp_runner::container::{
    ContainerError, ContainerProcess, ContainerResult, ContainerRuntimeApi, RunSpec,
    SupervisorSettings,
};
use mcp_runner::session::{SessionManagerConfig, SessionSettings};
use mcp_runner_protocol::JsonRpcMessage;

/// Method that makes the fake server print plain text on both streams.
pub const LOG_METHOD: &str = "test/log";

/// Exit code reported when a fake container is stopped.
pub const STOPPED_EXIT_CODE: i32 = 143;

pub struct FakeRuntime {
    pub pulls: AtomicUsize,
    pub spawns: AtomicUsize,
    pub stops: AtomicUsize,
    /// Fail every pull.
    pub fail_pull: AtomicBool,
    /// Whether `find_container` ever finds anything.
    pub visible: AtomicBool,
    /// Whether the fake server answers runner pings.
    pub answer_pings: AtomicBool,
    containers: Mutex<HashMap<String, CancellationToken>>,
    /// Lines received on stdin, per container name.
    received: Arc<Mutex<HashMap<String, Vec<String>>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pulls: AtomicUsize::new(0),
            spawns: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_pull: AtomicBool::new(false),
            visible: AtomicBool::new(true),
            answer_pings: AtomicBool::new(true),
            containers: Mutex::new(HashMap::new()),
            received: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn received(&self, name: &str) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    /// Make a container exit on its own with the given status.
    pub fn exit_container(&self, name: &str) {
        if let Some(token) = self.containers.lock().unwrap().get(name) {
            token.cancel();
        }
    }
}

#[async_trait]
impl ContainerRuntimeApi for FakeRuntime {
    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(ContainerError::CommandFailed {
                command: format!("docker pull {image}"),
                message: "manifest unknown".to_string(),
            });
        }
        Ok(())
    }

    fn spawn_container(&self, name: &str, _spec: &RunSpec) -> ContainerResult<ContainerProcess> {
        self.spawns.fetch_add(1, Ordering::SeqCst);

        let (runner_stdin, server_stdin) = tokio::io::duplex(64 * 1024);
        let (server_stdout, runner_stdout) = tokio::io::duplex(64 * 1024);
        let (server_stderr, runner_stderr) = tokio::io::duplex(64 * 1024);

        let token = CancellationToken::new();
        self.containers
            .lock()
            .unwrap()
            .insert(name.to_string(), token.clone());

        tokio::spawn(fake_server(
            name.to_string(),
            server_stdin,
            server_stdout,
            server_stderr,
            self.answer_pings.load(Ordering::SeqCst),
            Arc::clone(&self.received),
            token.clone(),
        ));

        let exit = async move {
            token.cancelled().await;
            Some(STOPPED_EXIT_CODE)
        }
        .boxed();

        Ok(ContainerProcess {
            stdin: Box::pin(runner_stdin),
            stdout: Box::pin(runner_stdout),
            stderr: Box::pin(runner_stderr),
            exit,
        })
    }

    async fn find_container(&self, name: &str) -> ContainerResult<Option<String>> {
        if self.visible.load(Ordering::SeqCst) {
            Ok(Some(format!("fake-{name}")))
        } else {
            Ok(None)
        }
    }

    async fn stop_and_remove_container(&self, handle: &str) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let name = handle.trim_start_matches("fake-");
        self.exit_container(name);
    }
}

async fn fake_server(
    name: String,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut stderr: DuplexStream,
    answer_pings: bool,
    received: Arc<Mutex<HashMap<String, Vec<String>>>>,
    token: CancellationToken,
) {
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                _ => break,
            },
        };

        received
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_default()
            .push(line.clone());

        let Some(JsonRpcMessage::Request(request)) = JsonRpcMessage::parse_line(&line) else {
            continue;
        };

        let reply = if request.method == "ping" {
            if !answer_pings {
                continue;
            }
            serde_json::json!({"jsonrpc": "2.0", "id": request.id, "result": {}})
        } else if request.method == LOG_METHOD {
            let _ = stdout.write_all(b"plain text on stdout\n").await;
            let _ = stderr.write_all(b"something on stderr\n").await;
            serde_json::json!({"jsonrpc": "2.0", "id": request.id, "result": {"logged": true}})
        } else {
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": request.id,
                "result": {"echo": request.method}
            })
        };

        let mut out = reply.to_string();
        out.push('\n');
        if stdout.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

pub fn spec() -> RunSpec {
    RunSpec {
        image: "ghcr.io/example/mcp-server".to_string(),
        tag: Some("1.0".to_string()),
        command: "node".to_string(),
        args: vec!["server.js".to_string()],
        env: BTreeMap::new(),
    }
}

/// Settings with short timers for tests.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        ping_interval: Duration::from_secs(15),
        ping_timeout: Duration::from_secs(5),
        supervisor: SupervisorSettings {
            start_poll_attempts: 3,
            start_poll_interval: Duration::from_millis(10),
            min_healthy_uptime: Duration::from_millis(50),
        },
    }
}

pub fn manager_config() -> SessionManagerConfig {
    SessionManagerConfig {
        gc_interval: Duration::from_secs(30),
        stopped_retention: Duration::from_secs(300),
        session: fast_settings(),
    }
}

pub fn request(id: i64, method: &str) -> JsonRpcMessage {
    serde_json::from_value(serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": {}
    }))
    .unwrap()
}
