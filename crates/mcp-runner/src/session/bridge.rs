//! One MCP session: a client on one side, one container on the other.
//!
//! Inbound client messages go to the container's stdin as JSON lines;
//! container stdout lines that parse as JSON-RPC go to outgoing subscribers,
//! everything else is log output. Pings are answered locally in both
//! directions and a liveness loop stops the session when either side goes
//! quiet.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use mcp_runner_protocol::jsonrpc::PING_ID_PREFIX;
use mcp_runner_protocol::{CloseReason, JsonRpcMessage, LogLine, LogStream};

use super::subscribers::{Subscribers, Subscription};
use crate::container::{
    CloseEvent, ContainerRuntimeApi, ContainerSupervisor, OutputBatch, RunSpec, SupervisorSettings,
};

/// Liveness and container settings of a session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Pings go out this often; a client silent for longer is gone.
    pub ping_interval: Duration,
    /// How long the container may take to answer a ping.
    pub ping_timeout: Duration,
    pub supervisor: SupervisorSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(5),
            supervisor: SupervisorSettings::default(),
        }
    }
}

/// Non-protocol output of the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub lines: Vec<LogLine>,
    pub time: DateTime<Utc>,
}

#[derive(Debug)]
struct Liveness {
    last_client_message: Instant,
    last_server_message: Instant,
    last_ping_sent: Option<Instant>,
}

struct SessionInner {
    id: String,
    container: ContainerSupervisor,
    settings: SessionSettings,
    outgoing: Arc<Subscribers<JsonRpcMessage>>,
    logs: Arc<Subscribers<LogBatch>>,
    closes: Arc<Subscribers<CloseEvent>>,
    to_container: mpsc::UnboundedSender<JsonRpcMessage>,
    liveness: Mutex<Liveness>,
    ping_counter: AtomicU64,
    stopped: AtomicBool,
    disposed: AtomicBool,
    closed: watch::Sender<Option<CloseEvent>>,
    /// Writer and liveness tasks, aborted on dispose.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    fn liveness(&self) -> std::sync::MutexGuard<'_, Liveness> {
        self.liveness.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_ping_id(&self) -> String {
        let n = self.ping_counter.fetch_add(1, Ordering::Relaxed);
        format!("{PING_ID_PREFIX}{}/{n}", self.id)
    }

    fn handle_output(&self, batch: OutputBatch) {
        let mut logs = Vec::new();
        for line in batch.lines {
            if batch.stream == LogStream::Stdout
                && let Some(message) = JsonRpcMessage::parse_line(&line)
            {
                self.handle_container_message(message);
                continue;
            }
            debug!("[{} {:?}] {}", self.id, batch.stream, line);
            logs.push(LogLine {
                stream: batch.stream,
                line,
            });
        }

        if !logs.is_empty() {
            self.logs.emit(LogBatch {
                lines: logs,
                time: Utc::now(),
            });
        }
    }

    fn handle_container_message(&self, message: JsonRpcMessage) {
        self.liveness().last_server_message = Instant::now();

        if message.is_ping_request() {
            if let Some(id) = message.id().cloned() {
                let _ = self.to_container.send(JsonRpcMessage::ping_response(id));
            }
            return;
        }
        if message.is_internal_ping() {
            return;
        }

        self.outgoing.emit(message);
    }

    /// One liveness tick: check both sides, then ping both.
    fn check_liveness(&self, now: Instant) -> Option<CloseReason> {
        {
            let mut liveness = self.liveness();

            if now.duration_since(liveness.last_client_message) > self.settings.ping_interval {
                return Some(CloseReason::ClientTimeout);
            }

            if let Some(sent) = liveness.last_ping_sent
                && liveness.last_server_message < sent
                && now.duration_since(sent) > self.settings.ping_timeout
            {
                return Some(CloseReason::ServerTimeout);
            }

            liveness.last_ping_sent = Some(now);
        }

        let _ = self
            .to_container
            .send(JsonRpcMessage::ping_request(self.next_ping_id()));
        self.outgoing
            .emit(JsonRpcMessage::ping_request(self.next_ping_id()));
        None
    }

    /// Runs once: abort timers, publish the close event, drop all listeners.
    fn dispose(&self, event: CloseEvent) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }

        info!(
            "Session {} closed: reason={}, exit_code={:?}",
            self.id, event.reason, event.exit_code
        );
        self.closed.send_replace(Some(event));
        self.closes.emit(event);

        self.outgoing.clear();
        self.logs.clear();
        self.closes.clear();
    }
}

/// Handle to a session; cheap to clone.
#[derive(Clone)]
pub struct McpSession {
    inner: Arc<SessionInner>,
}

impl McpSession {
    /// Create the session and start its container.
    pub fn start(
        id: impl Into<String>,
        runtime: Arc<dyn ContainerRuntimeApi>,
        spec: RunSpec,
        settings: SessionSettings,
    ) -> Self {
        let id = id.into();
        let (container, output) =
            ContainerSupervisor::start(runtime, spec, settings.supervisor.clone());
        let (to_container, to_container_rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        debug!("Session {} uses container {}", id, container.name());

        let inner = Arc::new(SessionInner {
            id,
            container,
            settings,
            outgoing: Subscribers::new(),
            logs: Subscribers::new(),
            closes: Subscribers::new(),
            to_container,
            liveness: Mutex::new(Liveness {
                last_client_message: now,
                last_server_message: now,
                last_ping_sent: None,
            }),
            ping_counter: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            closed: watch::Sender::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        tokio::spawn(run_output_pump(Arc::clone(&inner), output));
        let writer = tokio::spawn(run_container_writer(Arc::clone(&inner), to_container_rx));
        let liveness = tokio::spawn(run_liveness(Arc::clone(&inner)));

        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(writer);
            tasks.push(liveness);
        }
        // A start failure may already have disposed the session.
        if inner.disposed.load(Ordering::SeqCst) {
            for task in inner
                .tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .drain(..)
            {
                task.abort();
            }
        }

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn container(&self) -> &ContainerSupervisor {
        &self.inner.container
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Feed client messages into the session.
    ///
    /// Pings are answered directly, answers to runner pings are swallowed,
    /// everything else is queued for the container in order.
    pub fn incoming_message(&self, messages: Vec<JsonRpcMessage>) {
        if self.is_stopped() {
            debug!(
                "Session {} is stopped, dropping {} message(s)",
                self.inner.id,
                messages.len()
            );
            return;
        }

        self.inner.liveness().last_client_message = Instant::now();

        for message in messages {
            if message.is_ping_request() {
                if let Some(id) = message.id().cloned() {
                    self.inner.outgoing.emit(JsonRpcMessage::ping_response(id));
                }
                continue;
            }
            if message.is_internal_ping() {
                continue;
            }
            let _ = self.inner.to_container.send(message);
        }
    }

    /// Protocol messages for the client, in container output order.
    pub fn subscribe_outgoing(&self) -> Subscription<JsonRpcMessage> {
        self.inner.outgoing.subscribe()
    }

    pub fn subscribe_logs(&self) -> Subscription<LogBatch> {
        self.inner.logs.subscribe()
    }

    /// Yields the close event once, then ends.
    pub fn subscribe_close(&self) -> Subscription<CloseEvent> {
        self.inner.closes.subscribe()
    }

    pub fn close_event(&self) -> Option<CloseEvent> {
        *self.inner.closed.borrow()
    }

    /// Resolves once the session is closed.
    pub async fn wait_closed(&self) -> CloseEvent {
        let mut rx = self.inner.closed.subscribe();
        let event = rx.wait_for(Option::is_some).await.ok().and_then(|event| *event);
        event.unwrap_or(CloseEvent {
            reason: CloseReason::ServerStopped,
            exit_code: None,
        })
    }

    /// Stop on request.
    pub async fn stop(&self) {
        self.stop_with(CloseReason::ServerStopped).await
    }

    /// Stop with a specific reason. Only the first call has any effect.
    pub async fn stop_with(&self, reason: CloseReason) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping session {} ({})", self.inner.id, reason);
        self.inner.dispose(CloseEvent {
            reason,
            exit_code: None,
        });
        self.inner.container.stop_and_remove().await;
    }
}

async fn run_output_pump(
    inner: Arc<SessionInner>,
    mut output: mpsc::UnboundedReceiver<OutputBatch>,
) {
    let event = loop {
        tokio::select! {
            biased;
            batch = output.recv() => match batch {
                Some(batch) => inner.handle_output(batch),
                None => break inner.container.wait_closed().await,
            },
            event = inner.container.wait_closed() => {
                while let Ok(batch) = output.try_recv() {
                    inner.handle_output(batch);
                }
                break event;
            }
        }
    };

    inner.dispose(event);
    inner.container.stop_and_remove().await;
}

async fn run_container_writer(
    inner: Arc<SessionInner>,
    mut messages: mpsc::UnboundedReceiver<JsonRpcMessage>,
) {
    if inner.container.wait_for_handle().await.is_none() {
        return;
    }

    while let Some(message) = messages.recv().await {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", inner.id, e);
                continue;
            }
        };
        inner.container.write_line(&line).await;
    }
}

async fn run_liveness(inner: Arc<SessionInner>) {
    if inner.container.wait_for_handle().await.is_none() {
        return;
    }

    {
        let now = Instant::now();
        let mut liveness = inner.liveness();
        liveness.last_client_message = now;
        liveness.last_server_message = now;
        liveness.last_ping_sent = None;
    }

    let mut ticker = tokio::time::interval(inner.settings.ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Some(reason) = inner.check_liveness(Instant::now()) {
            warn!("Session {} failed liveness check: {}", inner.id, reason);
            // Stopping aborts this task, so it has to happen elsewhere.
            let session = McpSession {
                inner: Arc::clone(&inner),
            };
            tokio::spawn(async move { session.stop_with(reason).await });
            return;
        }
    }
}
