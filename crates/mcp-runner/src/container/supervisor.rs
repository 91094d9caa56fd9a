//! Lifecycle of a single container.
//!
//! `starting → running → closed`. A supervisor pulls the image, spawns the
//! `run` subprocess, polls the runtime until the container is discoverable
//! by name, and emits exactly one [`CloseEvent`] when it is over.

use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use mcp_runner_protocol::{CloseReason, LogStream};

use super::image::{RunSpec, generate_container_name};
use super::stream::{OutputBatch, StreamBridge};
use super::{ContainerProcess, ContainerRuntimeApi};

/// Timing knobs of a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// How often the runtime is asked for the container handle.
    pub start_poll_attempts: u32,
    pub start_poll_interval: Duration,
    /// Exits faster than this count as failures even with status 0.
    pub min_healthy_uptime: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            start_poll_attempts: 40,
            start_poll_interval: Duration::from_millis(250),
            min_healthy_uptime: Duration::from_millis(2500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Closed,
}

/// Terminal event of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseEvent {
    pub reason: CloseReason,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HandleState {
    Pending,
    Resolved(String),
    /// Resolution finished without a handle.
    Unavailable,
}

/// Classify how a container process ended.
pub fn classify_exit(
    stop_requested: bool,
    exit_code: Option<i32>,
    uptime: Duration,
    min_healthy_uptime: Duration,
) -> CloseReason {
    if stop_requested {
        CloseReason::ServerStopped
    } else if uptime < min_healthy_uptime || exit_code != Some(0) {
        CloseReason::ServerExitedError
    } else {
        CloseReason::ServerExitedSuccess
    }
}

struct SupervisorInner {
    name: String,
    runtime: Arc<dyn ContainerRuntimeApi>,
    settings: SupervisorSettings,
    handle: watch::Sender<HandleState>,
    state: watch::Sender<SupervisorState>,
    closed: watch::Sender<Option<CloseEvent>>,
    stop_requested: AtomicBool,
    removal_started: AtomicBool,
    bridge: OnceLock<StreamBridge>,
}

impl SupervisorInner {
    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    fn emit_close(&self, reason: CloseReason, exit_code: Option<i32>) {
        let event = CloseEvent { reason, exit_code };
        let emitted = self.closed.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(event);
            true
        });

        if emitted {
            self.state.send_replace(SupervisorState::Closed);
            info!(
                "Container {} closed: reason={}, exit_code={:?}",
                self.name, reason, exit_code
            );
        }
    }

    fn fail_start(&self, reason: CloseReason) {
        self.handle.send_replace(HandleState::Unavailable);
        self.emit_close(reason, None);
    }

    async fn resolve_handle(&self) -> Option<String> {
        let attempts = self.settings.start_poll_attempts.max(1);
        for attempt in 1..=attempts {
            match self.runtime.find_container(&self.name).await {
                Ok(Some(handle)) => return Some(handle),
                Ok(None) => debug!(
                    "Container {} not visible yet (attempt {}/{})",
                    self.name, attempt, attempts
                ),
                Err(e) => warn!("Failed to look up container {}: {}", self.name, e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.start_poll_interval).await;
            }
        }
        None
    }
}

/// Owns one container from pull to removal.
#[derive(Clone)]
pub struct ContainerSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ContainerSupervisor {
    /// Start the container lifecycle in the background.
    ///
    /// Returns the supervisor and the channel on which stdout/stderr batches
    /// arrive. The channel ends once both streams are exhausted.
    pub fn start(
        runtime: Arc<dyn ContainerRuntimeApi>,
        spec: RunSpec,
        settings: SupervisorSettings,
    ) -> (Self, mpsc::UnboundedReceiver<OutputBatch>) {
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(SupervisorInner {
            name: generate_container_name(),
            runtime,
            settings,
            handle: watch::Sender::new(HandleState::Pending),
            state: watch::Sender::new(SupervisorState::Starting),
            closed: watch::Sender::new(None),
            stop_requested: AtomicBool::new(false),
            removal_started: AtomicBool::new(false),
            bridge: OnceLock::new(),
        });

        tokio::spawn(run_lifecycle(Arc::clone(&inner), spec, batches_tx));

        (Self { inner }, batches_rx)
    }

    /// Generated container name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Runtime handle, once resolved.
    pub fn handle(&self) -> Option<String> {
        match &*self.inner.handle.borrow() {
            HandleState::Resolved(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Wait until handle resolution finishes; `None` if it never succeeded.
    pub async fn wait_for_handle(&self) -> Option<String> {
        let mut rx = self.inner.handle.subscribe();
        let state = rx
            .wait_for(|state| !matches!(state, HandleState::Pending))
            .await
            .map(|state| state.clone())
            .unwrap_or(HandleState::Unavailable);
        match state {
            HandleState::Resolved(handle) => Some(handle),
            _ => None,
        }
    }

    /// Write one line to the container's stdin.
    ///
    /// Returns `false` if the process is not (or no longer) writable.
    pub async fn write_line(&self, line: &str) -> bool {
        match self.inner.bridge.get() {
            Some(bridge) => bridge.write_line(line).await,
            None => {
                debug!("Container {} has no stdin yet", self.inner.name);
                false
            }
        }
    }

    /// Recent output lines of a stream.
    pub fn history(&self, stream: LogStream) -> Vec<String> {
        self.inner
            .bridge
            .get()
            .map(|bridge| bridge.history(stream))
            .unwrap_or_default()
    }

    /// Stop and remove the container.
    ///
    /// Idempotent. Waits for handle resolution and does nothing when no
    /// handle was ever obtained.
    pub async fn stop_and_remove(&self) {
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        if self.inner.removal_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let Some(handle) = self.wait_for_handle().await else {
            debug!(
                "Container {} never resolved, nothing to remove",
                self.inner.name
            );
            return;
        };

        info!("Stopping container {} ({})", self.inner.name, handle);
        self.inner.runtime.stop_and_remove_container(&handle).await;
    }

    pub fn close_event(&self) -> Option<CloseEvent> {
        *self.inner.closed.borrow()
    }

    /// Resolves with the close event; safe to await from any number of tasks.
    pub async fn wait_closed(&self) -> CloseEvent {
        let mut rx = self.inner.closed.subscribe();
        let event = rx.wait_for(Option::is_some).await.ok().and_then(|event| *event);
        event.unwrap_or(CloseEvent {
            reason: CloseReason::ServerStopped,
            exit_code: None,
        })
    }
}

async fn run_lifecycle(
    inner: Arc<SupervisorInner>,
    spec: RunSpec,
    batches: mpsc::UnboundedSender<OutputBatch>,
) {
    let image = spec.image_reference();
    if let Err(e) = inner.runtime.pull_image(&image).await {
        error!("Failed to pull {} for {}: {}", image, inner.name, e);
        inner.fail_start(CloseReason::ServerFailedToStart);
        return;
    }

    if inner.stop_requested() {
        debug!("Stop requested before {} was spawned", inner.name);
        inner.fail_start(CloseReason::ServerStopped);
        return;
    }

    let started_at = Instant::now();
    let ContainerProcess {
        stdin,
        stdout,
        stderr,
        mut exit,
    } = match inner.runtime.spawn_container(&inner.name, &spec) {
        Ok(process) => process,
        Err(e) => {
            error!("Failed to spawn container {}: {}", inner.name, e);
            inner.fail_start(CloseReason::ServerFailedToStart);
            return;
        }
    };

    // Only this task sets the bridge, once.
    let _ = inner
        .bridge
        .set(StreamBridge::spawn(stdin, stdout, stderr, batches));

    let resolved = tokio::select! {
        handle = inner.resolve_handle() => handle,
        exit_code = &mut exit => {
            inner.handle.send_replace(HandleState::Unavailable);
            let reason = classify_exit(
                inner.stop_requested(),
                exit_code,
                started_at.elapsed(),
                inner.settings.min_healthy_uptime,
            );
            inner.emit_close(reason, exit_code);
            return;
        }
    };

    let Some(handle) = resolved else {
        error!(
            "Container {} did not become visible after {} attempts",
            inner.name, inner.settings.start_poll_attempts
        );
        // Dropping the exit future kills the `run` process.
        drop(exit);
        inner.fail_start(CloseReason::ServerFailedToStart);
        return;
    };

    info!("Container {} is running ({})", inner.name, handle);
    inner.handle.send_replace(HandleState::Resolved(handle));
    inner.state.send_replace(SupervisorState::Running);

    let exit_code = exit.await;
    let reason = classify_exit(
        inner.stop_requested(),
        exit_code,
        started_at.elapsed(),
        inner.settings.min_healthy_uptime,
    );
    inner.emit_close(reason, exit_code);
}
