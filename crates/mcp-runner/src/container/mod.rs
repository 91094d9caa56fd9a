//! Container runtime management module.
//!
//! Provides an async interface to run MCP server containers via the Docker or
//! Podman CLI. The runtime is auto-detected or can be configured explicitly.

mod error;
pub mod image;
pub mod stream;
pub mod supervisor;

pub use error::{ContainerError, ContainerResult};
pub use image::{ResourceLimits, RunSpec};
pub use stream::{BoxedReader, BoxedWriter, OutputBatch, StreamBridge};
pub use supervisor::{CloseEvent, ContainerSupervisor, SupervisorSettings};

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use image::{
    build_run_args, is_benign_cleanup_error, registry_host, resolve_image_reference,
    validate_container_name, validate_image_name,
};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    #[default]
    Docker,
    Podman,
}

impl RuntimeType {
    /// Get the default binary name for this runtime.
    pub fn default_binary(&self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "docker"),
            RuntimeType::Podman => write!(f, "podman"),
        }
    }
}

/// Credentials for pulling from a private registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub username: String,
    pub password: String,
}

/// A running container process with its stdio.
pub struct ContainerProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
    /// Resolves with the exit code. Dropping it kills the process.
    pub exit: BoxFuture<'static, Option<i32>>,
}

/// Container runtime abstraction for testability.
///
/// One instance is shared by every supervisor, so implementations must be
/// safe for concurrent use.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Pull an image, appending the default tag when none is present.
    async fn pull_image(&self, image: &str) -> ContainerResult<()>;

    /// Start `run` for a spec under the given container name.
    fn spawn_container(&self, name: &str, spec: &RunSpec) -> ContainerResult<ContainerProcess>;

    /// Look up the runtime handle of a container by name.
    ///
    /// Returns `Ok(None)` while the container is not (yet) known.
    async fn find_container(&self, name: &str) -> ContainerResult<Option<String>>;

    /// Stop, then remove. Best effort: failures are logged, never returned.
    async fn stop_and_remove_container(&self, handle: &str);
}

/// Container runtime client backed by the docker/podman CLI.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    /// The runtime type (docker or podman)
    runtime_type: RuntimeType,
    /// Path to the container binary
    binary: String,
    limits: ResourceLimits,
    credentials: Option<RegistryCredentials>,
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        self.pull_image(image).await
    }

    fn spawn_container(&self, name: &str, spec: &RunSpec) -> ContainerResult<ContainerProcess> {
        self.spawn_container(name, spec)
    }

    async fn find_container(&self, name: &str) -> ContainerResult<Option<String>> {
        self.find_container(name).await
    }

    async fn stop_and_remove_container(&self, handle: &str) {
        self.stop_and_remove_container(handle).await
    }
}

impl ContainerRuntime {
    /// Create a container runtime by auto-detection.
    ///
    /// Tries Docker first, then Podman.
    pub fn detect() -> ContainerResult<Self> {
        [RuntimeType::Docker, RuntimeType::Podman]
            .into_iter()
            .find(|runtime_type| Self::is_binary_available(runtime_type.default_binary()))
            .map(Self::with_type)
            .ok_or(ContainerError::NoRuntimeAvailable)
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self::with_binary(runtime_type, runtime_type.default_binary())
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
            limits: ResourceLimits::default(),
            credentials: None,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_credentials(mut self, credentials: Option<RegistryCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Get the runtime type.
    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    /// Check if a binary is available in PATH.
    pub(crate) fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run a runtime subcommand to completion and fail on non-zero exit.
    async fn run_command(&self, command: &str, args: &[&str]) -> ContainerResult<Output> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::command_failed(command, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::command_failed(command, stderr.trim()));
        }

        Ok(output)
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> ContainerResult<String> {
        let output = self
            .run_command("version", &["version", "--format", "json"])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Log in to the registry serving `image`. The password goes over stdin.
    pub async fn login(
        &self,
        image: &str,
        credentials: &RegistryCredentials,
    ) -> ContainerResult<()> {
        let mut args = vec!["login"];
        if let Some(registry) = registry_host(image) {
            args.push(registry);
        }
        args.extend(["--username", credentials.username.as_str(), "--password-stdin"]);

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::command_failed("login", e))?;

        let mut stdin = child.stdin.take().ok_or(ContainerError::MissingPipe("stdin"))?;
        stdin.write_all(credentials.password.as_bytes()).await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ContainerError::command_failed("login", e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ContainerError::command_failed("login", stderr.trim()));
        }

        Ok(())
    }

    /// Pull an image, logging in first when credentials are configured.
    pub async fn pull_image(&self, image: &str) -> ContainerResult<()> {
        let reference = resolve_image_reference(image, None);
        validate_image_name(&reference)?;

        if let Some(credentials) = &self.credentials {
            self.login(&reference, credentials).await?;
        }

        info!("Pulling image {}", reference);
        self.run_command("pull", &["pull", &reference]).await?;
        Ok(())
    }

    /// Spawn `run` for a spec. The process is killed when its exit future
    /// is dropped.
    pub fn spawn_container(&self, name: &str, spec: &RunSpec) -> ContainerResult<ContainerProcess> {
        let args = build_run_args(spec, name, &self.limits)?;
        debug!(
            "Spawning {} as {} running {}",
            spec.image_reference(),
            name,
            spec.command_line().unwrap_or_else(|_| spec.command.clone())
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ContainerError::command_failed("run", e))?;

        let stdin = child.stdin.take().ok_or(ContainerError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(ContainerError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(ContainerError::MissingPipe("stderr"))?;

        let container = name.to_string();
        let exit = Box::pin(async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("Failed to wait for container {}: {}", container, e);
                    None
                }
            }
        });

        Ok(ContainerProcess {
            stdin: Box::pin(stdin),
            stdout: Box::pin(stdout),
            stderr: Box::pin(stderr),
            exit,
        })
    }

    /// Resolve a container name to its runtime id via `inspect`.
    ///
    /// Returns `Ok(None)` when the container does not exist.
    pub async fn find_container(&self, name: &str) -> ContainerResult<Option<String>> {
        validate_container_name(name)?;

        let output = Command::new(&self.binary)
            .args(["inspect", "--format", "{{.Id}}", name])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::command_failed("inspect", e))?;

        if !output.status.success() {
            // Container not found is not an error; callers treat it as missing.
            return Ok(None);
        }

        let id = String::from_utf8_lossy(&output.stdout)
            .trim()
            .trim_matches('"')
            .to_string();
        if id.is_empty() {
            return Ok(None);
        }

        Ok(Some(id))
    }

    /// Stop a running container.
    pub async fn stop_container(&self, handle: &str) -> ContainerResult<()> {
        validate_container_name(handle)?;
        self.run_command("stop", &["stop", handle]).await?;
        Ok(())
    }

    /// Force-remove a container.
    pub async fn remove_container(&self, handle: &str) -> ContainerResult<()> {
        validate_container_name(handle)?;
        self.run_command("rm", &["rm", "-f", handle]).await?;
        Ok(())
    }

    /// Stop then remove, treating "already gone" races as success.
    pub async fn stop_and_remove_container(&self, handle: &str) {
        if let Err(e) = self.stop_container(handle).await {
            log_cleanup_error(handle, &e);
        }
        if let Err(e) = self.remove_container(handle).await {
            log_cleanup_error(handle, &e);
        }
    }
}

fn log_cleanup_error(handle: &str, error: &ContainerError) {
    match error {
        ContainerError::CommandFailed { message, .. } if is_benign_cleanup_error(message) => {
            debug!("Container {} already gone: {}", handle, message);
        }
        other => warn!("Failed to clean up container {}: {}", handle, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_container_runtime_health_check() {
        // This test will only pass if docker or podman is installed
        let Ok(runtime) = ContainerRuntime::detect() else {
            return;
        };
        if let Ok(version) = runtime.health_check().await {
            assert!(!version.is_empty());
        }
    }

    #[test]
    fn test_detect_matches_installed_binaries() {
        let installed = ContainerRuntime::is_binary_available("docker")
            || ContainerRuntime::is_binary_available("podman");
        match ContainerRuntime::detect() {
            Ok(_) => assert!(installed),
            Err(e) => {
                assert!(!installed);
                assert!(matches!(e, ContainerError::NoRuntimeAvailable));
            }
        }
    }

    #[test]
    fn test_runtime_type_binaries() {
        assert_eq!(RuntimeType::Docker.default_binary(), "docker");
        assert_eq!(RuntimeType::Podman.default_binary(), "podman");
        assert_eq!(RuntimeType::default(), RuntimeType::Docker);
    }

    #[tokio::test]
    async fn test_find_container_rejects_invalid_names() {
        let runtime = ContainerRuntime::with_type(RuntimeType::Docker);
        assert!(matches!(
            runtime.find_container("--all").await,
            Err(ContainerError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_with_missing_binary_fails() {
        let runtime = ContainerRuntime::with_binary(RuntimeType::Docker, "/nonexistent/docker");
        let spec = RunSpec {
            image: "demo/server".to_string(),
            tag: None,
            command: "run".to_string(),
            args: vec![],
            env: Default::default(),
        };
        let result = runtime.spawn_container("mcp-run-test", &spec);
        assert!(matches!(result, Err(ContainerError::CommandFailed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_passes_each_argument_separately() {
        use std::os::unix::fs::PermissionsExt;
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("fake-docker");
        std::fs::write(&binary, "#!/bin/sh\nfor arg in \"$@\"; do echo \"[$arg]\"; done\n").unwrap();
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runtime = ContainerRuntime::with_binary(RuntimeType::Docker, binary.to_string_lossy());
        let spec = RunSpec {
            image: "demo/server".to_string(),
            tag: None,
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-everything".to_string(),
                "two words".to_string(),
            ],
            env: Default::default(),
        };
        let mut process = runtime.spawn_container("mcp-run-test", &spec).unwrap();

        let mut printed = String::new();
        process.stdout.read_to_string(&mut printed).await.unwrap();
        assert_eq!(process.exit.await, Some(0));

        let tail: Vec<&str> = printed
            .lines()
            .skip_while(|line| *line != "[demo/server:latest]")
            .collect();
        assert_eq!(
            tail,
            vec![
                "[demo/server:latest]",
                "[npx]",
                "[-y]",
                "[@modelcontextprotocol/server-everything]",
                "[two words]",
            ]
        );
    }
}
