//! Launch parameter resolution.
//!
//! Job configurations may carry a user-authored JavaScript snippet that turns
//! a JSON config into `{command, args?, env?}`. The snippet is untrusted, so it
//! runs in a separate Deno process with every permission denied except
//! reading its own harness file, a capped heap and a hard deadline.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

use mcp_runner_protocol::{LaunchParams, LaunchParamsRequest, LaunchParamsResponse};

const HARNESS_TEMPLATE: &str = include_str!("harness.js");

/// Name shown instead of the temporary harness path in diagnostics.
const HARNESS_DISPLAY_NAME: &str = "launcher.js";

/// Exit statuses of `timeout(1)` when it had to stop the command.
const TIMEOUT_EXIT_CODES: [i32; 2] = [124, 137];

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Deno executable.
    pub deno_binary: String,
    /// Wall-clock limit for one evaluation.
    pub timeout_secs: u64,
    /// V8 old-space cap in megabytes.
    pub max_heap_mb: u32,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            deno_binary: "deno".to_string(),
            timeout_secs: 5,
            max_heap_mb: 20,
        }
    }
}

/// Why a launch script produced no usable parameters.
///
/// The display text is the diagnostic sent back to the control plane.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to run launcher sandbox: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode launcher input: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Launcher script timed out after {seconds}s\n{output}")]
    Timeout { seconds: u64, output: String },

    #[error("{output}")]
    ScriptFailed { output: String },

    #[error("No output from launcher script:\n{output}")]
    NoOutput { output: String },

    #[error("Failed to parse output from launcher script:\n{output}")]
    MalformedOutput { output: String },

    #[error("Invalid launch parameters: {}", .0.join("; "))]
    InvalidParams(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct HarnessOutput {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

/// Evaluates launch scripts in the Deno sandbox.
#[derive(Debug, Clone)]
pub struct LaunchParamsResolver {
    config: LauncherConfig,
    /// Whether `timeout(1)` is available to enforce the deadline from outside.
    timeout_utility: bool,
}

impl LaunchParamsResolver {
    pub fn new(config: LauncherConfig) -> Self {
        let timeout_utility = crate::container::ContainerRuntime::is_binary_available("timeout");
        if !timeout_utility {
            warn!("timeout(1) not found; launcher deadline is enforced in-process only");
        }
        Self {
            config,
            timeout_utility,
        }
    }

    /// Whether the configured Deno binary is installed.
    pub fn is_available(&self) -> bool {
        crate::container::ContainerRuntime::is_binary_available(&self.config.deno_binary)
    }

    /// Resolve and convert to the wire response.
    pub async fn respond(&self, request: &LaunchParamsRequest) -> LaunchParamsResponse {
        match self.resolve(request).await {
            Ok(params) => LaunchParamsResponse::Success(params),
            Err(e) => {
                debug!("Launch parameter resolution failed: {}", e);
                LaunchParamsResponse::Error(e.to_string())
            }
        }
    }

    pub async fn resolve(&self, request: &LaunchParamsRequest) -> Result<LaunchParams, LaunchError> {
        let harness = render_harness(&request.get_launch_params, &request.config)?;

        let mut file = tempfile::Builder::new()
            .prefix("mcp-runner-launcher-")
            .suffix(".js")
            .tempfile()?;
        file.write_all(harness.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().to_string();

        let mut command = if self.timeout_utility {
            let mut command = Command::new("timeout");
            command
                .arg("--signal=KILL")
                .arg(format!("{}s", self.config.timeout_secs))
                .arg(&self.config.deno_binary);
            command
        } else {
            Command::new(&self.config.deno_binary)
        };

        command
            .args([
                "run".to_string(),
                "--quiet".to_string(),
                "--no-prompt".to_string(),
                "--no-config".to_string(),
                format!("--v8-flags=--max-old-space-size={}", self.config.max_heap_mb),
                format!("--allow-read={path}"),
                "--deny-write".to_string(),
                "--deny-env".to_string(),
                "--deny-sys".to_string(),
                "--deny-net".to_string(),
                "--deny-run".to_string(),
                "--deny-ffi".to_string(),
                path.clone(),
            ])
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn()?;

        // The outer deadline gets a small grace period so that timeout(1), when
        // present, is the one that fires.
        let deadline = Duration::from_secs(self.config.timeout_secs) + Duration::from_secs(1);
        let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                return Err(LaunchError::Timeout {
                    seconds: self.config.timeout_secs,
                    output: String::new(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).replace(&path, HARNESS_DISPLAY_NAME);
        let stderr = String::from_utf8_lossy(&output.stderr).replace(&path, HARNESS_DISPLAY_NAME);
        let combined = format!("{stdout}\n{stderr}").trim().to_string();

        if !output.status.success() {
            if self.timeout_utility
                && output
                    .status
                    .code()
                    .is_some_and(|code| TIMEOUT_EXIT_CODES.contains(&code))
            {
                return Err(LaunchError::Timeout {
                    seconds: self.config.timeout_secs,
                    output: combined,
                });
            }
            return Err(LaunchError::ScriptFailed {
                output: if combined.is_empty() {
                    format!("Launcher script exited with {}", output.status)
                } else {
                    combined
                },
            });
        }

        let data = parse_harness_output(&stdout, &combined)?;
        validate_launch_params(&data).map_err(LaunchError::InvalidParams)
    }
}

/// Fill the harness template. Both values are embedded as JSON literals.
fn render_harness(script: &str, config: &Value) -> Result<String, LaunchError> {
    let script = serde_json::to_string(script)?;
    let config = match config {
        Value::Null => "{}".to_string(),
        other => serde_json::to_string(other)?,
    };
    // The script placeholder goes first: it comes after the config one in the
    // template, so neither value can be mistaken for a placeholder.
    Ok(HARNESS_TEMPLATE
        .replacen("__SCRIPT__", &script, 1)
        .replacen("__CONFIG__", &config, 1))
}

/// Read the harness result from the last non-empty stdout line.
fn parse_harness_output(stdout: &str, combined: &str) -> Result<Value, LaunchError> {
    let Some(last_line) = stdout.lines().map(str::trim).rfind(|line| !line.is_empty()) else {
        return Err(LaunchError::NoOutput {
            output: combined.to_string(),
        });
    };

    let parsed: HarnessOutput =
        serde_json::from_str(last_line).map_err(|_| LaunchError::MalformedOutput {
            output: combined.to_string(),
        })?;

    if parsed.kind != "success" {
        return Err(LaunchError::ScriptFailed {
            output: format!("Launcher script returned error: {}", parsed.data),
        });
    }

    Ok(parsed.data)
}

/// Check a script result against `{command: string, args?: string[], env?: {string: string}}`.
///
/// Every problem is reported, not just the first one.
pub fn validate_launch_params(data: &Value) -> Result<LaunchParams, Vec<String>> {
    let Some(object) = data.as_object() else {
        return Err(vec![format!(
            "expected an object with a `command` string, got {}",
            type_name(data)
        )]);
    };

    let mut failures = Vec::new();

    let command = match object.get("command") {
        Some(Value::String(command)) if !command.trim().is_empty() => command.clone(),
        Some(Value::String(_)) => {
            failures.push("`command` must not be empty".to_string());
            String::new()
        }
        Some(other) => {
            failures.push(format!("`command` must be a string, got {}", type_name(other)));
            String::new()
        }
        None => {
            failures.push("`command` is required".to_string());
            String::new()
        }
    };

    let mut args = Vec::new();
    match object.get("args") {
        None | Some(Value::Null) => {}
        Some(Value::Array(items)) => {
            for (index, item) in items.iter().enumerate() {
                match item {
                    Value::String(arg) => args.push(arg.clone()),
                    other => failures.push(format!(
                        "`args[{index}]` must be a string, got {}",
                        type_name(other)
                    )),
                }
            }
        }
        Some(other) => failures.push(format!(
            "`args` must be an array of strings, got {}",
            type_name(other)
        )),
    }

    let mut env = BTreeMap::new();
    match object.get("env") {
        None | Some(Value::Null) => {}
        Some(Value::Object(entries)) => {
            for (key, value) in entries {
                match value {
                    Value::String(value) => {
                        env.insert(key.clone(), value.clone());
                    }
                    other => failures.push(format!(
                        "`env.{key}` must be a string, got {}",
                        type_name(other)
                    )),
                }
            }
        }
        Some(other) => failures.push(format!(
            "`env` must be an object of strings, got {}",
            type_name(other)
        )),
    }

    if failures.is_empty() {
        Ok(LaunchParams { command, args, env })
    } else {
        Err(failures)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
