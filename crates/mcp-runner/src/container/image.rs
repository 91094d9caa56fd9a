//! Run specifications, image references and `run` argument composition.
//!
//! Everything in here is pure so the exact CLI invocation can be tested
//! without a container runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use mcp_runner_protocol::{JobSource, StartJobRequest};

use super::error::{ContainerError, ContainerResult};

/// Tag appended to image references that carry none.
pub const DEFAULT_TAG: &str = "latest";

/// Prefix of generated container names.
pub const CONTAINER_NAME_PREFIX: &str = "mcp-run-";

const NAME_ALPHABET: [char; 36] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's',
    't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4', '5', '6', '7', '8', '9',
];

/// What to run for one session. Immutable once the session exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSpec {
    pub image: String,
    /// Explicit tag; replaces any tag embedded in `image`.
    #[serde(default)]
    pub tag: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl RunSpec {
    pub fn from_job(job: &StartJobRequest) -> Self {
        let JobSource::Docker { image, tag } = &job.source;
        Self {
            image: image.clone(),
            tag: tag.clone(),
            command: job.launch_params.command.clone(),
            args: job.launch_params.args.clone(),
            env: job.launch_params.env.clone(),
        }
    }

    /// Image reference with the tag substitution applied.
    pub fn image_reference(&self) -> String {
        resolve_image_reference(&self.image, self.tag.as_deref())
    }

    /// Command followed by its args, one argv element each.
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.command.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// Command and args as one shell-quoted string, for logs.
    pub fn command_line(&self) -> ContainerResult<String> {
        shlex::try_join(self.argv()).map_err(|e| {
            ContainerError::InvalidInput(format!("command cannot be quoted: {e}"))
        })
    }

    /// Validate all inputs that end up on the runtime command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image_reference())?;

        if let Some(tag) = &self.tag {
            validate_tag(tag)?;
        }

        if self.command.trim().is_empty() {
            return Err(ContainerError::InvalidInput(
                "command cannot be empty".to_string(),
            ));
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        Ok(())
    }
}

/// CPU and memory ceilings applied to every container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Value for `--cpus`.
    pub cpus: String,
    /// Value for `--memory`.
    pub memory: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: "0.25".to_string(),
            memory: "250m".to_string(),
        }
    }
}

/// Generate a unique container name.
pub fn generate_container_name() -> String {
    format!(
        "{CONTAINER_NAME_PREFIX}{}",
        nanoid::nanoid!(16, &NAME_ALPHABET)
    )
}

/// Split an image reference into its name and embedded tag.
///
/// Only a `:` after the last `/` starts a tag, so registry ports
/// (`localhost:5000/app`) are left alone.
fn split_tag(image: &str) -> (&str, Option<&str>) {
    let last_segment = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[last_segment..].rfind(':') {
        Some(i) => {
            let colon = last_segment + i;
            (&image[..colon], Some(&image[colon + 1..]))
        }
        None => (image, None),
    }
}

/// Apply tag rules to an image reference.
///
/// - an explicit tag replaces whatever tag the image carries
/// - without an explicit tag, an untagged image gets `:latest`
/// - digest references are pinned and left untouched unless a tag is given
pub fn resolve_image_reference(image: &str, tag: Option<&str>) -> String {
    let image = image.trim();
    let tag = tag.map(str::trim).filter(|t| !t.is_empty());

    if let Some((name, _digest)) = image.split_once('@') {
        return match tag {
            Some(tag) => format!("{}:{tag}", split_tag(name).0),
            None => image.to_string(),
        };
    }

    let (name, embedded) = split_tag(image);
    match (tag, embedded) {
        (Some(tag), _) => format!("{name}:{tag}"),
        (None, Some(_)) => image.to_string(),
        (None, None) => format!("{image}:{DEFAULT_TAG}"),
    }
}

/// Registry host of an image reference, `None` for Docker Hub.
pub fn registry_host(image: &str) -> Option<&str> {
    let (first, rest) = image.split_once('/')?;
    if rest.is_empty() {
        return None;
    }
    if first.contains('.') || first.contains(':') || first == "localhost" {
        Some(first)
    } else {
        None
    }
}

/// Compose the arguments of the runtime `run` invocation.
pub fn build_run_args(
    spec: &RunSpec,
    name: &str,
    limits: &ResourceLimits,
) -> ContainerResult<Vec<String>> {
    spec.validate()?;
    validate_container_name(name)?;

    let mut args: Vec<String> = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--interactive".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--cpus".to_string(),
        limits.cpus.clone(),
        "--memory".to_string(),
        limits.memory.clone(),
    ];

    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }

    args.push(spec.image_reference());
    args.extend(spec.argv().map(str::to_string));

    Ok(args)
}

/// Whether a stop/remove failure just means the container is already gone.
pub fn is_benign_cleanup_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    [
        "no such container",
        "not running",
        "is already stopping",
        "already stopped",
        "already in progress",
        "no container with name or id",
    ]
    .iter()
    .any(|needle| message.contains(needle))
}

/// Validate an image reference.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric()
            || c == '.'
            || c == '-'
            || c == '_'
            || c == '/'
            || c == ':'
            || c == '@'
    };

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters; only alphanumeric, '.', '-', '_', '/', ':', '@' are allowed",
            image
        )));
    }

    if image.starts_with('-') {
        return Err(ContainerError::InvalidInput(
            "image name cannot start with '-'".to_string(),
        ));
    }

    if image.contains("..") {
        return Err(ContainerError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

fn validate_tag(tag: &str) -> ContainerResult<()> {
    let tag = tag.trim();
    if tag.is_empty() {
        return Ok(());
    }

    if tag.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "image tag exceeds maximum length of 128 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_';
    if !tag.chars().all(valid_chars) || tag.starts_with(['.', '-']) {
        return Err(ContainerError::InvalidInput(format!(
            "image tag '{}' is not valid",
            tag
        )));
    }

    Ok(())
}

/// Validate a container name or runtime handle.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    if name.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) || name.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if key.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "environment variable key exceeds maximum length of 256 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '_';
    if !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters; only alphanumeric and '_' are allowed",
            key
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_spec() -> RunSpec {
        RunSpec {
            image: "demo/server".to_string(),
            tag: None,
            command: "run".to_string(),
            args: vec!["--x".to_string()],
            env: BTreeMap::from([("A".to_string(), "1".to_string())]),
        }
    }

    #[test]
    fn test_untagged_images_get_latest() {
        assert_eq!(resolve_image_reference("demo/server", None), "demo/server:latest");
        assert_eq!(resolve_image_reference("alpine", None), "alpine:latest");
        assert_eq!(
            resolve_image_reference("localhost:5000/app", None),
            "localhost:5000/app:latest"
        );
        assert_eq!(resolve_image_reference("alpine", Some("  ")), "alpine:latest");
    }

    #[test]
    fn test_embedded_tag_is_kept_without_explicit_tag() {
        assert_eq!(resolve_image_reference("node:20-slim", None), "node:20-slim");
        assert_eq!(
            resolve_image_reference("ghcr.io/org/app:1.2", None),
            "ghcr.io/org/app:1.2"
        );
    }

    #[test]
    fn test_explicit_tag_replaces_embedded_tag() {
        assert_eq!(resolve_image_reference("node:20-slim", Some("22")), "node:22");
        assert_eq!(
            resolve_image_reference("localhost:5000/app:old", Some("new")),
            "localhost:5000/app:new"
        );
        assert_eq!(
            resolve_image_reference("localhost:5000/app", Some("v2")),
            "localhost:5000/app:v2"
        );
        assert_eq!(
            resolve_image_reference("demo/server@sha256:abcd", Some("v1")),
            "demo/server:v1"
        );
    }

    #[test]
    fn test_digest_reference_untouched() {
        assert_eq!(
            resolve_image_reference("demo/server@sha256:abcd", None),
            "demo/server@sha256:abcd"
        );
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("ghcr.io/org/app:1"), Some("ghcr.io"));
        assert_eq!(registry_host("localhost:5000/app"), Some("localhost:5000"));
        assert_eq!(registry_host("localhost/app"), Some("localhost"));
        assert_eq!(registry_host("demo/server"), None);
        assert_eq!(registry_host("alpine"), None);
    }

    #[test]
    fn test_build_run_args() {
        let args = build_run_args(&demo_spec(), "mcp-run-abc", &ResourceLimits::default()).unwrap();
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--interactive",
                "--name",
                "mcp-run-abc",
                "--cpus",
                "0.25",
                "--memory",
                "250m",
                "--env",
                "A=1",
                "demo/server:latest",
                "run",
                "--x",
            ]
        );
    }

    #[test]
    fn test_run_args_keep_each_word_separate() {
        let spec = RunSpec {
            command: "npx".to_string(),
            args: vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-everything".to_string(),
                "hello world".to_string(),
                "it's".to_string(),
            ],
            env: BTreeMap::new(),
            ..demo_spec()
        };
        let args = build_run_args(&spec, "mcp-run-abc", &ResourceLimits::default()).unwrap();
        let image_at = args.iter().position(|a| a == "demo/server:latest").unwrap();
        assert_eq!(
            &args[image_at + 1..],
            ["npx", "-y", "@modelcontextprotocol/server-everything", "hello world", "it's"]
        );
    }

    #[test]
    fn test_command_line_is_shell_quoted() {
        let spec = RunSpec {
            args: vec!["--name".to_string(), "hello world".to_string(), "it's".to_string()],
            ..demo_spec()
        };
        let line = spec.command_line().unwrap();
        let words = shlex::split(&line).unwrap();
        assert_eq!(words, vec!["run", "--name", "hello world", "it's"]);
    }

    #[test]
    fn test_run_spec_from_job() {
        let job: StartJobRequest = serde_json::from_value(serde_json::json!({
            "serverRunId": "run_1",
            "source": {"type": "docker", "image": "demo/server:old", "tag": "v3"},
            "launchParams": {"command": "node", "args": ["index.js"]}
        }))
        .unwrap();
        let spec = RunSpec::from_job(&job);
        assert_eq!(spec.image_reference(), "demo/server:v3");
        assert_eq!(spec.command_line().unwrap(), "node index.js");
    }

    #[test]
    fn test_validation_rejects_injection() {
        let mut spec = demo_spec();
        spec.image = "demo/server; rm -rf /".to_string();
        assert!(spec.validate().is_err());

        let mut spec = demo_spec();
        spec.image = "--privileged".to_string();
        assert!(spec.validate().is_err());

        let mut spec = demo_spec();
        spec.env.insert("BAD-KEY".to_string(), "x".to_string());
        assert!(spec.validate().is_err());

        let mut spec = demo_spec();
        spec.tag = Some("v1 --privileged".to_string());
        assert!(spec.validate().is_err());

        let mut spec = demo_spec();
        spec.command = "  ".to_string();
        assert!(spec.validate().is_err());

        assert!(validate_container_name("mcp-run-abc").is_ok());
        assert!(validate_container_name("-rf").is_err());
        assert!(validate_container_name("").is_err());
    }

    #[test]
    fn test_generated_names_are_valid_and_unique() {
        let a = generate_container_name();
        let b = generate_container_name();
        assert_ne!(a, b);
        assert!(a.starts_with(CONTAINER_NAME_PREFIX));
        assert!(validate_container_name(&a).is_ok());
    }

    #[test]
    fn test_benign_cleanup_errors() {
        assert!(is_benign_cleanup_error(
            "Error response from daemon: No such container: mcp-run-abc"
        ));
        assert!(is_benign_cleanup_error(
            "Error response from daemon: Container abc is not running"
        ));
        assert!(is_benign_cleanup_error(
            "Error response from daemon: removal of container abc is already in progress"
        ));
        assert!(!is_benign_cleanup_error("permission denied while trying to connect"));
    }
}
