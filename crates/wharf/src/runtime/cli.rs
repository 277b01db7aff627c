//! Docker/Podman CLI implementation of [`ContainerRuntimeApi`].

use std::net::IpAddr;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::error::{RuntimeError, RuntimeResult, classify_failure};
use super::events::parse_event_line;
use super::pty::spawn_exec;
use super::{
    ContainerInspect, ContainerRuntimeApi, CreateSpec, DaemonState, EventStream, ExecRequest,
    PtyProcess,
};

/// Container runtime type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    #[default]
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

/// Validate a container ID or name before passing it to the CLI.
///
/// Container IDs are hex strings (12 or 64 chars for docker/podman).
/// Container names follow the same rules as container creation.
fn validate_container_id_or_name(id: &str) -> RuntimeResult<()> {
    if id.is_empty() {
        return Err(RuntimeError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(RuntimeError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) {
        return Err(RuntimeError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

/// Subset of `inspect` output we rely on.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectOutput {
    #[serde(alias = "ID")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    state: InspectState,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<std::collections::HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
    #[serde(default)]
    networks: Option<std::collections::HashMap<String, InspectEndpoint>>,
}

#[derive(Debug, Default, Deserialize)]
struct InspectEndpoint {
    #[serde(default, rename = "IPAddress")]
    ip_address: String,
}

impl InspectOutput {
    fn into_inspect(self) -> ContainerInspect {
        let network = self.network_settings.unwrap_or_default();
        let mut candidates = vec![network.ip_address];
        if let Some(networks) = network.networks {
            let mut names: Vec<_> = networks.into_iter().collect();
            names.sort_by(|a, b| a.0.cmp(&b.0));
            candidates.extend(names.into_iter().map(|(_, ep)| ep.ip_address));
        }
        let ip_address = candidates
            .iter()
            .filter(|ip| !ip.is_empty())
            .find_map(|ip| ip.parse::<IpAddr>().ok());

        ContainerInspect {
            id: self.id,
            name: self.name.trim_start_matches('/').to_string(),
            state: self.state.status.parse().unwrap_or_default(),
            ip_address,
            labels: self.config.and_then(|c| c.labels).unwrap_or_default(),
        }
    }
}

/// Container runtime client for managing containers.
///
/// Supports both Docker and Podman with automatic detection.
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    runtime_type: RuntimeType,
    binary: String,
}

impl Default for ContainerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime {
    /// Create a new container runtime with auto-detection.
    ///
    /// Prefers Podman, falls back to Docker.
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        {
            if Self::is_binary_available("docker") {
                return Self::with_type(RuntimeType::Docker);
            }
        }

        if Self::is_binary_available("podman") {
            Self::with_type(RuntimeType::Podman)
        } else if Self::is_binary_available("docker") {
            Self::with_type(RuntimeType::Docker)
        } else {
            // Fall back to podman, will fail at runtime
            Self::with_type(RuntimeType::Podman)
        }
    }

    /// Create a container runtime with a specific type.
    pub fn with_type(runtime_type: RuntimeType) -> Self {
        Self {
            binary: runtime_type.default_binary().to_string(),
            runtime_type,
        }
    }

    /// Create a container runtime with a custom binary path.
    pub fn with_binary(runtime_type: RuntimeType, binary: impl Into<String>) -> Self {
        Self {
            runtime_type,
            binary: binary.into(),
        }
    }

    pub fn runtime_type(&self) -> RuntimeType {
        self.runtime_type
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Check if a binary is available in PATH.
    fn is_binary_available(name: &str) -> bool {
        std::process::Command::new("which")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Run the runtime binary and collect its output.
    ///
    /// A process that cannot be spawned means the runtime is unusable, so it
    /// is reported as unavailable. The child is killed if the future is
    /// dropped (e.g. by a caller-side timeout).
    async fn exec(&self, command: &str, args: &[String]) -> RuntimeResult<Output> {
        debug!("{} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RuntimeError::Unavailable(format!("cannot run {} {}: {}", self.binary, command, e))
            })
    }

    /// Run a command that must succeed, returning trimmed stdout.
    async fn exec_checked(&self, command: &str, args: &[String]) -> RuntimeResult<String> {
        let output = self.exec(command, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(command, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Check if the container runtime is available and working.
    pub async fn health_check(&self) -> RuntimeResult<String> {
        self.exec_checked(
            "version",
            &["version".to_string(), "--format".to_string(), "json".to_string()],
        )
        .await
    }

    fn create_args(&self, spec: &CreateSpec) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".to_string(),
            // Keep a shell entrypoint alive without anything attached.
            "--interactive".to_string(),
            "--tty".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--cpus".to_string(),
            format!("{}.{:03}", spec.cpu_millis / 1000, spec.cpu_millis % 1000),
            "--memory".to_string(),
            format!("{}b", spec.memory_bytes),
        ];

        let mut labels: Vec<_> = spec.labels.iter().collect();
        labels.sort();
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        let mut env: Vec<_> = spec.env.iter().collect();
        env.sort();
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn create_container(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        validate_container_id_or_name(&spec.name)?;
        let args = self.create_args(spec);
        let id = self.exec_checked("create", &args).await?;
        // Podman may print pull progress before the id.
        id.lines()
            .last()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| RuntimeError::Parse("create returned no container id".to_string()))
    }

    async fn start_container(&self, container_id: &str) -> RuntimeResult<()> {
        validate_container_id_or_name(container_id)?;
        self.exec_checked("start", &["start".to_string(), container_id.to_string()])
            .await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> RuntimeResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["stop".to_string()];
        if let Some(t) = timeout_seconds {
            args.push("-t".to_string());
            args.push(t.to_string());
        }
        args.push(container_id.to_string());

        self.exec_checked("stop", &args).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> RuntimeResult<()> {
        validate_container_id_or_name(container_id)?;

        let mut args: Vec<String> = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(container_id.to_string());

        self.exec_checked("rm", &args).await?;
        Ok(())
    }

    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> RuntimeResult<Option<ContainerInspect>> {
        validate_container_id_or_name(container_id)?;

        let output = self
            .exec(
                "inspect",
                &[
                    "container".to_string(),
                    "inspect".to_string(),
                    container_id.to_string(),
                ],
            )
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return match classify_failure("inspect", &stderr) {
                // Container not found is not an error; callers treat it as missing.
                RuntimeError::NotFound(_) => Ok(None),
                RuntimeError::CommandFailed { .. } if stderr.to_lowercase().contains("no such") => {
                    Ok(None)
                }
                other => Err(other),
            };
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let parsed: Vec<InspectOutput> =
            serde_json::from_str(&stdout).map_err(|e| RuntimeError::Parse(e.to_string()))?;

        Ok(parsed.into_iter().next().map(InspectOutput::into_inspect))
    }

    async fn exec_attach(
        &self,
        container_id: &str,
        request: &ExecRequest,
    ) -> RuntimeResult<PtyProcess> {
        validate_container_id_or_name(container_id)?;
        spawn_exec(&self.binary, container_id, request)
    }

    async fn subscribe_events(&self) -> RuntimeResult<EventStream> {
        let mut child = Command::new(&self.binary)
            .args([
                "events",
                "--format",
                "{{json .}}",
                "--filter",
                "type=container",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                RuntimeError::Unavailable(format!("cannot run {} events: {}", self.binary, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Unavailable("events stdout not captured".to_string()))?;
        let lines = BufReader::new(stdout).lines();

        // The child is carried in the stream state so that dropping the
        // stream kills the `events` process.
        let stream = futures::stream::unfold((child, lines), |(child, mut lines)| async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_event_line(&line) {
                        Ok(Some(event)) => return Some((Ok(event), (child, lines))),
                        Ok(None) => continue,
                        Err(e) => {
                            warn!("skipping unparseable daemon event: {}", e);
                            continue;
                        }
                    },
                    Ok(None) => return None,
                    Err(e) => return Some((Err(RuntimeError::Io(e)), (child, lines))),
                }
            }
        });

        Ok(stream.boxed())
    }
}
