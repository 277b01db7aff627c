//! Daemon event parsing.
//!
//! Docker and Podman both emit one JSON object per line from
//! `events --format '{{json .}}'`, with different field names.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;

use super::error::{RuntimeError, RuntimeResult};

/// What happened to a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonAction {
    Create,
    Start,
    Restart,
    Unpause,
    Pause,
    Stop,
    Die,
    Kill,
    Oom,
    Destroy,
    Other(String),
}

impl DaemonAction {
    fn parse(raw: &str) -> Self {
        // Docker appends details after a colon ("exec_start: sh", "health_status: healthy").
        let action = raw.split(':').next().unwrap_or(raw).trim();
        match action {
            "create" => DaemonAction::Create,
            "start" => DaemonAction::Start,
            "restart" => DaemonAction::Restart,
            "unpause" => DaemonAction::Unpause,
            "pause" => DaemonAction::Pause,
            "stop" => DaemonAction::Stop,
            "die" | "died" => DaemonAction::Die,
            "kill" => DaemonAction::Kill,
            "oom" => DaemonAction::Oom,
            "destroy" | "remove" => DaemonAction::Destroy,
            other => DaemonAction::Other(other.to_string()),
        }
    }
}

/// A container event observed on the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonEvent {
    pub container_id: String,
    pub action: DaemonAction,
    pub exit_code: Option<i32>,
    pub time: DateTime<Utc>,
}

impl DaemonEvent {
    pub fn new(container_id: impl Into<String>, action: DaemonAction) -> Self {
        Self {
            container_id: container_id.into(),
            action,
            exit_code: None,
            time: Utc::now(),
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }
}

#[derive(Debug, Deserialize)]
struct RawActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    // docker
    #[serde(rename = "Action", default)]
    action: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "Actor", default)]
    actor: Option<RawActor>,
    #[serde(default)]
    time: Option<i64>,
    // podman
    #[serde(rename = "ID", default)]
    podman_id: Option<String>,
    #[serde(rename = "Status", default)]
    podman_status: Option<String>,
    #[serde(rename = "ContainerExitCode", default)]
    podman_exit_code: Option<i32>,
    #[serde(rename = "Time", default)]
    podman_time: Option<serde_json::Value>,
}

/// Parse one line of `events` output.
///
/// Returns `Ok(None)` for events that do not concern containers.
pub(crate) fn parse_event_line(line: &str) -> RuntimeResult<Option<DaemonEvent>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let raw: RawEvent =
        serde_json::from_str(line).map_err(|e| RuntimeError::Parse(e.to_string()))?;

    if let Some(kind) = raw.kind.as_deref()
        && !kind.eq_ignore_ascii_case("container")
    {
        return Ok(None);
    }

    let container_id = raw
        .actor
        .as_ref()
        .map(|a| a.id.clone())
        .filter(|id| !id.is_empty())
        .or(raw.id)
        .or(raw.podman_id)
        .unwrap_or_default();
    let Some(action) = raw.action.or(raw.status).or(raw.podman_status) else {
        return Ok(None);
    };
    if container_id.is_empty() {
        return Ok(None);
    }

    let exit_code = raw
        .actor
        .as_ref()
        .and_then(|a| a.attributes.get("exitCode"))
        .and_then(|code| code.parse::<i32>().ok())
        .or(raw.podman_exit_code);

    let time = raw
        .time
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .or_else(|| match raw.podman_time {
            Some(serde_json::Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            Some(serde_json::Value::Number(n)) => n
                .as_i64()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
            _ => None,
        })
        .unwrap_or_else(Utc::now);

    Ok(Some(DaemonEvent {
        container_id,
        action: DaemonAction::parse(&action),
        exit_code,
        time,
    }))
}
