use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a tracked agent.
///
/// Legal transitions: `spawning → ready → active ⇄ idle` and from any
/// non-terminal state into `completed`, `error` or `terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Spawning,
    Ready,
    Active,
    Idle,
    Completed,
    Error,
    Terminated,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Terminated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Terminated => "terminated",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "spawning" => Self::Spawning,
            "ready" => Self::Ready,
            "active" => Self::Active,
            "idle" => Self::Idle,
            "completed" => Self::Completed,
            "error" => Self::Error,
            "terminated" => Self::Terminated,
            other => anyhow::bail!("unknown agent status '{other}'"),
        })
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked unit of autonomous coding work: a directly spawned session or a
/// sub-agent detected inside another session's hook stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub pid: Option<i64>,
    pub cwd: String,
    /// Id reference only, resolved by lookup at traversal time. The parent
    /// record may have been deleted or terminated; children keep the reference.
    pub parent_id: Option<String>,
    pub template_id: Option<String>,
    pub status: AgentStatus,
    /// Correlation key to the underlying transcript, when known.
    pub session_path: Option<String>,
    pub initial_prompt: Option<String>,
    pub spawned_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnOptions {
    pub name: String,
    pub cwd: String,
    pub parent_id: Option<String>,
    pub template_id: Option<String>,
    pub initial_prompt: Option<String>,
    pub session_path: Option<String>,
}

/// Options for upserting by `session_path`: when a live record already shares
/// the path its mutable fields are updated in place, otherwise this
/// degenerates to a spawn.
#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    pub name: String,
    pub cwd: String,
    pub pid: Option<i64>,
    pub parent_id: Option<String>,
    pub template_id: Option<String>,
    pub initial_prompt: Option<String>,
    pub session_path: Option<String>,
    pub status: Option<AgentStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTreeNode {
    #[serde(flatten)]
    pub agent: AgentRecord,
    pub children: Vec<AgentTreeNode>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    /// spawning + ready + active
    pub active: usize,
    pub idle: usize,
    pub completed: usize,
    pub error: usize,
    pub by_status: HashMap<String, usize>,
}

/// Audit record persisted once per accepted hook request, before any handler
/// runs. Append-only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HookEventRecord {
    pub id: String,
    pub event_type: String,
    pub session_id: String,
    pub project_path: String,
    pub tool_name: Option<String>,
    pub tool_input: Option<String>,
    pub tool_result: Option<String>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub duration_ms: Option<i64>,
    pub timestamp: DateTime<Utc>,
}

/// Normalized hook event, produced once at the ingestion boundary. Everything
/// past the hook server sees this shape only.
#[derive(Debug, Clone)]
pub struct HookEvent {
    pub event_type: String,
    pub session_id: String,
    pub cwd: String,
    pub transcript_path: Option<String>,
    pub tool_name: Option<String>,
    pub tool_input: Option<Value>,
    pub tool_response: Option<Value>,
    pub blocked: bool,
    pub block_reason: Option<String>,
    pub duration_ms: Option<i64>,
    pub raw: Value,
}

/// Raw hook payload as posted by the CLI hook script.
///
/// Two generations of the hook script are in the wild: one posts snake_case
/// field names, the other camelCase. This accessor tolerates both so the
/// rest of the system never has to.
#[derive(Debug, Clone)]
pub struct HookPayload(pub Value);

impl HookPayload {
    pub fn field(&self, snake: &str) -> Option<&Value> {
        let obj = self.0.as_object()?;
        obj.get(snake).or_else(|| obj.get(&camel_case(snake)))
    }

    pub fn str_field(&self, snake: &str) -> Option<&str> {
        self.field(snake).and_then(Value::as_str)
    }

    fn first_str(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|n| self.str_field(n))
            .map(str::to_string)
    }

    /// Collapse the payload into the one shape the rest of the system sees.
    pub fn normalize(&self) -> HookEvent {
        let event_type = self
            .first_str(&["hook_event_name", "event_type", "event"])
            .map(|t| canonical_event_type(&t))
            .unwrap_or_else(|| "Unknown".to_string());

        HookEvent {
            event_type,
            session_id: self.first_str(&["session_id"]).unwrap_or_default(),
            cwd: self
                .first_str(&["cwd", "project_path", "working_directory"])
                .unwrap_or_default(),
            transcript_path: self.first_str(&["transcript_path", "session_path"]),
            tool_name: self.first_str(&["tool_name"]),
            tool_input: self.field("tool_input").cloned(),
            tool_response: self
                .field("tool_response")
                .or_else(|| self.field("tool_result"))
                .cloned(),
            blocked: self
                .field("blocked")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            block_reason: self.first_str(&["block_reason", "reason"]),
            duration_ms: self.field("duration_ms").and_then(Value::as_i64),
            raw: self.0.clone(),
        }
    }
}

/// Map snake_case event type values ("session_start") onto the PascalCase
/// names the handler table is keyed by ("SessionStart").
pub fn canonical_event_type(raw: &str) -> String {
    if !raw.contains('_') {
        return raw.to_string();
    }
    raw.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    let mut upper_next = false;
    for ch in snake.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Decision returned to the CLI hook caller. Failure paths default to
/// `allow` so a broken hub never wedges the caller's tool loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
    Deny,
}

/// Response body for the hook endpoint; also the per-handler reply shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResponse {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inject_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HookResponse {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            inject_context: None,
            modified_input: None,
            message: None,
        }
    }
}

impl Default for HookResponse {
    fn default() -> Self {
        Self::allow()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}
