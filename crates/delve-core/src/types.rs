use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique run identifier.
///
/// The unit of isolation, resumability and cancellation. Callers usually
/// pick it (a chat thread or request id); `new()` is for ad-hoc runs.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a whole run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Suspended,
    Completed,
    Error,
    Aborted,
}

impl RunStatus {
    /// `Completed`, `Error` and `Aborted` are mutually exclusive end states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }

    /// The terminal event announcing this status, if it is terminal.
    pub fn terminal_event(&self) -> Option<EventKind> {
        match self {
            Self::Completed => Some(EventKind::Completed),
            Self::Error => Some(EventKind::Error),
            Self::Aborted => Some(EventKind::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Status of a single node in the run ledger.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Error,
    /// Interrupted by cancellation mid-invocation.
    Aborted,
}

/// How a node's output is surfaced to the caller.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Rendered as answer text.
    #[default]
    Answer,
    /// Rendered as reasoning text.
    Reasoning,
    /// Not surfaced at all.
    Silent,
}

/// Names of the events the engine emits.
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunResumed,
    NodeStarted,
    NodeUpdated,
    NodeCompleted,
    NodeError,
    RunSuspended,
    Completed,
    Error,
    Aborted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunResumed => "run_resumed",
            Self::NodeStarted => "node_started",
            Self::NodeUpdated => "node_updated",
            Self::NodeCompleted => "node_completed",
            Self::NodeError => "node_error",
            Self::RunSuspended => "run_suspended",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Aborted)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single emitted event. Append-only from the consumer's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// Monotonic per event channel.
    pub seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Everything a step executor receives for one invocation.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: RunId,
    pub node_id: String,
    pub node_name: String,
    pub role: String,
    /// Executor capability reference from the node definition.
    pub executor: String,
    /// Opaque node configuration (model, prompt, tool set).
    pub config: serde_json::Value,
    /// Upper bound on the executor's own tool-call iterations.
    pub tool_steps: usize,
    pub input: serde_json::Value,
    /// Zero-based loop iteration; `None` for single invocations.
    pub iteration: Option<usize>,
    /// Outputs of earlier iterations of the same loop.
    pub history: Vec<serde_json::Value>,
    pub cancel: CancellationToken,
}

/// What a step executor hands back.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepOutput {
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl StepOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: serde_json::Value::String(text.into()),
            reasoning: None,
        }
    }

    pub fn json(content: serde_json::Value) -> Self {
        Self {
            content,
            reasoning: None,
        }
    }

    /// Content rendered as plain text (strings unquoted).
    pub fn as_text(&self) -> String {
        match &self.content {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
