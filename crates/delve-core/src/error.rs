use thiserror::Error;

#[derive(Debug, Error)]
pub enum DelveError {
    // Graph definition errors (build time only)
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge references unknown node: {0}")]
    UnknownNode(String),

    #[error("Node not reachable from entry: {0}")]
    UnreachableNode(String),

    #[error("Entry node missing or unregistered: {0}")]
    MissingEntry(String),

    #[error("Terminal node could not be determined: {0}")]
    MissingTerminal(String),

    #[error("Invalid edge {from} -> {to}: {reason}")]
    InvalidEdge {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Cycle detected through node: {0}")]
    CycleDetected(String),

    #[error("Non-terminal node has no outgoing edge: {0}")]
    DeadEnd(String),

    // Run errors
    #[error("No viable transition out of node: {0}")]
    NoViableTransition(String),

    #[error("Step failed in node {node}: {message}")]
    Step { node: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run exceeded time limit ({0}s)")]
    Timeout(u64),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run payload: {0}")]
    InvalidPayload(String),

    #[error("Admission denied for run {run_id}: remaining {remaining}, cost {cost}")]
    AdmissionDenied {
        run_id: String,
        remaining: u64,
        cost: u64,
    },

    // Storage errors
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DelveError {
    /// Errors raised while validating a graph definition.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode(_)
                | Self::UnknownNode(_)
                | Self::UnreachableNode(_)
                | Self::MissingEntry(_)
                | Self::MissingTerminal(_)
                | Self::InvalidEdge { .. }
                | Self::CycleDetected(_)
                | Self::DeadEnd(_)
        )
    }

    /// Storage failures, kept apart from run failures for alerting.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

pub type Result<T> = std::result::Result<T, DelveError>;
