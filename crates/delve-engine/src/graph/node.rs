use serde::{Deserialize, Serialize};

use delve_core::types::OutputMode;

use crate::context::RunContext;

/// A node in the workflow graph.
///
/// Each node is one agent step delegated to a step executor. The engine
/// never interprets `config`; it is handed to the executor untouched.
/// Input/output keys define the default data flow through the run context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default = "default_role")]
    pub role: String,
    /// Step-executor capability this node delegates to.
    #[serde(default = "default_executor")]
    pub executor: String,
    /// Opaque executor configuration (model, prompt, tool set).
    #[serde(default)]
    pub config: serde_json::Value,
    /// Track each output as a discrete progress step.
    #[serde(default)]
    pub is_step: bool,
    /// Maximum tool-call iterations inside one invocation.
    #[serde(default = "default_tool_steps")]
    pub tool_steps: usize,
    #[serde(default)]
    pub output_mode: OutputMode,
    /// Keys to pull from the run context as input.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Keys to push into the run context from this node's output.
    #[serde(default)]
    pub output_keys: Vec<String>,
}

fn default_role() -> String {
    "assistant".to_string()
}

fn default_executor() -> String {
    "agent".to_string()
}

fn default_tool_steps() -> usize {
    5
}

impl Node {
    /// Create a new node with minimal configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: default_role(),
            executor: default_executor(),
            config: serde_json::Value::Null,
            is_step: false,
            tool_steps: default_tool_steps(),
            output_mode: OutputMode::default(),
            input_keys: vec![],
            output_keys: vec![],
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Mark the node's output as a tracked progress step.
    pub fn as_step(mut self) -> Self {
        self.is_step = true;
        self
    }

    pub fn with_tool_steps(mut self, steps: usize) -> Self {
        self.tool_steps = steps;
        self
    }

    pub fn with_output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// Set the input keys.
    pub fn with_inputs(mut self, keys: Vec<String>) -> Self {
        self.input_keys = keys;
        self
    }

    /// Set the output keys.
    pub fn with_outputs(mut self, keys: Vec<String>) -> Self {
        self.output_keys = keys;
        self
    }

    /// Build the default input for this node from the run context.
    ///
    /// Carries the run query plus every input key present in the context.
    pub fn build_input(&self, ctx: &RunContext) -> serde_json::Value {
        let mut context = serde_json::Map::new();
        for key in &self.input_keys {
            if let Some(value) = ctx.get(key) {
                context.insert(key.clone(), value.clone());
            }
        }

        serde_json::json!({
            "query": ctx.query,
            "context": context,
        })
    }
}
