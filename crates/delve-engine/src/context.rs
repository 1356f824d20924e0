use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use delve_core::error::{DelveError, Result};
use delve_core::types::{NodeStatus, StepOutput};

/// Caller-supplied limits for one run.
///
/// Each field tightens the engine-wide limit; none can loosen it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loop_iterations: Option<usize>,
    /// Wall-clock bound on a single start/resume call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_secs: Option<u64>,
}

/// Per-node entry in the run ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub status: NodeStatus,
    /// Input of the latest invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Output of the latest invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub invocations: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A discrete progress step, recorded for nodes marked `is_step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub node_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    pub output: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Progress of an in-flight loop, persisted so the count survives a resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopState {
    pub node_id: String,
    /// Target of the loop edge.
    pub edge_to: String,
    /// Iterations completed so far.
    pub iteration: usize,
    pub history: Vec<serde_json::Value>,
}

/// State of one run, owned by the engine while the run executes.
///
/// `data` is the shared key/value area that nodes read from and write to;
/// the remaining fields are the artifacts a research run accumulates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunContext {
    pub query: String,
    #[serde(default)]
    data: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub ledger: BTreeMap<String, NodeRecord>,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<String>,
    #[serde(default)]
    pub options: RunOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
    /// Step-executor calls made across the whole run.
    #[serde(default)]
    pub invocations: usize,
}

impl RunContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Build a fresh context from a start payload.
    ///
    /// The payload must be an object with a string `query`. See
    /// `merge_payload` for how the other keys are applied.
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let query = payload
            .get("query")
            .and_then(|q| q.as_str())
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| DelveError::InvalidPayload("a non-empty `query` is required".into()))?;

        let mut ctx = Self::new(query);
        ctx.merge_payload(payload)?;
        Ok(ctx)
    }

    /// Merge a caller payload into the context.
    ///
    /// `options` replaces the run options, a nested `data` object and every
    /// other top-level key go into `data`. `query` only fills an empty query.
    /// `null` is a no-op.
    pub fn merge_payload(&mut self, payload: &serde_json::Value) -> Result<()> {
        let obj = match payload {
            serde_json::Value::Null => return Ok(()),
            serde_json::Value::Object(obj) => obj,
            _ => {
                return Err(DelveError::InvalidPayload(
                    "payload must be a JSON object".into(),
                ))
            }
        };

        for (key, value) in obj {
            match key.as_str() {
                "query" => {
                    if self.query.is_empty() {
                        if let Some(q) = value.as_str() {
                            self.query = q.to_string();
                        }
                    }
                }
                "options" => {
                    self.options = serde_json::from_value(value.clone()).map_err(|e| {
                        DelveError::InvalidPayload(format!("invalid options: {}", e))
                    })?;
                }
                "data" => match value {
                    serde_json::Value::Object(data) => {
                        for (k, v) in data {
                            self.data.insert(k.clone(), v.clone());
                        }
                    }
                    serde_json::Value::Null => {}
                    _ => {
                        return Err(DelveError::InvalidPayload(
                            "`data` must be a JSON object".into(),
                        ))
                    }
                },
                _ => {
                    self.data.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge another context's data into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &RunContext) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Store a node's output under its output keys.
    ///
    /// If the output is a JSON object (or a string holding one), matching
    /// keys are extracted individually. Otherwise the whole output is stored
    /// under each key.
    pub fn ingest_output(&mut self, output_keys: &[String], output: &StepOutput) {
        if output_keys.is_empty() {
            return;
        }

        let parsed = match &output.content {
            serde_json::Value::String(s) => serde_json::from_str::<serde_json::Value>(s).ok(),
            other => Some(other.clone()),
        };
        if let Some(obj) = parsed.as_ref().and_then(|v| v.as_object()) {
            for key in output_keys {
                if let Some(val) = obj.get(key) {
                    self.data.insert(key.clone(), val.clone());
                }
            }
            return;
        }

        for key in output_keys {
            self.data.insert(key.clone(), output.content.clone());
        }
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }

    /// Append sources, skipping ones already collected.
    pub fn add_sources(&mut self, items: impl IntoIterator<Item = serde_json::Value>) {
        for item in items {
            if !self.sources.contains(&item) {
                self.sources.push(item);
            }
        }
    }

    // -- ledger ------------------------------------------------------------

    /// Mark an invocation of `node_id` as started.
    pub fn begin_node(&mut self, node_id: &str, input: &serde_json::Value) {
        let record = self
            .ledger
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRecord {
                status: NodeStatus::Running,
                input: None,
                output: None,
                reasoning: None,
                error: None,
                invocations: 0,
                started_at: Utc::now(),
                finished_at: None,
            });
        record.status = NodeStatus::Running;
        record.input = Some(input.clone());
        record.invocations += 1;
        self.invocations += 1;
    }

    pub fn record_output(&mut self, node_id: &str, output: &StepOutput) {
        if let Some(record) = self.ledger.get_mut(node_id) {
            record.output = Some(output.content.clone());
            record.reasoning = output.reasoning.clone();
        }
    }

    pub fn complete_node(&mut self, node_id: &str) {
        self.finish_node(node_id, NodeStatus::Completed, None);
    }

    pub fn fail_node(&mut self, node_id: &str, message: impl Into<String>) {
        self.finish_node(node_id, NodeStatus::Error, Some(message.into()));
    }

    pub fn abort_node(&mut self, node_id: &str) {
        self.finish_node(node_id, NodeStatus::Aborted, None);
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.ledger.get(node_id).map(|r| r.status)
    }

    fn finish_node(&mut self, node_id: &str, status: NodeStatus, error: Option<String>) {
        if let Some(record) = self.ledger.get_mut(node_id) {
            record.status = status;
            record.error = error;
            record.finished_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut ctx = RunContext::new("q");
        ctx.set_str("name", "Alice");
        ctx.set("count", json!(42));

        assert_eq!(ctx.get_str("name"), Some("Alice"));
        assert_eq!(ctx.get("count"), Some(&json!(42)));
        assert_eq!(ctx.get("missing"), None);
    }

    #[test]
    fn test_merge() {
        let mut ctx1 = RunContext::new("q");
        ctx1.set_str("a", "1");
        ctx1.set_str("b", "2");

        let mut ctx2 = RunContext::new("q");
        ctx2.set_str("b", "overwritten");
        ctx2.set_str("c", "3");

        ctx1.merge(&ctx2);

        assert_eq!(ctx1.get_str("a"), Some("1"));
        assert_eq!(ctx1.get_str("b"), Some("overwritten"));
        assert_eq!(ctx1.get_str("c"), Some("3"));
    }

    #[test]
    fn test_ingest_json_output() {
        let mut ctx = RunContext::new("q");
        let output = StepOutput::text(r#"{"findings": "Rust is fast", "score": 9.5}"#);
        ctx.ingest_output(&["findings".into(), "score".into()], &output);

        assert_eq!(ctx.get_str("findings"), Some("Rust is fast"));
        assert_eq!(ctx.get("score"), Some(&json!(9.5)));
    }

    #[test]
    fn test_ingest_structured_output() {
        let mut ctx = RunContext::new("q");
        let output = StepOutput::json(json!({"plan": ["a", "b"], "extra": true}));
        ctx.ingest_output(&["plan".into()], &output);

        assert_eq!(ctx.get("plan"), Some(&json!(["a", "b"])));
        assert!(ctx.get("extra").is_none());
    }

    #[test]
    fn test_ingest_plain_text_output() {
        let mut ctx = RunContext::new("q");
        ctx.ingest_output(&["summary".into()], &StepOutput::text("A plain result."));
        assert_eq!(ctx.get_str("summary"), Some("A plain result."));
    }

    #[test]
    fn test_ingest_empty_keys() {
        let mut ctx = RunContext::new("q");
        ctx.ingest_output(&[], &StepOutput::text("anything"));
        assert!(ctx.data().is_empty());
    }

    #[test]
    fn test_from_payload() {
        let ctx = RunContext::from_payload(&json!({
            "query": "history of tokio",
            "data": {"depth": "deep"},
            "locale": "en",
            "options": {"max_loop_iterations": 2, "timeout_secs": 30}
        }))
        .unwrap();

        assert_eq!(ctx.query, "history of tokio");
        assert_eq!(ctx.get_str("depth"), Some("deep"));
        assert_eq!(ctx.get_str("locale"), Some("en"));
        assert_eq!(ctx.options.max_loop_iterations, Some(2));
        assert_eq!(ctx.options.timeout_secs, Some(30));
        assert!(ctx.get("options").is_none());
    }

    #[test]
    fn test_from_payload_requires_query() {
        for bad in [json!({}), json!({"query": ""}), json!({"query": 5}), json!("q")] {
            assert!(matches!(
                RunContext::from_payload(&bad),
                Err(DelveError::InvalidPayload(_))
            ));
        }
    }

    #[test]
    fn test_merge_payload_keeps_query() {
        let mut ctx = RunContext::new("original");
        ctx.merge_payload(&json!({"query": "other", "approved": true}))
            .unwrap();
        assert_eq!(ctx.query, "original");
        assert_eq!(ctx.get("approved"), Some(&json!(true)));

        ctx.merge_payload(&serde_json::Value::Null).unwrap();
        assert!(ctx.merge_payload(&json!([1, 2])).is_err());
        assert!(ctx.merge_payload(&json!({"options": "fast"})).is_err());
    }

    #[test]
    fn test_ledger_lifecycle() {
        let mut ctx = RunContext::new("q");
        ctx.begin_node("a", &json!({"query": "q"}));
        assert_eq!(ctx.node_status("a"), Some(NodeStatus::Running));

        ctx.record_output("a", &StepOutput::text("first"));
        ctx.begin_node("a", &json!({"query": "q"}));
        ctx.record_output("a", &StepOutput::text("second"));
        ctx.complete_node("a");

        let record = &ctx.ledger["a"];
        assert_eq!(record.status, NodeStatus::Completed);
        assert_eq!(record.invocations, 2);
        assert_eq!(record.output, Some(json!("second")));
        assert!(record.finished_at.is_some());
        assert_eq!(ctx.invocations, 2);

        ctx.begin_node("b", &json!({}));
        ctx.fail_node("b", "boom");
        assert_eq!(ctx.node_status("b"), Some(NodeStatus::Error));
        assert_eq!(ctx.ledger["b"].error.as_deref(), Some("boom"));
        assert_eq!(ctx.node_status("c"), None);
    }

    #[test]
    fn test_add_sources_dedupes() {
        let mut ctx = RunContext::new("q");
        ctx.add_sources(vec![json!("https://a"), json!("https://b")]);
        ctx.add_sources(vec![json!("https://b"), json!("https://c")]);
        assert_eq!(ctx.sources.len(), 3);
    }

    #[test]
    fn test_serde_roundtrip_keeps_loop_state() {
        let mut ctx = RunContext::new("q");
        ctx.set_str("k", "v");
        ctx.loop_state = Some(LoopState {
            node_id: "searcher".into(),
            edge_to: "reflector".into(),
            iteration: 2,
            history: vec![json!("r1"), json!("r2")],
        });

        let value = serde_json::to_value(&ctx).unwrap();
        let back: RunContext = serde_json::from_value(value).unwrap();
        assert_eq!(back.get_str("k"), Some("v"));
        assert_eq!(back.loop_state, ctx.loop_state);
    }
}
