use std::collections::HashMap;
use std::sync::Arc;

use delve_core::types::StepOutput;

use crate::context::RunContext;

/// Maps run state to a node's input.
pub type InputTransform = Arc<dyn Fn(&RunContext) -> serde_json::Value + Send + Sync>;

/// Maps a node's raw output back into run state.
pub type OutputTransform = Arc<dyn Fn(&mut RunContext, &StepOutput) + Send + Sync>;

/// Loop stop predicate over `(history, latest)`; `history` includes `latest`.
pub type StopPredicate = Arc<dyn Fn(&[serde_json::Value], &serde_json::Value) -> bool + Send + Sync>;

/// Edge eligibility predicate over run state.
pub type ContextPredicate = Arc<dyn Fn(&RunContext) -> bool + Send + Sync>;

/// When a loop should end before its ceiling.
///
/// The ceiling always applies; a condition can only end the loop earlier.
#[derive(Clone)]
pub enum StopCondition {
    /// Run until the ceiling.
    Never,
    /// Stop once the latest output contains the phrase (case-insensitive).
    OutputContains(String),
    Predicate(StopPredicate),
}

impl StopCondition {
    pub fn predicate(
        f: impl Fn(&[serde_json::Value], &serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn should_stop(&self, history: &[serde_json::Value], latest: &serde_json::Value) -> bool {
        match self {
            Self::Never => false,
            Self::OutputContains(phrase) => {
                let text = match latest {
                    serde_json::Value::String(s) => s.to_lowercase(),
                    other => other.to_string().to_lowercase(),
                };
                text.contains(&phrase.to_lowercase())
            }
            Self::Predicate(f) => f(history, latest),
        }
    }
}

impl std::fmt::Debug for StopCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::OutputContains(p) => write!(f, "OutputContains({:?})", p),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Condition for an edge to be eligible.
#[derive(Clone, Default)]
pub enum Condition {
    #[default]
    Always,
    /// Evaluated against run-context data.
    /// Supported: `key == "value"`, `key != "value"`, `key contains "substr"`.
    Expression(String),
    Predicate(ContextPredicate),
}

impl Condition {
    pub fn expr(expr: impl Into<String>) -> Self {
        Self::Expression(expr.into())
    }

    pub fn predicate(f: impl Fn(&RunContext) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn holds(&self, ctx: &RunContext) -> bool {
        match self {
            Self::Always => true,
            Self::Expression(expr) => evaluate_condition(expr, ctx.data()),
            Self::Predicate(f) => f(ctx),
        }
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Always => write!(f, "Always"),
            Self::Expression(e) => write!(f, "Expression({:?})", e),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// How the source node is invoked before the cursor moves to the target.
#[derive(Debug, Clone)]
pub enum EdgePattern {
    /// Invoke once.
    Sequential,
    /// Invoke repeatedly until `stop` holds or `max_iterations` is reached.
    Loop {
        max_iterations: usize,
        stop: StopCondition,
    },
}

impl EdgePattern {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Loop { .. } => "loop",
        }
    }
}

/// A directed transition between two nodes.
#[derive(Clone)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    pub pattern: EdgePattern,
    /// Eligibility condition. Loop edges are checked before the source node
    /// runs, sequential edges once its output is in run state.
    pub when: Condition,
    /// Lower value wins among eligible edges.
    pub priority: i32,
    pub input: Option<InputTransform>,
    pub output: Option<OutputTransform>,
}

impl Edge {
    /// Create a sequential edge.
    pub fn sequential(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            pattern: EdgePattern::Sequential,
            when: Condition::Always,
            priority: 0,
            input: None,
            output: None,
        }
    }

    /// Create a bounded loop edge.
    pub fn looping(
        from: impl Into<String>,
        to: impl Into<String>,
        max_iterations: usize,
        stop: StopCondition,
    ) -> Self {
        Self {
            pattern: EdgePattern::Loop {
                max_iterations,
                stop,
            },
            ..Self::sequential(from, to)
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when = condition;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_input(
        mut self,
        f: impl Fn(&RunContext) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.input = Some(Arc::new(f));
        self
    }

    pub fn with_output(
        mut self,
        f: impl Fn(&mut RunContext, &StepOutput) + Send + Sync + 'static,
    ) -> Self {
        self.output = Some(Arc::new(f));
        self
    }

    pub fn is_loop(&self) -> bool {
        matches!(self.pattern, EdgePattern::Loop { .. })
    }
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("pattern", &self.pattern)
            .field("when", &self.when)
            .field("priority", &self.priority)
            .field("input", &self.input.is_some())
            .field("output", &self.output.is_some())
            .finish()
    }
}

/// Evaluate a simple conditional expression against context data.
///
/// Supported expressions (operator separated by whitespace):
/// - `key == "value"`: exact match
/// - `key != "value"`: not equal
/// - `key contains "substr"`: substring match
///
/// Non-string values are compared by their JSON rendering.
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let Some((key, op, value)) = parse_expression(expr) else {
        return false;
    };
    let Some(actual) = lookup(context, key) else {
        return false;
    };

    match op {
        "==" => actual == value,
        "!=" => actual != value,
        "contains" => actual.contains(value),
        _ => false,
    }
}

fn lookup(context: &HashMap<String, serde_json::Value>, key: &str) -> Option<String> {
    context.get(key).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Split `key OP value` into its three parts. The key and operator are the
/// first two whitespace-delimited tokens; the rest is the value, with one
/// pair of surrounding quotes removed.
fn parse_expression(expr: &str) -> Option<(&str, &str, &str)> {
    let (key, rest) = expr.trim().split_once(char::is_whitespace)?;
    let (op, value) = rest.trim_start().split_once(char::is_whitespace)?;
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key, op, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edge_builders() {
        let e = Edge::sequential("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to, "b");
        assert!(!e.is_loop());
        assert_eq!(e.priority, 0);

        let e = Edge::looping("a", "c", 3, StopCondition::Never).with_priority(2);
        assert!(e.is_loop());
        assert_eq!(e.priority, 2);
        assert_eq!(e.pattern.name(), "loop");
    }

    #[test]
    fn test_condition_equals() {
        let mut ctx = HashMap::new();
        ctx.insert("status".into(), json!("success"));

        assert!(evaluate_condition(r#"status == "success""#, &ctx));
        assert!(!evaluate_condition(r#"status == "failure""#, &ctx));
    }

    #[test]
    fn test_condition_not_equals() {
        let mut ctx = HashMap::new();
        ctx.insert("status".into(), json!("success"));

        assert!(evaluate_condition(r#"status != "failure""#, &ctx));
        assert!(!evaluate_condition(r#"status != "success""#, &ctx));
    }

    #[test]
    fn test_condition_contains() {
        let mut ctx = HashMap::new();
        ctx.insert("notes".into(), json!("Found three sources on tokio."));

        assert!(evaluate_condition(r#"notes contains "tokio""#, &ctx));
        assert!(!evaluate_condition(r#"notes contains "actix""#, &ctx));
    }

    #[test]
    fn test_condition_non_string_values() {
        let mut ctx = HashMap::new();
        ctx.insert("needs_search".into(), json!(true));
        ctx.insert("rounds".into(), json!(2));

        assert!(evaluate_condition(r#"needs_search == "true""#, &ctx));
        assert!(evaluate_condition(r#"rounds != "3""#, &ctx));
    }

    #[test]
    fn test_operator_text_inside_value() {
        let mut ctx = HashMap::new();
        ctx.insert("notes".into(), json!("contains x"));
        ctx.insert("verdict".into(), json!("a == b"));

        assert!(evaluate_condition(r#"notes == "contains x""#, &ctx));
        assert!(!evaluate_condition(r#"notes != "contains x""#, &ctx));
        assert!(evaluate_condition(r#"verdict contains "==""#, &ctx));
        assert!(evaluate_condition(r#"verdict == "a == b""#, &ctx));
    }

    #[test]
    fn test_condition_unquoted_and_padded() {
        let mut ctx = HashMap::new();
        ctx.insert("rounds".into(), json!(2));

        assert!(evaluate_condition("  rounds   ==   2  ", &ctx));
        assert!(!evaluate_condition(r#"rounds >= "1""#, &ctx));
    }

    #[test]
    fn test_condition_missing_key() {
        let ctx = HashMap::new();
        assert!(!evaluate_condition(r#"missing == "value""#, &ctx));
    }

    #[test]
    fn test_condition_invalid_expr() {
        let ctx = HashMap::new();
        assert!(!evaluate_condition("this is not valid", &ctx));
    }

    #[test]
    fn test_condition_variants() {
        let mut run = RunContext::new("q");
        run.set_str("mode", "deep");

        assert!(Condition::Always.holds(&run));
        assert!(Condition::expr(r#"mode == "deep""#).holds(&run));
        assert!(!Condition::expr(r#"mode == "quick""#).holds(&run));
        assert!(Condition::predicate(|c| c.query == "q").holds(&run));
    }

    #[test]
    fn test_stop_conditions() {
        let history = vec![json!("searching"), json!("I have ENOUGH information now")];
        let latest = history.last().unwrap();

        assert!(!StopCondition::Never.should_stop(&history, latest));
        assert!(StopCondition::OutputContains("enough information".into())
            .should_stop(&history, latest));
        assert!(!StopCondition::OutputContains("done".into()).should_stop(&history, latest));
        assert!(StopCondition::predicate(|h, _| h.len() >= 2).should_stop(&history, latest));
    }
}
