//! The deep-search workflow.
//!
//! `planner` breaks the query into goals, `searcher` loops until it reports
//! it has enough material (or runs out of rounds), `reflector` reviews the
//! findings and `summarizer` writes the answer.

use serde_json::json;

use delve_core::config::ResearchConfig;
use delve_core::error::{DelveError, Result};
use delve_core::types::{OutputMode, StepOutput};

use crate::context::RunContext;
use crate::factory::GraphFactory;
use crate::graph::{Edge, Graph, GraphBuilder, Node, StopCondition};

pub const DEEP_SEARCH: &str = "deep_search";

/// Build the deep-search graph for the given research settings.
pub fn deep_search_graph(config: &ResearchConfig) -> Result<Graph> {
    if config.max_search_rounds == 0 {
        return Err(DelveError::Config(
            "research.max_search_rounds must be at least 1".into(),
        ));
    }

    let mut b = GraphBuilder::new(DEEP_SEARCH);

    b.add_node(
        Node::new("planner", "Planner")
            .with_role("planner")
            .with_executor(&config.executor)
            .with_output_mode(OutputMode::Reasoning)
            .as_step(),
    )?;
    b.add_node(
        Node::new("searcher", "Searcher")
            .with_role("researcher")
            .with_executor(&config.executor)
            .with_output_mode(OutputMode::Reasoning)
            .with_tool_steps(8)
            .as_step(),
    )?;
    b.add_node(
        Node::new("reflector", "Reflector")
            .with_role("reviewer")
            .with_executor(&config.executor)
            .with_output_mode(OutputMode::Reasoning)
            .with_inputs(vec!["plan".into(), "findings".into()])
            .with_outputs(vec!["reflection".into()]),
    )?;
    b.add_node(
        Node::new("summarizer", "Summarizer")
            .with_role("writer")
            .with_executor(&config.executor)
            .with_inputs(vec![
                "plan".into(),
                "findings".into(),
                "sources".into(),
                "reflection".into(),
            ]),
    )?;

    b.add_edge(Edge::sequential("planner", "searcher").with_output(ingest_plan))?;
    b.add_edge(
        Edge::looping(
            "searcher",
            "reflector",
            config.max_search_rounds,
            StopCondition::OutputContains(config.stop_phrase.clone()),
        )
        .with_input(search_input)
        .with_output(ingest_findings),
    )?;
    b.add_edge(Edge::sequential("reflector", "summarizer"))?;

    b.entry("planner");
    b.terminal("summarizer");
    b.build()
}

/// Record the plan and split it into goals.
///
/// Accepts `{"goals": [...]}`, a JSON array, or plain text with one goal
/// per line.
fn ingest_plan(ctx: &mut RunContext, output: &StepOutput) {
    let goals: Vec<String> = match &output.content {
        serde_json::Value::Object(obj) => obj
            .get("goals")
            .and_then(|g| g.as_array())
            .map(|items| items.iter().map(render).collect())
            .unwrap_or_default(),
        serde_json::Value::Array(items) => items.iter().map(render).collect(),
        _ => output
            .as_text()
            .lines()
            .map(|l| l.trim().trim_start_matches(&['-', '*'][..]).trim())
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    };

    ctx.goals = goals;
    ctx.set("plan", output.content.clone());
    ctx.set("goals", json!(ctx.goals));
}

/// Searcher input: the query, the plan and what has been found so far.
fn search_input(ctx: &RunContext) -> serde_json::Value {
    json!({
        "query": ctx.query,
        "context": {
            "plan": ctx.get("plan"),
            "goals": ctx.goals,
            "findings": ctx.get("findings"),
            "sources": ctx.sources,
        }
    })
}

/// Append one search round's findings and sources.
///
/// Structured output may carry `findings` and `sources`; anything else is
/// kept as a finding verbatim.
fn ingest_findings(ctx: &mut RunContext, output: &StepOutput) {
    let (finding, sources) = match &output.content {
        serde_json::Value::Object(obj) => (
            obj.get("findings").cloned().unwrap_or(output.content.clone()),
            obj.get("sources")
                .and_then(|s| s.as_array())
                .cloned()
                .unwrap_or_default(),
        ),
        other => (other.clone(), Vec::new()),
    };

    let mut findings = ctx
        .get("findings")
        .and_then(|f| f.as_array())
        .cloned()
        .unwrap_or_default();
    findings.push(finding);
    ctx.set("findings", serde_json::Value::Array(findings));

    ctx.add_sources(sources);
    ctx.set("sources", json!(ctx.sources));
}

fn render(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Factory serving the deep-search workflow.
pub struct DeepSearchFactory {
    config: ResearchConfig,
}

impl DeepSearchFactory {
    pub fn new(config: ResearchConfig) -> Self {
        Self { config }
    }
}

impl GraphFactory for DeepSearchFactory {
    fn default_workflow(&self) -> &str {
        DEEP_SEARCH
    }

    fn build(&self, workflow: &str) -> Result<Graph> {
        match workflow {
            DEEP_SEARCH => deep_search_graph(&self.config),
            other => Err(DelveError::InvalidPayload(format!(
                "unknown workflow: {}",
                other
            ))),
        }
    }
}
