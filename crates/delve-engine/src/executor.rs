use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use delve_core::config::EngineConfig;
use delve_core::error::{DelveError, Result};
use delve_core::event::EventChannel;
use delve_core::traits::{StateStore, StepExecutor};
use delve_core::types::{
    EventKind, NodeStatus, OutputMode, RunId, RunStatus, StepOutput, StepRequest,
};

use crate::context::{LoopState, RunContext, StepRecord};
use crate::graph::{Edge, Graph, Node, Route, StopCondition};
use crate::snapshot::RunSnapshot;

/// Engine-wide limits, applied on top of whatever a run asks for.
#[derive(Debug, Clone)]
pub struct EngineLimits {
    pub max_loop_iterations: usize,
    pub node_timeout: Option<Duration>,
    pub run_timeout: Option<Duration>,
    /// Nodes at which a run suspends before executing.
    pub pause_before: HashSet<String>,
}

impl EngineLimits {
    pub fn with_pause_before<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pause_before = ids.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&EngineConfig> for EngineLimits {
    fn from(config: &EngineConfig) -> Self {
        let secs = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            max_loop_iterations: config.max_loop_iterations.max(1),
            node_timeout: secs(config.node_timeout_secs),
            run_timeout: secs(config.run_timeout_secs),
            pause_before: config.pause_before.iter().cloned().collect(),
        }
    }
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Everything one engine instance needs. One engine owns one run.
pub struct EngineParts {
    pub run_id: RunId,
    pub graph: Arc<Graph>,
    pub events: Arc<EventChannel>,
    pub store: Arc<dyn StateStore>,
    pub executor: Arc<dyn StepExecutor>,
    pub cancel: CancellationToken,
    pub limits: EngineLimits,
}

/// How a `start`/`resume` call ended without raising.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    /// `Completed`, `Suspended` or `Aborted`; `Error` only on replay.
    pub status: RunStatus,
    pub context: RunContext,
    /// True when a finished run was replayed from its snapshot.
    pub replayed: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Where a walk stopped when it did not fail.
enum WalkEnd {
    Completed,
    Suspended,
}

/// Drives one run through a workflow graph.
///
/// Walks from the cursor node, invoking each node through the step executor
/// once or as a bounded loop, checkpointing after every invocation and
/// emitting events in visit order. Every finished
/// run emits exactly one of `completed`, `error` or `aborted`.
pub struct Engine {
    run_id: RunId,
    graph: Arc<Graph>,
    events: Arc<EventChannel>,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn StepExecutor>,
    cancel: CancellationToken,
    limits: EngineLimits,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        Self {
            run_id: parts.run_id,
            graph: parts.graph,
            events: parts.events,
            store: parts.store,
            executor: parts.executor,
            cancel: parts.cancel,
            limits: parts.limits,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a fresh run at `entry_id`.
    ///
    /// `payload` must carry a string `query`; `data` and `options` are
    /// optional. Payload errors are raised before anything is emitted.
    pub async fn start(&self, entry_id: &str, payload: serde_json::Value) -> Result<RunOutcome> {
        if self.graph.node(entry_id).is_none() {
            return Err(DelveError::UnknownNode(entry_id.to_string()));
        }
        let context = RunContext::from_payload(&payload)?;

        let mut snapshot = RunSnapshot::new(
            self.run_id.clone(),
            self.graph.name(),
            Some(entry_id.to_string()),
            context,
        );
        snapshot.status = RunStatus::Running;

        info!(
            run_id = %self.run_id,
            workflow = %self.graph.name(),
            entry = %entry_id,
            "Run started"
        );
        self.events.emit(
            EventKind::RunStarted,
            None,
            json!({
                "run_id": self.run_id,
                "workflow": self.graph.name(),
                "query": snapshot.context.query,
                "entry": entry_id,
            }),
        );

        self.drive(snapshot, None).await
    }

    /// Continue a stored run.
    ///
    /// A finished run is never re-executed: its terminal event is emitted
    /// again with `replayed: true`. A pending run (one that failed before
    /// its first node) starts at the graph entry. Anything else continues
    /// from its cursor, in-flight loop count included.
    pub async fn resume(
        &self,
        breakpoint_id: &str,
        extra: serde_json::Value,
    ) -> Result<RunOutcome> {
        if breakpoint_id != self.run_id.as_str() {
            return Err(DelveError::InvalidPayload(format!(
                "breakpoint {} does not belong to run {}",
                breakpoint_id, self.run_id
            )));
        }

        let mut snapshot = RunSnapshot::load_from(self.store.as_ref(), breakpoint_id)
            .await?
            .ok_or_else(|| DelveError::RunNotFound(breakpoint_id.to_string()))?;

        if snapshot.workflow != self.graph.name() {
            return Err(DelveError::InvalidPayload(format!(
                "run {} belongs to workflow {}, not {}",
                breakpoint_id,
                snapshot.workflow,
                self.graph.name()
            )));
        }

        if let Some(kind) = snapshot.status.terminal_event() {
            info!(run_id = %self.run_id, status = %snapshot.status, "Replaying finished run");
            let mut payload = terminal_payload(&snapshot);
            payload["replayed"] = json!(true);
            self.events.emit(kind, None, payload);
            return Ok(RunOutcome {
                run_id: self.run_id.clone(),
                status: snapshot.status,
                context: snapshot.context,
                replayed: true,
            });
        }

        snapshot.context.merge_payload(&extra)?;
        let previous = snapshot.status;
        snapshot.status = RunStatus::Running;
        snapshot.error = None;

        if previous == RunStatus::Pending {
            if snapshot.context.query.trim().is_empty() {
                return Err(DelveError::InvalidPayload(
                    "a non-empty `query` is required".into(),
                ));
            }
            let entry = self.graph.entry().to_string();
            snapshot.cursor = Some(entry.clone());
            info!(run_id = %self.run_id, entry = %entry, "Pending run started");
            self.events.emit(
                EventKind::RunStarted,
                None,
                json!({
                    "run_id": self.run_id,
                    "workflow": self.graph.name(),
                    "query": snapshot.context.query,
                    "entry": entry,
                }),
            );
            return self.drive(snapshot, None).await;
        }

        // Only a deliberate suspension skips the pause on its own node.
        let resume_point = if previous == RunStatus::Suspended {
            snapshot.cursor.clone()
        } else {
            None
        };

        info!(
            run_id = %self.run_id,
            cursor = ?snapshot.cursor,
            from = %previous,
            "Run resumed"
        );
        self.events.emit(
            EventKind::RunResumed,
            None,
            json!({
                "run_id": self.run_id,
                "cursor": snapshot.cursor,
                "iteration": snapshot.context.loop_state.as_ref().map(|l| l.iteration),
            }),
        );

        self.drive(snapshot, resume_point).await
    }

    async fn drive(
        &self,
        mut snapshot: RunSnapshot,
        resume_point: Option<String>,
    ) -> Result<RunOutcome> {
        let run_timeout = tighter(
            self.limits.run_timeout,
            snapshot.context.options.timeout_secs.map(Duration::from_secs),
        );

        let result = {
            let walk = async {
                self.checkpoint(&mut snapshot).await?;
                self.walk(&mut snapshot, resume_point).await
            };
            match run_timeout {
                Some(limit) => match tokio::time::timeout(limit, walk).await {
                    Ok(result) => result,
                    Err(_) => Err(DelveError::Timeout(limit.as_secs())),
                },
                None => walk.await,
            }
        };

        self.finish(snapshot, result).await
    }

    async fn walk(
        &self,
        snapshot: &mut RunSnapshot,
        mut resume_point: Option<String>,
    ) -> Result<WalkEnd> {
        loop {
            let Some(cursor) = snapshot.cursor.clone() else {
                return Ok(WalkEnd::Completed);
            };

            if self.cancel.is_cancelled() {
                return Err(DelveError::Cancelled);
            }

            let resuming_here = resume_point.take().as_deref() == Some(cursor.as_str());
            if self.limits.pause_before.contains(&cursor) && !resuming_here {
                return Ok(WalkEnd::Suspended);
            }

            let node = self
                .graph
                .node(&cursor)
                .ok_or_else(|| DelveError::UnknownNode(cursor.clone()))?;
            let route = self.graph.route(&cursor, &snapshot.context)?;

            let started = Instant::now();
            info!(run_id = %self.run_id, node_id = %node.id, node_name = %node.name, "Node started");
            self.events.emit(
                EventKind::NodeStarted,
                Some(&node.id),
                json!({
                    "name": node.name,
                    "role": node.role,
                    "pattern": route.name(),
                    "output_mode": node.output_mode,
                }),
            );

            // The node's completion and the cursor move land in one
            // checkpoint, so a resume never repeats a finished node.
            let (last, next) = match route {
                Route::Loop {
                    edge,
                    max_iterations,
                    stop,
                } => {
                    let last = self
                        .run_loop(snapshot, node, edge, max_iterations, stop)
                        .await?;
                    snapshot.context.complete_node(&node.id);
                    (last, Some(edge))
                }
                Route::Terminal | Route::Once(_) => {
                    let planned = match route {
                        Route::Once(edge) => edge,
                        _ => None,
                    };
                    let ctx = &mut snapshot.context;
                    let input = match planned.and_then(|e| e.input.as_ref()) {
                        Some(transform) => transform(ctx),
                        None => node.build_input(ctx),
                    };
                    let output = self.invoke(ctx, node, input, None, Vec::new()).await?;
                    apply_output(ctx, node, planned, &output);
                    record_step(ctx, node, None, &output);
                    ctx.complete_node(&node.id);

                    let next = self.graph.select_edge(&node.id, ctx)?;
                    if next.is_none() && node.output_mode == OutputMode::Answer {
                        ctx.final_answer = Some(output.as_text());
                    }
                    (Some(output), next)
                }
            };

            snapshot.cursor = next.map(|e| e.to.clone());
            self.checkpoint(snapshot).await?;

            let invocations = snapshot
                .context
                .ledger
                .get(&node.id)
                .map_or(0, |r| r.invocations);
            info!(
                run_id = %self.run_id,
                node_id = %node.id,
                invocations,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Node completed"
            );
            self.events.emit(
                EventKind::NodeCompleted,
                Some(&node.id),
                json!({
                    "invocations": invocations,
                    "output": visible(node, last.as_ref().map(|o| &o.content)),
                    "next": next.map(|e| &e.to),
                }),
            );
        }
    }

    /// Invoke `node` repeatedly until the stop condition holds or the
    /// ceiling is reached. Returns the last output, if any iteration ran.
    async fn run_loop(
        &self,
        snapshot: &mut RunSnapshot,
        node: &Node,
        edge: &Edge,
        max_iterations: usize,
        stop: &StopCondition,
    ) -> Result<Option<StepOutput>> {
        let ceiling = max_iterations
            .min(self.limits.max_loop_iterations)
            .min(
                snapshot
                    .context
                    .options
                    .max_loop_iterations
                    .unwrap_or(usize::MAX),
            )
            .max(1);

        let (mut iteration, mut history) = match snapshot.context.loop_state.take() {
            Some(state) if state.node_id == node.id && state.edge_to == edge.to => {
                debug!(
                    run_id = %self.run_id,
                    node_id = %node.id,
                    iteration = state.iteration,
                    "Continuing loop"
                );
                (state.iteration, state.history)
            }
            _ => (0, Vec::new()),
        };

        let mut last = None;
        loop {
            if iteration >= ceiling {
                debug!(run_id = %self.run_id, node_id = %node.id, ceiling, "Loop ceiling reached");
                break;
            }
            if let Some(latest) = history.last() {
                if stop.should_stop(&history, latest) {
                    debug!(run_id = %self.run_id, node_id = %node.id, iteration, "Loop stop condition met");
                    break;
                }
            }

            debug!(run_id = %self.run_id, node_id = %node.id, iteration, "Loop iteration");
            let ctx = &mut snapshot.context;
            let input = match edge.input.as_ref() {
                Some(transform) => transform(ctx),
                None => node.build_input(ctx),
            };
            let output = self
                .invoke(ctx, node, input, Some(iteration), history.clone())
                .await?;

            history.push(output.content.clone());
            apply_output(ctx, node, Some(edge), &output);
            record_step(ctx, node, Some(iteration), &output);
            iteration += 1;
            ctx.loop_state = Some(LoopState {
                node_id: node.id.clone(),
                edge_to: edge.to.clone(),
                iteration,
                history: history.clone(),
            });
            self.checkpoint(snapshot).await?;
            last = Some(output);
        }

        snapshot.context.loop_state = None;
        Ok(last)
    }

    /// One step-executor call, raced against cancellation and the node
    /// timeout. Emits `node_updated` on success and `node_error` on failure.
    async fn invoke(
        &self,
        ctx: &mut RunContext,
        node: &Node,
        input: serde_json::Value,
        iteration: Option<usize>,
        history: Vec<serde_json::Value>,
    ) -> Result<StepOutput> {
        if self.cancel.is_cancelled() {
            return Err(DelveError::Cancelled);
        }

        ctx.begin_node(&node.id, &input);
        let request = StepRequest {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            role: node.role.clone(),
            executor: node.executor.clone(),
            config: node.config.clone(),
            tool_steps: node.tool_steps,
            input,
            iteration,
            history,
            cancel: self.cancel.clone(),
        };

        let node_timeout = tighter(
            self.limits.node_timeout,
            ctx.options.node_timeout_secs.map(Duration::from_secs),
        );
        let call = self.executor.execute(request);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DelveError::Cancelled),
            result = with_timeout(call, node_timeout, &node.id) => result,
        };

        match result {
            Ok(output) => {
                ctx.record_output(&node.id, &output);
                let reasoning = match node.output_mode {
                    OutputMode::Silent => None,
                    _ => output.reasoning.as_deref(),
                };
                self.events.emit(
                    EventKind::NodeUpdated,
                    Some(&node.id),
                    json!({
                        "iteration": iteration,
                        "output_mode": node.output_mode,
                        "output": visible(node, Some(&output.content)),
                        "reasoning": reasoning,
                    }),
                );
                Ok(output)
            }
            Err(e) if matches!(e, DelveError::Cancelled) || self.cancel.is_cancelled() => {
                warn!(run_id = %self.run_id, node_id = %node.id, "Step interrupted by cancellation");
                ctx.abort_node(&node.id);
                Err(DelveError::Cancelled)
            }
            Err(e) => {
                let message = match &e {
                    DelveError::Step { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                error!(run_id = %self.run_id, node_id = %node.id, error = %message, "Step failed");
                ctx.fail_node(&node.id, message.clone());
                self.events.emit(
                    EventKind::NodeError,
                    Some(&node.id),
                    json!({ "error": message, "iteration": iteration }),
                );
                Err(match e {
                    DelveError::Step { .. } => e,
                    _ => DelveError::Step {
                        node: node.id.clone(),
                        message,
                    },
                })
            }
        }
    }

    /// Settle the run's status, emit its closing event and return.
    async fn finish(
        &self,
        mut snapshot: RunSnapshot,
        result: Result<WalkEnd>,
    ) -> Result<RunOutcome> {
        let status = match result {
            Ok(WalkEnd::Completed) => {
                snapshot.status = RunStatus::Completed;
                snapshot.cursor = None;
                RunStatus::Completed
            }
            Ok(WalkEnd::Suspended) => {
                snapshot.status = RunStatus::Suspended;
                RunStatus::Suspended
            }
            Err(e) if e.is_persistence() => return Err(self.persistence_failure(e)),
            Err(e) if matches!(e, DelveError::Cancelled) || self.cancel.is_cancelled() => {
                warn!(run_id = %self.run_id, cursor = ?snapshot.cursor, "Run aborted");
                interrupt_running(&mut snapshot.context, None);
                snapshot.status = RunStatus::Aborted;
                RunStatus::Aborted
            }
            Err(e) => {
                error!(run_id = %self.run_id, cursor = ?snapshot.cursor, error = %e, "Run failed");
                interrupt_running(&mut snapshot.context, Some(&e.to_string()));
                snapshot.status = RunStatus::Error;
                snapshot.error = Some(e.to_string());
                if let Err(store_err) = self.checkpoint(&mut snapshot).await {
                    return Err(self.persistence_failure(store_err));
                }
                self.events.emit(EventKind::Error, None, terminal_payload(&snapshot));
                return Err(e);
            }
        };

        if let Err(e) = self.checkpoint(&mut snapshot).await {
            return Err(self.persistence_failure(e));
        }

        match status {
            RunStatus::Suspended => {
                info!(run_id = %self.run_id, cursor = ?snapshot.cursor, "Run suspended");
                self.events.emit(
                    EventKind::RunSuspended,
                    None,
                    json!({
                        "run_id": self.run_id,
                        "cursor": snapshot.cursor,
                        "breakpoint": self.run_id,
                    }),
                );
            }
            _ => {
                info!(run_id = %self.run_id, status = %status, "Run finished");
                if let Some(kind) = status.terminal_event() {
                    self.events.emit(kind, None, terminal_payload(&snapshot));
                }
            }
        }

        Ok(RunOutcome {
            run_id: self.run_id.clone(),
            status,
            context: snapshot.context,
            replayed: false,
        })
    }

    /// A store failure ends the call without being recorded as a run error.
    fn persistence_failure(&self, e: DelveError) -> DelveError {
        error!(run_id = %self.run_id, error = %e, "Checkpoint failed");
        self.events.emit(
            EventKind::Error,
            None,
            json!({ "run_id": self.run_id, "error": e.to_string(), "persistence": true }),
        );
        e
    }

    async fn checkpoint(&self, snapshot: &mut RunSnapshot) -> Result<()> {
        snapshot.save_to(self.store.as_ref()).await
    }
}

/// Payload of the terminal event for a finished snapshot.
fn terminal_payload(snapshot: &RunSnapshot) -> serde_json::Value {
    match snapshot.status {
        RunStatus::Completed => json!({
            "run_id": snapshot.run_id,
            "status": snapshot.status,
            "final_answer": snapshot.context.final_answer,
            "steps": snapshot.context.steps.len(),
            "sources": snapshot.context.sources,
        }),
        RunStatus::Error => json!({
            "run_id": snapshot.run_id,
            "status": snapshot.status,
            "error": snapshot.error,
            "cursor": snapshot.cursor,
        }),
        _ => json!({
            "run_id": snapshot.run_id,
            "status": snapshot.status,
            "cursor": snapshot.cursor,
        }),
    }
}

fn apply_output(ctx: &mut RunContext, node: &Node, edge: Option<&Edge>, output: &StepOutput) {
    match edge.and_then(|e| e.output.as_ref()) {
        Some(transform) => transform(ctx, output),
        None => ctx.ingest_output(&node.output_keys, output),
    }
}

fn record_step(ctx: &mut RunContext, node: &Node, iteration: Option<usize>, output: &StepOutput) {
    if node.is_step {
        ctx.steps.push(StepRecord {
            node_id: node.id.clone(),
            name: node.name.clone(),
            iteration,
            output: output.content.clone(),
            recorded_at: chrono::Utc::now(),
        });
    }
}

/// Output as shown to the caller; silent nodes show nothing.
fn visible<'a>(node: &Node, output: Option<&'a serde_json::Value>) -> Option<&'a serde_json::Value> {
    match node.output_mode {
        OutputMode::Silent => None,
        _ => output,
    }
}

/// Close out ledger entries left running by an interrupted call.
fn interrupt_running(ctx: &mut RunContext, error: Option<&str>) {
    let running: Vec<String> = ctx
        .ledger
        .iter()
        .filter(|(_, r)| r.status == NodeStatus::Running)
        .map(|(id, _)| id.clone())
        .collect();
    for id in running {
        match error {
            Some(message) => ctx.fail_node(&id, message),
            None => ctx.abort_node(&id),
        }
    }
}

fn tighter(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

async fn with_timeout<F>(call: F, limit: Option<Duration>, node_id: &str) -> Result<StepOutput>
where
    F: std::future::Future<Output = Result<StepOutput>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .map_err(|_| DelveError::Step {
                node: node_id.to_string(),
                message: format!("timed out after {}s", limit.as_secs()),
            })?,
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_from_config() {
        let config = EngineConfig {
            max_loop_iterations: 4,
            node_timeout_secs: 0,
            run_timeout_secs: 60,
            pause_before: vec!["review".into()],
        };
        let limits = EngineLimits::from(&config);
        assert_eq!(limits.max_loop_iterations, 4);
        assert!(limits.node_timeout.is_none());
        assert_eq!(limits.run_timeout, Some(Duration::from_secs(60)));
        assert!(limits.pause_before.contains("review"));
    }

    #[test]
    fn test_tighter() {
        let s = Duration::from_secs;
        assert_eq!(tighter(Some(s(5)), Some(s(3))), Some(s(3)));
        assert_eq!(tighter(None, Some(s(3))), Some(s(3)));
        assert_eq!(tighter(Some(s(5)), None), Some(s(5)));
        assert_eq!(tighter(None, None), None);
    }

    #[test]
    fn test_interrupt_running() {
        let mut ctx = RunContext::new("q");
        ctx.begin_node("a", &json!({}));
        ctx.complete_node("a");
        ctx.begin_node("b", &json!({}));

        interrupt_running(&mut ctx, Some("Run exceeded time limit (5s)"));
        assert_eq!(ctx.node_status("a"), Some(NodeStatus::Completed));
        assert_eq!(ctx.node_status("b"), Some(NodeStatus::Error));
    }
}
