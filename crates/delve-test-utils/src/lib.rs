//! Shared fixtures for Delve tests: a scripted step executor, a store that
//! can be told to fail, an event recorder and a few canned graphs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use delve_core::error::{DelveError, Result};
use delve_core::event::EventChannel;
use delve_core::traits::{StateStore, StepExecutor};
use delve_core::types::{Event, EventKind, RunId, StepOutput, StepRequest};
use delve_engine::{
    Edge, Engine, EngineLimits, EngineParts, Graph, GraphBuilder, Node, StopCondition,
};
use delve_store::{MemoryStore, SqliteStore};

/// One recorded step-executor call.
#[derive(Debug, Clone)]
pub struct StepCall {
    pub run_id: String,
    pub node_id: String,
    pub iteration: Option<usize>,
    pub input: serde_json::Value,
    pub history_len: usize,
}

/// Step executor driven by a script instead of a model.
///
/// By default every step answers `"<node>: <query>"` (with `#n` for loop
/// iterations). Canned outputs, failures and blocking steps can be set per
/// node or per call number.
#[derive(Default)]
pub struct ScriptedExecutor {
    calls: Mutex<Vec<StepCall>>,
    outputs: HashMap<String, Vec<serde_json::Value>>,
    fail_on_call: Option<(usize, String)>,
    fail_at: Option<(String, String)>,
    block_at: Option<String>,
    delay: Option<Duration>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th call overall (1-based).
    pub fn fail_on_call(mut self, n: usize, message: impl Into<String>) -> Self {
        self.fail_on_call = Some((n, message.into()));
        self
    }

    /// Fail every call to `node_id`.
    pub fn fail_at(mut self, node_id: impl Into<String>, message: impl Into<String>) -> Self {
        self.fail_at = Some((node_id.into(), message.into()));
        self
    }

    /// Block calls to `node_id` until the run is cancelled, then fail.
    pub fn block_at(mut self, node_id: impl Into<String>) -> Self {
        self.block_at = Some(node_id.into());
        self
    }

    /// Answer successive calls to `node_id` with these outputs; the last
    /// one repeats.
    pub fn with_outputs(mut self, node_id: impl Into<String>, outputs: Vec<serde_json::Value>) -> Self {
        self.outputs.insert(node_id.into(), outputs);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<StepCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, node_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.node_id == node_id)
            .count()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn execute(&self, request: StepRequest) -> BoxFuture<'_, Result<StepOutput>> {
        Box::pin(async move {
            let (call_no, node_call_no) = {
                let mut calls = self.calls.lock().unwrap();
                let node_calls = calls.iter().filter(|c| c.node_id == request.node_id).count();
                calls.push(StepCall {
                    run_id: request.run_id.to_string(),
                    node_id: request.node_id.clone(),
                    iteration: request.iteration,
                    input: request.input.clone(),
                    history_len: request.history.len(),
                });
                (calls.len(), node_calls)
            };

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.block_at.as_deref() == Some(request.node_id.as_str()) {
                request.cancel.cancelled().await;
                return Err(DelveError::Step {
                    node: request.node_id.clone(),
                    message: "interrupted".into(),
                });
            }

            if let Some((n, message)) = &self.fail_on_call {
                if *n == call_no {
                    return Err(DelveError::Step {
                        node: request.node_id.clone(),
                        message: message.clone(),
                    });
                }
            }
            if let Some((node, message)) = &self.fail_at {
                if *node == request.node_id {
                    return Err(DelveError::Step {
                        node: node.clone(),
                        message: message.clone(),
                    });
                }
            }

            if let Some(outputs) = self.outputs.get(&request.node_id) {
                if let Some(out) = outputs.get(node_call_no).or_else(|| outputs.last()) {
                    return Ok(StepOutput::json(out.clone()));
                }
            }

            let query = request
                .input
                .get("query")
                .and_then(|q| q.as_str())
                .unwrap_or_default();
            let text = match request.iteration {
                Some(i) => format!("{} #{}: {}", request.node_id, i + 1, query),
                None => format!("{}: {}", request.node_id, query),
            };
            Ok(StepOutput::text(text))
        })
    }
}

/// Store wrapper that starts failing saves after a number of successes.
pub struct FlakyStore {
    inner: MemoryStore,
    saves_left: AtomicUsize,
}

impl FlakyStore {
    pub fn failing_after(saves: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            saves_left: AtomicUsize::new(saves),
        }
    }
}

impl StateStore for FlakyStore {
    fn save(&self, id: &str, data: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let allowed = self
            .saves_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Box::pin(async { Err(DelveError::Persistence("disk full".into())) });
        }
        self.inner.save(id, data)
    }

    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        self.inner.load(id)
    }

    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        self.inner.delete(id)
    }

    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>> {
        self.inner.exists(id)
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        self.inner.list()
    }
}

/// A SQLite store in a temp directory. Keep the `TempDir` alive.
pub fn temp_sqlite_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("runs.db")).unwrap();
    (dir, store)
}

/// Records every event emitted on a channel.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn attach(channel: &EventChannel) -> Self {
        let log = Self::default();
        let sink = log.events.clone();
        channel.on_all(move |e| sink.lock().unwrap().push(e.clone()));
        log
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn count_for(&self, kind: EventKind, node_id: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind && e.node_id.as_deref() == Some(node_id))
            .count()
    }

    /// Terminal events seen, in order.
    pub fn terminals(&self) -> Vec<EventKind> {
        self.kinds().into_iter().filter(|k| k.is_terminal()).collect()
    }

    pub fn last(&self) -> Option<Event> {
        self.events.lock().unwrap().last().cloned()
    }
}

/// An engine wired to a fresh event channel, with a recorder attached.
pub struct Harness {
    pub engine: Engine,
    pub events: Arc<EventChannel>,
    pub log: EventLog,
    pub cancel: CancellationToken,
}

pub fn harness(
    run_id: &str,
    graph: Arc<Graph>,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn StepExecutor>,
    limits: EngineLimits,
) -> Harness {
    let events = Arc::new(EventChannel::new());
    let log = EventLog::attach(&events);
    let cancel = CancellationToken::new();
    let engine = Engine::new(EngineParts {
        run_id: RunId::from_string(run_id),
        graph,
        events: events.clone(),
        store,
        executor,
        cancel: cancel.clone(),
        limits,
    });
    Harness {
        engine,
        events,
        log,
        cancel,
    }
}

/// `a -> b -> c`, all sequential.
pub fn chain_graph() -> Graph {
    let mut b = GraphBuilder::new("chain");
    for id in ["a", "b", "c"] {
        b.add_node(Node::new(id, id.to_uppercase()).as_step()).unwrap();
    }
    b.add_edge(Edge::sequential("a", "b")).unwrap();
    b.add_edge(Edge::sequential("b", "c")).unwrap();
    b.entry("a");
    b.build().unwrap()
}

/// `a -> b (loop) -> c`: `b` repeats up to `max_iterations` times.
pub fn loop_graph(max_iterations: usize, stop: StopCondition) -> Graph {
    let mut b = GraphBuilder::new("looping");
    for id in ["a", "b", "c"] {
        b.add_node(Node::new(id, id.to_uppercase())).unwrap();
    }
    b.add_edge(Edge::sequential("a", "b")).unwrap();
    b.add_edge(Edge::looping("b", "c", max_iterations, stop))
        .unwrap();
    b.entry("a");
    b.build().unwrap()
}

pub fn start_payload(query: &str) -> serde_json::Value {
    serde_json::json!({ "query": query })
}
