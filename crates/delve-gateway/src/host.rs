use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use delve_core::error::{DelveError, Result};
use delve_core::event::EventChannel;
use delve_core::traits::{StateStore, StepExecutor};
use delve_core::types::{Event, EventKind, RunId, RunStatus};
use delve_engine::{
    Engine, EngineLimits, EngineParts, Graph, GraphFactory, RunContext, RunOutcome, RunSnapshot,
};

use crate::admission::AdmissionControl;
use crate::lanes::RunLanes;

/// One request to execute a run, fresh or resumed.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    /// Workflow for a fresh run; the factory default when absent.
    pub workflow: Option<String>,
    pub payload: serde_json::Value,
    pub thread_item_id: Option<String>,
}

impl RunRequest {
    pub fn new(run_id: RunId, payload: serde_json::Value) -> Self {
        Self {
            run_id,
            workflow: None,
            payload,
            thread_item_id: None,
        }
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn with_thread_item(mut self, id: impl Into<String>) -> Self {
        self.thread_item_id = Some(id.into());
        self
    }
}

/// An engine event tagged with the run it belongs to.
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub run_id: RunId,
    pub thread_item_id: String,
    pub event: Event,
}

/// Events of one execution, closed once the engine has returned.
pub type RunStream = mpsc::Receiver<StreamItem>;

/// Hosts independent runs keyed by run id.
///
/// Every execution gets its own engine, event channel and cancellation
/// token; the only shared pieces are the store, the lanes that serialize
/// executions of the same id, and the tokens of live runs.
pub struct RunHost {
    factory: Arc<dyn GraphFactory>,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn StepExecutor>,
    admission: Arc<dyn AdmissionControl>,
    limits: EngineLimits,
    stream_buffer: usize,
    lanes: RunLanes,
    live: Mutex<HashMap<String, CancellationToken>>,
}

impl RunHost {
    pub fn new(
        factory: Arc<dyn GraphFactory>,
        store: Arc<dyn StateStore>,
        executor: Arc<dyn StepExecutor>,
        admission: Arc<dyn AdmissionControl>,
        limits: EngineLimits,
        stream_buffer: usize,
    ) -> Self {
        Self {
            factory,
            store,
            executor,
            admission,
            limits,
            stream_buffer: stream_buffer.max(1),
            lanes: RunLanes::new(),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Execute a run in the background and stream its events.
    ///
    /// With no stored snapshot the run is admitted, built and started at
    /// its entry. A stored unfinished run is resumed from its checkpoint;
    /// a finished one replays its terminal event without executing.
    pub fn execute(self: &Arc<Self>, request: RunRequest) -> RunStream {
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let host = self.clone();
        tokio::spawn(async move { host.run(request, tx).await });
        rx
    }

    /// Trip the cancellation token of a live run.
    pub fn cancel(&self, run_id: &str) -> bool {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        match live.get(run_id) {
            Some(token) => {
                info!(run_id = %run_id, "Cancelling run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every live run. Used on shutdown.
    pub fn cancel_all(&self) {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        for (run_id, token) in live.iter() {
            debug!(run_id = %run_id, "Cancelling run for shutdown");
            token.cancel();
        }
    }

    pub fn is_live(&self, run_id: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(run_id)
    }

    async fn run(&self, request: RunRequest, tx: mpsc::Sender<StreamItem>) {
        let run_id = request.run_id.clone();
        let _lane = self.lanes.acquire(run_id.as_str()).await;

        let thread_item_id = request
            .thread_item_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let events = Arc::new(EventChannel::new());
        let closed_out = Arc::new(AtomicBool::new(false));
        {
            let closed_out = closed_out.clone();
            events.on_all(move |e| {
                if e.kind.is_terminal() || e.kind == EventKind::RunSuspended {
                    closed_out.store(true, Ordering::Release);
                }
            });
        }

        let (_, mut rx) = events.stream();
        let forward = {
            let run_id = run_id.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let item = StreamItem {
                        run_id: run_id.clone(),
                        thread_item_id: thread_item_id.clone(),
                        event,
                    };
                    if tx.send(item).await.is_err() {
                        debug!(run_id = %run_id, "Stream consumer gone, run continues");
                        break;
                    }
                }
            })
        };

        let cancel = CancellationToken::new();
        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(run_id.to_string(), cancel.clone());

        let result = self.dispatch(&request, events.clone(), cancel).await;

        self.live
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id.as_str());

        match result {
            Ok(outcome) => {
                if outcome.status == RunStatus::Completed && !outcome.replayed {
                    self.admission.settle(&run_id).await;
                }
                debug!(run_id = %run_id, status = %outcome.status, "Execution finished");
            }
            Err(e) if !closed_out.load(Ordering::Acquire) => {
                self.startup_failure(&request, &e, &events).await;
            }
            Err(e) => debug!(run_id = %run_id, error = %e, "Execution ended with error"),
        }

        events.close();
        if let Err(e) = forward.await {
            error!(run_id = %run_id, error = %e, "Event forwarder failed");
        }
    }

    async fn dispatch(
        &self,
        request: &RunRequest,
        events: Arc<EventChannel>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let id = request.run_id.as_str();
        match RunSnapshot::load_from(self.store.as_ref(), id).await? {
            None => {
                self.admission.admit(&request.run_id).await?;
                let workflow = request
                    .workflow
                    .as_deref()
                    .unwrap_or_else(|| self.factory.default_workflow());
                let graph = Arc::new(self.factory.build(workflow)?);
                let entry = graph.entry().to_string();
                info!(run_id = %id, workflow = %workflow, "Starting run");
                self.engine(request, graph, events, cancel)
                    .start(&entry, request.payload.clone())
                    .await
            }
            Some(snapshot) => {
                if let Some(asked) = request.workflow.as_deref() {
                    if asked != snapshot.workflow {
                        debug!(
                            run_id = %id,
                            asked = %asked,
                            stored = %snapshot.workflow,
                            "Ignoring workflow of existing run"
                        );
                    }
                }
                // A pending run never started; it goes through admission
                // like a fresh one.
                if snapshot.status == RunStatus::Pending {
                    self.admission.admit(&request.run_id).await?;
                }
                let graph = Arc::new(self.factory.build(&snapshot.workflow)?);
                info!(run_id = %id, status = %snapshot.status, "Resuming run");
                self.engine(request, graph, events, cancel)
                    .resume(id, request.payload.clone())
                    .await
            }
        }
    }

    fn engine(
        &self,
        request: &RunRequest,
        graph: Arc<Graph>,
        events: Arc<EventChannel>,
        cancel: CancellationToken,
    ) -> Engine {
        Engine::new(EngineParts {
            run_id: request.run_id.clone(),
            graph,
            events,
            store: self.store.clone(),
            executor: self.executor.clone(),
            cancel,
            limits: self.limits.clone(),
        })
    }

    /// The run failed before the engine could announce an outcome.
    ///
    /// Keeps whatever the request carried in a pending snapshot so the run
    /// can be started again, then reports the error on the stream.
    async fn startup_failure(&self, request: &RunRequest, err: &DelveError, events: &EventChannel) {
        let run_id = &request.run_id;
        warn!(run_id = %run_id, error = %err, "Run failed to start");

        let keep = !matches!(
            err,
            DelveError::AdmissionDenied { .. }
                | DelveError::Persistence(_)
                | DelveError::Serialization(_)
        );
        if keep {
            if let Err(e) = self.save_pending(request, err).await {
                error!(run_id = %run_id, error = %e, "Failed to save pending snapshot");
            }
        }

        let mut payload = json!({
            "run_id": run_id,
            "error": err.to_string(),
            "startup": true,
        });
        if let DelveError::AdmissionDenied {
            remaining, cost, ..
        } = err
        {
            payload["admission"] = json!({ "remaining": remaining, "cost": cost });
        }
        if err.is_persistence() {
            payload["persistence"] = json!(true);
        }
        events.emit(EventKind::Error, None, payload);
    }

    async fn save_pending(&self, request: &RunRequest, err: &DelveError) -> Result<()> {
        let id = request.run_id.as_str();
        let mut snapshot = match RunSnapshot::load_from(self.store.as_ref(), id).await? {
            Some(existing) if existing.status == RunStatus::Pending => existing,
            // Progress already checkpointed; leave it for the next resume.
            Some(_) => return Ok(()),
            None => {
                let workflow = request
                    .workflow
                    .clone()
                    .unwrap_or_else(|| self.factory.default_workflow().to_string());
                RunSnapshot::new(request.run_id.clone(), workflow, None, RunContext::default())
            }
        };

        if let Err(e) = snapshot.context.merge_payload(&request.payload) {
            debug!(run_id = %id, error = %e, "Payload not kept");
        }
        snapshot.error = Some(err.to_string());
        snapshot.save_to(self.store.as_ref()).await
    }
}
