use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

type LaneMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Per-run FIFO lanes ensuring one execution per run id at a time.
///
/// A lane holds no run state; it only orders executions of the same id.
/// Lanes of distinct run ids never contend, and a lane is dropped as soon
/// as nobody holds or waits on it.
#[derive(Clone, Default)]
pub struct RunLanes {
    lanes: Arc<Mutex<LaneMap>>,
}

impl RunLanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lane of `run_id`. Waiters are served in arrival order.
    pub async fn acquire(&self, run_id: &str) -> LaneGuard {
        let lane = {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            lanes.entry(run_id.to_string()).or_default().clone()
        };
        let guard = lane.lock_owned().await;
        LaneGuard {
            guard: Some(guard),
            lanes: self.lanes.clone(),
            run_id: run_id.to_string(),
        }
    }

    /// Number of lanes currently held or waited on.
    pub fn active(&self) -> usize {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Exclusive hold on one run's lane, released on drop.
pub struct LaneGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lanes: Arc<Mutex<LaneMap>>,
    run_id: String,
}

impl Drop for LaneGuard {
    fn drop(&mut self) {
        // Release first so the count below only sees the map and waiters.
        self.guard.take();
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lane) = lanes.get(&self.run_id) {
            if Arc::strong_count(lane) == 1 {
                lanes.remove(&self.run_id);
            }
        }
    }
}
