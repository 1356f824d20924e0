use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use delve_core::error::{DelveError, Result};
use delve_core::traits::StateStore;
use delve_core::types::{RunId, RunStatus};

use crate::context::RunContext;

/// Current snapshot layout.
pub const SNAPSHOT_VERSION: u32 = 1;

/// A checkpoint of one run, stored through `StateStore` as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub version: u32,
    pub run_id: RunId,
    /// Graph name the run was started on.
    pub workflow: String,
    pub status: RunStatus,
    /// Next node to execute; `None` once the run has finished.
    pub cursor: Option<String>,
    pub context: RunContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(
        run_id: RunId,
        workflow: impl Into<String>,
        cursor: Option<String>,
        context: RunContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            run_id,
            workflow: workflow.into(),
            status: RunStatus::Pending,
            cursor,
            context,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| DelveError::Serialization(e.to_string()))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_value(value).map_err(|e| DelveError::Serialization(e.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(DelveError::Serialization(format!(
                "snapshot version {} is newer than supported version {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }

    /// Stamp `updated_at` and write the snapshot under its run id.
    pub async fn save_to(&mut self, store: &dyn StateStore) -> Result<()> {
        self.updated_at = Utc::now();
        let value = self.to_value()?;
        store.save(self.run_id.as_str(), value).await
    }

    /// Load the snapshot stored under `id`, if any.
    pub async fn load_from(store: &dyn StateStore, id: &str) -> Result<Option<Self>> {
        match store.load(id).await? {
            Some(value) => Self::from_value(value).map(Some),
            None => Ok(None),
        }
    }

    /// Compact view for status endpoints and the CLI.
    pub fn summary(&self) -> serde_json::Value {
        let ledger: serde_json::Map<String, serde_json::Value> = self
            .context
            .ledger
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    serde_json::json!({
                        "status": record.status,
                        "invocations": record.invocations,
                        "error": record.error,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "run_id": self.run_id,
            "workflow": self.workflow,
            "status": self.status,
            "cursor": self.cursor,
            "error": self.error,
            "query": self.context.query,
            "final_answer": self.context.final_answer,
            "steps": self.context.steps.len(),
            "sources": self.context.sources.len(),
            "ledger": ledger,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }
}
