use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::{StepOutput, StepRequest};

/// Step executor: the opaque capability a node delegates to.
///
/// Implementations perform the model call and any tool loop. They should
/// watch `request.cancel` and return early when it fires.
pub trait StepExecutor: Send + Sync + 'static {
    fn execute(&self, request: StepRequest) -> BoxFuture<'_, Result<StepOutput>>;
}

/// State store: per-run key-value persistence.
///
/// Keys are caller-chosen run ids; values are self-describing JSON
/// snapshots. `load` returns `Ok(None)` when the key is absent.
pub trait StateStore: Send + Sync + 'static {
    fn save(&self, id: &str, data: serde_json::Value) -> BoxFuture<'_, Result<()>>;

    fn load(&self, id: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    /// Returns true if something was deleted.
    fn delete(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    fn exists(&self, id: &str) -> BoxFuture<'_, Result<bool>>;

    /// All stored keys, for inspection.
    fn list(&self) -> BoxFuture<'_, Result<Vec<String>>>;
}
