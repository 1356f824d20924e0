use delve_core::error::{DelveError, Result};

use crate::graph::Graph;

/// Builds workflow graphs by name.
///
/// Injected into the run host; each fresh run asks for its graph here, and
/// a resumed run rebuilds the graph recorded in its snapshot.
pub trait GraphFactory: Send + Sync + 'static {
    /// Workflow used when a request names none.
    fn default_workflow(&self) -> &str;

    fn build(&self, workflow: &str) -> Result<Graph>;
}

/// Single-workflow factory backed by a closure.
pub struct FnFactory<F> {
    workflow: String,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn() -> Result<Graph> + Send + Sync + 'static,
{
    pub fn new(workflow: impl Into<String>, build: F) -> Self {
        Self {
            workflow: workflow.into(),
            build,
        }
    }
}

impl<F> GraphFactory for FnFactory<F>
where
    F: Fn() -> Result<Graph> + Send + Sync + 'static,
{
    fn default_workflow(&self) -> &str {
        &self.workflow
    }

    fn build(&self, workflow: &str) -> Result<Graph> {
        if workflow != self.workflow {
            return Err(DelveError::InvalidPayload(format!(
                "unknown workflow: {}",
                workflow
            )));
        }
        (self.build)()
    }
}
