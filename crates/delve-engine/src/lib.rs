pub mod context;
pub mod executor;
pub mod factory;
pub mod graph;
pub mod research;
pub mod snapshot;
pub mod step;

pub use context::{LoopState, NodeRecord, RunContext, RunOptions, StepRecord};
pub use executor::{Engine, EngineLimits, EngineParts, RunOutcome};
pub use factory::{FnFactory, GraphFactory};
pub use graph::{Condition, Edge, EdgePattern, Graph, GraphBuilder, Node, Route, StopCondition};
pub use research::DeepSearchFactory;
pub use snapshot::RunSnapshot;
pub use step::{EchoExecutor, RemoteExecutor};
