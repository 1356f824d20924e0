//! Workflow graph model.
//!
//! A workflow is a directed graph of `Node`s connected by `Edge`s. Each node
//! is one agent step handed to a step executor. A loop edge eligible before
//! the current node runs makes it repeat as a bounded loop; otherwise it runs
//! once and the sequential edge chosen after its output lands decides where
//! the cursor goes next.
//!
//! Graphs are assembled with `GraphBuilder`, validated once in `build()`,
//! and shared immutably (`Arc<Graph>`) by every run of the workflow.

pub mod builder;
pub mod edge;
pub mod node;

pub use builder::{Graph, GraphBuilder, Route};
pub use edge::{
    evaluate_condition, Condition, ContextPredicate, Edge, EdgePattern, InputTransform,
    OutputTransform, StopCondition, StopPredicate,
};
pub use node::Node;
