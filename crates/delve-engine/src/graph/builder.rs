use std::collections::{HashMap, HashSet, VecDeque};

use tracing::debug;

use delve_core::error::{DelveError, Result};

use super::edge::{Edge, EdgePattern, StopCondition};
use super::node::Node;
use crate::context::RunContext;

/// Assembles a workflow graph and validates it once in `build()`.
///
/// Graph errors only ever surface here; a `Graph` that exists is valid.
pub struct GraphBuilder {
    name: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: Vec<Edge>,
    entry: Option<String>,
    terminal: Option<String>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            entry: None,
            terminal: None,
        }
    }

    /// Set the node every fresh run starts from.
    pub fn entry(&mut self, id: impl Into<String>) -> &mut Self {
        self.entry = Some(id.into());
        self
    }

    /// Declare the terminal node. Inferred when left unset.
    pub fn terminal(&mut self, id: impl Into<String>) -> &mut Self {
        self.terminal = Some(id.into());
        self
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(DelveError::DuplicateNode(node.id));
        }
        self.order.push(node.id.clone());
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        for id in [&edge.from, &edge.to] {
            if !self.nodes.contains_key(id) {
                return Err(DelveError::UnknownNode(id.clone()));
            }
        }
        if edge.from == edge.to {
            return Err(DelveError::InvalidEdge {
                from: edge.from,
                to: edge.to,
                reason: "self-edges are not allowed; use a loop pattern".into(),
            });
        }
        if let EdgePattern::Loop { max_iterations: 0, .. } = edge.pattern {
            return Err(DelveError::InvalidEdge {
                from: edge.from,
                to: edge.to,
                reason: "loop max_iterations must be at least 1".into(),
            });
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph> {
        let entry = match &self.entry {
            Some(id) if self.nodes.contains_key(id) => id.clone(),
            Some(id) => return Err(DelveError::MissingEntry(id.clone())),
            None => return Err(DelveError::MissingEntry("<unset>".into())),
        };

        let has_outgoing: HashSet<&str> = self.edges.iter().map(|e| e.from.as_str()).collect();
        let sinks: Vec<&String> = self
            .order
            .iter()
            .filter(|id| !has_outgoing.contains(id.as_str()))
            .collect();

        let terminal = match &self.terminal {
            Some(id) => {
                if !self.nodes.contains_key(id) {
                    return Err(DelveError::MissingTerminal(id.clone()));
                }
                if let Some(edge) = self.edges.iter().find(|e| &e.from == id) {
                    return Err(DelveError::InvalidEdge {
                        from: edge.from.clone(),
                        to: edge.to.clone(),
                        reason: "terminal node must not have outgoing edges".into(),
                    });
                }
                id.clone()
            }
            None => match sinks.as_slice() {
                [only] => (*only).clone(),
                [] => {
                    return Err(DelveError::MissingTerminal(
                        "every node has an outgoing edge".into(),
                    ))
                }
                many => {
                    return Err(DelveError::MissingTerminal(format!(
                        "ambiguous, candidates: {}",
                        many.iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )))
                }
            },
        };

        if let Some(dead) = sinks.iter().find(|id| ***id != terminal) {
            return Err(DelveError::DeadEnd((*dead).clone()));
        }

        // Reachability from the entry.
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue = VecDeque::from([entry.as_str()]);
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for edge in self.edges.iter().filter(|e| e.from == id) {
                queue.push_back(edge.to.as_str());
            }
        }
        if let Some(orphan) = self.order.iter().find(|id| !seen.contains(id.as_str())) {
            return Err(DelveError::UnreachableNode(orphan.clone()));
        }

        if let Some(node) = self.find_cycle() {
            return Err(DelveError::CycleDetected(node));
        }

        debug!(
            graph = %self.name,
            nodes = self.order.len(),
            edges = self.edges.len(),
            entry = %entry,
            terminal = %terminal,
            "Graph built"
        );

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            order: self.order,
            edges: self.edges,
            entry,
            terminal,
        })
    }

    /// Depth-first search for a back edge. Returns a node on the cycle.
    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            Active,
            Done,
        }

        fn visit<'a>(
            id: &'a str,
            edges: &'a [Edge],
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Option<String> {
            marks.insert(id, Mark::Active);
            for edge in edges.iter().filter(|e| e.from == id) {
                match marks.get(edge.to.as_str()).copied().unwrap_or(Mark::Unvisited) {
                    Mark::Active => return Some(edge.to.clone()),
                    Mark::Unvisited => {
                        if let Some(found) = visit(edge.to.as_str(), edges, marks) {
                            return Some(found);
                        }
                    }
                    Mark::Done => {}
                }
            }
            marks.insert(id, Mark::Done);
            None
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for id in &self.order {
            if marks.get(id.as_str()).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited {
                if let Some(found) = visit(id.as_str(), &self.edges, &mut marks) {
                    return Some(found);
                }
            }
        }
        None
    }
}

/// An immutable, validated workflow graph.
pub struct Graph {
    name: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: Vec<Edge>,
    entry: String,
    terminal: String,
}

impl Graph {
    /// Workflow name, recorded in every snapshot.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn terminal(&self) -> &str {
        &self.terminal
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        let id = id.to_string();
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Decide how `id` is invoked, before it runs.
    ///
    /// The best edge eligible now (lowest priority, first declared on ties)
    /// decides: a loop edge makes `id` loop toward its target. Otherwise `id`
    /// runs once and its transition is picked afterwards by `select_edge`,
    /// so its own output can steer the route. Only a node whose every
    /// outgoing edge is an ineligible loop fails up front.
    pub fn route(&self, id: &str, ctx: &RunContext) -> Result<Route<'_>> {
        if self.outgoing(id).next().is_none() {
            return Ok(Route::Terminal);
        }
        match self.best_edge(id, ctx, |_| true) {
            Some(edge) => match &edge.pattern {
                EdgePattern::Loop {
                    max_iterations,
                    stop,
                } => Ok(Route::Loop {
                    edge,
                    max_iterations: *max_iterations,
                    stop,
                }),
                EdgePattern::Sequential => Ok(Route::Once(Some(edge))),
            },
            None if self.outgoing(id).any(|e| !e.is_loop()) => Ok(Route::Once(None)),
            None => Err(DelveError::NoViableTransition(id.to_string())),
        }
    }

    /// Pick the sequential transition out of `id` once its output is in
    /// run state.
    ///
    /// Among sequential edges whose condition holds, the lowest priority
    /// wins and ties go to the edge declared first. `Ok(None)` means `id`
    /// has no outgoing edges (it is the terminal). Edges that exist but are
    /// all ineligible are a `NoViableTransition`.
    pub fn select_edge(&self, id: &str, ctx: &RunContext) -> Result<Option<&Edge>> {
        if self.outgoing(id).next().is_none() {
            return Ok(None);
        }
        self.best_edge(id, ctx, |e| !e.is_loop())
            .map(Some)
            .ok_or_else(|| DelveError::NoViableTransition(id.to_string()))
    }

    fn best_edge(
        &self,
        id: &str,
        ctx: &RunContext,
        keep: impl Fn(&Edge) -> bool,
    ) -> Option<&Edge> {
        self.outgoing(id)
            .filter(|&e| keep(e) && e.when.holds(ctx))
            .min_by_key(|e| e.priority)
    }
}

/// How the cursor node is invoked.
#[derive(Debug, Clone, Copy)]
pub enum Route<'g> {
    /// No outgoing edges: invoke once and finish the run.
    Terminal,
    /// Invoke repeatedly along this loop edge.
    Loop {
        edge: &'g Edge,
        max_iterations: usize,
        stop: &'g StopCondition,
    },
    /// Invoke once. The edge eligible before the call, if any, supplies
    /// the input and output transforms.
    Once(Option<&'g Edge>),
}

impl Route<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Terminal => "terminal",
            Self::Loop { .. } => "loop",
            Self::Once(_) => "sequential",
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("nodes", &self.order)
            .field("edges", &self.edges)
            .field("entry", &self.entry)
            .field("terminal", &self.terminal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edge::{Condition, StopCondition};

    fn chain() -> GraphBuilder {
        let mut b = GraphBuilder::new("chain");
        for id in ["a", "b", "c"] {
            b.add_node(Node::new(id, id.to_uppercase())).unwrap();
        }
        b.add_edge(Edge::sequential("a", "b")).unwrap();
        b.add_edge(Edge::sequential("b", "c")).unwrap();
        b.entry("a");
        b
    }

    #[test]
    fn test_build_infers_terminal() {
        let graph = chain().build().unwrap();
        assert_eq!(graph.name(), "chain");
        assert_eq!(graph.entry(), "a");
        assert_eq!(graph.terminal(), "c");
        assert_eq!(graph.nodes().count(), 3);
        assert_eq!(graph.outgoing("a").count(), 1);
        assert_eq!(graph.outgoing("c").count(), 0);
    }

    #[test]
    fn test_duplicate_node() {
        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        let err = b.add_node(Node::new("a", "Again")).unwrap_err();
        assert!(matches!(err, DelveError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn test_edge_to_unknown_node() {
        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        let err = b.add_edge(Edge::sequential("a", "ghost")).unwrap_err();
        assert!(matches!(err, DelveError::UnknownNode(id) if id == "ghost"));

        let err = b.add_edge(Edge::sequential("ghost", "a")).unwrap_err();
        assert!(matches!(err, DelveError::UnknownNode(id) if id == "ghost"));
    }

    #[test]
    fn test_loop_with_zero_ceiling_rejected() {
        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        b.add_node(Node::new("b", "B")).unwrap();
        let err = b
            .add_edge(Edge::looping("a", "b", 0, StopCondition::Never))
            .unwrap_err();
        assert!(matches!(err, DelveError::InvalidEdge { .. }));
        assert!(err.is_graph_error());
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        let err = b.add_edge(Edge::sequential("a", "a")).unwrap_err();
        assert!(matches!(err, DelveError::InvalidEdge { .. }));
    }

    #[test]
    fn test_missing_entry() {
        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        assert!(matches!(b.build(), Err(DelveError::MissingEntry(_))));

        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        b.entry("nope");
        assert!(matches!(b.build(), Err(DelveError::MissingEntry(id)) if id == "nope"));
    }

    #[test]
    fn test_ambiguous_terminal() {
        let mut b = GraphBuilder::new("g");
        for id in ["a", "b", "c"] {
            b.add_node(Node::new(id, id)).unwrap();
        }
        b.add_edge(Edge::sequential("a", "b")).unwrap();
        b.add_edge(Edge::sequential("a", "c")).unwrap();
        b.entry("a");
        assert!(matches!(b.build(), Err(DelveError::MissingTerminal(_))));
    }

    #[test]
    fn test_dead_end_with_declared_terminal() {
        let mut b = GraphBuilder::new("g");
        for id in ["a", "b", "c"] {
            b.add_node(Node::new(id, id)).unwrap();
        }
        b.add_edge(Edge::sequential("a", "b")).unwrap();
        b.add_edge(Edge::sequential("a", "c")).unwrap();
        b.entry("a");
        b.terminal("c");
        assert!(matches!(b.build(), Err(DelveError::DeadEnd(id)) if id == "b"));
    }

    #[test]
    fn test_terminal_with_outgoing_edge() {
        let mut b = chain();
        b.terminal("b");
        assert!(matches!(b.build(), Err(DelveError::InvalidEdge { .. })));
    }

    #[test]
    fn test_unreachable_node() {
        let mut b = GraphBuilder::new("g");
        for id in ["a", "b", "island"] {
            b.add_node(Node::new(id, id)).unwrap();
        }
        b.add_edge(Edge::sequential("a", "b")).unwrap();
        b.add_edge(Edge::sequential("island", "b")).unwrap();
        b.entry("a");
        assert!(matches!(b.build(), Err(DelveError::UnreachableNode(id)) if id == "island"));
    }

    #[test]
    fn test_cycle_detected() {
        let mut b = GraphBuilder::new("g");
        for id in ["a", "b", "c", "end"] {
            b.add_node(Node::new(id, id)).unwrap();
        }
        b.add_edge(Edge::sequential("a", "b")).unwrap();
        b.add_edge(Edge::sequential("b", "c")).unwrap();
        b.add_edge(Edge::sequential("c", "a").when(Condition::expr(r#"again == "yes""#)))
            .unwrap();
        b.add_edge(Edge::sequential("c", "end").with_priority(1))
            .unwrap();
        b.entry("a");
        let err = b.build().unwrap_err();
        assert!(matches!(err, DelveError::CycleDetected(_)));
        assert!(err.is_graph_error());
    }

    fn fan_out() -> Graph {
        let mut b = GraphBuilder::new("fan");
        for id in ["router", "deep", "quick", "fallback", "end"] {
            b.add_node(Node::new(id, id)).unwrap();
        }
        b.add_edge(Edge::sequential("router", "deep").when(Condition::expr(r#"mode == "deep""#)))
            .unwrap();
        b.add_edge(
            Edge::sequential("router", "quick")
                .when(Condition::expr(r#"mode != "deep""#))
                .with_priority(1),
        )
        .unwrap();
        b.add_edge(
            Edge::sequential("router", "fallback")
                .when(Condition::expr(r#"mode != "deep""#))
                .with_priority(1),
        )
        .unwrap();
        for id in ["deep", "quick", "fallback"] {
            b.add_edge(Edge::sequential(id, "end")).unwrap();
        }
        b.entry("router");
        b.build().unwrap()
    }

    #[test]
    fn test_select_edge_by_condition() {
        let graph = fan_out();
        let mut ctx = RunContext::new("q");
        ctx.set_str("mode", "deep");
        let edge = graph.select_edge("router", &ctx).unwrap().unwrap();
        assert_eq!(edge.to, "deep");
    }

    #[test]
    fn test_select_edge_ties_go_to_first_declared() {
        let graph = fan_out();
        let mut ctx = RunContext::new("q");
        ctx.set_str("mode", "quick");
        let edge = graph.select_edge("router", &ctx).unwrap().unwrap();
        assert_eq!(edge.to, "quick");
    }

    #[test]
    fn test_select_edge_lower_priority_wins() {
        let mut b = GraphBuilder::new("g");
        for id in ["a", "b", "c", "end"] {
            b.add_node(Node::new(id, id)).unwrap();
        }
        b.add_edge(Edge::sequential("a", "b").with_priority(5)).unwrap();
        b.add_edge(Edge::sequential("a", "c").with_priority(-1)).unwrap();
        b.add_edge(Edge::sequential("b", "end")).unwrap();
        b.add_edge(Edge::sequential("c", "end")).unwrap();
        b.entry("a");
        let graph = b.build().unwrap();

        let edge = graph.select_edge("a", &RunContext::new("q")).unwrap().unwrap();
        assert_eq!(edge.to, "c");
    }

    #[test]
    fn test_select_edge_no_viable_transition() {
        let graph = fan_out();
        // `mode` unset: neither `==` nor `!=` holds on a missing key.
        let err = graph
            .select_edge("router", &RunContext::new("q"))
            .unwrap_err();
        assert!(matches!(err, DelveError::NoViableTransition(id) if id == "router"));
    }

    #[test]
    fn test_selected_edge_outlives_lookup_key() {
        let graph = fan_out();
        let edge = {
            let id = String::from("deep");
            graph.select_edge(&id, &RunContext::new("q")).unwrap().unwrap()
        };
        assert_eq!(edge.to, "end");
        assert_eq!(graph.outgoing(&String::from("router")).count(), 3);
    }

    #[test]
    fn test_route_defers_sequential_choice() {
        let graph = fan_out();
        let ctx = RunContext::new("q");
        assert!(matches!(graph.route("router", &ctx).unwrap(), Route::Once(None)));
        assert!(matches!(graph.route("end", &ctx).unwrap(), Route::Terminal));

        let mut ctx = RunContext::new("q");
        ctx.set_str("mode", "deep");
        match graph.route("router", &ctx).unwrap() {
            Route::Once(Some(edge)) => assert_eq!(edge.to, "deep"),
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn test_route_ineligible_loop_fails_up_front() {
        let mut b = GraphBuilder::new("g");
        b.add_node(Node::new("a", "A")).unwrap();
        b.add_node(Node::new("b", "B")).unwrap();
        b.add_edge(
            Edge::looping("a", "b", 2, StopCondition::Never)
                .when(Condition::expr(r#"go == "yes""#)),
        )
        .unwrap();
        b.entry("a");
        let graph = b.build().unwrap();

        let err = graph.route("a", &RunContext::new("q")).unwrap_err();
        assert!(matches!(err, DelveError::NoViableTransition(id) if id == "a"));

        let mut ctx = RunContext::new("q");
        ctx.set_str("go", "yes");
        assert!(matches!(
            graph.route("a", &ctx).unwrap(),
            Route::Loop { edge, max_iterations: 2, .. } if edge.to == "b"
        ));
    }

    #[test]
    fn test_select_edge_terminal() {
        let graph = fan_out();
        assert!(graph
            .select_edge("end", &RunContext::new("q"))
            .unwrap()
            .is_none());
    }
}
