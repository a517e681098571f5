use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::{error_codes, GraphEdge, GraphNode, Severity, ValidationIssue};

/// DFS colouring: white = unvisited, gray = on the current path, black = finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validates workflow structure over a caller-supplied node and edge list.
///
/// Nodes keep the order they were supplied in, and outgoing edges keep the
/// order of the edge list, so every algorithm here is deterministic.
#[derive(Debug, Clone)]
pub struct GraphValidator {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    /// Outgoing adjacency by node index
    outgoing: Vec<Vec<usize>>,
    /// Edges naming at least one unknown node
    dangling: Vec<GraphEdge>,
}

/// Everything [`GraphValidator::validate`] found
#[derive(Debug, Clone, Serialize)]
pub struct GraphReport {
    pub cycles: Vec<Vec<String>>,
    pub reachable: BTreeSet<String>,
    pub unreachable: Vec<String>,
    pub components: Vec<Vec<String>>,
    pub workflow_count: usize,
    pub issues: Vec<ValidationIssue>,
}

impl GraphReport {
    /// True when no issue of [`Severity::Error`] was found
    pub fn is_valid(&self) -> bool {
        !self.issues.iter().any(|issue| issue.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| issue.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|issue| issue.severity == Severity::Warning)
    }
}

impl GraphValidator {
    /// Build a validator. Duplicate node ids collapse onto the first
    /// occurrence (a later duplicate can still mark the node as a source).
    pub fn new(nodes: impl IntoIterator<Item = GraphNode>, edges: impl IntoIterator<Item = GraphEdge>) -> Self {
        let mut ordered: Vec<GraphNode> = Vec::new();
        let mut index = HashMap::new();

        for node in nodes {
            match index.get(&node.id) {
                Some(&existing) => {
                    let kept: &mut GraphNode = &mut ordered[existing];
                    kept.is_source |= node.is_source;
                }
                None => {
                    index.insert(node.id.clone(), ordered.len());
                    ordered.push(node);
                }
            }
        }

        let mut outgoing = vec![Vec::new(); ordered.len()];
        let mut dangling = Vec::new();

        for edge in edges {
            match (index.get(&edge.from), index.get(&edge.to)) {
                (Some(&from), Some(&to)) => outgoing[from].push(to),
                _ => dangling.push(edge),
            }
        }

        Self {
            nodes: ordered,
            index,
            outgoing,
            dangling,
        }
    }

    /// Build a validator where every node appearing in an edge exists and
    /// none is a source. Handy for purely structural questions.
    pub fn from_edges(edges: impl IntoIterator<Item = GraphEdge>) -> Self {
        let edges: Vec<GraphEdge> = edges.into_iter().collect();
        let mut nodes = Vec::new();
        for edge in &edges {
            nodes.push(GraphNode::new(edge.from.clone()));
            nodes.push(GraphNode::new(edge.to.clone()));
        }
        Self::new(nodes, edges)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Edges that referenced unknown nodes and were left out of the graph
    pub fn dangling_edges(&self) -> &[GraphEdge] {
        &self.dangling
    }

    /// Finds directed cycles.
    ///
    /// Each node is visited exactly once overall, so disconnected subgraphs
    /// are all checked. A cycle is reported as the DFS path from the first
    /// occurrence of the revisited node up to the top, followed by that node
    /// again: `A -> B -> C -> A` yields `[A, B, C, A]`.
    ///
    /// The walk keeps its own path stack, so depth is bounded by memory and
    /// not by the thread stack.
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        let mut colors = vec![Color::White; self.nodes.len()];
        // (node, index of the next outgoing edge to follow)
        let mut path: Vec<(usize, usize)> = Vec::new();
        let mut cycles = Vec::new();

        for start in 0..self.nodes.len() {
            if colors[start] != Color::White {
                continue;
            }
            colors[start] = Color::Gray;
            path.push((start, 0));

            while let Some(top) = path.last_mut() {
                let (node, edge) = *top;
                let Some(&next) = self.outgoing[node].get(edge) else {
                    colors[node] = Color::Black;
                    path.pop();
                    continue;
                };
                top.1 += 1;

                match colors[next] {
                    Color::White => {
                        colors[next] = Color::Gray;
                        path.push((next, 0));
                    }
                    Color::Gray => {
                        // Back edge: the cycle is the part of the path starting at `next`
                        if let Some(cycle_start) = path.iter().position(|&(n, _)| n == next) {
                            let mut cycle: Vec<String> = path[cycle_start..]
                                .iter()
                                .map(|&(n, _)| self.nodes[n].id.clone())
                                .collect();
                            cycle.push(self.nodes[next].id.clone());
                            cycles.push(cycle);
                        }
                    }
                    Color::Black => {}
                }
            }
        }

        cycles
    }

    pub fn has_cycle(&self) -> bool {
        !self.detect_cycles().is_empty()
    }

    /// All nodes reachable by following edges forward from any source node.
    /// Source nodes are included in the result.
    pub fn reachable_from_sources(&self) -> BTreeSet<String> {
        let mut visited = vec![false; self.nodes.len()];
        let mut pending: Vec<usize> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_source)
            .map(|(idx, _)| idx)
            .collect();

        while let Some(node) = pending.pop() {
            if visited[node] {
                continue;
            }
            visited[node] = true;
            pending.extend(self.outgoing[node].iter().copied().filter(|&n| !visited[n]));
        }

        visited
            .iter()
            .enumerate()
            .filter(|(_, &seen)| seen)
            .map(|(idx, _)| self.nodes[idx].id.clone())
            .collect()
    }

    /// Non-source nodes that no source reaches, in node order
    pub fn unreachable_nodes(&self) -> Vec<String> {
        let reachable = self.reachable_from_sources();
        self.nodes
            .iter()
            .filter(|node| !node.is_source && !reachable.contains(&node.id))
            .map(|node| node.id.clone())
            .collect()
    }

    /// Partitions nodes into weakly connected components.
    ///
    /// Edges are treated as undirected. Components come out in the order
    /// of their first node; members are in BFS order.
    pub fn connected_components(&self) -> Vec<Vec<String>> {
        let mut undirected = vec![Vec::new(); self.nodes.len()];
        for (from, targets) in self.outgoing.iter().enumerate() {
            for &to in targets {
                undirected[from].push(to);
                undirected[to].push(from);
            }
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut components = Vec::new();

        for start in 0..self.nodes.len() {
            if visited[start] {
                continue;
            }
            visited[start] = true;

            let mut component = Vec::new();
            let mut queue = VecDeque::from([start]);
            while let Some(node) = queue.pop_front() {
                component.push(self.nodes[node].id.clone());
                for &next in &undirected[node] {
                    if !visited[next] {
                        visited[next] = true;
                        queue.push_back(next);
                    }
                }
            }
            components.push(component);
        }

        components
    }

    /// Number of components with at least two members. An isolated block
    /// is not a workflow.
    pub fn workflow_count(&self) -> usize {
        self.connected_components()
            .iter()
            .filter(|component| component.len() >= 2)
            .count()
    }

    /// Topological execution order, or `None` when the graph has a cycle
    pub fn execution_order(&self) -> Option<Vec<String>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for targets in &self.outgoing {
            for &to in targets {
                in_degree[to] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(node) = ready.pop_front() {
            order.push(self.nodes[node].id.clone());
            for &next in &self.outgoing[node] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        (order.len() == self.nodes.len()).then_some(order)
    }

    /// Runs every check and collects coded issues
    pub fn validate(&self) -> GraphReport {
        let cycles = self.detect_cycles();
        let reachable = self.reachable_from_sources();
        let unreachable = self.unreachable_nodes();
        let components = self.connected_components();
        let workflow_count = components.iter().filter(|c| c.len() >= 2).count();

        let mut issues = Vec::new();

        for cycle in &cycles {
            issues.push(ValidationIssue {
                code: error_codes::CIRCULAR_DEPENDENCY,
                message: format!("Circular dependency detected: {}", cycle.join(" → ")),
                nodes: cycle.clone(),
                severity: Severity::Error,
            });
        }

        // Without any source every node would be flagged; nothing to report then.
        if self.nodes.iter().any(|node| node.is_source) {
            for id in &unreachable {
                issues.push(ValidationIssue {
                    code: error_codes::UNREACHABLE_NODE,
                    message: format!("Block '{}' is not reachable from any input block", id),
                    nodes: vec![id.clone()],
                    severity: Severity::Warning,
                });
            }
        }

        for edge in &self.dangling {
            issues.push(ValidationIssue {
                code: error_codes::DANGLING_EDGE,
                message: format!("Connection {} → {} references a missing block", edge.from, edge.to),
                nodes: vec![edge.from.clone(), edge.to.clone()],
                severity: Severity::Error,
            });
        }

        GraphReport {
            cycles,
            reachable,
            unreachable,
            components,
            workflow_count,
            issues,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nodes(ids: &[&str]) -> Vec<GraphNode> {
        ids.iter().map(|id| GraphNode::new(*id)).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<GraphEdge> {
        pairs.iter().map(|(from, to)| GraphEdge::new(*from, *to)).collect()
    }

    #[test]
    fn test_detects_simple_cycle() {
        let validator = GraphValidator::new(nodes(&["A", "B", "C"]), edges(&[("A", "B"), ("B", "C"), ("C", "A")]));

        let cycles = validator.detect_cycles();
        assert_eq!(cycles, vec![vec!["A", "B", "C", "A"]]);
        assert!(validator.has_cycle());
    }

    #[test]
    fn test_no_cycles_in_dag() {
        let validator = GraphValidator::new(
            nodes(&["step1", "step2", "step3"]),
            edges(&[("step1", "step2"), ("step1", "step3"), ("step2", "step3")]),
        );

        assert!(validator.detect_cycles().is_empty());
        assert_eq!(
            validator.execution_order(),
            Some(vec!["step1".to_string(), "step2".to_string(), "step3".to_string()])
        );
    }

    #[test]
    fn test_detects_cycles_in_disconnected_subgraphs() {
        let validator = GraphValidator::new(
            nodes(&["a", "b", "c", "d", "e", "f", "g"]),
            edges(&[("a", "b"), ("b", "c"), ("c", "a"), ("d", "e"), ("e", "f"), ("f", "d")]),
        );

        let cycles = validator.detect_cycles();
        assert_eq!(cycles.len(), 2, "Should detect both cycles");
        assert_eq!(cycles[1], vec!["d", "e", "f", "d"]);
        assert_eq!(validator.execution_order(), None);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let validator = GraphValidator::new(nodes(&["step1"]), edges(&[("step1", "step1")]));
        assert_eq!(validator.detect_cycles(), vec![vec!["step1", "step1"]]);
    }

    #[test]
    fn test_shared_descendant_is_not_a_cycle() {
        // Diamond: D is reached twice but only after it finished
        let validator = GraphValidator::new(
            nodes(&["A", "B", "C", "D"]),
            edges(&[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")]),
        );
        assert!(validator.detect_cycles().is_empty());
    }

    #[test]
    fn test_long_chain_does_not_exhaust_the_stack() {
        let n = 100_000;
        let ids: Vec<String> = (0..n).map(|i| format!("n{}", i)).collect();
        let mut chain: Vec<GraphEdge> = ids.windows(2).map(|w| GraphEdge::new(&w[0], &w[1])).collect();

        let validator = GraphValidator::new(ids.iter().map(GraphNode::new), chain.clone());
        assert!(validator.detect_cycles().is_empty());
        assert_eq!(validator.execution_order().map(|order| order.len()), Some(n));

        // Closing the chain yields one cycle spanning every node
        chain.push(GraphEdge::new(&ids[n - 1], &ids[0]));
        let validator = GraphValidator::new(ids.iter().map(GraphNode::new), chain);
        let cycles = validator.detect_cycles();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), n + 1);
        assert_eq!(cycles[0].first(), cycles[0].last());
        assert!(!validator.validate().is_valid());
    }

    #[test]
    fn test_reachability_from_sources() {
        let graph_nodes = vec![
            GraphNode::source("input"),
            GraphNode::new("transform"),
            GraphNode::new("output"),
            GraphNode::new("orphan"),
        ];
        let validator = GraphValidator::new(graph_nodes, edges(&[("input", "transform"), ("transform", "output")]));

        let reachable = validator.reachable_from_sources();
        assert_eq!(reachable.len(), 3);
        assert!(reachable.contains("output"));
        assert_eq!(validator.unreachable_nodes(), vec!["orphan".to_string()]);
    }

    #[test]
    fn test_connected_components_ignore_direction() {
        let validator = GraphValidator::new(nodes(&["A", "B", "C", "D"]), edges(&[("B", "A"), ("C", "D")]));

        let components = validator.connected_components();
        assert_eq!(components, vec![vec!["A", "B"], vec!["C", "D"]]);
        assert_eq!(validator.workflow_count(), 2);
    }

    #[test]
    fn test_isolated_node_is_not_a_workflow() {
        let validator = GraphValidator::new(nodes(&["A", "B", "C"]), edges(&[("A", "B")]));

        assert_eq!(validator.connected_components().len(), 2);
        assert_eq!(validator.workflow_count(), 1);
    }

    #[test]
    fn test_from_edges_collects_nodes() {
        let validator = GraphValidator::from_edges(edges(&[("x", "y"), ("y", "z")]));
        assert_eq!(validator.node_count(), 3);
        assert!(validator.contains("z"));
        assert_eq!(validator.workflow_count(), 1);
    }

    #[test]
    fn test_validate_reports_coded_issues() {
        let graph_nodes = vec![
            GraphNode::source("in"),
            GraphNode::new("a"),
            GraphNode::new("b"),
            GraphNode::new("island"),
        ];
        let validator = GraphValidator::new(
            graph_nodes,
            edges(&[("in", "a"), ("a", "b"), ("b", "a"), ("b", "missing")]),
        );

        let report = validator.validate();
        assert!(!report.is_valid());
        assert_eq!(report.cycles, vec![vec!["a", "b", "a"]]);
        assert_eq!(report.unreachable, vec!["island".to_string()]);

        let codes: Vec<&str> = report.issues.iter().map(|issue| issue.code).collect();
        assert_eq!(
            codes,
            vec![
                error_codes::CIRCULAR_DEPENDENCY,
                error_codes::UNREACHABLE_NODE,
                error_codes::DANGLING_EDGE,
            ]
        );
        assert_eq!(report.warnings().count(), 1);
        assert_eq!(report.errors().count(), 2);
    }

    #[test]
    fn test_validate_empty_graph() {
        let validator = GraphValidator::new(Vec::new(), Vec::new());
        let report = validator.validate();
        assert!(report.is_valid());
        assert!(report.components.is_empty());
        assert_eq!(report.workflow_count, 0);
    }
}
