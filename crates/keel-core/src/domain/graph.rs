//! Dependency graph for the task plan.
//!
//! Design:
//! - Forward edges: task -> tasks it depends on (waits for)
//! - Reverse edges: task -> tasks that depend on it (waiting tasks)
//! - Invariant: edges and reverse_edges must be kept in sync

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::task::{TaskId, TaskSpec};

/// Dependency graph for tracking task prerequisites.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Forward edges: task -> tasks it depends on
    edges: HashMap<TaskId, HashSet<TaskId>>,

    /// Reverse edges: task -> tasks that depend on it
    reverse_edges: HashMap<TaskId, HashSet<TaskId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the graph from task definitions.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a TaskSpec>) -> Self {
        let mut graph = Self::new();
        for spec in specs {
            for dep in &spec.depends_on {
                graph.add_dependency(spec.id.clone(), dep.clone());
            }
        }
        graph
    }

    /// Add a dependency: `task` depends on `depends_on`.
    ///
    /// Example: add_dependency(b, a) means "B waits for A"
    pub fn add_dependency(&mut self, task: TaskId, depends_on: TaskId) {
        self.edges
            .entry(task.clone())
            .or_default()
            .insert(depends_on.clone());
        self.reverse_edges.entry(depends_on).or_default().insert(task);
    }

    pub fn has_dependencies(&self, task: &TaskId) -> bool {
        self.edges.get(task).is_some_and(|deps| !deps.is_empty())
    }

    /// Dependencies of a task, sorted for deterministic output.
    pub fn get_dependencies(&self, task: &TaskId) -> Vec<TaskId> {
        let mut deps: Vec<TaskId> = self
            .edges
            .get(task)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// Tasks directly waiting for `task`.
    pub fn get_waiting_tasks(&self, task: &TaskId) -> Vec<TaskId> {
        let mut waiting: Vec<TaskId> = self
            .reverse_edges
            .get(task)
            .map(|w| w.iter().cloned().collect())
            .unwrap_or_default();
        waiting.sort();
        waiting
    }

    /// Every task that transitively waits for `task`.
    pub fn dependents_of(&self, task: &TaskId) -> Vec<TaskId> {
        let mut seen = HashSet::new();
        let mut stack = vec![task.clone()];
        while let Some(node) = stack.pop() {
            for waiting in self.get_waiting_tasks(&node) {
                if seen.insert(waiting.clone()) {
                    stack.push(waiting);
                }
            }
        }
        let mut out: Vec<TaskId> = seen.into_iter().collect();
        out.sort();
        out
    }

    /// Detect a cycle in the dependency graph.
    ///
    /// Three-colour DFS: a dependency edge into a Gray node closes a cycle.
    /// Returns the cycle path (first node repeated at the end), or None for a DAG.
    pub fn detect_cycle(&self) -> Option<Vec<TaskId>> {
        let mut nodes: Vec<&TaskId> = self.edges.keys().collect();
        nodes.sort();

        let mut colors: HashMap<TaskId, Color> = HashMap::new();
        let mut path: Vec<TaskId> = Vec::new();
        for node in nodes {
            if colors.get(node).copied().unwrap_or(Color::White) == Color::White {
                if let Some(cycle) = self.dfs_cycle(node, &mut colors, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_cycle(
        &self,
        node: &TaskId,
        colors: &mut HashMap<TaskId, Color>,
        path: &mut Vec<TaskId>,
    ) -> Option<Vec<TaskId>> {
        colors.insert(node.clone(), Color::Gray);
        path.push(node.clone());

        for dep in self.get_dependencies(node) {
            match colors.get(&dep).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = path.iter().position(|n| *n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.dfs_cycle(&dep, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        colors.insert(node.clone(), Color::Black);
        path.pop();
        None
    }

    /// Dependency order of `nodes` (Kahn's algorithm).
    ///
    /// Among tasks whose prerequisites are satisfied, plan position wins, so a
    /// plan with no dependencies runs exactly in the order written.
    /// Dependencies on ids outside `nodes` are ignored here (the builder
    /// rejects them before this is called).
    pub fn topological_order(&self, nodes: &[TaskId]) -> Result<Vec<TaskId>, Vec<TaskId>> {
        let position: HashMap<&TaskId, usize> =
            nodes.iter().enumerate().map(|(i, id)| (id, i)).collect();

        let mut in_degree: Vec<usize> = nodes
            .iter()
            .map(|id| {
                self.get_dependencies(id)
                    .iter()
                    .filter(|d| position.contains_key(d))
                    .count()
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            let id = &nodes[i];
            order.push(id.clone());
            for waiting in self.get_waiting_tasks(id) {
                if let Some(&j) = position.get(&waiting) {
                    in_degree[j] -= 1;
                    if in_degree[j] == 0 {
                        ready.push(Reverse(j));
                    }
                }
            }
        }

        if order.len() == nodes.len() {
            Ok(order)
        } else {
            Err(self.detect_cycle().unwrap_or_default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TaskId {
        TaskId::new(s)
    }

    #[test]
    fn new_graph_is_empty() {
        let graph = DependencyGraph::new();
        assert!(!graph.has_dependencies(&id("a")));
    }

    #[test]
    fn add_dependency_creates_both_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a")); // B depends on A

        assert!(graph.has_dependencies(&id("b")));
        assert!(!graph.has_dependencies(&id("a")));
        assert_eq!(graph.get_dependencies(&id("b")), vec![id("a")]);
        assert_eq!(graph.get_waiting_tasks(&id("a")), vec![id("b")]);
    }

    #[test]
    fn detect_simple_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("b"));
        graph.add_dependency(id("b"), id("a"));

        let cycle = graph.detect_cycle().expect("cycle");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.len() >= 3);
    }

    #[test]
    fn detect_self_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("a"));
        assert_eq!(graph.detect_cycle(), Some(vec![id("a"), id("a")]));
    }

    #[test]
    fn detect_longer_cycle() {
        // A <- B <- C <- D <- B
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("b"));
        graph.add_dependency(id("d"), id("c"));
        graph.add_dependency(id("b"), id("d"));

        let cycle = graph.detect_cycle().expect("cycle");
        assert!(!cycle.contains(&id("a")));
    }

    #[test]
    fn dag_with_diamond_should_not_detect_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("b"));
        graph.add_dependency(id("c"), id("a"));

        assert!(graph.detect_cycle().is_none());
    }

    #[test]
    fn topological_order_respects_dependencies_and_plan_position() {
        // plan order: c, a, b ; c depends on b, b depends on a
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("c"), id("b"));
        graph.add_dependency(id("b"), id("a"));

        let nodes = vec![id("c"), id("a"), id("b"), id("d")];
        let order = graph.topological_order(&nodes).unwrap();
        assert_eq!(order, vec![id("a"), id("b"), id("c"), id("d")]);
    }

    #[test]
    fn topological_order_without_dependencies_keeps_plan_order() {
        let graph = DependencyGraph::new();
        let nodes = vec![id("z"), id("y"), id("x")];
        assert_eq!(graph.topological_order(&nodes).unwrap(), nodes);
    }

    #[test]
    fn topological_order_reports_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("a"), id("b"));
        graph.add_dependency(id("b"), id("a"));

        let err = graph
            .topological_order(&[id("a"), id("b")])
            .unwrap_err();
        assert!(err.contains(&id("a")) && err.contains(&id("b")));
    }

    #[test]
    fn dependents_are_transitive() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(id("b"), id("a"));
        graph.add_dependency(id("c"), id("b"));
        graph.add_dependency(id("d"), id("x"));

        assert_eq!(graph.dependents_of(&id("a")), vec![id("b"), id("c")]);
    }
}
