//! Dependency graph construction for workflow steps.
//!
//! Provides DAG functionality for step dependencies, including cycle
//! detection with the offending path, a declaration-stable topological
//! order, and upstream queries used by feedback edges.

use crate::models::WorkflowDefinition;
use petgraph::Direction;
use petgraph::algo::{has_path_connecting, is_cyclic_directed};
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use thiserror::Error;

/// Errors that can occur during DAG operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    /// Circular dependency detected.
    #[error("circular dependency detected: {0}")]
    CycleDetected(String),

    /// Dependency reference not found.
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    DependencyNotFound {
        /// Step declaring the dependency.
        step: String,
        /// Missing dependency id.
        dependency: String,
    },
}

/// Result type for DAG operations.
pub type Result<T> = std::result::Result<T, DagError>;

/// Dependency graph over a workflow's steps.
///
/// Edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// The underlying graph structure.
    graph: DiGraph<String, ()>,
    /// Mapping from step ID to node index.
    node_map: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph for `definition`.
    ///
    /// # Errors
    /// Returns error if:
    /// - A dependency reference doesn't exist
    /// - A circular dependency is detected
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut node_map = HashMap::new();

        // Nodes are added in declaration order, so node indices double as
        // declaration positions.
        for step in &definition.steps {
            node_map.entry(step.id.clone()).or_insert_with(|| graph.add_node(step.id.clone()));
        }

        for step in &definition.steps {
            let to = node_map[&step.id];
            for dependency in &step.dependencies {
                let from = *node_map.get(dependency).ok_or_else(|| DagError::DependencyNotFound {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let dag = Self { graph, node_map };
        dag.detect_cycles()?;
        Ok(dag)
    }

    /// Detects cycles in the dependency graph.
    ///
    /// # Errors
    /// Returns error with cycle path if a cycle is detected.
    pub fn detect_cycles(&self) -> Result<()> {
        if is_cyclic_directed(&self.graph) {
            return Err(DagError::CycleDetected(self.find_cycle_path()));
        }
        Ok(())
    }

    /// Finds a cycle path in the graph for error reporting.
    fn find_cycle_path(&self) -> String {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();
        let mut path = Vec::new();

        for node in self.graph.node_indices() {
            if !visited.contains(&node)
                && self.dfs_cycle(node, &mut visited, &mut stack, &mut path)
            {
                // Trim the lead-in so the path starts at the repeated node.
                let last = path.last().copied();
                let start = path.iter().position(|n| Some(*n) == last).unwrap_or(0);
                return path[start..]
                    .iter()
                    .map(|idx| self.graph[*idx].clone())
                    .collect::<Vec<_>>()
                    .join(" -> ");
            }
        }

        "unknown cycle".to_string()
    }

    /// DFS helper to detect cycles.
    fn dfs_cycle(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        stack: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> bool {
        visited.insert(node);
        stack.insert(node);
        path.push(node);

        for neighbor in self.graph.neighbors_directed(node, Direction::Outgoing) {
            if stack.contains(&neighbor) {
                path.push(neighbor);
                return true;
            }
            if !visited.contains(&neighbor) && self.dfs_cycle(neighbor, visited, stack, path) {
                return true;
            }
        }

        stack.remove(&node);
        path.pop();
        false
    }

    /// Steps in an order where every dependency comes before its dependents.
    ///
    /// Among steps that are ready at the same time, the one declared first
    /// comes first, so the order is stable for a given definition.
    pub fn topological_order(&self) -> Vec<String> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|n| self.graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| Reverse(index))
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(Reverse(index)) = ready.pop() {
            let node = NodeIndex::new(index);
            order.push(self.graph[node].clone());
            for dependent in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let degree = &mut in_degree[dependent.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(dependent.index()));
                }
            }
        }
        order
    }

    /// Returns true if `ancestor` is a direct or transitive dependency of `step`.
    pub fn is_upstream(&self, ancestor: &str, step: &str) -> bool {
        match (self.node_map.get(ancestor), self.node_map.get(step)) {
            (Some(&from), Some(&to)) if from != to => {
                has_path_connecting(&self.graph, from, to, None)
            }
            _ => false,
        }
    }

    /// Direct dependents of `step`.
    pub fn dependents(&self, step: &str) -> Vec<String> {
        self.node_map
            .get(step)
            .map(|&node| {
                self.graph
                    .neighbors_directed(node, Direction::Outgoing)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Gets the number of nodes (steps) in the graph.
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Gets the number of edges (dependencies) in the graph.
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WorkflowStep, WorkflowType};

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", "Linear", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("t3", "Three").depends_on("t2"))
            .with_step(WorkflowStep::new("t1", "One"))
            .with_step(WorkflowStep::new("t2", "Two").depends_on("t1"))
    }

    #[test]
    fn test_dag_construction() {
        let dag = DependencyGraph::from_definition(&linear()).unwrap();
        assert_eq!(dag.node_count(), 3);
        assert_eq!(dag.edge_count(), 2);
    }

    #[test]
    fn test_topological_order() {
        let dag = DependencyGraph::from_definition(&linear()).unwrap();
        assert_eq!(dag.topological_order(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_topological_order_prefers_declaration_order() {
        let def = WorkflowDefinition::new("wf", "Diamond", WorkflowType::Parallel)
            .with_step(WorkflowStep::new("b", "B").depends_on("root"))
            .with_step(WorkflowStep::new("a", "A").depends_on("root"))
            .with_step(WorkflowStep::new("root", "Root"))
            .with_step(WorkflowStep::new("join", "Join").depends_on("a").depends_on("b"));
        let dag = DependencyGraph::from_definition(&def).unwrap();
        assert_eq!(dag.topological_order(), vec!["root", "b", "a", "join"]);
    }

    #[test]
    fn test_cycle_detection_names_path() {
        let def = WorkflowDefinition::new("wf", "Cycle", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("t1", "One").depends_on("t3"))
            .with_step(WorkflowStep::new("t2", "Two").depends_on("t1"))
            .with_step(WorkflowStep::new("t3", "Three").depends_on("t2"));

        match DependencyGraph::from_definition(&def).unwrap_err() {
            DagError::CycleDetected(path) => {
                assert_eq!(path, "t1 -> t2 -> t3 -> t1");
            }
            other => panic!("Expected CycleDetected error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_dependency() {
        let def = WorkflowDefinition::new("wf", "Broken", WorkflowType::Sequential)
            .with_step(WorkflowStep::new("t1", "One").depends_on("ghost"));
        assert_eq!(
            DependencyGraph::from_definition(&def).unwrap_err(),
            DagError::DependencyNotFound { step: "t1".into(), dependency: "ghost".into() }
        );
    }

    #[test]
    fn test_upstream_and_dependents() {
        let dag = DependencyGraph::from_definition(&linear()).unwrap();
        assert!(dag.is_upstream("t1", "t3"));
        assert!(!dag.is_upstream("t3", "t1"));
        assert!(!dag.is_upstream("t1", "t1"));
        assert_eq!(dag.dependents("t1"), vec!["t2"]);
    }
}
