//! DAG construction, cycle detection, and parallel group computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph with edges
//! from dependency to dependent. A recursion-stack DFS reports the exact
//! cycle path; topological order then drives minimal level assignment.

use std::collections::{HashMap, HashSet};

use nexus_types::workflow::WorkflowStep;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
}

/// Step dependency graph. Node weights are step ids.
struct StepGraph<'a> {
    graph: DiGraph<&'a str, ()>,
    nodes: HashMap<&'a str, NodeIndex>,
}

impl<'a> StepGraph<'a> {
    fn build(steps: &'a [WorkflowStep]) -> Result<Self, DagError> {
        let mut graph = DiGraph::<&str, ()>::new();
        let nodes: HashMap<&str, NodeIndex> = steps
            .iter()
            .map(|s| (s.id.as_str(), graph.add_node(s.id.as_str())))
            .collect();

        for step in steps {
            let to = nodes[step.id.as_str()];
            for dep in &step.depends_on {
                let from = nodes.get(dep.as_str()).ok_or_else(|| DagError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                })?;
                graph.add_edge(*from, to, ());
            }
        }

        Ok(Self { graph, nodes })
    }

    /// Depth-first search with an explicit recursion stack.
    ///
    /// Returns the first cycle found as a closed path (`[a, b, a]`).
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            // (node, remaining successors) frames; `path` mirrors the stack.
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
            let mut path: Vec<NodeIndex> = Vec::new();
            marks[root.index()] = Mark::OnStack;
            stack.push((root, self.successors(root)));
            path.push(root);

            while let Some((node, pending)) = stack.last_mut() {
                match pending.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::OnStack => {
                            let start = path.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|n| self.graph[*n].to_string()).collect();
                            cycle.push(self.graph[next].to_string());
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            let successors = self.successors(next);
                            stack.push((next, successors));
                            path.push(next);
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        stack.pop();
                        path.pop();
                    }
                }
            }
        }
        None
    }

    fn successors(&self, node: NodeIndex) -> Vec<NodeIndex> {
        // Reverse so popping visits edges in insertion order.
        let mut next: Vec<NodeIndex> = self.graph.neighbors_directed(node, Direction::Outgoing).collect();
        next.reverse();
        next
    }
}

/// Reject unknown dependencies and cycles.
pub fn validate_dag(steps: &[WorkflowStep]) -> Result<(), DagError> {
    let graph = StepGraph::build(steps)?;
    match graph.find_cycle() {
        Some(path) => Err(DagError::CycleDetected { path }),
        None => Ok(()),
    }
}

/// Group step ids into ordered parallel levels.
///
/// `level(s) = 0` without dependencies, else `1 + max(level(dep))`. This is
/// the minimal leveling: every step runs in the earliest group its
/// dependencies allow. Within a level, ids keep their order in `steps`.
pub fn compute_parallel_groups(steps: &[WorkflowStep]) -> Result<Vec<Vec<String>>, DagError> {
    if steps.is_empty() {
        return Ok(vec![]);
    }

    let graph = StepGraph::build(steps)?;
    if let Some(path) = graph.find_cycle() {
        return Err(DagError::CycleDetected { path });
    }
    let sorted = toposort(&graph.graph, None).map_err(|cycle| DagError::CycleDetected {
        path: vec![graph.graph[cycle.node_id()].to_string()],
    })?;

    let mut levels: HashMap<NodeIndex, usize> = HashMap::with_capacity(sorted.len());
    for node in sorted {
        let level = graph
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|dep| levels.get(&dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        levels.insert(node, level);
    }

    let depth = levels.values().copied().max().unwrap_or(0);
    let mut groups: Vec<Vec<String>> = vec![Vec::new(); depth + 1];
    for step in steps {
        let level = levels[&graph.nodes[step.id.as_str()]];
        groups[level].push(step.id.clone());
    }
    Ok(groups)
}

/// All steps that transitively depend on `step_id`, in `steps` order.
pub fn transitive_dependents(step_id: &str, steps: &[WorkflowStep]) -> Vec<String> {
    let mut dependents_of: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents_of.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack = vec![step_id];
    while let Some(current) = stack.pop() {
        for &next in dependents_of.get(current).into_iter().flatten() {
            if visited.insert(next) {
                stack.push(next);
            }
        }
    }

    steps
        .iter()
        .filter(|s| visited.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_types::service::ServiceId;
    use serde_json::json;

    fn step(id: &str, depends_on: Vec<&str>) -> WorkflowStep {
        WorkflowStep::new(id, ServiceId::Mageagent, "analyze", json!({})).depends_on(depends_on)
    }

    fn level_of(groups: &[Vec<String>], id: &str) -> usize {
        groups.iter().position(|g| g.iter().any(|s| s == id)).unwrap()
    }

    #[test]
    fn test_no_dependencies_single_group() {
        let steps = vec![step("a", vec![]), step("b", vec![]), step("c", vec![])];
        let groups = compute_parallel_groups(&steps).unwrap();
        assert_eq!(groups, vec![vec!["a", "b", "c"]]);
    }

    #[test]
    fn test_diamond_three_groups() {
        let steps = vec![
            step("step1", vec![]),
            step("step2", vec!["step1"]),
            step("step3", vec!["step1"]),
            step("step4", vec!["step2", "step3"]),
        ];
        let groups = compute_parallel_groups(&steps).unwrap();
        assert_eq!(groups, vec![vec!["step1"], vec!["step2", "step3"], vec!["step4"]]);
    }

    #[test]
    fn test_levels_are_minimal() {
        //   a -> b -> c -> e
        //   d ---------> e   (d is a root, so it lands in level 0)
        //   f depends on a only (level 1, not pushed later)
        let steps = vec![
            step("e", vec!["c", "d"]),
            step("c", vec!["b"]),
            step("b", vec!["a"]),
            step("a", vec![]),
            step("d", vec![]),
            step("f", vec!["a"]),
        ];
        let groups = compute_parallel_groups(&steps).unwrap();

        let all: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(all, steps.len(), "every step in exactly one group");
        for s in &steps {
            let expected = s
                .depends_on
                .iter()
                .map(|d| level_of(&groups, d) + 1)
                .max()
                .unwrap_or(0);
            assert_eq!(level_of(&groups, &s.id), expected, "level of {}", s.id);
        }
        assert_eq!(groups[0], vec!["a", "d"]);
        assert_eq!(groups[1], vec!["b", "f"]);
    }

    #[test]
    fn test_two_step_cycle_reports_path() {
        let steps = vec![step("a", vec!["b"]), step("b", vec!["a"])];
        let err = compute_parallel_groups(&steps).unwrap_err();
        let DagError::CycleDetected { path } = err else {
            panic!("expected cycle, got {err:?}");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 3);
        assert!(path.contains(&"a".to_string()) && path.contains(&"b".to_string()));
    }

    #[test]
    fn test_cycle_behind_valid_prefix() {
        let steps = vec![
            step("root", vec![]),
            step("x", vec!["root", "z"]),
            step("y", vec!["x"]),
            step("z", vec!["y"]),
        ];
        let err = validate_dag(&steps).unwrap_err();
        let DagError::CycleDetected { path } = err else {
            panic!("expected cycle");
        };
        assert!(!path.contains(&"root".to_string()));
        assert_eq!(path.len(), 4);
        assert!(err_msg(&steps).contains("cycle detected"));
    }

    fn err_msg(steps: &[WorkflowStep]) -> String {
        validate_dag(steps).unwrap_err().to_string()
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let steps = vec![step("a", vec!["a"])];
        assert!(matches!(validate_dag(&steps), Err(DagError::CycleDetected { .. })));
    }

    #[test]
    fn test_unknown_dependency() {
        let steps = vec![step("a", vec!["missing"])];
        let err = validate_dag(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn test_empty_steps() {
        assert!(compute_parallel_groups(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_transitive_dependents() {
        let steps = vec![
            step("a", vec![]),
            step("b", vec!["a"]),
            step("c", vec!["b"]),
            step("d", vec![]),
            step("e", vec!["c", "d"]),
        ];
        assert_eq!(transitive_dependents("a", &steps), vec!["b", "c", "e"]);
        assert_eq!(transitive_dependents("d", &steps), vec!["e"]);
        assert!(transitive_dependents("e", &steps).is_empty());
    }
}
