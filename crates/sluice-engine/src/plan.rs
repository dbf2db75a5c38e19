//! Validated execution plan.
//!
//! Steps live in a petgraph arena with an edge from each dependency to its
//! dependent. Building the plan rejects duplicate ids, unknown dependencies
//! and cycles before anything touches the store.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use sluice_types::step::{Step, StepId, StepKind};

use crate::errors::PlanError;

/// A dependency-ordered, acyclic set of steps.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    graph: DiGraph<Step, ()>,
    index: HashMap<StepId, NodeIndex>,
    /// Topological order with insertion-order tie-breaking.
    order: Vec<NodeIndex>,
    /// Transitive dependencies of each node.
    ancestors: HashMap<NodeIndex, HashSet<NodeIndex>>,
}

fn check_step_shape(step: &Step) -> Result<(), PlanError> {
    let invalid = |message: &str| PlanError::InvalidStep {
        step: step.id.clone(),
        message: message.to_string(),
    };
    if step.id.as_str().trim().is_empty() {
        return Err(invalid("step id must not be empty"));
    }
    if step.target.trim().is_empty() {
        return Err(invalid("target must not be empty"));
    }
    match step.kind {
        StepKind::Transform | StepKind::Export if step.sql.as_deref().map_or(true, |s| s.trim().is_empty()) => {
            Err(invalid("sql is required"))
        }
        StepKind::Load if step.source.as_deref().map_or(true, |s| s.trim().is_empty()) => {
            Err(invalid("source is required"))
        }
        _ => Ok(()),
    }
}

impl ExecutionPlan {
    /// Validate and order `steps`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] for duplicate ids, unknown dependencies,
    /// cycles, or steps missing their query/source.
    pub fn build(steps: Vec<Step>) -> Result<Self, PlanError> {
        let mut graph = DiGraph::with_capacity(steps.len(), steps.len());
        let mut index = HashMap::with_capacity(steps.len());

        for step in steps {
            check_step_shape(&step)?;
            if index.contains_key(&step.id) {
                return Err(PlanError::DuplicateStep(step.id));
            }
            let id = step.id.clone();
            let idx = graph.add_node(step);
            index.insert(id, idx);
        }

        let mut edges = Vec::new();
        for idx in graph.node_indices() {
            let step = &graph[idx];
            for dep in &step.depends_on {
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(PlanError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                edges.push((dep_idx, idx));
            }
        }
        for (from, to) in edges {
            graph.update_edge(from, to, ());
        }

        let order = Self::toposort(&graph)?;
        let ancestors = Self::compute_ancestors(&graph, &order);

        Ok(Self {
            graph,
            index,
            order,
            ancestors,
        })
    }

    /// Kahn's algorithm; ready nodes are taken in insertion order.
    fn toposort(graph: &DiGraph<Step, ()>) -> Result<Vec<NodeIndex>, PlanError> {
        let mut in_degree: HashMap<NodeIndex, usize> =
            graph.node_indices().map(|idx| (idx, 0)).collect();
        for edge in graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = graph
            .node_indices()
            .filter(|idx| in_degree[idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(graph.node_count());

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            let mut next: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
            next.sort_by_key(|n| n.index());
            for n in next {
                if let Some(deg) = in_degree.get_mut(&n) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(n);
                    }
                }
            }
        }

        if order.len() != graph.node_count() {
            let stuck = graph
                .node_indices()
                .find(|idx| in_degree[idx] > 0)
                .map_or_else(|| StepId::new("unknown"), |idx| graph[idx].id.clone());
            return Err(PlanError::Cycle(stuck));
        }
        Ok(order)
    }

    fn compute_ancestors(
        graph: &DiGraph<Step, ()>,
        order: &[NodeIndex],
    ) -> HashMap<NodeIndex, HashSet<NodeIndex>> {
        let mut ancestors: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
        for &idx in order {
            let mut set = HashSet::new();
            for parent in graph.neighbors_directed(idx, Direction::Incoming) {
                set.insert(parent);
                if let Some(grand) = ancestors.get(&parent) {
                    set.extend(grand.iter().copied());
                }
            }
            ancestors.insert(idx, set);
        }
        ancestors
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Steps in execution order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().map(|&idx| &self.graph[idx])
    }

    #[must_use]
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    /// Whether `ancestor` is a transitive dependency of `step`.
    #[must_use]
    pub fn is_ancestor(&self, ancestor: &StepId, step: &StepId) -> bool {
        match (self.index.get(ancestor), self.index.get(step)) {
            (Some(a), Some(s)) => self.ancestors.get(s).is_some_and(|set| set.contains(a)),
            _ => false,
        }
    }

    /// Direct dependents of `id`, in insertion order.
    #[must_use]
    pub fn dependents(&self, id: &StepId) -> Vec<&StepId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        out.sort_by_key(|n| n.index());
        out.into_iter().map(|n| &self.graph[n].id).collect()
    }

    /// All steps downstream of `id`, in execution order.
    #[must_use]
    pub fn transitive_dependents(&self, id: &StepId) -> Vec<&StepId> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        self.order
            .iter()
            .filter(|n| self.ancestors.get(n).is_some_and(|set| set.contains(&idx)))
            .map(|&n| &self.graph[n].id)
            .collect()
    }

    /// Number of unfinished dependencies per step, for scheduling.
    #[must_use]
    pub fn in_degrees(&self) -> HashMap<StepId, usize> {
        self.index
            .iter()
            .map(|(id, &idx)| {
                (
                    id.clone(),
                    self.graph.neighbors_directed(idx, Direction::Incoming).count(),
                )
            })
            .collect()
    }
}
