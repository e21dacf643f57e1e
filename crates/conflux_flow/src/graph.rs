//! Structural validation of the task dependency graph.

use crate::{FlowError, TaskNode};
use conflux_containers::RandomState;
use petgraph::{Directed, algo, graphmap::GraphMap};

/// Rejects task graphs containing a dependency cycle.
///
/// Tasks on a cycle can never all see their predecessors complete, so the
/// flow would wait on them forever. Rejecting the graph up front turns
/// that deadlock into an error at `start`.
pub(crate) fn ensure_acyclic(tasks: &[TaskNode]) -> Result<(), FlowError> {
    let edge_count = tasks.iter().map(|task| task.inputs.len()).sum();
    let mut graph: GraphMap<usize, (), Directed, RandomState> =
        GraphMap::with_capacity(tasks.len(), edge_count);

    for index in 0..tasks.len() {
        graph.add_node(index);
    }
    for (index, task) in tasks.iter().enumerate() {
        for &input in &task.inputs {
            // Edge directed from dependency to dependent.
            graph.add_edge(input, index, ());
        }
    }

    algo::toposort(&graph, None)
        .map(|_| ())
        .map_err(|_| FlowError::CyclicDependencies)
}
