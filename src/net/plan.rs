use crate::net::graph::{Graph, Node};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Step {
    pub layer: usize,
    pub need_backward: bool,
    pub propagate_down: bool,
}

/// Orderings derived from a validated graph. Never edited in place; the net
/// drops it and compiles a new one whenever the graph changes.
#[derive(Debug)]
pub(crate) struct ExecutionPlan {
    pub forward: Vec<Step>,
    pub backward: Vec<Step>,
}

impl ExecutionPlan {
    /// Backward-necessity inference in one sweep over `order`, which must be
    /// topological. A layer runs backward when an ancestor does or when it
    /// owns trainable parameters; it propagates to its inputs only in the
    /// former case.
    pub fn compile(graph: &Graph, order: &[Node]) -> Self {
        let mut layer_need = vec![false; graph.layers.len()];
        let mut blob_need = vec![false; graph.blobs.len()];
        let mut forward = Vec::with_capacity(graph.layers.len());

        for &node in order {
            match node {
                Node::Layer(i) => {
                    let entry = &graph.layers[i];
                    let pred = entry.needs.iter().any(|&b| blob_need[b]);
                    let trainable = entry.node.has_parameters() && !entry.node.frozen();

                    layer_need[i] = pred || trainable;
                    forward.push(Step {
                        layer: i,
                        need_backward: layer_need[i],
                        propagate_down: pred,
                    });
                }
                Node::Blob(i) => {
                    blob_need[i] = graph.blobs[i].producers.iter().any(|&l| layer_need[l]);
                }
            }
        }

        let backward = forward.iter().rev().filter(|s| s.need_backward).copied().collect();

        let plan = ExecutionPlan { forward, backward };
        tracing::debug!(
            layers = plan.forward.len(),
            backward = plan.backward.len(),
            "compiled execution plan"
        );
        plan
    }
}
