use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::{
    graph::{Graph, NodeId, OpKind},
    Error, Result, Tensor,
};

impl Graph {
    /// Evaluate `output` node by node on the CPU, without planning or native
    /// code. Every input reachable from `output` must be bound.
    pub fn evaluate(
        &self,
        output: &Tensor,
        inputs: &[(&Tensor, f32)],
        rows: usize,
    ) -> Result<Vec<f32>> {
        self.check_owned(output)?;
        let mut bound = HashMap::new();
        for (tensor, value) in inputs {
            self.check_owned(tensor)?;
            bound.insert(tensor.id(), *value);
        }

        let nodes = self.nodes();

        // Dependency graph of the nodes feeding `output`. Adding an edge also
        // adds its endpoints, so visits are tracked separately.
        let mut dep_graph = DiGraphMap::<usize, ()>::new();
        let mut visited = vec![false; nodes.len()];
        let mut stack = vec![output.id()];
        while let Some(id) = stack.pop() {
            let node = nodes
                .get(id.index())
                .ok_or_else(|| Error::UnknownNode { id }.bt())?;
            if std::mem::replace(&mut visited[id.index()], true) {
                continue;
            }
            dep_graph.add_node(id.index());
            for input in node.inputs() {
                dep_graph.add_edge(input.index(), id.index(), ());
                stack.push(*input);
            }
        }

        // Creation order already is topological; this guards the invariant.
        let order = toposort(&dep_graph, None).map_err(|cycle| {
            Error::msg(format!("cycle through node [{}]", cycle.node_id()))
        })?;

        let mut results: Vec<Option<Vec<f32>>> = vec![None; nodes.len()];
        for idx in order {
            let node = &nodes[idx];
            let operand = |i: usize| {
                let id: NodeId = node.inputs()[i];
                results[id.index()]
                    .as_ref()
                    .ok_or_else(|| Error::msg(format!("node [{id}] evaluated out of order")))
            };
            let computed = match node.kind() {
                OpKind::Input => {
                    let value = bound.get(&node.id()).ok_or_else(|| {
                        Error::UnboundInput {
                            id: node.id(),
                            label: node.label().to_string(),
                        }
                        .bt()
                    })?;
                    vec![*value; rows]
                }
                OpKind::Relu => operand(0)?.iter().map(|&x| x.max(0.0)).collect(),
                OpKind::Add => {
                    let (l, r) = (operand(0)?, operand(1)?);
                    l.iter().zip(r).map(|(x, y)| x + y).collect()
                }
                OpKind::Mul => {
                    let (l, r) = (operand(0)?, operand(1)?);
                    l.iter().zip(r).map(|(x, y)| x * y).collect()
                }
            };
            results[idx] = Some(computed);
        }

        results[output.id().index()]
            .take()
            .ok_or_else(|| Error::msg("output was not evaluated"))
    }
}
