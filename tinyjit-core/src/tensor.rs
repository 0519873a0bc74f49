use std::{
    fmt,
    ops::{Add, Mul},
};

use crate::{
    graph::{Graph, NodeId, OpKind},
    Result,
};

/// A tensor representing a node of a graph. Performing operations on this
/// tensor will not cause any computations, it only appends nodes.
///
/// Operators return a `Result` because both operands must come from the same
/// graph.
#[derive(Clone)]
pub struct Tensor {
    id: NodeId,
    graph: Graph,
}

impl Tensor {
    pub(crate) fn new(id: NodeId, graph: Graph) -> Self {
        Self { id, graph }
    }

    /// Get the node ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Retrieve the graph for this `Tensor`.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn label(&self) -> String {
        self.graph.nodes()[self.id.index()].label().to_string()
    }

    pub fn kind(&self) -> OpKind {
        self.graph.nodes()[self.id.index()].kind()
    }

    /// Elementwise `max(0, self)`.
    pub fn relu(&self) -> Result<Tensor> {
        self.graph.relu(self)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("id", &self.id)
            .field("label", &self.label())
            .finish()
    }
}

macro_rules! tensor_binop {
    ($trait:ident, $fn_name:ident) => {
        impl $trait for &Tensor {
            type Output = Result<Tensor>;
            /// Add an elementwise operation to the graph.
            fn $fn_name(self, rhs: Self) -> Self::Output {
                self.graph.$fn_name(self, rhs)
            }
        }

        impl $trait for Tensor {
            type Output = Result<Tensor>;
            /// Add an elementwise operation to the graph.
            fn $fn_name(self, rhs: Self) -> Self::Output {
                self.graph.$fn_name(&self, &rhs)
            }
        }
    };
}

tensor_binop!(Add, add);
tensor_binop!(Mul, mul);
