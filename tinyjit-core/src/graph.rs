use std::{
    cell::{Ref, RefCell},
    fmt::{self, Display},
    rc::Rc,
};

use petgraph::Graph as PetGraph;
use petgraph::{
    dot::{Config, Dot},
    graph::NodeIndex,
};

use crate::{planner::MemoryPlan, Error, Result, Tensor};

/// The operation a node performs. Arity is fixed per kind.
#[derive(PartialEq, Eq, Hash, Debug, Clone, Copy)]
pub enum OpKind {
    /// An externally supplied value, bound to a slot before the kernel runs.
    Input,
    Add,
    Mul,
    /// Elementwise `max(0, x)`.
    Relu,
}

impl OpKind {
    /// Number of inputs a node of this kind takes.
    pub const fn arity(&self) -> usize {
        match self {
            Self::Input => 0,
            Self::Relu => 1,
            Self::Add | Self::Mul => 2,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Input => "Input",
            Self::Add => "Add",
            Self::Mul => "Mul",
            Self::Relu => "Relu",
        }
    }

    /// The infix C operator for binary kinds.
    pub fn as_c_op(&self) -> Option<&'static str> {
        match self {
            Self::Add => Some("+"),
            Self::Mul => Some("*"),
            Self::Input | Self::Relu => None,
        }
    }
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dense creation-order id of a node. Ids are only meaningful within the graph
/// that issued them.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct NodeId(usize);

impl NodeId {
    pub const fn index(&self) -> usize {
        self.0
    }
}

impl From<NodeId> for usize {
    fn from(value: NodeId) -> Self {
        value.0
    }
}

impl From<usize> for NodeId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct Node {
    id: NodeId,
    kind: OpKind,
    label: String,
    inputs: Vec<NodeId>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ids of the nodes this node reads, in operand order.
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }
}

#[derive(Default)]
pub(crate) struct GraphData {
    pub(crate) nodes: Vec<Node>,
    pub(crate) plan: Option<MemoryPlan>,
}

/// An append-only DAG of elementwise operations.
///
/// `Graph` is a cheap handle: clones share the same nodes. It is deliberately
/// neither `Send` nor `Sync`.
#[derive(Clone, Default)]
pub struct Graph {
    data: Rc<RefCell<GraphData>>,
}

impl Graph {
    /// Create an empty Graph
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read-only access to the nodes, in creation order.
    pub fn nodes(&self) -> Ref<'_, [Node]> {
        Ref::map(self.data.borrow(), |data| data.nodes.as_slice())
    }

    pub fn node(&self, id: NodeId) -> Result<Node> {
        self.data
            .borrow()
            .nodes
            .get(id.index())
            .cloned()
            .ok_or_else(|| Error::UnknownNode { id }.bt())
    }

    pub fn len(&self) -> usize {
        self.data.borrow().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.borrow().nodes.is_empty()
    }

    /// Whether both handles refer to the same underlying graph.
    pub fn same_graph(&self, other: &Graph) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    pub(crate) fn data(&self) -> Ref<'_, GraphData> {
        self.data.borrow()
    }

    pub(crate) fn set_plan(&self, plan: MemoryPlan) {
        self.data.borrow_mut().plan = Some(plan);
    }

    /// Append an input node. Always succeeds.
    pub fn add_input(&self, label: impl Into<String>) -> Tensor {
        let id = self.push(OpKind::Input, label.into(), Vec::new());
        Tensor::new(id, self.clone())
    }

    /// Append a node of `kind` reading `inputs`.
    ///
    /// Fails with [`Error::ArityMismatch`] when the number of inputs does not
    /// match the kind, and with [`Error::ForeignTensor`] when an input was
    /// created by another graph.
    pub fn create_node(
        &self,
        kind: OpKind,
        label: impl Into<String>,
        inputs: &[&Tensor],
    ) -> Result<Tensor> {
        let label = label.into();
        if inputs.len() != kind.arity() {
            return Err(Error::ArityMismatch {
                kind,
                label,
                expected: kind.arity(),
                actual: inputs.len(),
            }
            .bt());
        }
        for input in inputs {
            self.check_owned(input)?;
        }
        let inputs = inputs.iter().map(|t| t.id()).collect();
        let id = self.push(kind, label, inputs);
        Ok(Tensor::new(id, self.clone()))
    }

    pub fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let label = format!("add(%{}, %{})", a.id(), b.id());
        self.create_node(OpKind::Add, label, &[a, b])
    }

    pub fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let label = format!("mul(%{}, %{})", a.id(), b.id());
        self.create_node(OpKind::Mul, label, &[a, b])
    }

    pub fn relu(&self, a: &Tensor) -> Result<Tensor> {
        let label = format!("relu(%{})", a.id());
        self.create_node(OpKind::Relu, label, &[a])
    }

    pub(crate) fn check_owned(&self, tensor: &Tensor) -> Result<()> {
        if tensor.graph().same_graph(self) {
            Ok(())
        } else {
            Err(Error::ForeignTensor {
                id: tensor.id(),
                label: tensor.label(),
            }
            .bt())
        }
    }

    fn push(&self, kind: OpKind, label: String, inputs: Vec<NodeId>) -> NodeId {
        let mut data = self.data.borrow_mut();
        let id = NodeId(data.nodes.len());
        data.nodes.push(Node {
            id,
            kind,
            label,
            inputs,
        });
        id
    }

    /// Human readable listing of every node in creation order.
    pub fn dump(&self) -> String {
        self.to_string()
    }

    pub fn to_petgraph(&self) -> PetGraph<String, ()> {
        let nodes = self.nodes();
        let mut g = PetGraph::<String, ()>::new();
        let idx_map: Vec<NodeIndex> = nodes
            .iter()
            .map(|node| g.add_node(format!("{}: {}", node.kind, node.label)))
            .collect();
        for node in nodes.iter() {
            for input in &node.inputs {
                g.add_edge(idx_map[input.index()], idx_map[node.id.index()], ());
            }
        }
        g
    }

    /// Produce a DOT format string of this graph.
    pub fn to_dot(&self) -> String {
        let g = self.to_petgraph();
        format!("{:?}", Dot::with_config(&g, &[Config::EdgeNoLabel]))
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes = self.nodes();
        writeln!(f, "--- COMPUTATIONAL GRAPH ---")?;
        for node in nodes.iter() {
            write!(f, "[{}] {} ({})", node.id, node.label, node.kind)?;
            if !node.inputs.is_empty() {
                write!(f, " <- inputs:")?;
                for input in &node.inputs {
                    write!(f, " {}[{}]", nodes[input.index()].label, input)?;
                }
            }
            writeln!(f)?;
        }
        write!(f, "---------------------------")
    }
}
