use std::{
    fmt::Write,
    hash::{DefaultHasher, Hash, Hasher},
};

use tracing::debug;

use crate::{
    graph::{Graph, Node, NodeId, OpKind},
    planner::MemoryPlan,
    Context, Error, Result, Tensor,
};

/// Name the generated kernel is exported under.
pub const KERNEL_SYMBOL: &str = "fused_kernel";

/// How the output's subgraph is turned into kernel code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KernelStrategy {
    /// Every computed node is written to its planned slot and read back by its
    /// consumers, so shared nodes are evaluated once per row.
    #[default]
    Materialize,
    /// The whole subgraph is folded into a single expression that reads only
    /// input slots. Nodes with several consumers are duplicated.
    Inline,
}

/// A complete C translation unit exporting [`KERNEL_SYMBOL`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    code: String,
    output: NodeId,
    output_offset: usize,
    required_arena: usize,
    strategy: KernelStrategy,
    plan: MemoryPlan,
}

impl KernelSource {
    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn output(&self) -> NodeId {
        self.output
    }

    pub fn output_offset(&self) -> usize {
        self.output_offset
    }

    /// Smallest arena, in elements, the kernel can run against.
    pub fn required_arena(&self) -> usize {
        self.required_arena
    }

    pub fn slot_width(&self) -> usize {
        self.plan.slot_width()
    }

    /// The plan the kernel's offsets were taken from.
    pub fn plan(&self) -> &MemoryPlan {
        &self.plan
    }

    pub fn strategy(&self) -> KernelStrategy {
        self.strategy
    }

    /// Content hash of the source text, used to name build artifacts.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.code.hash(&mut hasher);
        hasher.finish()
    }
}

fn slot_read(plan: &MemoryPlan, id: NodeId) -> Result<String> {
    Ok(format!("buffer[{} + i]", plan.offset(id)?))
}

fn lookup(nodes: &[Node], id: NodeId) -> Result<&Node> {
    nodes
        .get(id.index())
        .ok_or_else(|| Error::UnknownNode { id }.bt())
}

fn binary_op(node: &Node) -> Result<&'static str> {
    node.kind().as_c_op().with_context(|| {
        format!(
            "node '{}' [{}] of kind {} has no infix operator",
            node.label(),
            node.id(),
            node.kind()
        )
    })
}

/// Lowering of `id` into one expression over input slots.
///
/// Members are visited in creation order, which is a post-order of the
/// subgraph. An operand's text is moved into its last consumer and cloned for
/// the others.
fn inline_expr(nodes: &[Node], plan: &MemoryPlan, id: NodeId) -> Result<String> {
    let members = subgraph(nodes, id)?;
    let mut pending = vec![0usize; nodes.len()];
    for &member in &members {
        for input in lookup(nodes, member)?.inputs() {
            pending[input.index()] += 1;
        }
    }

    let mut exprs: Vec<Option<String>> = vec![None; nodes.len()];
    for &member in &members {
        let node = lookup(nodes, member)?;
        let mut operand = |i: usize| -> Result<String> {
            let input = node.inputs()[i].index();
            pending[input] -= 1;
            let expr = if pending[input] == 0 {
                exprs[input].take()
            } else {
                exprs[input].clone()
            };
            expr.with_context(|| format!("operand [{input}] lowered out of order"))
        };
        let expr = match node.kind() {
            OpKind::Input => slot_read(plan, member)?,
            OpKind::Relu => format!("fmaxf(0.0f, {})", operand(0)?),
            OpKind::Add | OpKind::Mul => {
                let l = operand(0)?;
                let r = operand(1)?;
                format!("({l} {} {r})", binary_op(node)?)
            }
        };
        exprs[member.index()] = Some(expr);
    }

    exprs[id.index()]
        .take()
        .with_context(|| format!("node [{id}] was not lowered"))
}

/// Expression for a single node whose operands are read from their slots.
fn materialized_expr(node: &Node, plan: &MemoryPlan) -> Result<String> {
    match node.kind() {
        OpKind::Input => slot_read(plan, node.id()),
        OpKind::Relu => Ok(format!(
            "fmaxf(0.0f, {})",
            slot_read(plan, node.inputs()[0])?
        )),
        OpKind::Add | OpKind::Mul => Ok(format!(
            "({} {} {})",
            slot_read(plan, node.inputs()[0])?,
            binary_op(node)?,
            slot_read(plan, node.inputs()[1])?
        )),
    }
}

/// Ids reachable from `output` through input edges, in creation order.
fn subgraph(nodes: &[Node], output: NodeId) -> Result<Vec<NodeId>> {
    let mut reachable = vec![false; nodes.len()];
    let mut stack = vec![output];
    while let Some(id) = stack.pop() {
        let node = lookup(nodes, id)?;
        if !reachable[id.index()] {
            reachable[id.index()] = true;
            stack.extend_from_slice(node.inputs());
        }
    }
    Ok(reachable
        .iter()
        .enumerate()
        .filter(|(_, reached)| **reached)
        .map(|(i, _)| NodeId::from(i))
        .collect())
}

fn emit(body: &str) -> String {
    format!(
        r#"#include <math.h>

#if defined(_WIN32)
#define TINYJIT_EXPORT __declspec(dllexport)
#else
#define TINYJIT_EXPORT
#endif

#ifdef __cplusplus
extern "C" {{
#endif

TINYJIT_EXPORT void {KERNEL_SYMBOL}(float* buffer, int row_count) {{
    for (int i = 0; i < row_count; i++) {{
{body}    }}
}}

#ifdef __cplusplus
}}
#endif
"#
    )
}

impl Graph {
    /// Lower `output` into a single expression over input slots and the row
    /// index `i`.
    pub fn expression(&self, output: &Tensor) -> Result<String> {
        self.check_owned(output)?;
        let plan = self.plan()?;
        plan.offset(output.id())?;
        inline_expr(&self.nodes(), &plan, output.id())
    }

    /// Generate the kernel for `output` with [`KernelStrategy::Materialize`].
    pub fn generate_kernel(&self, output: &Tensor) -> Result<KernelSource> {
        self.generate_kernel_with(output, KernelStrategy::default())
    }

    pub fn generate_kernel_with(
        &self,
        output: &Tensor,
        strategy: KernelStrategy,
    ) -> Result<KernelSource> {
        self.check_owned(output)?;
        let plan = self.plan()?;
        let nodes = self.nodes();
        let out = output.id();
        let output_offset = plan.offset(out)?;
        let members = subgraph(&nodes, out)?;

        let mut body = String::new();
        let mut statements = 0;
        match strategy {
            KernelStrategy::Inline => {
                let expr = inline_expr(&nodes, &plan, out)?;
                let _ = writeln!(body, "        buffer[{output_offset} + i] = {expr};");
                statements += 1;
            }
            KernelStrategy::Materialize => {
                for &id in &members {
                    let node = lookup(&nodes, id)?;
                    if node.kind() == OpKind::Input {
                        continue;
                    }
                    let expr = materialized_expr(node, &plan)?;
                    let _ = writeln!(body, "        {} = {expr};", slot_read(&plan, id)?);
                    statements += 1;
                }
            }
        }

        let mut highest = output_offset;
        for &id in &members {
            highest = highest.max(plan.offset(id)?);
        }

        let source = KernelSource {
            code: emit(&body),
            output: out,
            output_offset,
            required_arena: highest + plan.slot_width(),
            strategy,
            plan,
        };
        debug!(
            output = out.index(),
            ?strategy,
            statements,
            fingerprint = source.fingerprint(),
            "generated kernel"
        );
        Ok(source)
    }
}
