//! Liveness-based arena planning.
//!
//! Every node gets a fixed-width slot in a flat arena. A slot is released once
//! the last node reading it has been placed, and later nodes take the lowest
//! free slot. This is a greedy linear scan: reuse depends on creation order and
//! is not guaranteed to be optimal.

use tracing::{debug, info, trace};

use crate::{
    graph::{Graph, Node, NodeId, OpKind},
    Error, Result, Tensor,
};

pub use slots::SlotMetrics;
use slots::SlotTable;

mod slots;

/// Elements per slot unless configured otherwise.
pub const DEFAULT_SLOT_WIDTH: usize = 1024;
/// Rows per kernel invocation unless configured otherwise.
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanConfig {
    /// Elements per slot. Must be at least `batch_size`.
    pub slot_width: usize,
    /// Rows the kernel is expected to process.
    pub batch_size: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            slot_width: DEFAULT_SLOT_WIDTH,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl PlanConfig {
    pub fn with_slot_width(mut self, slot_width: usize) -> Self {
        self.slot_width = slot_width;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.slot_width == 0 || self.batch_size > self.slot_width {
            return Err(Error::ArenaOverflow {
                rows: self.batch_size,
                slot_width: self.slot_width,
            }
            .bt());
        }
        Ok(())
    }
}

/// The slot table produced by one planning pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryPlan {
    config: PlanConfig,
    /// Arena offset per node, indexed by node id.
    offsets: Vec<usize>,
    /// Latest consumer per node, indexed by node id.
    last_use: Vec<Option<NodeId>>,
    slot_count: usize,
    metrics: SlotMetrics,
}

impl MemoryPlan {
    /// Plan `nodes`, which must be in creation order.
    pub fn new(nodes: &[Node], config: PlanConfig) -> Result<Self> {
        config.validate()?;
        let last_use = last_uses(nodes);

        let mut offsets = vec![0; nodes.len()];
        let mut table = SlotTable::new();
        // Inputs are resident before the kernel starts, so they are placed first.
        let order = nodes
            .iter()
            .filter(|node| node.kind() == OpKind::Input)
            .chain(nodes.iter().filter(|node| node.kind() != OpKind::Input));

        for (step, node) in order.enumerate() {
            let slot = table.acquire();
            offsets[node.id().index()] = slot * config.slot_width;
            debug!(
                step,
                node = node.id().index(),
                label = node.label(),
                slot,
                "assigned slot"
            );

            for input in node.inputs() {
                if last_use[input.index()] == Some(node.id()) {
                    let freed = offsets[input.index()] / config.slot_width;
                    if table.release(freed) {
                        trace!(input = input.index(), slot = freed, "input is dead, freeing slot");
                    }
                }
            }
        }

        let metrics = table.metrics();
        debug_assert_eq!(metrics.peak_occupied, table.len());
        let plan = Self {
            config,
            offsets,
            last_use,
            slot_count: metrics.peak_occupied,
            metrics,
        };
        info!(
            nodes = nodes.len(),
            slots = plan.slot_count,
            arena_size = plan.arena_size(),
            "memory planning complete"
        );
        Ok(plan)
    }

    /// Arena offset of `id`.
    pub fn offset(&self, id: NodeId) -> Result<usize> {
        self.offsets.get(id.index()).copied().ok_or_else(|| {
            Error::UnplannedQuery {
                what: format!("offset of node [{id}]"),
            }
            .bt()
        })
    }

    /// Slot index of `id`.
    pub fn slot(&self, id: NodeId) -> Result<usize> {
        Ok(self.offset(id)? / self.config.slot_width)
    }

    /// Whether `id` was part of this planning pass.
    pub fn contains(&self, id: NodeId) -> bool {
        id.index() < self.offsets.len()
    }

    /// The last node reading `id`, or `None` if nothing reads it.
    pub fn last_use(&self, id: NodeId) -> Option<NodeId> {
        self.last_use.get(id.index()).copied().flatten()
    }

    /// Number of elements the arena must hold.
    pub fn arena_size(&self) -> usize {
        self.slot_count * self.config.slot_width
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_width(&self) -> usize {
        self.config.slot_width
    }

    pub fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    pub fn config(&self) -> PlanConfig {
        self.config
    }

    /// Number of nodes covered by this plan.
    pub fn planned_nodes(&self) -> usize {
        self.offsets.len()
    }

    pub fn metrics(&self) -> &SlotMetrics {
        &self.metrics
    }
}

fn last_uses(nodes: &[Node]) -> Vec<Option<NodeId>> {
    let mut last_use: Vec<Option<NodeId>> = vec![None; nodes.len()];
    for node in nodes {
        for input in node.inputs() {
            let entry = &mut last_use[input.index()];
            *entry = (*entry).max(Some(node.id()));
        }
    }
    last_use
}

impl Graph {
    /// Plan the arena with the default [`PlanConfig`].
    pub fn compile(&self) -> Result<MemoryPlan> {
        self.compile_with(PlanConfig::default())
    }

    /// Plan the arena. Any previous plan is discarded, never merged.
    pub fn compile_with(&self, config: PlanConfig) -> Result<MemoryPlan> {
        let plan = MemoryPlan::new(&self.nodes(), config)?;
        self.set_plan(plan.clone());
        Ok(plan)
    }

    pub fn is_planned(&self) -> bool {
        self.data().plan.is_some()
    }

    /// The current plan.
    pub fn plan(&self) -> Result<MemoryPlan> {
        self.data().plan.clone().ok_or_else(|| {
            Error::UnplannedQuery {
                what: "memory plan".to_string(),
            }
            .bt()
        })
    }

    /// Planned arena offset of `tensor`.
    pub fn get_offset(&self, tensor: &Tensor) -> Result<usize> {
        self.check_owned(tensor)?;
        match &self.data().plan {
            Some(plan) => plan.offset(tensor.id()),
            None => Err(Error::UnplannedQuery {
                what: format!("offset of '{}' [{}]", tensor.label(), tensor.id()),
            }
            .bt()),
        }
    }

    /// Planned arena size in elements.
    pub fn arena_size(&self) -> Result<usize> {
        match &self.data().plan {
            Some(plan) => Ok(plan.arena_size()),
            None => Err(Error::UnplannedQuery {
                what: "arena size".to_string(),
            }
            .bt()),
        }
    }
}
