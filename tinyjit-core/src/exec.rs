use std::ffi::c_int;

use tracing::{debug, info};

use crate::{
    config::JitConfig,
    graph::{Graph, OpKind},
    runtime::{self, CompiledKernel},
    Error, Result, Tensor,
};

/// Flat buffer holding every planned slot for one batch of rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Arena(Vec<f32>);

impl Arena {
    /// A zero-initialized arena of `size` elements.
    pub fn new(size: usize) -> Self {
        Self(vec![0.0; size])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Write `value` into the first `rows` elements starting at `offset`.
    pub fn broadcast(&mut self, offset: usize, value: f32, rows: usize) -> Result<()> {
        let len = self.len();
        let slot = self.0.get_mut(offset..offset + rows).ok_or_else(|| {
            Error::msg(format!(
                "rows {offset}..{} are outside an arena of {len} elements",
                offset + rows
            ))
        })?;
        slot.fill(value);
        Ok(())
    }

    /// The `rows` elements starting at `offset`.
    pub fn row(&self, offset: usize, rows: usize) -> Result<&[f32]> {
        self.0.get(offset..offset + rows).ok_or_else(|| {
            Error::msg(format!(
                "rows {offset}..{} are outside an arena of {} elements",
                offset + rows,
                self.len()
            ))
        })
    }

    fn as_mut_ptr(&mut self) -> *mut f32 {
        self.0.as_mut_ptr()
    }
}

/// The arena after a kernel ran over it.
#[derive(Debug, Clone)]
pub struct Execution {
    arena: Arena,
    output_offset: usize,
    rows: usize,
}

impl Execution {
    /// The output value of row 0.
    pub fn scalar(&self) -> f32 {
        self.arena.as_slice()[self.output_offset]
    }

    /// The output value of every row.
    pub fn rows(&self) -> &[f32] {
        &self.arena.as_slice()[self.output_offset..self.output_offset + self.rows]
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }
}

impl Graph {
    /// Run `kernel` over `rows` rows, broadcasting each bound scalar across its
    /// input slot first.
    pub fn execute(
        &self,
        kernel: &CompiledKernel,
        inputs: &[(&Tensor, f32)],
        rows: usize,
    ) -> Result<Execution> {
        let plan = kernel.plan();
        if self.plan()? != *plan {
            crate::bail!("kernel was generated from a different memory plan; regenerate it");
        }
        if rows > plan.slot_width() || c_int::try_from(rows).is_err() {
            return Err(Error::ArenaOverflow {
                rows,
                slot_width: plan.slot_width(),
            }
            .bt());
        }
        if rows != plan.batch_size() {
            debug!(rows, batch_size = plan.batch_size(), "row count differs from planned batch size");
        }

        let mut arena = Arena::new(plan.arena_size());
        info!(
            elements = arena.len(),
            bytes = arena.len() * std::mem::size_of::<f32>(),
            "allocated arena"
        );
        for (tensor, value) in inputs {
            self.check_owned(tensor)?;
            if tensor.kind() != OpKind::Input || !plan.contains(tensor.id()) {
                return Err(Error::UnboundInput {
                    id: tensor.id(),
                    label: tensor.label(),
                }
                .bt());
            }
            let offset = plan.offset(tensor.id())?;
            debug!(input = %tensor.label(), offset, value, "initializing input");
            arena.broadcast(offset, *value, rows)?;
        }

        if arena.len() < kernel.required_arena() {
            crate::bail!(
                "kernel needs {} arena elements but the plan provides {}",
                kernel.required_arena(),
                arena.len()
            );
        }
        debug!(rows, "running fused kernel");
        // SAFETY: the kernel only touches slots of `plan`, all of which lie
        // within the arena, and `rows` fits in every slot.
        unsafe { (kernel.entry())(arena.as_mut_ptr(), rows as c_int) };

        Ok(Execution {
            arena,
            output_offset: kernel.output_offset(),
            rows,
        })
    }

    /// Generate, build, execute and release a kernel for `output`.
    pub fn run(
        &self,
        output: &Tensor,
        inputs: &[(&Tensor, f32)],
        rows: usize,
        cfg: &JitConfig,
    ) -> Result<Execution> {
        let source = self.generate_kernel(output)?;
        let kernel = runtime::build(cfg, &source)?;
        let execution = self.execute(&kernel, inputs, rows);
        let released = kernel.release();
        let execution = execution?;
        released?;
        info!(output = %output.label(), result = execution.scalar(), "kernel executed");
        Ok(execution)
    }
}
