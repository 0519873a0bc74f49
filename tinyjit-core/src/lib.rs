//! tinyjit is a tiny specializing JIT for elementwise scalar graphs.
//!
//! All the code you write is recorded into a [`Graph`] and nothing is computed
//! until the graph is planned, lowered to C, compiled and loaded.
//!
//! ## A quick guide
//! - First, create a [`Graph`]. It holds every node and, once planned, the arena layout.
//! - Values are modelled with a [`Tensor`]. Arithmetic on tensors only appends nodes.
//! - Plan the arena with [`Graph::compile`]. This assigns every node a slot and
//!   reuses slots of values nothing reads anymore.
//! - Generate a C kernel for an output with [`Graph::generate_kernel`] and turn it
//!   into native code with [`runtime::build`].
//! - Run it over a batch of rows with [`Graph::execute`], or do all of the above
//!   with [`Graph::run`].
//!
//! ## What can you do with it?
//! ```no_run
//! use tinyjit_core::{Graph, JitConfig};
//!
//! # fn main() -> tinyjit_core::Result<()> {
//! let graph = Graph::empty();
//! let a = graph.add_input("A");
//! let b = graph.add_input("B");
//! let t1 = (&a + &b)?;
//! let t2 = (&t1 * &a)?;
//! let t3 = b.relu()?;
//! let out = (&t2 + &t3)?;
//!
//! graph.compile()?;
//! let result = graph.run(&out, &[(&a, 2.0), (&b, 3.0)], 10, &JitConfig::from_env()?)?;
//! assert_eq!(result.rows(), &[13.0; 10]);
//! # Ok(())
//! # }
//! ```
//!
//! [`Graph::evaluate`] computes the same values without a compiler, which is
//! handy for checking generated kernels.

mod codegen;
mod config;
mod error;
mod exec;
mod graph;
mod interp;
mod planner;
pub mod runtime;
mod tensor;

pub use codegen::{KernelSource, KernelStrategy, KERNEL_SYMBOL};
pub use config::{JitConfig, DEFAULT_BUILD_TIMEOUT, DEFAULT_COMPILER};
pub use error::{Context, Error, Result};
pub use exec::{Arena, Execution};
pub use graph::{Graph, Node, NodeId, OpKind};
pub use planner::{
    MemoryPlan, PlanConfig, SlotMetrics, DEFAULT_BATCH_SIZE, DEFAULT_SLOT_WIDTH,
};
pub use runtime::{build, CompiledKernel, EntryPoint, NativeModule};
pub use tensor::Tensor;
