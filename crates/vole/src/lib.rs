//! # Vole
//!
//! A graph execution engine that plans tensor lifetimes ahead of time, so a
//! pass only ever holds the buffers it currently needs, and runs training
//! graphs as forward, backward and update steps through the same loop.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Tensor, TensorStore, Shape, DType, MemoryManager, Error |
//! | `vole` | Kernel trait, lifetime planner, RuntimeGraph, training sequences, reference ops |
//!
//! ## Modules
//!
//! - [`graph`]: kernel contract, [`ExecutionPlan`](graph::ExecutionPlan), [`RuntimeGraph`](graph::RuntimeGraph)
//! - [`train`]: trainable step sequences, optimizer contract, required-for-backward analysis, session loop
//! - [`ops`]: operator capability table and f32 reference kernels
//! - [`config`]: runtime and training configuration

pub mod config;
pub mod graph;
pub mod ops;
pub mod train;

/// Re-export core types.
pub use vole_core::{
    format_bytes, AffineQuantization, DType, Error, MemoryManager, MemoryStats, Result, Shape,
    SharedMemoryManager, SimpleMemoryManager, Tensor, TensorId, TensorStore, WithDType,
};

/// Convenient glob import: `use vole::prelude::*;`
pub mod prelude {
    pub use crate::config::{RuntimeConfig, TrainingConfig};
    pub use crate::graph::{ExecutionPlan, Kernel, Lifetime, Phase, PlanState, RuntimeGraph, Step};
    pub use crate::ops::{lower_inference, lower_training, KernelRegistry, OpKind, OpNode};
    pub use crate::train::{
        mark_required_for_backward, GradientApplier, Optimizer, Sgd, SharedOptimizer,
        TrainableSequence, TrainingSession,
    };
    pub use vole_core::{
        DType, Error, MemoryManager, Result, Shape, SimpleMemoryManager, Tensor, TensorId,
        TensorStore,
    };
}
