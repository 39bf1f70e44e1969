// Graph: the kernel contract, the lifetime planner and the executor.

pub mod kernel;
pub mod plan;
pub mod runtime;

pub use kernel::Kernel;
pub use plan::{ExecutionPlan, Lifetime};
pub use runtime::{Phase, PlanState, RuntimeGraph, Step};
