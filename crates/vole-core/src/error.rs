use crate::dtype::DType;
use crate::shape::Shape;
use crate::tensor::TensorId;

/// All errors that can occur while building, planning or running a graph.
///
/// Variants fall into three groups. Structural violations (double writes,
/// bad kernel indices, running an unplanned graph) are programming errors in
/// the caller or the loader. Numeric configuration errors come from kernels
/// that cannot handle the tensors they were bound to. Resource exhaustion
/// comes from the memory manager. None of them are retried by the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A tensor was bound as the primary output of two steps.
    #[error("tensor {tensor} written by step {first} and again by step {second}")]
    DoubleWrite {
        tensor: TensorId,
        first: usize,
        second: usize,
    },

    /// A step read a tensor that only a later step writes.
    #[error("tensor {tensor} read by step {read} before step {write} writes it")]
    ReadBeforeWrite {
        tensor: TensorId,
        read: usize,
        write: usize,
    },

    /// Step index outside the plan.
    #[error("step index {index} out of range for plan with {len} slots")]
    StepIndexOutOfRange { index: usize, len: usize },

    /// The allocation plan was used before it was built (or after it went stale).
    #[error("execution plan is not built; call configure() first")]
    PlanNotBuilt,

    /// A tensor id that does not belong to the store.
    #[error("unknown tensor {0}")]
    UnknownTensor(TensorId),

    /// A tensor bound as a kernel output is also bound elsewhere in the same call.
    #[error("tensor {0} is bound as an output and aliased by another binding")]
    AliasedOutput(TensorId),

    /// The kernel does not support this element type.
    #[error("{op}: unsupported dtype {dtype}")]
    UnsupportedType { op: String, dtype: DType },

    /// Shape mismatch between bound tensors.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Typed access with the wrong element type.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Data access on a tensor that has no backing storage.
    #[error("tensor {0} has no backing storage")]
    NotAllocated(TensorId),

    /// Allocation requested for a tensor that already has storage.
    #[error("tensor {0} is already allocated")]
    AlreadyAllocated(TensorId),

    /// The memory manager could not satisfy a request.
    #[error("allocation of {requested} bytes for tensor {tensor} failed ({available} bytes available)")]
    AllocationFailure {
        tensor: TensorId,
        requested: usize,
        available: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Whether this error signals a broken contract rather than a runtime fault.
    ///
    /// Contract violations mean the graph or the caller is wrong; rerunning
    /// the same pass will fail the same way.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::DoubleWrite { .. }
                | Error::ReadBeforeWrite { .. }
                | Error::StepIndexOutOfRange { .. }
                | Error::PlanNotBuilt
                | Error::UnknownTensor(_)
                | Error::AliasedOutput(_)
        )
    }
}

/// Convenience Result type used throughout Vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
