// Operators: IR-level nodes, the capability table and reference kernels
//
// An OpNode is what a loader hands over for one operator: its kind, tensor
// bindings and, for training graphs, which tensors receive gradients. The
// KernelRegistry maps each kind to factories for its forward and backward
// kernels, so the engine never has to know what an operator computes.
//
// The reference kernels are f32-only and run on host memory.

pub mod add;
pub mod fully_connected;
pub mod mse_loss;
pub mod registry;
pub mod relu;

use std::fmt;

use vole_core::{DType, Error, Result, Shape, Tensor, TensorId};

pub use add::{AddBackward, AddKernel};
pub use fully_connected::{FullyConnectedBackward, FullyConnectedKernel};
pub use mse_loss::{MseLossBackward, MseLossKernel};
pub use registry::{
    lower_inference, lower_training, BackwardFactory, ForwardFactory, KernelRegistry,
    LoweredOp, OpCapability,
};
pub use relu::{ReluBackward, ReluKernel};

/// Operator kinds with a reference implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// `out = a + b` (same shapes).
    Add,
    /// `out = max(x, 0)`.
    Relu,
    /// `out = x . W^T + b`, with `W` laid out `[out_features, in_features]`.
    FullyConnected,
    /// `loss = mean((pred - target)^2)`.
    MseLoss,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpKind::Add => "Add",
            OpKind::Relu => "Relu",
            OpKind::FullyConnected => "FullyConnected",
            OpKind::MseLoss => "MseLoss",
        };
        write!(f, "{s}")
    }
}

/// One operator of a graph as produced by a loader.
#[derive(Debug, Clone)]
pub struct OpNode {
    pub name: String,
    pub kind: OpKind,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorId>,
    /// Gradient tensor written for each input, if any.
    pub input_grads: Vec<Option<TensorId>>,
    /// Incoming gradient tensor for each output, if any.
    pub output_grads: Vec<Option<TensorId>>,
    /// Set by `mark_required_for_backward`.
    pub required_for_backward: bool,
}

impl OpNode {
    pub fn new(
        name: impl Into<String>,
        kind: OpKind,
        inputs: Vec<TensorId>,
        outputs: Vec<TensorId>,
    ) -> Self {
        let input_grads = vec![None; inputs.len()];
        let output_grads = vec![None; outputs.len()];
        Self {
            name: name.into(),
            kind,
            inputs,
            outputs,
            input_grads,
            output_grads,
            required_for_backward: false,
        }
    }

    /// Bind the gradient tensor of input `index`.
    pub fn with_input_grad(mut self, index: usize, grad: TensorId) -> Self {
        if let Some(slot) = self.input_grads.get_mut(index) {
            *slot = Some(grad);
        }
        self
    }

    /// Bind the incoming gradient tensor of output `index`.
    pub fn with_output_grad(mut self, index: usize, grad: TensorId) -> Self {
        if let Some(slot) = self.output_grads.get_mut(index) {
            *slot = Some(grad);
        }
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required_for_backward = required;
        self
    }

    pub fn has_input_grads(&self) -> bool {
        self.input_grads.iter().any(Option::is_some)
    }

    /// Input `index`, or a descriptive error.
    pub fn input(&self, index: usize) -> Result<TensorId> {
        self.inputs.get(index).copied().ok_or_else(|| {
            Error::msg(format!("{} '{}': missing input #{index}", self.kind, self.name))
        })
    }

    pub fn output(&self, index: usize) -> Result<TensorId> {
        self.outputs.get(index).copied().ok_or_else(|| {
            Error::msg(format!("{} '{}': missing output #{index}", self.kind, self.name))
        })
    }

    pub fn output_grad(&self, index: usize) -> Result<TensorId> {
        self.output_grads
            .get(index)
            .copied()
            .flatten()
            .ok_or_else(|| {
                Error::msg(format!(
                    "{} '{}': no incoming gradient bound for output #{index}",
                    self.kind, self.name
                ))
            })
    }

    pub fn input_grad(&self, index: usize) -> Option<TensorId> {
        self.input_grads.get(index).copied().flatten()
    }
}

// Shared checks for the f32 reference kernels.

pub(crate) fn expect_f32(op: &str, tensor: &Tensor) -> Result<()> {
    if tensor.dtype() != DType::F32 {
        return Err(Error::UnsupportedType {
            op: op.to_string(),
            dtype: tensor.dtype(),
        });
    }
    Ok(())
}

pub(crate) fn expect_shape(expected: &Shape, tensor: &Tensor) -> Result<()> {
    if tensor.shape() != expected {
        return Err(Error::ShapeMismatch {
            expected: expected.clone(),
            got: tensor.shape().clone(),
        });
    }
    Ok(())
}
