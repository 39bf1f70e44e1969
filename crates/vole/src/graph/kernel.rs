use vole_core::{Result, TensorId, TensorStore};

/// One executable step of a compute graph.
///
/// A kernel is bound to its tensors by id when the loader creates it. It
/// never allocates: by the time `execute` runs, the execution loop has
/// already given every tensor in `output_tensors()` its storage, and it
/// releases whatever is no longer needed right after.
///
/// The planner reads only the binding lists, so they must list every
/// tensor the kernel touches and must not change after the kernel has been
/// added to a graph.
///
/// Training kernels also have a backward phase. The graph runs every
/// forward phase in kernel order, then the backward phases in reverse kernel
/// order, so a backward phase can read gradients written by the backward
/// phases of downstream kernels. Inference kernels keep the defaults.
pub trait Kernel {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    /// Tensors read by this kernel.
    fn input_tensors(&self) -> &[TensorId];

    /// Tensors written by this kernel as primary outputs.
    fn output_tensors(&self) -> &[TensorId];

    /// Validate bindings (dtypes, shapes) before the first run.
    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()>;

    /// Compute outputs from inputs.
    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()>;

    /// Whether the kernel gets a step in the backward sweep.
    fn has_backward(&self) -> bool {
        false
    }

    /// Tensors read by the backward phase.
    fn backward_input_tensors(&self) -> &[TensorId] {
        &[]
    }

    /// Tensors written by the backward phase.
    fn backward_output_tensors(&self) -> &[TensorId] {
        &[]
    }

    /// Compute gradients and update parameters.
    fn backward(&mut self, _tensors: &mut TensorStore) -> Result<()> {
        Ok(())
    }
}
