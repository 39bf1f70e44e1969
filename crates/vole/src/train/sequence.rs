// TrainableSequence: forward -> backward* -> update* for one operator
//
// The sequence is one kernel with two phases. Its forward phase is the
// forward kernel. Its backward phase runs the backward kernels and then the
// gradient appliers, so each parameter is updated right after its gradient
// is computed and before any upstream operator's backward phase runs.
//
// Backward bindings are the union of the backward and applier bindings.
// Tensors written by one of those steps and read by a later one (parameter
// gradients) are backward outputs only, so the planner allocates and
// releases them within the operator's backward step.

use vole_core::{Result, TensorId, TensorStore};

use crate::graph::Kernel;

/// Ordered training steps generated for one operator.
pub struct TrainableSequence {
    name: String,
    forward: Box<dyn Kernel>,
    backward: Vec<Box<dyn Kernel>>,
    appliers: Vec<Box<dyn Kernel>>,
    backward_inputs: Vec<TensorId>,
    backward_outputs: Vec<TensorId>,
}

impl TrainableSequence {
    /// Sequence with only a forward step.
    pub fn new(forward: Box<dyn Kernel>) -> Self {
        Self {
            name: forward.name().to_string(),
            forward,
            backward: Vec::new(),
            appliers: Vec::new(),
            backward_inputs: Vec::new(),
            backward_outputs: Vec::new(),
        }
    }

    pub fn with_backward(mut self, kernel: Box<dyn Kernel>) -> Self {
        self.backward.push(kernel);
        self.rebind();
        self
    }

    pub fn with_applier(mut self, applier: Box<dyn Kernel>) -> Self {
        self.appliers.push(applier);
        self.rebind();
        self
    }

    pub fn backward_len(&self) -> usize {
        self.backward.len()
    }

    pub fn applier_len(&self) -> usize {
        self.appliers.len()
    }

    fn update_steps(&self) -> impl Iterator<Item = &(dyn Kernel + 'static)> + '_ {
        self.backward
            .iter()
            .chain(self.appliers.iter())
            .map(|k| &**k)
    }

    // Recompute the union bindings of the backward phase.
    fn rebind(&mut self) {
        let mut outputs: Vec<TensorId> = Vec::new();
        for step in self.update_steps() {
            for &id in step.output_tensors() {
                if !outputs.contains(&id) {
                    outputs.push(id);
                }
            }
        }
        let mut inputs: Vec<TensorId> = Vec::new();
        for step in self.update_steps() {
            for &id in step.input_tensors() {
                if !outputs.contains(&id) && !inputs.contains(&id) {
                    inputs.push(id);
                }
            }
        }
        self.backward_inputs = inputs;
        self.backward_outputs = outputs;
    }
}

impl Kernel for TrainableSequence {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_tensors(&self) -> &[TensorId] {
        self.forward.input_tensors()
    }

    fn output_tensors(&self) -> &[TensorId] {
        self.forward.output_tensors()
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        self.forward.configure(tensors)?;
        for step in self.backward.iter_mut().chain(self.appliers.iter_mut()) {
            step.configure(tensors)?;
        }
        Ok(())
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        tracing::trace!(op = %self.name, "forward");
        self.forward.execute(tensors)
    }

    fn has_backward(&self) -> bool {
        !self.backward.is_empty() || !self.appliers.is_empty()
    }

    fn backward_input_tensors(&self) -> &[TensorId] {
        &self.backward_inputs
    }

    fn backward_output_tensors(&self) -> &[TensorId] {
        &self.backward_outputs
    }

    fn backward(&mut self, tensors: &mut TensorStore) -> Result<()> {
        for step in &mut self.backward {
            tracing::trace!(op = %self.name, step = step.name(), "backward");
            step.execute(tensors)?;
        }
        for step in &mut self.appliers {
            tracing::trace!(op = %self.name, step = step.name(), "update");
            step.execute(tensors)?;
        }
        Ok(())
    }
}
