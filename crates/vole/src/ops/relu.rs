use vole_core::{Result, TensorId, TensorStore};

use super::{expect_f32, expect_shape};
use crate::graph::Kernel;

/// `y = max(x, 0)`.
pub struct ReluKernel {
    inputs: [TensorId; 1],
    outputs: [TensorId; 1],
}

impl ReluKernel {
    pub fn new(x: TensorId, y: TensorId) -> Self {
        Self {
            inputs: [x],
            outputs: [y],
        }
    }
}

impl Kernel for ReluKernel {
    fn name(&self) -> &str {
        "relu"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let x = tensors.get(self.inputs[0])?;
        let y = tensors.get(self.outputs[0])?;
        expect_f32("relu", x)?;
        expect_f32("relu", y)?;
        expect_shape(x.shape(), y)
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let x = ins[0].data::<f32>()?;
        for (y, &v) in outs[0].data_mut::<f32>()?.iter_mut().zip(x) {
            *y = v.max(0.0);
        }
        Ok(())
    }
}

/// `dx = dy * (y > 0)`, using the saved forward output `y`.
pub struct ReluBackward {
    inputs: [TensorId; 2],
    outputs: [TensorId; 1],
}

impl ReluBackward {
    pub fn new(y: TensorId, dy: TensorId, dx: TensorId) -> Self {
        Self {
            inputs: [y, dy],
            outputs: [dx],
        }
    }
}

impl Kernel for ReluBackward {
    fn name(&self) -> &str {
        "relu_grad"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let y = tensors.get(self.inputs[0])?;
        for &id in self.inputs.iter().chain(&self.outputs) {
            let t = tensors.get(id)?;
            expect_f32("relu_grad", t)?;
            expect_shape(y.shape(), t)?;
        }
        Ok(())
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let y = ins[0].data::<f32>()?;
        let dy = ins[1].data::<f32>()?;
        let dx = outs[0].data_mut::<f32>()?;
        for ((g, &y), &d) in dx.iter_mut().zip(y).zip(dy) {
            *g = if y > 0.0 { d } else { 0.0 };
        }
        Ok(())
    }
}
