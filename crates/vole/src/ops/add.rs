// Add: element-wise sum of two same-shaped tensors
//
//   forward:  out = a + b
//   backward: da = dy, db = dy   (da + db = 2 dy when both bind one tensor)

use vole_core::{Error, Result, TensorId, TensorStore};

use super::{expect_f32, expect_shape};
use crate::graph::Kernel;

pub struct AddKernel {
    inputs: [TensorId; 2],
    outputs: [TensorId; 1],
}

impl AddKernel {
    pub fn new(a: TensorId, b: TensorId, out: TensorId) -> Self {
        Self {
            inputs: [a, b],
            outputs: [out],
        }
    }
}

impl Kernel for AddKernel {
    fn name(&self) -> &str {
        "add"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let a = tensors.get(self.inputs[0])?;
        let b = tensors.get(self.inputs[1])?;
        let out = tensors.get(self.outputs[0])?;
        for t in [a, b, out] {
            expect_f32("add", t)?;
        }
        expect_shape(a.shape(), b)?;
        expect_shape(a.shape(), out)
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let a = ins[0].data::<f32>()?;
        let b = ins[1].data::<f32>()?;
        let out = outs[0].data_mut::<f32>()?;
        for ((o, x), y) in out.iter_mut().zip(a).zip(b) {
            *o = x + y;
        }
        Ok(())
    }
}

/// Gradient of `Add`: routes `dy` to each bound input gradient.
pub struct AddBackward {
    inputs: [TensorId; 1],
    outputs: Vec<TensorId>,
    // Both operands share one gradient tensor.
    doubled: bool,
}

impl AddBackward {
    pub fn new(dy: TensorId, da: Option<TensorId>, db: Option<TensorId>) -> Result<Self> {
        let (outputs, doubled) = match (da, db) {
            (Some(da), Some(db)) if da == db => (vec![da], true),
            (Some(da), Some(db)) => (vec![da, db], false),
            (Some(g), None) | (None, Some(g)) => (vec![g], false),
            (None, None) => return Err(Error::msg("add backward: no input gradient to write")),
        };
        Ok(Self {
            inputs: [dy],
            outputs,
            doubled,
        })
    }
}

impl Kernel for AddBackward {
    fn name(&self) -> &str {
        "add_grad"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let dy = tensors.get(self.inputs[0])?;
        expect_f32("add_grad", dy)?;
        for &id in &self.outputs {
            let g = tensors.get(id)?;
            expect_f32("add_grad", g)?;
            expect_shape(dy.shape(), g)?;
        }
        Ok(())
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let dy = ins[0].data::<f32>()?;
        let scale = if self.doubled { 2.0 } else { 1.0 };
        for out in outs.iter_mut() {
            for (g, d) in out.data_mut::<f32>()?.iter_mut().zip(dy) {
                *g = scale * d;
            }
        }
        Ok(())
    }
}
