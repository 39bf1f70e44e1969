// MseLoss: loss = mean((pred - target)^2), written to a one-element tensor
//
// The loss is the root of the backward graph, so its backward kernel takes
// no incoming gradient: dpred = 2 (pred - target) / n.

use vole_core::{Result, Shape, TensorId, TensorStore};

use super::{expect_f32, expect_shape};
use crate::graph::Kernel;

fn check_pair(
    op: &str,
    tensors: &TensorStore,
    pred: TensorId,
    target: TensorId,
) -> Result<Shape> {
    let pred = tensors.get(pred)?;
    let target = tensors.get(target)?;
    expect_f32(op, pred)?;
    expect_f32(op, target)?;
    expect_shape(pred.shape(), target)?;
    Ok(pred.shape().clone())
}

pub struct MseLossKernel {
    inputs: [TensorId; 2],
    outputs: [TensorId; 1],
}

impl MseLossKernel {
    pub fn new(pred: TensorId, target: TensorId, loss: TensorId) -> Self {
        Self {
            inputs: [pred, target],
            outputs: [loss],
        }
    }
}

impl Kernel for MseLossKernel {
    fn name(&self) -> &str {
        "mse_loss"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        check_pair("mse_loss", tensors, self.inputs[0], self.inputs[1])?;
        let loss = tensors.get(self.outputs[0])?;
        expect_f32("mse_loss", loss)?;
        expect_shape(&Shape::from(1), loss)
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let pred = ins[0].data::<f32>()?;
        let target = ins[1].data::<f32>()?;
        let n = pred.len().max(1) as f32;
        let sum: f32 = pred
            .iter()
            .zip(target)
            .map(|(p, t)| (p - t) * (p - t))
            .sum();
        outs[0].data_mut::<f32>()?[0] = sum / n;
        Ok(())
    }
}

/// Gradient of the mean squared error with respect to the predictions.
pub struct MseLossBackward {
    inputs: [TensorId; 2],
    outputs: [TensorId; 1],
}

impl MseLossBackward {
    pub fn new(pred: TensorId, target: TensorId, dpred: TensorId) -> Self {
        Self {
            inputs: [pred, target],
            outputs: [dpred],
        }
    }
}

impl Kernel for MseLossBackward {
    fn name(&self) -> &str {
        "mse_loss_grad"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let shape = check_pair("mse_loss_grad", tensors, self.inputs[0], self.inputs[1])?;
        let dpred = tensors.get(self.outputs[0])?;
        expect_f32("mse_loss_grad", dpred)?;
        expect_shape(&shape, dpred)
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let pred = ins[0].data::<f32>()?;
        let target = ins[1].data::<f32>()?;
        let scale = 2.0 / pred.len().max(1) as f32;
        let dpred = outs[0].data_mut::<f32>()?;
        for ((g, p), t) in dpred.iter_mut().zip(pred).zip(target) {
            *g = scale * (p - t);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, MemoryManager, SimpleMemoryManager, Tensor};

    #[test]
    fn test_mse_forward_and_backward() {
        let mut store = TensorStore::new();
        let mut mm = SimpleMemoryManager::new();
        let mut add = |name: &str, n: usize, values: Option<[f32; 2]>| {
            let id = store.add(Tensor::new(name, DType::F32, n));
            let t = store.get_mut(id).unwrap();
            mm.allocate_memory(t).unwrap();
            if let Some(v) = values {
                t.copy_from_slice(&v).unwrap();
            }
            id
        };
        let pred = add("pred", 2, Some([1.0, 3.0]));
        let target = add("target", 2, Some([0.0, 1.0]));
        let loss = add("loss", 1, None);
        let dpred = add("dpred", 2, None);

        let mut fwd = MseLossKernel::new(pred, target, loss);
        let mut bwd = MseLossBackward::new(pred, target, dpred);
        fwd.configure(&mut store).unwrap();
        bwd.configure(&mut store).unwrap();
        fwd.execute(&mut store).unwrap();
        bwd.execute(&mut store).unwrap();

        // ((1)^2 + (2)^2) / 2
        assert_eq!(store.get(loss).unwrap().to_vec::<f32>().unwrap(), vec![2.5]);
        assert_eq!(store.get(dpred).unwrap().to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_mse_requires_scalar_loss() {
        let mut store = TensorStore::new();
        let pred = store.add(Tensor::new("pred", DType::F32, 2));
        let target = store.add(Tensor::new("target", DType::F32, 2));
        let loss = store.add(Tensor::new("loss", DType::F32, 2));
        assert!(MseLossKernel::new(pred, target, loss)
            .configure(&mut store)
            .is_err());
    }
}
