use vole_core::{Error, Result, TensorId, TensorStore};

use super::optimizer::SharedOptimizer;
use crate::graph::Kernel;

/// Update step that feeds one parameter gradient to the optimizer.
///
/// The parameter is listed as an input, not an output: it is provisioned by
/// the loader, lives for the whole session and must never enter the
/// allocation plan. Its storage is mutated in place by `Optimizer::apply`.
pub struct GradientApplier {
    name: String,
    bindings: [TensorId; 2],
    optimizer: SharedOptimizer,
}

impl GradientApplier {
    pub fn new(gradient: TensorId, parameter: TensorId, optimizer: SharedOptimizer) -> Self {
        Self {
            name: format!("apply({gradient} -> {parameter})"),
            bindings: [gradient, parameter],
            optimizer,
        }
    }

    pub fn gradient(&self) -> TensorId {
        self.bindings[0]
    }

    pub fn parameter(&self) -> TensorId {
        self.bindings[1]
    }
}

impl Kernel for GradientApplier {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.bindings
    }

    fn output_tensors(&self) -> &[TensorId] {
        &[]
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let gradient = tensors.get(self.gradient())?;
        let parameter = tensors.get(self.parameter())?;
        if !parameter.is_trainable() {
            return Err(Error::msg(format!(
                "{}: tensor {} ('{}') is not trainable",
                self.name,
                parameter.id(),
                parameter.name()
            )));
        }
        if gradient.dtype() != parameter.dtype() {
            return Err(Error::DTypeMismatch {
                expected: parameter.dtype(),
                got: gradient.dtype(),
            });
        }
        if gradient.shape() != parameter.shape() {
            return Err(Error::ShapeMismatch {
                expected: parameter.shape().clone(),
                got: gradient.shape().clone(),
            });
        }
        Ok(())
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let (ins, mut outs) = tensors.borrow_io(&self.bindings[..1], &self.bindings[1..])?;
        let mut optimizer = self
            .optimizer
            .try_borrow_mut()
            .map_err(|_| Error::msg("optimizer is already borrowed"))?;
        optimizer.apply(ins[0], &mut *outs[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::Sgd;
    use vole_core::{DType, MemoryManager, SimpleMemoryManager, Tensor};

    #[test]
    fn test_applier_updates_parameter_in_place() {
        let mut store = TensorStore::new();
        let mut mm = SimpleMemoryManager::new();
        let w = store.add(Tensor::new("w", DType::F32, 2).trainable());
        let dw = store.add(Tensor::new("dw", DType::F32, 2));
        for (id, values) in [(w, [1.0f32, 1.0]), (dw, [2.0, -2.0])] {
            let t = store.get_mut(id).unwrap();
            mm.allocate_memory(t).unwrap();
            t.copy_from_slice(&values).unwrap();
        }

        let sgd = Sgd::new(0.5).shared();
        let mut applier = GradientApplier::new(dw, w, sgd.clone());
        assert_eq!(applier.input_tensors(), &[dw, w]);
        assert!(applier.output_tensors().is_empty());

        applier.configure(&mut store).unwrap();
        applier.execute(&mut store).unwrap();
        assert_eq!(store.get(w).unwrap().to_vec::<f32>().unwrap(), vec![0.0, 2.0]);
        assert_eq!(sgd.borrow().steps(), 1);
    }

    #[test]
    fn test_applier_requires_trainable_parameter() {
        let mut store = TensorStore::new();
        let w = store.add(Tensor::new("w", DType::F32, 2));
        let dw = store.add(Tensor::new("dw", DType::F32, 2));
        let mut applier = GradientApplier::new(dw, w, Sgd::new(0.1).shared());
        assert!(applier.configure(&mut store).is_err());

        store.get_mut(w).unwrap().set_trainable(true);
        applier.configure(&mut store).unwrap();
    }
}
