// Optimizer: per-parameter update rule consumed by gradient appliers
//
// The engine only ever calls `apply(gradient, parameter)`. Everything else
// (learning rate schedules, per-parameter state) belongs to the optimizer.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use vole_core::{DType, Error, Result, Tensor, TensorId};

use crate::config::TrainingConfig;

/// Stateful update rule for trainable parameters.
pub trait Optimizer {
    fn name(&self) -> &str;

    /// Update `parameter` in place from `gradient` and advance internal state.
    fn apply(&mut self, gradient: &Tensor, parameter: &mut Tensor) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// One optimizer shared by every applier of a training graph.
pub type SharedOptimizer = Rc<RefCell<dyn Optimizer>>;

/// Stochastic gradient descent with optional momentum.
///
/// With momentum `m` the update is `v = m * v + g; p -= lr * v`, keeping one
/// velocity buffer per parameter tensor.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: HashMap<TensorId, Vec<f32>>,
    steps: usize,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self {
            lr,
            momentum: 0.0,
            velocity: HashMap::new(),
            steps: 0,
        }
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        Self::new(config.learning_rate).with_momentum(config.momentum)
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Number of `apply` calls served.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Velocity buffer of a parameter, once it has been updated at least once.
    pub fn velocity(&self, parameter: TensorId) -> Option<&[f32]> {
        self.velocity.get(&parameter).map(Vec::as_slice)
    }

    /// Wrap for sharing between appliers.
    pub fn shared(self) -> Rc<RefCell<Sgd>> {
        Rc::new(RefCell::new(self))
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &str {
        "sgd"
    }

    fn apply(&mut self, gradient: &Tensor, parameter: &mut Tensor) -> Result<()> {
        for t in [gradient, &*parameter] {
            if t.dtype() != DType::F32 {
                return Err(Error::UnsupportedType {
                    op: "sgd".into(),
                    dtype: t.dtype(),
                });
            }
        }
        if gradient.shape() != parameter.shape() {
            return Err(Error::ShapeMismatch {
                expected: parameter.shape().clone(),
                got: gradient.shape().clone(),
            });
        }

        let lr = self.lr;
        let g = gradient.data::<f32>()?;
        if self.momentum == 0.0 {
            let p = parameter.data_mut::<f32>()?;
            for (p, g) in p.iter_mut().zip(g) {
                *p -= lr * g;
            }
        } else {
            let momentum = self.momentum;
            let v = self
                .velocity
                .entry(parameter.id())
                .or_insert_with(|| vec![0.0; g.len()]);
            let p = parameter.data_mut::<f32>()?;
            for ((p, v), g) in p.iter_mut().zip(v.iter_mut()).zip(g) {
                *v = momentum * *v + g;
                *p -= lr * *v;
            }
        }
        self.steps += 1;
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{MemoryManager, SimpleMemoryManager, TensorStore};

    fn pair(
        store: &mut TensorStore,
        mm: &mut SimpleMemoryManager,
        p: &[f32],
        g: &[f32],
    ) -> (TensorId, TensorId) {
        let param = store.add(Tensor::new("w", DType::F32, p.len()).trainable());
        let grad = store.add(Tensor::new("dw", DType::F32, g.len()));
        for (id, values) in [(param, p), (grad, g)] {
            let t = store.get_mut(id).unwrap();
            mm.allocate_memory(t).unwrap();
            t.copy_from_slice(values).unwrap();
        }
        (param, grad)
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut store = TensorStore::new();
        let mut mm = SimpleMemoryManager::new();
        let (w, dw) = pair(&mut store, &mut mm, &[1.0, -2.0], &[0.5, -1.0]);
        let mut sgd = Sgd::new(0.1);

        let (ins, mut outs) = store.borrow_io(&[dw], &[w]).unwrap();
        sgd.apply(ins[0], &mut *outs[0]).unwrap();
        let w = store.get(w).unwrap().to_vec::<f32>().unwrap();
        assert!((w[0] - 0.95).abs() < 1e-6);
        assert!((w[1] + 1.9).abs() < 1e-6);
        assert_eq!(sgd.steps(), 1);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut store = TensorStore::new();
        let mut mm = SimpleMemoryManager::new();
        let (w, dw) = pair(&mut store, &mut mm, &[0.0], &[1.0]);
        let mut sgd = Sgd::new(1.0).with_momentum(0.5);

        for _ in 0..2 {
            let (ins, mut outs) = store.borrow_io(&[dw], &[w]).unwrap();
            sgd.apply(ins[0], &mut *outs[0]).unwrap();
        }
        // v1 = 1, p1 = -1; v2 = 0.5 + 1 = 1.5, p2 = -2.5
        assert_eq!(sgd.velocity(w), Some(&[1.5f32][..]));
        assert_eq!(store.get(w).unwrap().to_vec::<f32>().unwrap(), vec![-2.5]);
    }

    #[test]
    fn test_rejects_mismatched_gradient() {
        let mut store = TensorStore::new();
        let mut mm = SimpleMemoryManager::new();
        let (w, dw) = pair(&mut store, &mut mm, &[0.0, 0.0], &[1.0]);
        let mut sgd = Sgd::new(0.1);
        let (ins, mut outs) = store.borrow_io(&[dw], &[w]).unwrap();
        assert!(matches!(
            sgd.apply(ins[0], &mut *outs[0]),
            Err(Error::ShapeMismatch { .. })
        ));
        assert_eq!(sgd.steps(), 0);
    }
}
