// FullyConnected: y = x W^T + b
//
// Shapes:
//
//   x: [..., in]      flattened to [rows, in]
//   W: [out, in]
//   b: [out]          optional
//   y: [rows, out]
//
// Backward, for incoming dy: [rows, out]:
//
//   dx = dy W         [rows, in]
//   dW = dy^T x       [out, in]
//   db = sum_rows dy  [out]
//
// Output rows are independent, so every product is split by output row and
// computed in parallel with rayon.

use rayon::prelude::*;
use vole_core::{Error, Result, Shape, TensorId, TensorStore};

use super::{expect_f32, expect_shape};
use crate::graph::Kernel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Dims {
    rows: usize,
    in_features: usize,
    out_features: usize,
}

fn resolve_dims(tensors: &TensorStore, x: TensorId, w: TensorId) -> Result<Dims> {
    let x = tensors.get(x)?;
    let w = tensors.get(w)?;
    expect_f32("fully_connected", x)?;
    expect_f32("fully_connected", w)?;
    if w.shape().rank() != 2 {
        return Err(Error::msg(format!(
            "fully_connected: weights must be [out, in], got {}",
            w.shape()
        )));
    }
    let out_features = w.shape().dim(0)?;
    let in_features = w.shape().dim(1)?;
    if out_features == 0 || in_features == 0 {
        return Err(Error::msg(format!(
            "fully_connected: empty weights {}",
            w.shape()
        )));
    }
    if x.shape().last_dim() != in_features {
        let mut expected = x.shape().dims().to_vec();
        if let Some(last) = expected.last_mut() {
            *last = in_features;
        }
        return Err(Error::ShapeMismatch {
            expected: Shape::new(expected),
            got: x.shape().clone(),
        });
    }
    Ok(Dims {
        rows: x.shape().leading_elems(),
        in_features,
        out_features,
    })
}

/// Forward kernel. Inputs are `[x, W]` or `[x, W, b]`.
pub struct FullyConnectedKernel {
    inputs: Vec<TensorId>,
    outputs: [TensorId; 1],
    dims: Option<Dims>,
}

impl FullyConnectedKernel {
    pub fn new(x: TensorId, weights: TensorId, bias: Option<TensorId>, y: TensorId) -> Self {
        let mut inputs = vec![x, weights];
        inputs.extend(bias);
        Self {
            inputs,
            outputs: [y],
            dims: None,
        }
    }
}

impl Kernel for FullyConnectedKernel {
    fn name(&self) -> &str {
        "fully_connected"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let dims = resolve_dims(tensors, self.inputs[0], self.inputs[1])?;
        if let Some(&b) = self.inputs.get(2) {
            let b = tensors.get(b)?;
            expect_f32("fully_connected", b)?;
            expect_shape(&Shape::from(dims.out_features), b)?;
        }
        let y = tensors.get(self.outputs[0])?;
        expect_f32("fully_connected", y)?;
        expect_shape(&Shape::from((dims.rows, dims.out_features)), y)?;
        self.dims = Some(dims);
        Ok(())
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let dims = self.dims.ok_or(Error::PlanNotBuilt)?;
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let x = ins[0].data::<f32>()?;
        let w = ins[1].data::<f32>()?;
        let b = match ins.get(2) {
            Some(t) => Some(t.data::<f32>()?),
            None => None,
        };
        let y = outs[0].data_mut::<f32>()?;

        y.par_chunks_mut(dims.out_features)
            .zip(x.par_chunks(dims.in_features))
            .for_each(|(y_row, x_row)| {
                for (o, y) in y_row.iter_mut().enumerate() {
                    let w_row = &w[o * dims.in_features..(o + 1) * dims.in_features];
                    let dot: f32 = x_row.iter().zip(w_row).map(|(a, b)| a * b).sum();
                    *y = dot + b.map_or(0.0, |b| b[o]);
                }
            });
        Ok(())
    }
}

/// Backward kernel. Reads `[x, W, dy]` and writes whichever of
/// `dx`, `dW`, `db` are bound.
pub struct FullyConnectedBackward {
    inputs: [TensorId; 3],
    outputs: Vec<TensorId>,
    dx: Option<TensorId>,
    dw: Option<TensorId>,
    db: Option<TensorId>,
    dims: Option<Dims>,
}

impl FullyConnectedBackward {
    pub fn new(
        x: TensorId,
        weights: TensorId,
        dy: TensorId,
        dx: Option<TensorId>,
        dw: Option<TensorId>,
        db: Option<TensorId>,
    ) -> Result<Self> {
        let outputs: Vec<TensorId> = [dx, dw, db].into_iter().flatten().collect();
        if outputs.is_empty() {
            return Err(Error::msg(
                "fully_connected backward: no input gradient to write",
            ));
        }
        Ok(Self {
            inputs: [x, weights, dy],
            outputs,
            dx,
            dw,
            db,
            dims: None,
        })
    }

    fn slot(&self, grad: Option<TensorId>) -> Option<usize> {
        grad.and_then(|id| self.outputs.iter().position(|&o| o == id))
    }
}

impl Kernel for FullyConnectedBackward {
    fn name(&self) -> &str {
        "fully_connected_grad"
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let [x, w, dy] = self.inputs;
        let dims = resolve_dims(tensors, x, w)?;
        let dy = tensors.get(dy)?;
        expect_f32("fully_connected_grad", dy)?;
        expect_shape(&Shape::from((dims.rows, dims.out_features)), dy)?;

        let expected = [
            (self.dx, tensors.get(x)?.shape().clone()),
            (self.dw, tensors.get(w)?.shape().clone()),
            (self.db, Shape::from(dims.out_features)),
        ];
        for (grad, shape) in expected {
            if let Some(id) = grad {
                let g = tensors.get(id)?;
                expect_f32("fully_connected_grad", g)?;
                expect_shape(&shape, g)?;
            }
        }
        self.dims = Some(dims);
        Ok(())
    }

    fn execute(&mut self, tensors: &mut TensorStore) -> Result<()> {
        let dims = self.dims.ok_or(Error::PlanNotBuilt)?;
        let dx_slot = self.slot(self.dx);
        let dw_slot = self.slot(self.dw);
        let db_slot = self.slot(self.db);
        let (ins, mut outs) = tensors.borrow_io(&self.inputs, &self.outputs)?;
        let x = ins[0].data::<f32>()?;
        let w = ins[1].data::<f32>()?;
        let dy = ins[2].data::<f32>()?;
        let Dims {
            rows,
            in_features,
            out_features,
        } = dims;

        if let Some(i) = dx_slot {
            outs[i]
                .data_mut::<f32>()?
                .par_chunks_mut(in_features)
                .zip(dy.par_chunks(out_features))
                .for_each(|(dx_row, dy_row)| {
                    dx_row.fill(0.0);
                    for (o, &g) in dy_row.iter().enumerate() {
                        let w_row = &w[o * in_features..(o + 1) * in_features];
                        for (d, &wv) in dx_row.iter_mut().zip(w_row) {
                            *d += g * wv;
                        }
                    }
                });
        }

        if let Some(i) = dw_slot {
            outs[i]
                .data_mut::<f32>()?
                .par_chunks_mut(in_features)
                .enumerate()
                .for_each(|(o, dw_row)| {
                    dw_row.fill(0.0);
                    for r in 0..rows {
                        let g = dy[r * out_features + o];
                        let x_row = &x[r * in_features..(r + 1) * in_features];
                        for (d, &xv) in dw_row.iter_mut().zip(x_row) {
                            *d += g * xv;
                        }
                    }
                });
        }

        if let Some(i) = db_slot {
            let db = outs[i].data_mut::<f32>()?;
            db.fill(0.0);
            for dy_row in dy.chunks(out_features) {
                for (d, &g) in db.iter_mut().zip(dy_row) {
                    *d += g;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vole_core::{DType, MemoryManager, SimpleMemoryManager, Tensor};

    struct Fixture {
        store: TensorStore,
        mm: SimpleMemoryManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: TensorStore::new(),
                mm: SimpleMemoryManager::new(),
            }
        }

        fn tensor(
            &mut self,
            name: &str,
            shape: impl Into<Shape>,
            values: Option<&[f32]>,
        ) -> TensorId {
            let id = self.store.add(Tensor::new(name, DType::F32, shape));
            let t = self.store.get_mut(id).unwrap();
            self.mm.allocate_memory(t).unwrap();
            if let Some(values) = values {
                t.copy_from_slice(values).unwrap();
            }
            id
        }

        fn read(&self, id: TensorId) -> Vec<f32> {
            self.store.get(id).unwrap().to_vec().unwrap()
        }
    }

    #[test]
    fn test_forward_with_bias() {
        let mut f = Fixture::new();
        // x: [2, 3], W: [2, 3], b: [2]
        let x = f.tensor("x", (2, 3), Some(&[1.0, 2.0, 3.0, -1.0, 0.0, 1.0]));
        let w = f.tensor("w", (2, 3), Some(&[1.0, 0.0, 0.0, 0.5, 0.5, 0.5]));
        let b = f.tensor("b", 2, Some(&[0.0, 1.0]));
        let y = f.tensor("y", (2, 2), None);

        let mut k = FullyConnectedKernel::new(x, w, Some(b), y);
        k.configure(&mut f.store).unwrap();
        k.execute(&mut f.store).unwrap();
        assert_eq!(f.read(y), vec![1.0, 4.0, -1.0, 1.0]);
    }

    #[test]
    fn test_forward_rejects_wrong_input_width() {
        let mut f = Fixture::new();
        let x = f.tensor("x", (2, 4), None);
        let w = f.tensor("w", (2, 3), None);
        let y = f.tensor("y", (2, 2), None);
        let err = FullyConnectedKernel::new(x, w, None, y)
            .configure(&mut f.store)
            .unwrap_err();
        match err {
            Error::ShapeMismatch { expected, got } => {
                assert_eq!(expected, Shape::from((2, 3)));
                assert_eq!(got, Shape::from((2, 4)));
            }
            other => panic!("expected ShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_backward_gradients() {
        let mut f = Fixture::new();
        // One row: x = [1, 2], W = [[3, 4]], dy = [[2]]
        let x = f.tensor("x", (1, 2), Some(&[1.0, 2.0]));
        let w = f.tensor("w", (1, 2), Some(&[3.0, 4.0]));
        let dy = f.tensor("dy", (1, 1), Some(&[2.0]));
        let dx = f.tensor("dx", (1, 2), None);
        let dw = f.tensor("dw", (1, 2), None);
        let db = f.tensor("db", 1, None);

        let mut k = FullyConnectedBackward::new(x, w, dy, Some(dx), Some(dw), Some(db)).unwrap();
        k.configure(&mut f.store).unwrap();
        k.execute(&mut f.store).unwrap();
        assert_eq!(f.read(dx), vec![6.0, 8.0]);
        assert_eq!(f.read(dw), vec![2.0, 4.0]);
        assert_eq!(f.read(db), vec![2.0]);
    }

    #[test]
    fn test_backward_accumulates_over_rows() {
        let mut f = Fixture::new();
        let x = f.tensor("x", (2, 1), Some(&[1.0, 3.0]));
        let w = f.tensor("w", (1, 1), Some(&[0.5]));
        let dy = f.tensor("dy", (2, 1), Some(&[1.0, -1.0]));
        let dw = f.tensor("dw", (1, 1), None);
        let db = f.tensor("db", 1, None);

        let mut k = FullyConnectedBackward::new(x, w, dy, None, Some(dw), Some(db)).unwrap();
        assert_eq!(k.output_tensors(), &[dw, db]);
        k.configure(&mut f.store).unwrap();
        k.execute(&mut f.store).unwrap();
        assert_eq!(f.read(dw), vec![-2.0]);
        assert_eq!(f.read(db), vec![0.0]);
    }
}
