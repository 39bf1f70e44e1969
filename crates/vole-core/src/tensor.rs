// Tensor: buffer descriptor owned by a graph's TensorStore
//
// A Tensor is metadata (name, dtype, shape, quantization, trainable flag)
// plus an optional backing Storage. The storage is attached and detached
// only by a MemoryManager; kernels read and write through it but never
// allocate. Everything else refers to tensors by TensorId, an index into the
// owning TensorStore, so no reference outlives the arena.

use std::fmt;

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};
use crate::quant::AffineQuantization;
use crate::shape::Shape;

/// Index of a tensor in its owning [`TensorStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    /// Id carried by a tensor that has not been added to a store yet.
    pub const DETACHED: TensorId = TensorId(usize::MAX);

    pub fn from_index(index: usize) -> Self {
        TensorId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TensorId::DETACHED {
            write!(f, "%detached")
        } else {
            write!(f, "%{}", self.0)
        }
    }
}

// Storage

/// Backing bytes of an allocated tensor.
///
/// Held as 8-byte words so that typed views of any supported element type
/// are always aligned.
#[derive(Debug, Clone)]
pub struct Storage {
    words: Vec<u64>,
    len: usize,
}

impl Storage {
    /// Zero-initialized storage of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Storage {
            words: vec![0u64; len.div_ceil(8)],
            len,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    fn as_slice<T: WithDType>(&self) -> Result<&[T]> {
        bytemuck::try_cast_slice(self.as_bytes())
            .map_err(|e| Error::msg(format!("invalid typed view of tensor storage: {e}")))
    }

    fn as_mut_slice<T: WithDType>(&mut self) -> Result<&mut [T]> {
        bytemuck::try_cast_slice_mut(self.as_bytes_mut())
            .map_err(|e| Error::msg(format!("invalid typed view of tensor storage: {e}")))
    }
}

// Tensor

/// A graph tensor: metadata plus optional backing storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    id: TensorId,
    name: String,
    dtype: DType,
    shape: Shape,
    quantization: Option<AffineQuantization>,
    trainable: bool,
    storage: Option<Storage>,
}

impl Tensor {
    /// Create an unallocated tensor descriptor.
    pub fn new(name: impl Into<String>, dtype: DType, shape: impl Into<Shape>) -> Self {
        Tensor {
            id: TensorId::DETACHED,
            name: name.into(),
            dtype,
            shape: shape.into(),
            quantization: None,
            trainable: false,
            storage: None,
        }
    }

    /// Attach affine quantization parameters.
    pub fn with_quantization(mut self, quantization: AffineQuantization) -> Self {
        self.quantization = Some(quantization);
        self
    }

    /// Mark the tensor as a trainable parameter.
    pub fn trainable(mut self) -> Self {
        self.trainable = true;
        self
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Bytes of backing storage this tensor needs.
    pub fn size_in_bytes(&self) -> usize {
        self.shape.elem_count() * self.dtype.size_in_bytes()
    }

    pub fn quantization(&self) -> Option<&AffineQuantization> {
        self.quantization.as_ref()
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn set_trainable(&mut self, trainable: bool) {
        self.trainable = trainable;
    }

    /// Whether the tensor currently has backing storage.
    pub fn is_allocated(&self) -> bool {
        self.storage.is_some()
    }

    /// Attach storage. Used by memory managers only.
    pub fn attach_storage(&mut self, storage: Storage) -> Result<()> {
        if self.storage.is_some() {
            return Err(Error::AlreadyAllocated(self.id));
        }
        if storage.len_bytes() < self.size_in_bytes() {
            return Err(Error::msg(format!(
                "storage of {} bytes is too small for tensor {} ({} bytes)",
                storage.len_bytes(),
                self.id,
                self.size_in_bytes()
            )));
        }
        self.storage = Some(storage);
        Ok(())
    }

    /// Detach and return the storage. Used by memory managers only.
    pub fn detach_storage(&mut self) -> Option<Storage> {
        self.storage.take()
    }

    pub fn storage(&self) -> Result<&Storage> {
        self.storage.as_ref().ok_or(Error::NotAllocated(self.id))
    }

    fn check_dtype<T: WithDType>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: T::DTYPE,
            });
        }
        Ok(())
    }

    /// Typed read-only view of the tensor contents.
    pub fn data<T: WithDType>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        let n = self.elem_count();
        let storage = self.storage.as_ref().ok_or(Error::NotAllocated(self.id))?;
        Ok(&storage.as_slice::<T>()?[..n])
    }

    /// Typed mutable view of the tensor contents.
    pub fn data_mut<T: WithDType>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        let n = self.elem_count();
        let id = self.id;
        let storage = self.storage.as_mut().ok_or(Error::NotAllocated(id))?;
        Ok(&mut storage.as_mut_slice::<T>()?[..n])
    }

    /// Overwrite the tensor contents from a host slice of matching length.
    pub fn copy_from_slice<T: WithDType>(&mut self, values: &[T]) -> Result<()> {
        let expected = self.shape.clone();
        let dst = self.data_mut::<T>()?;
        if dst.len() != values.len() {
            return Err(Error::ShapeMismatch {
                expected,
                got: Shape::from(values.len()),
            });
        }
        dst.copy_from_slice(values);
        Ok(())
    }

    /// Copy the tensor contents out into a Vec.
    pub fn to_vec<T: WithDType>(&self) -> Result<Vec<T>> {
        Ok(self.data::<T>()?.to_vec())
    }
}

// TensorStore

/// Arena that exclusively owns every tensor of one graph.
#[derive(Debug, Default)]
pub struct TensorStore {
    tensors: Vec<Tensor>,
}

impl TensorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a tensor and return its id.
    pub fn add(&mut self, mut tensor: Tensor) -> TensorId {
        let id = TensorId(self.tensors.len());
        tensor.id = id;
        self.tensors.push(tensor);
        id
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, id: TensorId) -> bool {
        id.0 < self.tensors.len()
    }

    pub fn get(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors.get(id.0).ok_or(Error::UnknownTensor(id))
    }

    pub fn get_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors.get_mut(id.0).ok_or(Error::UnknownTensor(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor> {
        self.tensors.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Tensor> {
        self.tensors.iter_mut()
    }

    /// Ids of every tensor that currently holds storage.
    pub fn allocated_ids(&self) -> Vec<TensorId> {
        self.tensors
            .iter()
            .filter(|t| t.is_allocated())
            .map(|t| t.id)
            .collect()
    }

    /// Borrow a kernel's bindings: shared views of `inputs` and exclusive
    /// views of `outputs`, in the order given.
    ///
    /// Inputs may repeat (`x + x`). Outputs must be distinct and must not
    /// appear among the inputs.
    pub fn borrow_io(
        &mut self,
        inputs: &[TensorId],
        outputs: &[TensorId],
    ) -> Result<(Vec<&Tensor>, Vec<&mut Tensor>)> {
        for &id in inputs.iter().chain(outputs) {
            if !self.contains(id) {
                return Err(Error::UnknownTensor(id));
            }
        }
        for (i, &id) in outputs.iter().enumerate() {
            if outputs[..i].contains(&id) || inputs.contains(&id) {
                return Err(Error::AliasedOutput(id));
            }
        }

        // Split the arena at each requested id, in ascending order, so only
        // the bound tensors are visited.
        let mut wanted: Vec<TensorId> = inputs.iter().chain(outputs).copied().collect();
        wanted.sort_unstable();
        wanted.dedup();
        let mut slots: Vec<(TensorId, Option<&mut Tensor>)> = Vec::with_capacity(wanted.len());
        let mut rest: &mut [Tensor] = &mut self.tensors;
        let mut offset = 0;
        for id in wanted {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(id.0 - offset + 1);
            slots.push((id, head.last_mut()));
            rest = tail;
            offset = id.0 + 1;
        }

        let mut outs = Vec::with_capacity(outputs.len());
        for &id in outputs {
            let found = slots.binary_search_by_key(&id, |(slot, _)| *slot);
            let tensor = match found {
                Ok(pos) => slots[pos].1.take(),
                Err(_) => None,
            };
            outs.push(tensor.ok_or(Error::AliasedOutput(id))?);
        }
        let shared: Vec<(TensorId, Option<&Tensor>)> = slots
            .into_iter()
            .map(|(id, slot)| (id, slot.map(downgrade)))
            .collect();
        let ins = inputs
            .iter()
            .map(|&id| {
                shared
                    .binary_search_by_key(&id, |(slot, _)| *slot)
                    .ok()
                    .and_then(|pos| shared[pos].1)
                    .ok_or(Error::AliasedOutput(id))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((ins, outs))
    }
}

fn downgrade(tensor: &mut Tensor) -> &Tensor {
    tensor
}
