//! # vole-core
//!
//! Tensor-level building blocks for the Vole graph engine.
//!
//! This crate provides:
//! - [`Tensor`] / [`TensorStore`]: buffer descriptors and the arena that owns them
//! - [`TensorId`]: index-based handle used by kernels and plans
//! - [`Shape`] / [`DType`] / [`AffineQuantization`]: tensor metadata
//! - [`MemoryManager`]: allocation contract, with [`SimpleMemoryManager`] as reference
//! - [`Error`] / [`Result`]: the error type shared by every Vole crate

pub mod dtype;
pub mod error;
pub mod memory;
pub mod quant;
pub mod shape;
pub mod tensor;

pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use memory::{
    format_bytes, MemoryManager, MemoryStats, SharedMemoryManager, SimpleMemoryManager,
};
pub use quant::AffineQuantization;
pub use shape::Shape;
pub use tensor::{Storage, Tensor, TensorId, TensorStore};
