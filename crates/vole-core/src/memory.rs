// MemoryManager: the allocation contract the engine drives
//
// The engine decides WHEN a tensor needs storage (from its lifetime plan);
// the manager decides WHERE it comes from. Managers are shared between a
// graph and its control-flow subgraphs, so the engine holds them behind
// `Rc<RefCell<..>>`; runs are single-threaded and serialized by the loader.
//
// SimpleMemoryManager is the reference implementation: one heap buffer per
// tensor, an optional byte budget, and MemoryStats bookkeeping so callers can
// observe current and peak residency.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::tensor::{Storage, Tensor};

/// Allocation/release contract used by the execution loop.
///
/// `release_memory` on a tensor with no storage is a caller bug; managers
/// report it as `Error::NotAllocated` rather than guarding against it.
pub trait MemoryManager {
    /// Give `tensor` backing storage of `tensor.size_in_bytes()` bytes.
    fn allocate_memory(&mut self, tensor: &mut Tensor) -> Result<()>;

    /// Take back the storage of `tensor`.
    fn release_memory(&mut self, tensor: &mut Tensor) -> Result<()>;

    /// Allocation statistics, if the manager keeps any.
    fn stats(&self) -> MemoryStats {
        MemoryStats::default()
    }
}

/// A memory manager shared by every graph of one model.
pub type SharedMemoryManager = Rc<RefCell<dyn MemoryManager>>;

// MemoryStats

/// Snapshot of a manager's allocation bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Bytes currently held by tensors.
    pub current_bytes: usize,
    /// High-water mark of `current_bytes`.
    pub peak_bytes: usize,
    /// Tensors currently holding storage.
    pub live_tensors: usize,
    /// High-water mark of `live_tensors`.
    pub peak_live_tensors: usize,
    /// Allocations served since creation.
    pub alloc_count: usize,
    /// Releases served since creation.
    pub release_count: usize,
}

impl MemoryStats {
    /// Record an allocation of `bytes`.
    pub fn record_alloc(&mut self, bytes: usize) {
        self.current_bytes += bytes;
        self.live_tensors += 1;
        self.alloc_count += 1;
        self.peak_bytes = self.peak_bytes.max(self.current_bytes);
        self.peak_live_tensors = self.peak_live_tensors.max(self.live_tensors);
    }

    /// Record a release of `bytes`.
    pub fn record_release(&mut self, bytes: usize) {
        self.current_bytes = self.current_bytes.saturating_sub(bytes);
        self.live_tensors = self.live_tensors.saturating_sub(1);
        self.release_count += 1;
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} live ({} tensors), peak {} ({} tensors), {} allocs / {} releases",
            format_bytes(self.current_bytes),
            self.live_tensors,
            format_bytes(self.peak_bytes),
            self.peak_live_tensors,
            self.alloc_count,
            self.release_count,
        )
    }
}

/// Format bytes into a human-readable string (B, KB, MB, GB).
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// SimpleMemoryManager

/// Heap-backed memory manager with an optional byte budget.
#[derive(Debug, Default)]
pub struct SimpleMemoryManager {
    limit: Option<usize>,
    stats: MemoryStats,
}

impl SimpleMemoryManager {
    /// Unbounded manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager that refuses to hold more than `limit` bytes at once.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            stats: MemoryStats::default(),
        }
    }

    /// Manager with an optional budget, as read from a runtime config.
    pub fn with_optional_limit(limit: Option<usize>) -> Self {
        Self {
            limit,
            stats: MemoryStats::default(),
        }
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Wrap the manager for sharing between graphs.
    pub fn shared(self) -> Rc<RefCell<SimpleMemoryManager>> {
        Rc::new(RefCell::new(self))
    }
}

impl MemoryManager for SimpleMemoryManager {
    fn allocate_memory(&mut self, tensor: &mut Tensor) -> Result<()> {
        if tensor.is_allocated() {
            return Err(Error::AlreadyAllocated(tensor.id()));
        }
        let requested = tensor.size_in_bytes();
        if let Some(limit) = self.limit {
            let available = limit.saturating_sub(self.stats.current_bytes);
            if requested > available {
                tracing::debug!(
                    tensor = %tensor.id(),
                    requested,
                    available,
                    "memory budget exhausted"
                );
                return Err(Error::AllocationFailure {
                    tensor: tensor.id(),
                    requested,
                    available,
                });
            }
        }
        tensor.attach_storage(Storage::zeroed(requested))?;
        self.stats.record_alloc(requested);
        Ok(())
    }

    fn release_memory(&mut self, tensor: &mut Tensor) -> Result<()> {
        let storage = tensor
            .detach_storage()
            .ok_or(Error::NotAllocated(tensor.id()))?;
        self.stats.record_release(storage.len_bytes());
        Ok(())
    }

    fn stats(&self) -> MemoryStats {
        self.stats
    }
}
