// ExecutionPlan: lifetime analysis and alloc/dealloc schedule
//
// One scan over the step list, in execution order. An inference graph has one
// step per kernel; a training graph appends the backward steps after the
// forward ones, in reverse kernel order.
//
//   - an input with a recorded lifetime extends that lifetime to this index;
//     inputs without one are loader-provisioned (graph inputs, constants,
//     parameters) and stay outside the plan
//   - an output opens a new lifetime (i, i); a second writer is an error, and
//     so is writing a tensor some earlier step already read
//   - graph outputs are then pushed to the sentinel index N
//
// alloc_plan has N slots, dealloc_plan has N + 1. The execution loop only
// ever walks slots 0..N of the dealloc plan; slot N holds the graph outputs
// and is run solely by explicit teardown, so output buffers survive the pass
// that produced them.

use std::collections::BTreeMap;
use std::fmt;

use vole_core::{Error, Result, TensorId, TensorStore};

/// Step-index span during which a tensor must hold storage (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifetime {
    /// Index of the step that writes the tensor.
    pub first_write: usize,
    /// Index of the last step that reads it, or N for kept-alive tensors.
    pub last_use: usize,
}

impl Lifetime {
    /// Whether the tensor must be resident while step `index` runs.
    pub fn contains(&self, index: usize) -> bool {
        self.first_write <= index && index <= self.last_use
    }
}

/// Per-step allocation and release schedule for one graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    num_steps: usize,
    lifetimes: BTreeMap<TensorId, Lifetime>,
    alloc_plan: Vec<Vec<TensorId>>,
    dealloc_plan: Vec<Vec<TensorId>>,
}

impl ExecutionPlan {
    /// Build the plan from each step's `(inputs, outputs)` bindings, in
    /// execution order, and the graph's output tensors.
    ///
    /// Tensors are listed in each slot in ascending id order.
    pub fn build<'a, I>(steps: I, graph_outputs: &[TensorId]) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a [TensorId], &'a [TensorId])>,
    {
        let mut lifetimes: BTreeMap<TensorId, Lifetime> = BTreeMap::new();
        // Untracked tensors read so far, with the first step that read them.
        let mut provisioned: BTreeMap<TensorId, usize> = BTreeMap::new();
        let mut num_steps = 0usize;

        for (index, (inputs, outputs)) in steps.into_iter().enumerate() {
            num_steps = index + 1;
            for &id in inputs {
                match lifetimes.get_mut(&id) {
                    Some(lifetime) => lifetime.last_use = index,
                    None => {
                        provisioned.entry(id).or_insert(index);
                    }
                }
            }
            for &id in outputs {
                if let Some(existing) = lifetimes.get(&id) {
                    return Err(Error::DoubleWrite {
                        tensor: id,
                        first: existing.first_write,
                        second: index,
                    });
                }
                if let Some(&read) = provisioned.get(&id) {
                    return Err(Error::ReadBeforeWrite {
                        tensor: id,
                        read,
                        write: index,
                    });
                }
                lifetimes.insert(
                    id,
                    Lifetime {
                        first_write: index,
                        last_use: index,
                    },
                );
            }
        }

        // Outputs outlive the pass regardless of any earlier last use.
        for id in graph_outputs {
            if let Some(lifetime) = lifetimes.get_mut(id) {
                lifetime.last_use = num_steps;
            }
        }

        let mut alloc_plan = vec![Vec::new(); num_steps];
        let mut dealloc_plan = vec![Vec::new(); num_steps + 1];
        for (&id, lifetime) in &lifetimes {
            alloc_plan[lifetime.first_write].push(id);
            dealloc_plan[lifetime.last_use].push(id);
        }

        Ok(Self {
            num_steps,
            lifetimes,
            alloc_plan,
            dealloc_plan,
        })
    }

    /// Number of steps the plan covers (N).
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Lifetime of a tracked tensor; `None` for loader-provisioned tensors.
    pub fn lifetime(&self, id: TensorId) -> Option<Lifetime> {
        self.lifetimes.get(&id).copied()
    }

    /// Every tracked tensor with its lifetime, in id order.
    pub fn lifetimes(&self) -> impl Iterator<Item = (TensorId, Lifetime)> + '_ {
        self.lifetimes.iter().map(|(&id, &lt)| (id, lt))
    }

    /// Number of tensors managed by the plan.
    pub fn tracked_count(&self) -> usize {
        self.lifetimes.len()
    }

    pub fn is_tracked(&self, id: TensorId) -> bool {
        self.lifetimes.contains_key(&id)
    }

    /// N slots: tensors first written by step `i`.
    pub fn alloc_plan(&self) -> &[Vec<TensorId>] {
        &self.alloc_plan
    }

    /// N + 1 slots: tensors last used by step `i`; slot N is the sentinel.
    pub fn dealloc_plan(&self) -> &[Vec<TensorId>] {
        &self.dealloc_plan
    }

    /// Tensors kept alive past the last step (dealloc slot N).
    pub fn sentinel(&self) -> &[TensorId] {
        &self.dealloc_plan[self.num_steps]
    }

    /// Tracked tensors that must be resident while step `index` runs.
    pub fn resident_at(&self, index: usize) -> Vec<TensorId> {
        self.lifetimes
            .iter()
            .filter(|(_, lt)| lt.contains(index))
            .map(|(&id, _)| id)
            .collect()
    }

    /// Largest number of tracked tensors resident at once during a pass.
    pub fn max_live_tensors(&self) -> usize {
        let mut live = 0usize;
        let mut peak = 0usize;
        for index in 0..self.num_steps {
            live += self.alloc_plan[index].len();
            peak = peak.max(live);
            live -= self.dealloc_plan[index].len();
        }
        peak
    }

    /// Largest number of bytes held by tracked tensors at once during a pass.
    pub fn peak_bytes_estimate(&self, tensors: &TensorStore) -> Result<usize> {
        let size = |ids: &[TensorId]| -> Result<usize> {
            ids.iter()
                .map(|&id| tensors.get(id).map(|t| t.size_in_bytes()))
                .sum()
        };
        let mut live = 0usize;
        let mut peak = 0usize;
        for index in 0..self.num_steps {
            live += size(&self.alloc_plan[index])?;
            peak = peak.max(live);
            live -= size(&self.dealloc_plan[index])?;
        }
        Ok(peak)
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(ids: &[TensorId]) -> String {
            let names: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            format!("[{}]", names.join(", "))
        }
        writeln!(
            f,
            "ExecutionPlan: {} steps, {} tracked tensors, max {} live",
            self.num_steps,
            self.lifetimes.len(),
            self.max_live_tensors()
        )?;
        for index in 0..self.num_steps {
            writeln!(
                f,
                "  #{index:<4} alloc {} free {}",
                list(&self.alloc_plan[index]),
                list(&self.dealloc_plan[index])
            )?;
        }
        write!(f, "  sentinel    keep  {}", list(self.sentinel()))
    }
}
