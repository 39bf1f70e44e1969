// RuntimeGraph: owns one graph's tensors and kernels, and drives passes
//
// Lifecycle:
//
//   Unbuilt --configure()--> Planned --add_kernel()/add_output_tensor()--> Stale
//      ^                        |                                           |
//      +------------------------+------------- configure() <----------------+
//
// A pass is a list of steps: the forward phase of every kernel in order,
// then the backward phase of every training kernel in reverse order. An
// inference graph has exactly one step per kernel.
//
// execute() configures lazily, then for each step i runs
// alloc_plan[i] -> step -> dealloc_plan[i]. The first error aborts the pass
// and marks the plan Stale, so the next configure() releases whatever the
// aborted pass left resident before rebuilding.
//
// Graph outputs sit in the sentinel slot and survive every pass. A later
// pass reuses their storage. They are released by release_outputs(),
// teardown() or drop.

use std::cell::{RefCell, RefMut};
use std::rc::Rc;

use vole_core::{
    Error, MemoryManager, MemoryStats, Result, SharedMemoryManager, SimpleMemoryManager, Tensor,
    TensorId, TensorStore, WithDType,
};

use super::kernel::Kernel;
use super::plan::ExecutionPlan;
use crate::config::RuntimeConfig;

/// Validity of the graph's allocation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    /// No plan has been built yet.
    Unbuilt,
    /// The plan matches the current kernel list and every kernel is configured.
    Planned,
    /// The kernel list or graph outputs changed, or the last pass failed.
    Stale,
}

/// Entry point of a kernel run by one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Forward,
    Backward,
}

/// One slot of a pass: a kernel index and the phase it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub kernel: usize,
    pub phase: Phase,
}

fn schedule(kernels: &[Box<dyn Kernel>]) -> Vec<Step> {
    let forward = (0..kernels.len()).map(|kernel| Step {
        kernel,
        phase: Phase::Forward,
    });
    let backward = (0..kernels.len())
        .rev()
        .filter(|&kernel| kernels[kernel].has_backward())
        .map(|kernel| Step {
            kernel,
            phase: Phase::Backward,
        });
    forward.chain(backward).collect()
}

fn bindings(kernel: &dyn Kernel, phase: Phase) -> (&[TensorId], &[TensorId]) {
    match phase {
        Phase::Forward => (kernel.input_tensors(), kernel.output_tensors()),
        Phase::Backward => (
            kernel.backward_input_tensors(),
            kernel.backward_output_tensors(),
        ),
    }
}

/// A compute graph ready to be configured and executed.
pub struct RuntimeGraph {
    config: RuntimeConfig,
    memory: SharedMemoryManager,
    tensors: TensorStore,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    kernels: Vec<Box<dyn Kernel>>,
    steps: Vec<Step>,
    plan: Option<ExecutionPlan>,
    state: PlanState,
}

fn lock(memory: &SharedMemoryManager) -> Result<RefMut<'_, dyn MemoryManager + 'static>> {
    memory
        .try_borrow_mut()
        .map_err(|_| Error::msg("memory manager is already in use by another graph run"))
}

impl RuntimeGraph {
    /// Empty graph driven by a shared memory manager.
    pub fn new(memory: SharedMemoryManager) -> Self {
        Self::with_config(memory, RuntimeConfig::default())
    }

    pub fn with_config(memory: SharedMemoryManager, config: RuntimeConfig) -> Self {
        Self {
            config,
            memory,
            tensors: TensorStore::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            kernels: Vec::new(),
            steps: Vec::new(),
            plan: None,
            state: PlanState::Unbuilt,
        }
    }

    /// Graph with its own `SimpleMemoryManager`, budgeted by `config.memory_limit`.
    pub fn from_config(config: RuntimeConfig) -> Self {
        let memory: SharedMemoryManager = Rc::new(RefCell::new(
            SimpleMemoryManager::with_optional_limit(config.memory_limit),
        ));
        Self::with_config(memory, config)
    }

    // Construction

    /// Hand a tensor to the graph's arena.
    pub fn add_tensor(&mut self, tensor: Tensor) -> TensorId {
        self.tensors.add(tensor)
    }

    /// Add a tensor and register it as a graph input.
    pub fn add_input_tensor(&mut self, tensor: Tensor) -> TensorId {
        let id = self.tensors.add(tensor);
        self.inputs.push(id);
        id
    }

    /// Add a tensor and register it as a graph output.
    pub fn add_output_tensor(&mut self, tensor: Tensor) -> TensorId {
        let id = self.tensors.add(tensor);
        self.push_output(id);
        id
    }

    /// Register a tensor already in the arena as a graph output.
    pub fn mark_output(&mut self, id: TensorId) -> Result<()> {
        self.tensors.get(id)?;
        if !self.outputs.contains(&id) {
            self.push_output(id);
        }
        Ok(())
    }

    fn push_output(&mut self, id: TensorId) {
        self.outputs.push(id);
        self.invalidate();
    }

    /// Append a kernel. Its bindings must already live in this graph's arena.
    pub fn add_kernel(&mut self, kernel: Box<dyn Kernel>) {
        self.kernels.push(kernel);
        self.invalidate();
    }

    fn invalidate(&mut self) {
        if self.state == PlanState::Planned {
            self.state = PlanState::Stale;
        }
    }

    // Accessors

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn state(&self) -> PlanState {
        self.state
    }

    /// The current plan, if one has been built. It may be stale.
    pub fn plan(&self) -> Option<&ExecutionPlan> {
        self.plan.as_ref()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    /// Steps of the current plan, in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    pub fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn tensors(&self) -> &TensorStore {
        &self.tensors
    }

    pub fn tensors_mut(&mut self) -> &mut TensorStore {
        &mut self.tensors
    }

    pub fn tensor(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors.get(id)
    }

    pub fn tensor_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors.get_mut(id)
    }

    pub fn memory_manager(&self) -> &SharedMemoryManager {
        &self.memory
    }

    pub fn memory_stats(&self) -> MemoryStats {
        self.memory.borrow().stats()
    }

    // Planning

    /// Build the plan if needed and configure every kernel.
    ///
    /// A no-op when the plan is already valid: kernels are not configured
    /// again and nothing is allocated.
    pub fn configure(&mut self) -> Result<()> {
        if self.state == PlanState::Planned {
            return Ok(());
        }
        if self.state == PlanState::Stale {
            self.release_tracked()?;
        }
        self.check_bindings()?;

        let steps = schedule(&self.kernels);
        let plan = ExecutionPlan::build(
            steps
                .iter()
                .map(|step| bindings(&*self.kernels[step.kernel], step.phase)),
            &self.outputs,
        )?;
        tracing::debug!(
            kernels = self.kernels.len(),
            steps = plan.num_steps(),
            tracked = plan.tracked_count(),
            max_live = plan.max_live_tensors(),
            outputs = plan.sentinel().len(),
            "built execution plan"
        );
        if self.config.trace_plan {
            tracing::debug!("\n{plan}");
        }
        self.plan = Some(plan);
        self.steps = steps;
        self.state = PlanState::Stale;

        for (index, kernel) in self.kernels.iter_mut().enumerate() {
            kernel.configure(&mut self.tensors).map_err(|err| {
                tracing::warn!(kernel = index, name = kernel.name(), %err, "kernel configure failed");
                err
            })?;
        }
        self.state = PlanState::Planned;
        Ok(())
    }

    fn check_bindings(&self) -> Result<()> {
        for &id in self.inputs.iter().chain(&self.outputs) {
            self.tensors.get(id)?;
        }
        for kernel in &self.kernels {
            let bound = kernel
                .input_tensors()
                .iter()
                .chain(kernel.output_tensors())
                .chain(kernel.backward_input_tensors())
                .chain(kernel.backward_output_tensors());
            for &id in bound {
                self.tensors.get(id)?;
            }
        }
        Ok(())
    }

    // Release every tensor the current (stale) plan still holds.
    fn release_tracked(&mut self) -> Result<()> {
        let Some(plan) = &self.plan else {
            return Ok(());
        };
        let mut memory = lock(&self.memory)?;
        for (id, _) in plan.lifetimes() {
            let tensor = self.tensors.get_mut(id)?;
            if tensor.is_allocated() {
                memory.release_memory(tensor)?;
                tracing::trace!(tensor = %id, "released stale allocation");
            }
        }
        Ok(())
    }

    // Execution

    /// Run one full pass over the step list, configuring first if needed.
    pub fn execute(&mut self) -> Result<()> {
        self.configure()?;
        for index in 0..self.steps.len() {
            if let Err(err) = self.run_step(index) {
                self.state = PlanState::Stale;
                let step = self.steps[index];
                tracing::warn!(
                    step = index,
                    name = self.kernels[step.kernel].name(),
                    phase = ?step.phase,
                    %err,
                    "execution pass aborted"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn run_step(&mut self, index: usize) -> Result<()> {
        self.allocate(index)?;
        let step = self.steps[index];
        let kernel = &mut self.kernels[step.kernel];
        tracing::trace!(step = index, name = kernel.name(), phase = ?step.phase, "execute");
        match step.phase {
            Phase::Forward => kernel.execute(&mut self.tensors)?,
            Phase::Backward => kernel.backward(&mut self.tensors)?,
        }
        self.deallocate(index)
    }

    /// Allocate every tensor first written by step `index`.
    ///
    /// Graph outputs still resident from an earlier pass keep their storage.
    pub fn allocate(&mut self, index: usize) -> Result<()> {
        let plan = match (&self.state, &self.plan) {
            (PlanState::Planned, Some(plan)) => plan,
            _ => return Err(Error::PlanNotBuilt),
        };
        let slot = plan
            .alloc_plan()
            .get(index)
            .ok_or(Error::StepIndexOutOfRange {
                index,
                len: plan.num_steps(),
            })?;
        let mut memory = lock(&self.memory)?;
        for &id in slot {
            let tensor = self.tensors.get_mut(id)?;
            if tensor.is_allocated() {
                continue;
            }
            memory.allocate_memory(tensor)?;
            tracing::trace!(tensor = %id, bytes = tensor.size_in_bytes(), "allocate");
        }
        Ok(())
    }

    /// Release every tensor last used by step `index`.
    ///
    /// `index == N` runs the sentinel slot, which `execute()` never does.
    pub fn deallocate(&mut self, index: usize) -> Result<()> {
        let plan = match (&self.state, &self.plan) {
            (PlanState::Planned, Some(plan)) => plan,
            _ => return Err(Error::PlanNotBuilt),
        };
        let slot = plan
            .dealloc_plan()
            .get(index)
            .ok_or(Error::StepIndexOutOfRange {
                index,
                len: plan.dealloc_plan().len(),
            })?;
        let mut memory = lock(&self.memory)?;
        for &id in slot {
            let tensor = self.tensors.get_mut(id)?;
            memory.release_memory(tensor)?;
            tracing::trace!(tensor = %id, "release");
        }
        Ok(())
    }

    // Inputs and outputs

    /// Give a loader-provisioned tensor (graph input, constant, parameter)
    /// its storage. Tensors managed by the plan are rejected.
    pub fn allocate_tensor(&mut self, id: TensorId) -> Result<()> {
        if self.plan.as_ref().is_some_and(|p| p.is_tracked(id)) {
            return Err(Error::msg(format!(
                "tensor {id} is managed by the execution plan"
            )));
        }
        let tensor = self.tensors.get_mut(id)?;
        if tensor.is_allocated() {
            return Ok(());
        }
        lock(&self.memory)?.allocate_memory(tensor)?;
        tracing::trace!(tensor = %id, "allocate provisioned tensor");
        Ok(())
    }

    /// Provision graph input `index` if needed and copy `values` into it.
    pub fn set_input<T: WithDType>(&mut self, index: usize, values: &[T]) -> Result<()> {
        let id = *self.inputs.get(index).ok_or_else(|| {
            Error::msg(format!(
                "graph has {} inputs, no input #{index}",
                self.inputs.len()
            ))
        })?;
        self.allocate_tensor(id)?;
        self.tensors.get_mut(id)?.copy_from_slice(values)
    }

    /// Copy graph output `index` out of the graph.
    pub fn output<T: WithDType>(&self, index: usize) -> Result<Vec<T>> {
        let id = *self.outputs.get(index).ok_or_else(|| {
            Error::msg(format!(
                "graph has {} outputs, no output #{index}",
                self.outputs.len()
            ))
        })?;
        self.tensors.get(id)?.to_vec()
    }

    // Teardown

    /// Release the graph outputs held in the sentinel slot.
    ///
    /// Outputs that hold no storage are skipped. Returns how many were released.
    pub fn release_outputs(&mut self) -> Result<usize> {
        let Some(plan) = &self.plan else {
            return Ok(0);
        };
        let mut memory = lock(&self.memory)?;
        let mut released = 0;
        for &id in plan.sentinel() {
            let tensor = self.tensors.get_mut(id)?;
            if tensor.is_allocated() {
                memory.release_memory(tensor)?;
                released += 1;
            }
        }
        Ok(released)
    }

    /// Release every tensor that still holds storage.
    ///
    /// Runs the sentinel slot first, then sweeps the arena for anything a
    /// failed pass left behind.
    pub fn teardown(&mut self) -> Result<()> {
        self.release_outputs()?;
        let leftovers = self.tensors.allocated_ids();
        if leftovers.is_empty() {
            return Ok(());
        }
        let mut memory = lock(&self.memory)?;
        for id in leftovers {
            let tensor = self.tensors.get_mut(id)?;
            tracing::trace!(tensor = %id, name = tensor.name(), "teardown release");
            memory.release_memory(tensor)?;
        }
        Ok(())
    }
}

impl Drop for RuntimeGraph {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::warn!(%err, "graph teardown left tensors allocated");
        }
    }
}
