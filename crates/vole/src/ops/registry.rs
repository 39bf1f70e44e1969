// KernelRegistry: operator kind -> kernel factories
//
// Each entry is a capability: a forward factory and, for differentiable
// operators, a backward factory. Lowering a node asks the table for the
// factories of its kind and never matches on the kind itself, so new
// operators are added by registering them, not by editing the engine.
//
// Training lowering emits one TrainableSequence per node:
//
//   forward phase       the forward kernel
//   backward phase      the backward kernel, only if the node is required
//                       for backward, then one applier per trainable input
//                       with a bound gradient, in reverse input order (bias
//                       before weights for FullyConnected)

use std::collections::HashMap;

use vole_core::{Error, Result, TensorStore};

use super::{
    AddBackward, AddKernel, FullyConnectedBackward, FullyConnectedKernel, MseLossBackward,
    MseLossKernel, OpKind, OpNode, ReluBackward, ReluKernel,
};
use crate::graph::{Kernel, RuntimeGraph};
use crate::train::{GradientApplier, SharedOptimizer, TrainableSequence};

/// Builds the forward kernel of a node.
pub type ForwardFactory = fn(&OpNode) -> Result<Box<dyn Kernel>>;

/// Builds the backward kernel of a node from its gradient bindings.
pub type BackwardFactory = fn(&OpNode) -> Result<Box<dyn Kernel>>;

/// What the runtime can do with one operator kind.
#[derive(Clone, Copy)]
pub struct OpCapability {
    pub forward: ForwardFactory,
    pub backward: Option<BackwardFactory>,
}

/// Kernels produced for one node.
pub struct LoweredOp {
    pub forward: Box<dyn Kernel>,
    pub backward: Vec<Box<dyn Kernel>>,
    pub appliers: Vec<Box<dyn Kernel>>,
}

impl LoweredOp {
    pub fn into_sequence(self) -> TrainableSequence {
        let seq = TrainableSequence::new(self.forward);
        let seq = self
            .backward
            .into_iter()
            .fold(seq, TrainableSequence::with_backward);
        self.appliers
            .into_iter()
            .fold(seq, TrainableSequence::with_applier)
    }
}

/// Capability table keyed by operator kind.
pub struct KernelRegistry {
    table: HashMap<OpKind, OpCapability>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl KernelRegistry {
    /// Registry with no operators.
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Registry with the reference f32 kernels.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(OpKind::Add, add_forward, Some(add_backward));
        registry.register(OpKind::Relu, relu_forward, Some(relu_backward));
        registry.register(OpKind::FullyConnected, fc_forward, Some(fc_backward));
        registry.register(OpKind::MseLoss, mse_forward, Some(mse_backward));
        registry
    }

    /// Add or replace the capability of `kind`.
    pub fn register(
        &mut self,
        kind: OpKind,
        forward: ForwardFactory,
        backward: Option<BackwardFactory>,
    ) {
        self.table.insert(kind, OpCapability { forward, backward });
    }

    pub fn capability(&self, kind: OpKind) -> Result<OpCapability> {
        self.table
            .get(&kind)
            .copied()
            .ok_or_else(|| Error::msg(format!("no kernel registered for {kind}")))
    }

    pub fn supports(&self, kind: OpKind) -> bool {
        self.table.contains_key(&kind)
    }

    /// Build the forward kernel and, when `optimizer` is given and the node
    /// is required for backward, its backward kernel and gradient appliers.
    pub fn lower(
        &self,
        node: &OpNode,
        tensors: &TensorStore,
        optimizer: Option<&SharedOptimizer>,
    ) -> Result<LoweredOp> {
        let capability = self.capability(node.kind)?;
        let mut lowered = LoweredOp {
            forward: (capability.forward)(node)?,
            backward: Vec::new(),
            appliers: Vec::new(),
        };
        let Some(optimizer) = optimizer else {
            return Ok(lowered);
        };
        if !node.required_for_backward || !node.has_input_grads() {
            return Ok(lowered);
        }
        let backward = capability.backward.ok_or_else(|| {
            Error::msg(format!(
                "{} '{}' is required for backward but has no backward kernel",
                node.kind, node.name
            ))
        })?;
        lowered.backward.push(backward(node)?);

        for (index, &input) in node.inputs.iter().enumerate().rev() {
            let Some(grad) = node.input_grad(index) else {
                continue;
            };
            if tensors.get(input)?.is_trainable() {
                lowered.appliers.push(Box::new(GradientApplier::new(
                    grad,
                    input,
                    optimizer.clone(),
                )));
            }
        }
        Ok(lowered)
    }
}

/// Append the forward kernel of every node to `graph`, in order.
pub fn lower_inference(
    graph: &mut RuntimeGraph,
    registry: &KernelRegistry,
    nodes: &[OpNode],
) -> Result<()> {
    for node in nodes {
        let lowered = registry.lower(node, graph.tensors(), None)?;
        graph.add_kernel(lowered.forward);
    }
    tracing::debug!(nodes = nodes.len(), "lowered inference graph");
    Ok(())
}

/// Append one trainable sequence per node to `graph`, in order.
///
/// The graph runs the forward phases in this order and the backward phases
/// in reverse, so each node's output gradient is written by the backward
/// phase of the node that consumes its output.
///
/// `required_for_backward` must already be set on the nodes (see
/// `mark_required_for_backward`).
pub fn lower_training(
    graph: &mut RuntimeGraph,
    registry: &KernelRegistry,
    nodes: &[OpNode],
    optimizer: &SharedOptimizer,
) -> Result<()> {
    let mut appliers = 0;
    for node in nodes {
        let lowered = registry.lower(node, graph.tensors(), Some(optimizer))?;
        appliers += lowered.appliers.len();
        graph.add_kernel(Box::new(lowered.into_sequence()));
    }
    tracing::debug!(nodes = nodes.len(), appliers, "lowered training graph");
    Ok(())
}

// Built-in factories

fn add_forward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(AddKernel::new(
        node.input(0)?,
        node.input(1)?,
        node.output(0)?,
    )))
}

fn add_backward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(AddBackward::new(
        node.output_grad(0)?,
        node.input_grad(0),
        node.input_grad(1),
    )?))
}

fn relu_forward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(ReluKernel::new(node.input(0)?, node.output(0)?)))
}

fn relu_backward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    let dx = node.input_grad(0).ok_or_else(|| {
        Error::msg(format!("Relu '{}': no gradient bound for input #0", node.name))
    })?;
    Ok(Box::new(ReluBackward::new(
        node.output(0)?,
        node.output_grad(0)?,
        dx,
    )))
}

fn fc_forward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(FullyConnectedKernel::new(
        node.input(0)?,
        node.input(1)?,
        node.inputs.get(2).copied(),
        node.output(0)?,
    )))
}

fn fc_backward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(FullyConnectedBackward::new(
        node.input(0)?,
        node.input(1)?,
        node.output_grad(0)?,
        node.input_grad(0),
        node.input_grad(1),
        node.input_grad(2),
    )?))
}

fn mse_forward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    Ok(Box::new(MseLossKernel::new(
        node.input(0)?,
        node.input(1)?,
        node.output(0)?,
    )))
}

fn mse_backward(node: &OpNode) -> Result<Box<dyn Kernel>> {
    let dpred = node.input_grad(0).ok_or_else(|| {
        Error::msg(format!("MseLoss '{}': no gradient bound for predictions", node.name))
    })?;
    Ok(Box::new(MseLossBackward::new(
        node.input(0)?,
        node.input(1)?,
        dpred,
    )))
}
