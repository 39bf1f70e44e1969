// Training tests: phase ordering, parameter updates and the session loop

use std::cell::RefCell;
use std::rc::Rc;

use vole::prelude::*;

// Helpers

type Log = Rc<RefCell<Vec<String>>>;

/// Kernel that only records that it ran.
struct Logged {
    name: String,
    inputs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    log: Log,
}

impl Kernel for Logged {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_tensors(&self) -> &[TensorId] {
        &self.inputs
    }

    fn output_tensors(&self) -> &[TensorId] {
        &self.outputs
    }

    fn configure(&mut self, _tensors: &mut TensorStore) -> Result<()> {
        Ok(())
    }

    fn execute(&mut self, _tensors: &mut TensorStore) -> Result<()> {
        self.log.borrow_mut().push(self.name.clone());
        Ok(())
    }
}

fn logged(log: &Log, name: &str, inputs: &[TensorId], outputs: &[TensorId]) -> Box<dyn Kernel> {
    Box::new(Logged {
        name: name.to_string(),
        inputs: inputs.to_vec(),
        outputs: outputs.to_vec(),
        log: log.clone(),
    })
}

/// Optimizer that records which parameter it was asked to update.
struct RecordingOptimizer {
    log: Log,
}

impl Optimizer for RecordingOptimizer {
    fn name(&self) -> &str {
        "recording"
    }

    fn apply(&mut self, _gradient: &Tensor, parameter: &mut Tensor) -> Result<()> {
        self.log
            .borrow_mut()
            .push(format!("apply {}", parameter.name()));
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        0.0
    }

    fn set_learning_rate(&mut self, _lr: f32) {}
}

fn assert_close(got: &[f32], expected: &[f32]) {
    assert_eq!(got.len(), expected.len(), "{got:?} vs {expected:?}");
    for (g, e) in got.iter().zip(expected) {
        assert!((g - e).abs() < 1e-5, "{got:?} vs {expected:?}");
    }
}

fn provision(graph: &mut RuntimeGraph, id: TensorId, values: &[f32]) {
    graph.allocate_tensor(id).unwrap();
    graph.tensor_mut(id).unwrap().copy_from_slice(values).unwrap();
}

// Phase ordering

#[test]
fn test_backward_runs_in_reverse_after_every_forward() {
    let log = Log::default();
    let optimizer: SharedOptimizer = Rc::new(RefCell::new(RecordingOptimizer { log: log.clone() }));
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, 2));
    let w0 = graph.add_tensor(Tensor::new("w0", DType::F32, 2).trainable());
    let w1 = graph.add_tensor(Tensor::new("w1", DType::F32, 2).trainable());
    let h = graph.add_tensor(Tensor::new("h", DType::F32, 2));
    let g0 = graph.add_tensor(Tensor::new("g0", DType::F32, 2));
    let g1 = graph.add_tensor(Tensor::new("g1", DType::F32, 2));
    let y = graph.add_output_tensor(Tensor::new("y", DType::F32, 2));
    for id in [x, w0, w1] {
        graph.allocate_tensor(id).unwrap();
    }

    let first = TrainableSequence::new(logged(&log, "f0", &[x, w0], &[h]))
        .with_backward(logged(&log, "b0", &[x], &[g0]))
        .with_applier(Box::new(GradientApplier::new(g0, w0, optimizer.clone())));
    let second = TrainableSequence::new(logged(&log, "f1", &[h, w1], &[y]))
        .with_backward(logged(&log, "b1", &[h], &[g1]))
        .with_applier(Box::new(GradientApplier::new(g1, w1, optimizer)));
    graph.add_kernel(Box::new(first));
    graph.add_kernel(Box::new(second));

    graph.execute().unwrap();
    // Each update follows its own backward and precedes the next upstream one.
    assert_eq!(
        *log.borrow(),
        vec!["f0", "f1", "b1", "apply w1", "b0", "apply w0"]
    );

    let phases: Vec<(usize, Phase)> = graph.steps().iter().map(|s| (s.kernel, s.phase)).collect();
    assert_eq!(
        phases,
        vec![
            (0, Phase::Forward),
            (1, Phase::Forward),
            (1, Phase::Backward),
            (0, Phase::Backward),
        ]
    );

    // Gradients live only inside their own backward step; h stays until b1.
    let plan = graph.plan().unwrap();
    assert_eq!(plan.num_steps(), 4);
    assert_eq!(plan.lifetime(g1), Some(Lifetime { first_write: 2, last_use: 2 }));
    assert_eq!(plan.lifetime(g0), Some(Lifetime { first_write: 3, last_use: 3 }));
    assert_eq!(plan.lifetime(h), Some(Lifetime { first_write: 0, last_use: 2 }));
    assert!(!plan.is_tracked(w0));

    graph.execute().unwrap();
    assert_eq!(log.borrow().len(), 12);
    assert_eq!(log.borrow()[6], "f0");
}

#[test]
fn test_forward_reading_a_later_gradient_fails_configure() {
    let log = Log::default();
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, 2));
    let g = graph.add_tensor(Tensor::new("g", DType::F32, 2));
    let h = graph.add_tensor(Tensor::new("h", DType::F32, 2));
    let y = graph.add_output_tensor(Tensor::new("y", DType::F32, 2));

    // f0 consumes g, which only the backward phase of the next kernel writes.
    graph.add_kernel(logged(&log, "f0", &[x, g], &[h]));
    let second = TrainableSequence::new(logged(&log, "f1", &[h], &[y]))
        .with_backward(logged(&log, "b1", &[h], &[g]));
    graph.add_kernel(Box::new(second));

    let err = graph.configure().unwrap_err();
    assert!(
        matches!(err, Error::ReadBeforeWrite { tensor, read: 0, write: 2 } if tensor == g),
        "{err}"
    );
    assert!(err.is_contract_violation());
    assert_ne!(graph.state(), PlanState::Planned);

    assert!(graph.execute().is_err());
    assert!(log.borrow().is_empty());
}

// Parameter updates through the reference kernels

#[test]
fn test_fully_connected_step_updates_weights_and_bias() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, (1, 2)));
    let dy = graph.add_input_tensor(Tensor::new("dy", DType::F32, (1, 1)));
    let w = graph.add_tensor(Tensor::new("w", DType::F32, (1, 2)).trainable());
    let b = graph.add_tensor(Tensor::new("b", DType::F32, 1).trainable());
    let y = graph.add_output_tensor(Tensor::new("y", DType::F32, (1, 1)));
    let dw = graph.add_tensor(Tensor::new("dw", DType::F32, (1, 2)));
    let db = graph.add_tensor(Tensor::new("db", DType::F32, 1));

    let nodes = vec![OpNode::new("fc", OpKind::FullyConnected, vec![x, w, b], vec![y])
        .with_output_grad(0, dy)
        .with_input_grad(1, dw)
        .with_input_grad(2, db)
        .required(true)];
    let optimizer: SharedOptimizer = Sgd::new(0.1).shared();
    lower_training(&mut graph, &KernelRegistry::default(), &nodes, &optimizer).unwrap();

    provision(&mut graph, w, &[0.5, -1.0]);
    provision(&mut graph, b, &[0.25]);
    graph.set_input(0, &[1.0f32, 2.0]).unwrap();
    graph.set_input(1, &[2.0f32]).unwrap();

    graph.execute().unwrap();
    // Forward saw the old parameters.
    assert_close(&graph.output::<f32>(0).unwrap(), &[-1.25]);
    assert_close(graph.tensor(w).unwrap().data::<f32>().unwrap(), &[0.3, -1.4]);
    assert_close(graph.tensor(b).unwrap().data::<f32>().unwrap(), &[0.05]);
    assert!(!graph.tensor(dw).unwrap().is_allocated());
    assert!(!graph.tensor(db).unwrap().is_allocated());
    // x, dy, w, b and y
    assert_eq!(graph.memory_stats().live_tensors, 5);

    graph.execute().unwrap();
    assert_close(&graph.output::<f32>(0).unwrap(), &[0.3 - 2.8 + 0.05]);
}

#[test]
fn test_fully_connected_into_mse_trains() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, (1, 2)));
    let target = graph.add_input_tensor(Tensor::new("target", DType::F32, (1, 1)));
    let w = graph.add_tensor(Tensor::new("w", DType::F32, (1, 2)).trainable());
    let y = graph.add_tensor(Tensor::new("y", DType::F32, (1, 1)));
    let loss = graph.add_output_tensor(Tensor::new("loss", DType::F32, 1));
    let dy = graph.add_tensor(Tensor::new("dy", DType::F32, (1, 1)));
    let dw = graph.add_tensor(Tensor::new("dw", DType::F32, (1, 2)));

    let mut nodes = vec![
        OpNode::new("fc", OpKind::FullyConnected, vec![x, w], vec![y])
            .with_output_grad(0, dy)
            .with_input_grad(1, dw),
        OpNode::new("mse", OpKind::MseLoss, vec![y, target], vec![loss]).with_input_grad(0, dy),
    ];
    assert_eq!(
        mark_required_for_backward(&mut nodes, graph.tensors(), &[loss]).unwrap(),
        2
    );
    let optimizer: SharedOptimizer = Sgd::new(0.1).shared();
    lower_training(&mut graph, &KernelRegistry::default(), &nodes, &optimizer).unwrap();

    provision(&mut graph, w, &[0.5, 0.5]);
    graph.set_input(0, &[1.0f32, 2.0]).unwrap();
    graph.set_input(1, &[3.0f32]).unwrap();
    graph.execute().unwrap();

    // dy is written by the mse backward step before fc's backward reads it.
    let plan = graph.plan().unwrap();
    assert_eq!(plan.lifetime(dy), Some(Lifetime { first_write: 2, last_use: 3 }));

    // y = 1.5, loss = 2.25, dy = -3, dw = [-3, -6]
    assert_close(&graph.output::<f32>(0).unwrap(), &[2.25]);
    assert_close(graph.tensor(w).unwrap().data::<f32>().unwrap(), &[0.8, 1.1]);
    assert!(!graph.tensor(dy).unwrap().is_allocated());
    assert!(!graph.tensor(dw).unwrap().is_allocated());

    // y = 3.0 on the second pass.
    graph.execute().unwrap();
    assert_close(&graph.output::<f32>(0).unwrap(), &[0.0]);
}

#[test]
fn test_pruned_nodes_emit_no_gradient_work() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, (1, 2)));
    let target = graph.add_input_tensor(Tensor::new("target", DType::F32, (1, 1)));
    let wf = graph.add_tensor(Tensor::new("wf", DType::F32, (2, 2)));
    let w = graph.add_tensor(Tensor::new("w", DType::F32, (1, 2)).trainable());
    let h = graph.add_tensor(Tensor::new("h", DType::F32, (1, 2)));
    let y = graph.add_tensor(Tensor::new("y", DType::F32, (1, 1)));
    let loss = graph.add_output_tensor(Tensor::new("loss", DType::F32, 1));
    let dx = graph.add_tensor(Tensor::new("dx", DType::F32, (1, 2)));
    let dwf = graph.add_tensor(Tensor::new("dwf", DType::F32, (2, 2)));
    let dh = graph.add_tensor(Tensor::new("dh", DType::F32, (1, 2)));
    let dw = graph.add_tensor(Tensor::new("dw", DType::F32, (1, 2)));
    let dy = graph.add_tensor(Tensor::new("dy", DType::F32, (1, 1)));

    let mut nodes = vec![
        OpNode::new("frozen", OpKind::FullyConnected, vec![x, wf], vec![h])
            .with_output_grad(0, dh)
            .with_input_grad(0, dx)
            .with_input_grad(1, dwf),
        OpNode::new("head", OpKind::FullyConnected, vec![h, w], vec![y])
            .with_output_grad(0, dy)
            .with_input_grad(0, dh)
            .with_input_grad(1, dw),
        OpNode::new("loss", OpKind::MseLoss, vec![y, target], vec![loss]).with_input_grad(0, dy),
    ];
    let required = mark_required_for_backward(&mut nodes, graph.tensors(), &[loss]).unwrap();
    assert_eq!(required, 2);
    assert!(!nodes[0].required_for_backward);

    let optimizer: SharedOptimizer = Sgd::new(0.1).shared();
    lower_training(&mut graph, &KernelRegistry::default(), &nodes, &optimizer).unwrap();
    graph.configure().unwrap();

    // Steps: 0..=2 forward, 3 loss backward, 4 head backward.
    let plan = graph.plan().unwrap();
    assert_eq!(plan.num_steps(), 5);
    assert!(!plan.is_tracked(dx));
    assert!(!plan.is_tracked(dwf));
    assert_eq!(plan.lifetime(dy), Some(Lifetime { first_write: 3, last_use: 4 }));
    assert_eq!(plan.lifetime(dh), Some(Lifetime { first_write: 4, last_use: 4 }));
    assert_eq!(plan.lifetime(dw), Some(Lifetime { first_write: 4, last_use: 4 }));
    assert_eq!(plan.lifetime(h), Some(Lifetime { first_write: 0, last_use: 4 }));

    provision(&mut graph, wf, &[1.0, 0.0, 0.0, 1.0]);
    provision(&mut graph, w, &[0.5, 0.5]);
    graph.set_input(0, &[1.0f32, 2.0]).unwrap();
    graph.set_input(1, &[3.0f32]).unwrap();
    graph.execute().unwrap();

    assert_close(&graph.output::<f32>(0).unwrap(), &[2.25]);
    assert_close(graph.tensor(w).unwrap().data::<f32>().unwrap(), &[0.8, 1.1]);
    assert_close(graph.tensor(wf).unwrap().data::<f32>().unwrap(), &[1.0, 0.0, 0.0, 1.0]);
    assert!(!graph.tensor(dx).unwrap().is_allocated());
    assert!(!graph.tensor(dwf).unwrap().is_allocated());
}

// Session loop

#[test]
fn test_fit_drives_loss_down() {
    let config = TrainingConfig::default()
        .with_learning_rate(0.25)
        .with_epochs(20);
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let target = graph.add_input_tensor(Tensor::new("target", DType::F32, 4));
    let pred = graph.add_tensor(Tensor::new("pred", DType::F32, 4).trainable());
    let loss = graph.add_tensor(Tensor::new("loss", DType::F32, 1));
    let dpred = graph.add_tensor(Tensor::new("dpred", DType::F32, 4));
    graph.allocate_tensor(pred).unwrap();

    let mut nodes = vec![
        OpNode::new("mse", OpKind::MseLoss, vec![pred, target], vec![loss]).with_input_grad(0, dpred),
    ];
    assert_eq!(
        mark_required_for_backward(&mut nodes, graph.tensors(), &[loss]).unwrap(),
        1
    );
    let optimizer: SharedOptimizer = Sgd::from_config(&config).shared();
    lower_training(&mut graph, &KernelRegistry::default(), &nodes, &optimizer).unwrap();

    let mut session = TrainingSession::new(graph, loss, config).unwrap();
    let batches = [[1.0f32, -2.0, 0.5, 3.0]];
    let result = session
        .fit(&batches, |graph, batch| graph.set_input(0, batch))
        .unwrap();

    assert_eq!(result.epochs.len(), 20);
    assert_eq!(session.info().iteration(), 20);
    for pair in result.epochs.windows(2) {
        assert!(pair[1].loss < pair[0].loss, "{result}");
    }
    // Loss at step 0 is mean(t^2) = 14.25 / 4.
    assert!((result.epochs[0].loss - 3.5625).abs() < 1e-5);
    assert!(result.final_loss < result.epochs[0].loss * 0.01);

    let learned = session.graph().tensor(pred).unwrap().to_vec::<f32>().unwrap();
    for (p, t) in learned.iter().zip(batches[0]) {
        assert!((p - t).abs() < 0.25);
    }
}

#[test]
fn test_fit_trains_a_multi_operator_graph() {
    let config = TrainingConfig::default()
        .with_learning_rate(0.05)
        .with_epochs(6);
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, (1, 2)));
    let target = graph.add_input_tensor(Tensor::new("target", DType::F32, (1, 1)));
    let wf = graph.add_tensor(Tensor::new("wf", DType::F32, (2, 2)));
    let w = graph.add_tensor(Tensor::new("w", DType::F32, (1, 2)).trainable());
    let b = graph.add_tensor(Tensor::new("b", DType::F32, 1).trainable());
    let h = graph.add_tensor(Tensor::new("h", DType::F32, (1, 2)));
    let z = graph.add_tensor(Tensor::new("z", DType::F32, (1, 1)));
    let a = graph.add_tensor(Tensor::new("a", DType::F32, (1, 1)));
    let loss = graph.add_tensor(Tensor::new("loss", DType::F32, 1));
    let dx = graph.add_tensor(Tensor::new("dx", DType::F32, (1, 2)));
    let dwf = graph.add_tensor(Tensor::new("dwf", DType::F32, (2, 2)));
    let dh = graph.add_tensor(Tensor::new("dh", DType::F32, (1, 2)));
    let dz = graph.add_tensor(Tensor::new("dz", DType::F32, (1, 1)));
    let da = graph.add_tensor(Tensor::new("da", DType::F32, (1, 1)));
    let dw = graph.add_tensor(Tensor::new("dw", DType::F32, (1, 2)));
    let db = graph.add_tensor(Tensor::new("db", DType::F32, 1));

    let mut nodes = vec![
        OpNode::new("frozen", OpKind::FullyConnected, vec![x, wf], vec![h])
            .with_output_grad(0, dh)
            .with_input_grad(0, dx)
            .with_input_grad(1, dwf),
        OpNode::new("head", OpKind::FullyConnected, vec![h, w, b], vec![z])
            .with_output_grad(0, dz)
            .with_input_grad(0, dh)
            .with_input_grad(1, dw)
            .with_input_grad(2, db),
        OpNode::new("act", OpKind::Relu, vec![z], vec![a])
            .with_output_grad(0, da)
            .with_input_grad(0, dz),
        OpNode::new("mse", OpKind::MseLoss, vec![a, target], vec![loss]).with_input_grad(0, da),
    ];
    assert_eq!(
        mark_required_for_backward(&mut nodes, graph.tensors(), &[loss]).unwrap(),
        3
    );
    let optimizer: SharedOptimizer = Sgd::from_config(&config).shared();
    lower_training(&mut graph, &KernelRegistry::default(), &nodes, &optimizer).unwrap();
    provision(&mut graph, wf, &[1.0, 0.0, 0.0, 1.0]);
    provision(&mut graph, w, &[0.5, 0.5]);
    provision(&mut graph, b, &[0.0]);

    let mut session = TrainingSession::new(graph, loss, config).unwrap();
    let batches = [[1.0f32, 2.0, 3.0]];
    let result = session
        .fit(&batches, |graph, batch| {
            graph.set_input(0, &batch[..2])?;
            graph.set_input(1, &batch[2..])
        })
        .unwrap();

    // The error shrinks by 0.4 per step: z = 1.5, 2.4, 2.76, ...
    assert_eq!(result.epochs.len(), 6);
    assert!((result.epochs[0].loss - 2.25).abs() < 1e-4, "{result}");
    assert!((result.epochs[1].loss - 0.36).abs() < 1e-4, "{result}");
    for pair in result.epochs.windows(2) {
        assert!(pair[1].loss < pair[0].loss, "{result}");
    }

    // Summed over six steps the head moves by 0.25 * (1 - 0.4^6) * [h, 1].
    let graph = session.graph();
    let moved = 0.25 * (1.0 - 0.4f32.powi(6));
    let learned_w = graph.tensor(w).unwrap().to_vec::<f32>().unwrap();
    let learned_b = graph.tensor(b).unwrap().to_vec::<f32>().unwrap();
    assert!((learned_w[0] - (0.5 + moved)).abs() < 1e-4, "{learned_w:?}");
    assert!((learned_w[1] - (0.5 + 2.0 * moved)).abs() < 1e-4, "{learned_w:?}");
    assert!((learned_b[0] - moved).abs() < 1e-4, "{learned_b:?}");

    // The frozen layer is read but never differentiated or updated.
    assert_close(graph.tensor(wf).unwrap().data::<f32>().unwrap(), &[1.0, 0.0, 0.0, 1.0]);
    let plan = graph.plan().unwrap();
    for id in [dx, dwf] {
        assert!(!plan.is_tracked(id));
        assert!(!graph.tensor(id).unwrap().is_allocated());
    }
    assert!(plan.is_tracked(dh));
    assert_eq!(graph.steps().len(), 7);
}

#[test]
fn test_session_rejects_non_scalar_loss() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let wide = graph.add_tensor(Tensor::new("wide", DType::F32, 3));
    assert!(TrainingSession::new(graph, wide, TrainingConfig::default()).is_err());
}

#[test]
fn test_fit_without_batches_fails() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let loss = graph.add_tensor(Tensor::new("loss", DType::F32, 1));
    let mut session = TrainingSession::new(graph, loss, TrainingConfig::default()).unwrap();
    let batches: [[f32; 1]; 0] = [];
    assert!(session.fit(&batches, |_, _| Ok(())).is_err());
}

// Inference lowering

#[test]
fn test_inference_fully_connected_relu() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F32, (1, 2)));
    let w = graph.add_tensor(Tensor::new("w", DType::F32, (2, 2)));
    let b = graph.add_tensor(Tensor::new("b", DType::F32, 2));
    let h = graph.add_tensor(Tensor::new("h", DType::F32, (1, 2)));
    let y = graph.add_output_tensor(Tensor::new("y", DType::F32, (1, 2)));
    let nodes = vec![
        OpNode::new("fc", OpKind::FullyConnected, vec![x, w, b], vec![h]),
        OpNode::new("relu", OpKind::Relu, vec![h], vec![y]),
    ];
    lower_inference(&mut graph, &KernelRegistry::default(), &nodes).unwrap();
    assert_eq!(graph.kernel_count(), 2);

    provision(&mut graph, w, &[1.0, 0.0, 0.0, -1.0]);
    provision(&mut graph, b, &[0.5, 0.5]);
    graph.set_input(0, &[1.0f32, 2.0]).unwrap();
    graph.execute().unwrap();

    assert_close(&graph.output::<f32>(0).unwrap(), &[1.5, 0.0]);
    assert!(!graph.tensor(h).unwrap().is_allocated());
}

#[test]
fn test_unsupported_dtype_fails_configure() {
    let mut graph = RuntimeGraph::from_config(RuntimeConfig::default());
    let x = graph.add_input_tensor(Tensor::new("x", DType::F64, (1, 2)));
    let w = graph.add_tensor(Tensor::new("w", DType::F64, (1, 2)));
    let y = graph.add_output_tensor(Tensor::new("y", DType::F64, (1, 1)));
    let nodes = vec![OpNode::new("fc", OpKind::FullyConnected, vec![x, w], vec![y])];
    lower_inference(&mut graph, &KernelRegistry::default(), &nodes).unwrap();

    let err = graph.configure().unwrap_err();
    assert!(matches!(err, Error::UnsupportedType { .. }));
    assert!(!err.is_contract_violation());
    assert_ne!(graph.state(), PlanState::Planned);
}
