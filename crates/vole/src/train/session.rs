// TrainingSession: iteration loop over a lowered training graph
//
// One training step is one execute() of the graph: every operator's forward
// phase in graph order, then every backward phase (gradients, then updates)
// in reverse order. The loss is read from its output tensor afterwards. It
// is registered as a graph output so its buffer survives the pass.

use std::fmt;

use vole_core::{Error, Result, TensorId};

use crate::config::TrainingConfig;
use crate::graph::RuntimeGraph;

/// Iteration bookkeeping shared with kernels that need it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrainingInfo {
    batch_size: usize,
    iteration: usize,
}

impl TrainingInfo {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            iteration: 0,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Completed training steps.
    pub fn iteration(&self) -> usize {
        self.iteration
    }
}

/// Summary of a full training run.
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// Per-epoch logs.
    pub epochs: Vec<EpochLog>,
    /// Loss of the last step.
    pub final_loss: f64,
}

/// Log for a single training epoch.
#[derive(Debug, Clone)]
pub struct EpochLog {
    /// Epoch number (0-indexed).
    pub epoch: usize,
    /// Mean loss over the epoch's batches.
    pub loss: f64,
}

impl fmt::Display for TrainResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Training complete: {} epochs", self.epochs.len())?;
        for log in &self.epochs {
            writeln!(f, "  epoch {}: loss = {:.6}", log.epoch, log.loss)?;
        }
        write!(f, "  final loss: {:.6}", self.final_loss)
    }
}

/// Drives a training graph one step at a time.
pub struct TrainingSession {
    graph: RuntimeGraph,
    loss: TensorId,
    info: TrainingInfo,
    config: TrainingConfig,
}

impl TrainingSession {
    /// Wrap a lowered training graph whose loss is written to `loss`.
    pub fn new(mut graph: RuntimeGraph, loss: TensorId, config: TrainingConfig) -> Result<Self> {
        graph.mark_output(loss)?;
        let elems = graph.tensor(loss)?.elem_count();
        if elems != 1 {
            return Err(Error::msg(format!(
                "loss tensor {loss} must hold one element, has {elems}"
            )));
        }
        Ok(Self {
            graph,
            loss,
            info: TrainingInfo::new(config.batch_size),
            config,
        })
    }

    pub fn graph(&self) -> &RuntimeGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut RuntimeGraph {
        &mut self.graph
    }

    pub fn info(&self) -> TrainingInfo {
        self.info
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Run forward, backward and update once and return the loss.
    pub fn train_step(&mut self) -> Result<f32> {
        self.graph.execute()?;
        let loss = self
            .graph
            .tensor(self.loss)?
            .data::<f32>()?
            .first()
            .copied()
            .ok_or(Error::NotAllocated(self.loss))?;
        self.info.iteration += 1;
        tracing::trace!(iteration = self.info.iteration, loss, "train step");
        Ok(loss)
    }

    /// Run `config.epochs` epochs. Before each step, `feed` loads one batch
    /// into the graph's inputs.
    pub fn fit<B, F>(&mut self, batches: &[B], mut feed: F) -> Result<TrainResult>
    where
        F: FnMut(&mut RuntimeGraph, &B) -> Result<()>,
    {
        if batches.is_empty() {
            return Err(Error::msg("fit() needs at least one batch"));
        }
        let mut epochs = Vec::with_capacity(self.config.epochs);
        let mut final_loss = 0.0;
        for epoch in 0..self.config.epochs {
            let mut total = 0.0f64;
            for batch in batches {
                feed(&mut self.graph, batch)?;
                let loss = f64::from(self.train_step()?);
                total += loss;
                final_loss = loss;
            }
            let loss = total / batches.len() as f64;
            tracing::info!(epoch, loss, "epoch finished");
            epochs.push(EpochLog { epoch, loss });
        }
        Ok(TrainResult { epochs, final_loss })
    }
}
