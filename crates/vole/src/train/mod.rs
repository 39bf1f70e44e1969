// Training: step sequences, the optimizer contract and the session loop.

pub mod applier;
pub mod optimizer;
pub mod reachability;
pub mod sequence;
pub mod session;

pub use applier::GradientApplier;
pub use optimizer::{Optimizer, SharedOptimizer, Sgd};
pub use reachability::mark_required_for_backward;
pub use sequence::TrainableSequence;
pub use session::{EpochLog, TrainResult, TrainingInfo, TrainingSession};
