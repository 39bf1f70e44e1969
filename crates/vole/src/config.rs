// Runtime configuration
//
// Builder-style structs, plus `from_env()` so deployments can override the
// memory budget and plan tracing without recompiling:
//
//   VOLE_MEMORY_LIMIT   byte budget for the reference memory manager
//   VOLE_TRACE_PLAN     "1"/"true" to log every plan when it is built

use vole_core::{Error, Result};

const ENV_MEMORY_LIMIT: &str = "VOLE_MEMORY_LIMIT";
const ENV_TRACE_PLAN: &str = "VOLE_TRACE_PLAN";

/// Execution-engine configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Byte budget for the memory manager (`None` = unbounded).
    pub memory_limit: Option<usize>,
    /// Log the full alloc/dealloc plan at debug level when it is built.
    pub trace_plan: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_limit: None,
            trace_plan: false,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `VOLE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_MEMORY_LIMIT) {
            let limit = raw.trim().parse::<usize>().map_err(|e| {
                Error::msg(format!("{ENV_MEMORY_LIMIT}='{raw}' is not a byte count: {e}"))
            })?;
            config.memory_limit = Some(limit);
        }
        if let Some(raw) = lookup(ENV_TRACE_PLAN) {
            config.trace_plan = parse_flag(ENV_TRACE_PLAN, &raw)?;
        }
        Ok(config)
    }

    /// Set the memory budget in bytes.
    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Enable plan tracing.
    pub fn with_trace_plan(mut self, trace: bool) -> Self {
        self.trace_plan = trace;
        self
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" | "" => Ok(false),
        other => Err(Error::msg(format!("{key}='{other}' is not a boolean flag"))),
    }
}

/// Training hyper-parameters consumed by the session and the reference optimizer.
#[derive(Debug, Clone)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub batch_size: usize,
    pub epochs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.0,
            batch_size: 1,
            epochs: 1,
        }
    }
}

impl TrainingConfig {
    pub fn with_learning_rate(mut self, lr: f32) -> Self {
        self.learning_rate = lr;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }
}
