//! Isolated execution units and the transform they run.

pub mod pool;
pub mod transform;

pub use pool::{LatencyRange, ResultMessage, SandboxPool, TaskMessage};

use crate::error::SandboxError;

/// Anything that accepts task messages for a numbered execution slot.
pub trait TaskSink: Send + Sync {
    fn submit(&self, slot: usize, task: TaskMessage) -> Result<(), SandboxError>;
}

impl TaskSink for SandboxPool {
    fn submit(&self, slot: usize, task: TaskMessage) -> Result<(), SandboxError> {
        SandboxPool::submit(self, slot, task)
    }
}
