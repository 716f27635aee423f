//! Ordered step queue.

use crate::cancel::CancelToken;
use crate::source::SourceMap;
use crate::step::{Step, StepError};
use std::collections::VecDeque;
use tracing::info;

/// FIFO queue of steps making up one run.
#[derive(Debug, Default)]
pub struct Pipeline {
    steps: VecDeque<Step>,
    simulated: bool,
}

impl Pipeline {
    pub fn new(simulated: bool) -> Self {
        Self {
            steps: VecDeque::new(),
            simulated,
        }
    }

    /// Append a step, stamping it with the pipeline's simulated flag.
    pub fn push_step(&mut self, mut step: Step) {
        step.set_simulated(self.simulated);
        self.steps.push_back(step);
    }

    /// Number of steps still queued.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn has_steps_left(&self) -> bool {
        !self.steps.is_empty()
    }

    pub fn simulated(&self) -> bool {
        self.simulated
    }

    /// Flip simulated mode for this pipeline and every step still queued.
    /// Steps already executed are unaffected.
    pub fn set_simulated(&mut self, simulated: bool) {
        self.simulated = simulated;
        for step in &mut self.steps {
            step.set_simulated(simulated);
        }
    }

    /// The next step in line, if any.
    pub fn front(&self) -> Option<&Step> {
        self.steps.front()
    }

    /// Remove the front step without running it.
    pub fn pop_step(&mut self) -> Option<Step> {
        self.steps.pop_front()
    }

    /// Run the front step against the source map. Returns `Ok(false)` when
    /// the queue was already empty. The step is dequeued before execution;
    /// a failing step is not retried.
    pub fn run_next_step(
        &mut self,
        sources: &mut SourceMap,
        cancel: &CancelToken,
    ) -> Result<bool, StepError> {
        let Some(step) = self.steps.pop_front() else {
            return Ok(false);
        };
        info!("running step '{}': {}", step.label(), step.describe());
        step.execute(sources, cancel)?;
        Ok(true)
    }
}
