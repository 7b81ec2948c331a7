//! Resource limiting for fiber execution (spec section 5).
//!
//! Grounded on the teacher's `resource::{ResourceTracker, LimitedTracker,
//! NoLimitTracker}` idiom (referenced throughout `monty::run`/`monty::heap`,
//! though the module itself wasn't present in the retrieval pack — its shape
//! is reconstructed from call sites). A tracker is consulted once per
//! dispatched opcode and once per frame push, so a runaway script (infinite
//! loop, unbounded recursion) can be stopped without the host needing to kill
//! a thread.

use crate::error::RuntimeFault;

/// Consulted by the VM's dispatch loop at each opcode and frame push.
/// Implementors decide what counts as "too much"; the VM only calls the two
/// methods below and propagates a fault on `Err`.
pub trait ResourceTracker {
    fn consume_step(&mut self) -> Result<(), RuntimeFault>;
    fn consume_frame(&mut self) -> Result<(), RuntimeFault>;
}

/// No limits: every call succeeds. The default for embedders that trust their
/// own scripts or impose limits at a different layer (e.g. a wall-clock
/// timeout via cooperative [`crate::fiber::Fiber::should_cancel`]).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLimitTracker;

impl ResourceTracker for NoLimitTracker {
    fn consume_step(&mut self) -> Result<(), RuntimeFault> {
        Ok(())
    }
    fn consume_frame(&mut self) -> Result<(), RuntimeFault> {
        Ok(())
    }
}

/// Caps the number of opcodes dispatched and frames pushed across a fiber's
/// lifetime (spec section 4.9 "VmConfig", §5 "resource ownership").
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub max_steps: u64,
    pub max_frames: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000_000,
            max_frames: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LimitedTracker {
    limits: ResourceLimits,
    steps_used: u64,
    frames_used: u32,
}

impl LimitedTracker {
    #[must_use]
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            steps_used: 0,
            frames_used: 0,
        }
    }
}

impl ResourceTracker for LimitedTracker {
    fn consume_step(&mut self) -> Result<(), RuntimeFault> {
        self.steps_used += 1;
        if self.steps_used > self.limits.max_steps {
            return Err(RuntimeFault::BadCodeblock("step limit exceeded".into()));
        }
        Ok(())
    }

    fn consume_frame(&mut self) -> Result<(), RuntimeFault> {
        if self.frames_used >= self.limits.max_frames {
            return Err(RuntimeFault::StackOverflow);
        }
        self.frames_used += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limited_tracker_faults_past_step_budget() {
        let mut tracker = LimitedTracker::new(ResourceLimits { max_steps: 2, max_frames: 10 });
        tracker.consume_step().unwrap();
        tracker.consume_step().unwrap();
        assert!(tracker.consume_step().is_err());
    }

    #[test]
    fn no_limit_tracker_never_faults() {
        let mut tracker = NoLimitTracker;
        for _ in 0..1000 {
            tracker.consume_step().unwrap();
        }
    }
}
