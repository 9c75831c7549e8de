//! Logical step clock.
//!
//! Time is a step counter that starts at zero and advances by exactly one
//! each time a step resolves. All arithmetic is checked.

/// Errors that can occur during clock operations.
#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    /// Step counter would overflow.
    #[error("step counter overflow: cannot advance beyond u64::MAX")]
    StepOverflow,
}

/// The simulator's logical time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepClock {
    time: u64,
}

impl StepClock {
    /// A clock at step zero.
    pub const fn new() -> Self {
        Self { time: 0 }
    }

    /// A clock resumed at `time` (used when restoring snapshots).
    pub const fn resume_at(time: u64) -> Self {
        Self { time }
    }

    /// Advance the clock by one step. Returns the new time.
    ///
    /// # Errors
    ///
    /// Returns [`ClockError::StepOverflow`] if the counter would exceed
    /// `u64::MAX`.
    pub fn advance(&mut self) -> Result<u64, ClockError> {
        self.time = self.time.checked_add(1).ok_or(ClockError::StepOverflow)?;
        Ok(self.time)
    }

    /// The current step.
    pub const fn time(&self) -> u64 {
        self.time
    }
}
