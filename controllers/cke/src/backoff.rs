//! # Fibonacci Backoff
//!
//! Progressive wait used by the leader loop after a failed tick. It grows
//! more slowly than exponential backoff so that a flapping host does not
//! push the next attempt out too far.
//!
//! Calculations are done in multiples of a base step (the tick interval by
//! default): 1, 1, 2, 3, 5, 8, ... capped at a maximum.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, in units of `step`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    /// Unit of the sequence
    step: Duration,
    /// Previous multiplier
    prev: u32,
    /// Current multiplier
    current: u32,
    /// Cap on the returned duration
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a backoff starting at `step` and capped at `max`
    #[must_use]
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            prev: 0,
            current: 1,
            max: max.max(step),
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.step.saturating_mul(self.current).min(self.max);

        // Stop growing once the cap is reached so the multiplier cannot overflow.
        if result < self.max {
            let next = self.prev.saturating_add(self.current);
            self.prev = self.current;
            self.current = next;
        }

        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = 0;
        self.current = 1;
    }

    /// Calculate the backoff for a given count of consecutive errors (stateless)
    ///
    /// `error_count` 0 and 1 both give `step`; the cap is `max`.
    #[must_use]
    pub fn calculate_for_error_count(error_count: u32, step: Duration, max: Duration) -> Duration {
        let mut backoff = Self::new(step, max);
        let mut result = backoff.next_backoff();
        for _ in 1..error_count {
            result = backoff.next_backoff();
            if result >= backoff.max {
                break;
            }
        }
        result
    }
}
