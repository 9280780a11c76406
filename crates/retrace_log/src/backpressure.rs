//! Backpressure for event producers.
//!
//! When the writer's queue is full a producer either waits, waits up to a
//! deadline and then drops the event, or drops it immediately.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Backpressure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackpressurePolicy {
    /// Block until space is available
    #[default]
    Block,
    /// Block up to the duration, then drop the event
    Timeout(Duration),
    /// Drop the event when the queue is full
    Drop,
}

impl BackpressurePolicy {
    /// Build from a timeout in seconds: `None` blocks forever, zero drops
    /// immediately, anything else waits that long then drops.
    #[must_use]
    pub fn from_timeout_secs(timeout: Option<f64>) -> Self {
        match timeout {
            None => Self::Block,
            Some(secs) if secs <= 0.0 => Self::Drop,
            Some(secs) => Self::Timeout(Duration::from_secs_f64(secs)),
        }
    }

    /// Deadline for an append starting at `now`, if the policy has one
    #[must_use]
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        match self {
            Self::Timeout(d) => Some(now + *d),
            Self::Block | Self::Drop => None,
        }
    }
}

/// What a producer should do with the event it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureStatus {
    /// Enqueue now
    Accept,
    /// Wait for space
    Wait,
    /// Give up on this event
    Drop,
}

/// Tracks queue fill and decides per append
#[derive(Debug)]
pub struct BackpressureController {
    capacity: usize,
    policy: BackpressurePolicy,
    dropped: AtomicU64,
}

impl BackpressureController {
    /// Create a controller for a queue of `capacity` frames
    #[must_use]
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Decide what to do with a queue currently holding `queued` frames.
    /// `deadline` is the value returned by [`BackpressurePolicy::deadline`]
    /// when the append started.
    #[must_use]
    pub fn status(&self, queued: usize, deadline: Option<Instant>, now: Instant) -> BackpressureStatus {
        if queued < self.capacity {
            return BackpressureStatus::Accept;
        }
        match self.policy {
            BackpressurePolicy::Block => BackpressureStatus::Wait,
            BackpressurePolicy::Drop => BackpressureStatus::Drop,
            BackpressurePolicy::Timeout(_) => match deadline {
                Some(d) if now < d => BackpressureStatus::Wait,
                _ => BackpressureStatus::Drop,
            },
        }
    }

    /// Count one dropped event
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Events dropped so far
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get policy
    #[must_use]
    pub const fn policy(&self) -> BackpressurePolicy {
        self.policy
    }
}

impl Default for BackpressureController {
    fn default() -> Self {
        Self::new(1024, BackpressurePolicy::Block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_timeout_secs() {
        assert_eq!(BackpressurePolicy::from_timeout_secs(None), BackpressurePolicy::Block);
        assert_eq!(BackpressurePolicy::from_timeout_secs(Some(0.0)), BackpressurePolicy::Drop);
        assert_eq!(
            BackpressurePolicy::from_timeout_secs(Some(1.5)),
            BackpressurePolicy::Timeout(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_accept_below_capacity() {
        let controller = BackpressureController::new(2, BackpressurePolicy::Drop);
        let now = Instant::now();
        assert_eq!(controller.status(1, None, now), BackpressureStatus::Accept);
        assert_eq!(controller.status(2, None, now), BackpressureStatus::Drop);
    }

    #[test]
    fn test_block_waits() {
        let controller = BackpressureController::new(1, BackpressurePolicy::Block);
        assert_eq!(controller.status(1, None, Instant::now()), BackpressureStatus::Wait);
    }

    #[test]
    fn test_timeout_waits_then_drops() {
        let policy = BackpressurePolicy::Timeout(Duration::from_millis(10));
        let controller = BackpressureController::new(1, policy);
        let start = Instant::now();
        let deadline = policy.deadline(start);
        assert_eq!(controller.status(1, deadline, start), BackpressureStatus::Wait);
        assert_eq!(
            controller.status(1, deadline, start + Duration::from_millis(20)),
            BackpressureStatus::Drop
        );
    }

    #[test]
    fn test_drop_counter() {
        let controller = BackpressureController::default();
        controller.record_drop();
        controller.record_drop();
        assert_eq!(controller.dropped(), 2);
        assert_eq!(controller.capacity(), 1024);
    }
}
