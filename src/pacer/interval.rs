//! Fixed-interval dequeue pacing

use std::time::Duration;
use tokio::time::Instant;

/// Dequeues on a fixed schedule anchored at the first successful dequeue.
#[derive(Debug, Clone)]
pub struct IntervalPacer {
    frame_duration: Duration,
    first_dequeue: Option<Instant>,
    dequeued: u64,
}

impl IntervalPacer {
    pub fn new(frame_duration: Duration) -> Self {
        Self { frame_duration, first_dequeue: None, dequeued: 0 }
    }

    /// Seconds until the next scheduled dequeue. May be zero or negative when behind.
    pub fn tick(&self, now: Instant) -> f64 {
        let Some(first) = self.first_dequeue else {
            return self.frame_duration.as_secs_f64();
        };

        let offset = self.frame_duration.as_secs_f64() * self.dequeued as f64;
        let elapsed = now.saturating_duration_since(first).as_secs_f64();
        offset - elapsed
    }

    /// Record a successful dequeue. The first call anchors the schedule.
    pub fn dequeued(&mut self, now: Instant) {
        self.first_dequeue.get_or_insert(now);
        self.dequeued += 1;
    }

    pub fn dequeued_count(&self) -> u64 {
        self.dequeued
    }
}
