//! Dequeue pacing strategies.
//!
//! A pacer answers one question per dequeue cycle: how long to wait before reading the
//! jitter buffer again. Both strategies are stateful and ticked once per cycle; a
//! non-positive answer means "read now".

mod interval;
mod pid;

pub use interval::IntervalPacer;
pub use pid::{PidGains, PidPacer};

use std::time::Duration;
use tokio::time::Instant;

use crate::config::{JitterMode, PlayoutConfig};

/// The pacing strategy chosen for a buffered handler.
#[derive(Debug, Clone)]
pub enum Pacer {
    Pid(PidPacer),
    Interval(IntervalPacer),
}

impl Pacer {
    /// Build the pacer for `config`'s jitter mode, or `None` when the mode is unbuffered.
    pub fn for_config(config: &PlayoutConfig, frame_duration: Duration) -> Option<Self> {
        match config.jitter_mode {
            JitterMode::Pid => Some(Pacer::Pid(PidPacer::new(
                config.min_depth(),
                frame_duration,
                config.pid_gains,
            ))),
            JitterMode::IntervalBased => Some(Pacer::Interval(IntervalPacer::new(frame_duration))),
            JitterMode::None | JitterMode::PerLayer => None,
        }
    }

    /// Wait before the next dequeue attempt; zero means dequeue immediately.
    pub fn next_wait(&mut self, current_depth: Duration, now: Instant) -> Duration {
        let seconds = match self {
            Pacer::Pid(pid) => pid.tick(current_depth),
            Pacer::Interval(interval) => interval.tick(now),
        };
        non_negative(seconds)
    }

    /// Tell the pacer a unit was dequeued at `now`
    pub fn dequeued(&mut self, now: Instant) {
        if let Pacer::Interval(interval) = self {
            interval.dequeued(now);
        }
    }
}

fn non_negative(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
}
