//! PID-controlled dequeue pacing

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Controller gains. The defaults are tunable starting points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        Self { kp: 0.01, ki: 0.001, kd: 0.001 }
    }
}

/// Holds the buffer near `target_depth` by stretching or shrinking the wait between
/// dequeues around one frame duration.
#[derive(Debug, Clone)]
pub struct PidPacer {
    target_depth: Duration,
    frame_duration: Duration,
    gains: PidGains,
    integral: f64,
    last_error: f64,
}

impl PidPacer {
    pub fn new(target_depth: Duration, frame_duration: Duration, gains: PidGains) -> Self {
        Self { target_depth, frame_duration, gains, integral: 0.0, last_error: 0.0 }
    }

    /// Advance the controller with the current buffer depth and return the wait in
    /// seconds. May be zero or negative.
    pub fn tick(&mut self, current_depth: Duration) -> f64 {
        let error = self.target_depth.as_secs_f64() - current_depth.as_secs_f64();
        self.integral += error;
        let derivative = error - self.last_error;
        self.last_error = error;

        self.frame_duration.as_secs_f64()
            + self.gains.kp * error
            + self.gains.ki * self.integral
            + self.gains.kd * derivative
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }
}
