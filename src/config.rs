//! Playout configuration.
//!
//! All options are supplied by the embedding application, either constructed directly or
//! loaded from YAML. Every field has a default, so partial documents are fine:
//!
//! ```rust
//! use playout::{JitterMode, PlayoutConfig, SimulreceiveMode};
//!
//! let config = PlayoutConfig::from_yaml_str(
//!     "jitterMode: intervalBased\nminDepthSeconds: 0.1\nsimulreceiveMode: visualizeOnly\n",
//! )?;
//! assert_eq!(config.jitter_mode, JitterMode::IntervalBased);
//! assert_eq!(config.simulreceive_mode, SimulreceiveMode::VisualizeOnly);
//! assert_eq!(config.quality_miss_threshold, 5);
//! # Ok::<(), playout::PlayoutError>(())
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::gate::{GapPolicy, NameGateKind};
use crate::pacer::PidGains;
use crate::types::{FALLBACK_FRAME_DURATION, frame_duration_for};
use crate::{PlayoutError, Result};

/// How a stream handler absorbs network jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JitterMode {
    /// Decode on arrival and display immediately
    None,
    /// Jitter buffer dequeued by a PID-controlled pacer
    #[default]
    Pid,
    /// Jitter buffer dequeued on a fixed frame interval
    IntervalBased,
    /// Decode on arrival; the render sink's display timebase absorbs jitter
    PerLayer,
}

impl JitterMode {
    /// Whether this mode owns a jitter buffer and a dequeue task
    pub fn is_buffered(self) -> bool {
        matches!(self, JitterMode::Pid | JitterMode::IntervalBased)
    }
}

/// Whether multiple variants of a source compete for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SimulreceiveMode {
    /// Every handler renders its own images
    Disabled,
    /// Every handler renders its own images; the engine only reports its choice
    VisualizeOnly,
    /// The engine picks one image per tick across handlers
    #[default]
    Enabled,
}

impl SimulreceiveMode {
    /// Whether handlers fill their decoded-image slot for the engine
    pub fn uses_engine(self) -> bool {
        !matches!(self, SimulreceiveMode::Disabled)
    }

    /// Whether handlers forward decoded images straight to the render sink
    pub fn forwards_directly(self) -> bool {
        !matches!(self, SimulreceiveMode::Enabled)
    }
}

/// Configuration for one subscription and all of its stream handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayoutConfig {
    pub jitter_mode: JitterMode,

    /// Buffered duration required before playout starts
    pub min_depth_seconds: f64,

    pub simulreceive_mode: SimulreceiveMode,

    /// Consecutive step-down ticks tolerated before a downgrade is committed
    pub quality_miss_threshold: u32,

    /// Consecutive stale ticks before a variant is reported paused (0 disables)
    pub pause_miss_threshold: u32,

    /// Handlers with no data for this long are removed
    pub cleanup_timeout_seconds: f64,

    /// How often the cleanup sweep runs
    pub cleanup_interval_seconds: f64,

    pub name_gate: NameGateKind,
    pub gap_policy: GapPolicy,
    pub pid_gains: PidGains,

    /// Frame rate assumed when neither the unit nor the profile says otherwise
    pub default_fps: f64,
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            jitter_mode: JitterMode::default(),
            min_depth_seconds: 0.2,
            simulreceive_mode: SimulreceiveMode::default(),
            quality_miss_threshold: 5,
            pause_miss_threshold: 30,
            cleanup_timeout_seconds: 1.5,
            cleanup_interval_seconds: 1.5,
            name_gate: NameGateKind::default(),
            gap_policy: GapPolicy::default(),
            pid_gains: PidGains::default(),
            default_fps: 30.0,
        }
    }
}

impl PlayoutConfig {
    /// Parse and validate a configuration from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: PlayoutConfig = serde_yaml_ng::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| PlayoutError::config_file(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject option combinations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.simulreceive_mode == SimulreceiveMode::Enabled
            && self.jitter_mode == JitterMode::PerLayer
        {
            return Err(PlayoutError::invalid_configuration(
                "simulreceive cannot be combined with per-layer jitter buffering",
            ));
        }

        if Duration::try_from_secs_f64(self.min_depth_seconds).is_err() {
            return Err(PlayoutError::invalid_configuration(format!(
                "minDepthSeconds must be a non-negative duration, got {}",
                self.min_depth_seconds
            )));
        }

        for (name, value) in [
            ("cleanupTimeoutSeconds", self.cleanup_timeout_seconds),
            ("cleanupIntervalSeconds", self.cleanup_interval_seconds),
        ] {
            if !Duration::try_from_secs_f64(value).is_ok_and(|d| !d.is_zero()) {
                return Err(PlayoutError::invalid_configuration(format!(
                    "{name} must be a positive duration, got {value}"
                )));
            }
        }

        if frame_duration_for(self.default_fps).is_none() {
            return Err(PlayoutError::invalid_configuration(format!(
                "defaultFps must be positive with a representable frame period, got {}",
                self.default_fps
            )));
        }

        if self.quality_miss_threshold == 0 {
            return Err(PlayoutError::invalid_configuration(
                "qualityMissThreshold must be at least 1",
            ));
        }

        Ok(())
    }

    // Accessors saturate rather than panic on configs that skipped `validate`

    pub fn min_depth(&self) -> Duration {
        seconds_or(self.min_depth_seconds, Duration::ZERO)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        seconds_or(self.cleanup_timeout_seconds, Duration::MAX)
    }

    pub fn cleanup_interval(&self) -> Duration {
        seconds_or(self.cleanup_interval_seconds, Duration::from_millis(1500))
    }

    pub fn default_frame_duration(&self) -> Duration {
        frame_duration_for(self.default_fps).unwrap_or(FALLBACK_FRAME_DURATION)
    }
}

fn seconds_or(seconds: f64, fallback: Duration) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(fallback)
}
