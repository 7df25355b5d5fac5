//! Frame units awaiting ordering

use std::sync::Arc;
use std::time::Duration;

/// An encoded media unit keyed by its group/object name.
///
/// This is the fundamental data unit that flows from the depacketizer, through the jitter
/// buffer, into the decoder. Ordering uses [`FrameUnit::sequence`]; pacing uses
/// `timestamp`, which lives on the media clock and is unrelated to arrival time.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameUnit {
    /// Group number, typically one GOP
    pub group_id: u32,

    /// Object number within the group
    pub object_id: u16,

    /// Encoded bytes (zero-copy via Arc)
    pub payload: Arc<[u8]>,

    /// Presentation timestamp on the media clock
    pub timestamp: Duration,

    /// In-band frame rate hint, overriding the configured default
    pub fps: Option<f64>,

    /// Set when this unit is not contiguous with the previously accepted unit
    pub discontinuous: bool,
}

impl FrameUnit {
    /// Create a new contiguous frame unit with no fps hint
    pub fn new(group_id: u32, object_id: u16, timestamp: Duration, payload: Vec<u8>) -> Self {
        Self {
            group_id,
            object_id,
            payload: payload.into(),
            timestamp,
            fps: None,
            discontinuous: false,
        }
    }

    /// Attach an in-band fps hint
    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    /// Ordering key: `(group_id << 16) | object_id`
    pub fn sequence(&self) -> u64 {
        sequence_of(self.group_id, self.object_id)
    }

    /// Nominal on-screen duration of this unit.
    ///
    /// Uses the fps hint when present and sane, otherwise `default`.
    pub fn nominal_duration(&self, default: Duration) -> Duration {
        self.fps.and_then(frame_duration_for).unwrap_or(default)
    }
}

/// Frame duration assumed when no usable frame rate is known (30 fps)
pub const FALLBACK_FRAME_DURATION: Duration = Duration::from_nanos(33_333_333);

/// Frame duration at `fps`, or `None` if the rate is not positive or its period does not
/// fit in a non-zero [`Duration`].
pub fn frame_duration_for(fps: f64) -> Option<Duration> {
    if !(fps.is_finite() && fps > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / fps).ok().filter(|d| !d.is_zero())
}

/// Pack a group/object pair into a sequence number
pub fn sequence_of(group_id: u32, object_id: u16) -> u64 {
    (u64::from(group_id) << 16) | u64::from(object_id)
}
