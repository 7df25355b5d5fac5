//! Decoded image types

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{FullTrackName, frame_duration_for};

/// Display transform applied by the render sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Orientation {
    #[default]
    Up,
    Down,
    Left,
    Right,
}

/// Output of a decoder, before the owning handler stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Presentation timestamp of the unit that produced this frame
    pub timestamp: Duration,

    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,

    /// Pixel data or an opaque platform handle
    pub data: Arc<[u8]>,
}

impl DecodedFrame {
    pub fn new(timestamp: Duration, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self { timestamp, width, height, orientation: Orientation::Up, data: data.into() }
    }
}

/// A decoded frame tagged by the stream handler that owns it.
///
/// This is what sits in a handler's single-slot cache and what the simulreceive engine
/// compares across variants.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /// Variant that produced the image
    pub track: FullTrackName,

    pub frame: DecodedFrame,

    /// Nominal frame rate of the unit
    pub fps: f64,

    /// True if a gap preceded the unit this image was decoded from
    pub discontinuous: bool,
}

impl DecodedImage {
    pub fn timestamp(&self) -> Duration {
        self.frame.timestamp
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    /// Nominal duration of the image on screen
    pub fn frame_duration(&self) -> Duration {
        frame_duration_for(self.fps).unwrap_or(Duration::ZERO)
    }
}
