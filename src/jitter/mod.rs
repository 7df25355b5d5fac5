//! Jitter buffering for encoded frame units.
//!
//! [`JitterBuffer`] holds the ordering, prefill and read-barrier logic and is driven with
//! `&mut self`. [`SharedJitterBuffer`] puts one lock around it so the network path can
//! write while a dequeue task reads.
//!
//! ```rust
//! use playout::jitter::{SharedJitterBuffer, WriteRejected};
//! use playout::types::FrameUnit;
//! use std::time::Duration;
//!
//! let buffer = SharedJitterBuffer::new(Duration::ZERO, Duration::from_millis(33));
//! buffer.write(FrameUnit::new(1, 0, Duration::ZERO, vec![1])).unwrap();
//! assert!(buffer.read().is_some());
//!
//! // Already played out
//! let stale = buffer.write(FrameUnit::new(1, 0, Duration::ZERO, vec![1]));
//! assert!(matches!(stale, Err(WriteRejected::TooOld { .. })));
//! ```

mod buffer;

pub use buffer::{BufferStats, JitterBuffer, WriteRejected};

use parking_lot::Mutex;
use std::time::Duration;

use crate::types::FrameUnit;

/// A [`JitterBuffer`] behind a single lock.
#[derive(Debug)]
pub struct SharedJitterBuffer {
    inner: Mutex<JitterBuffer>,
}

impl SharedJitterBuffer {
    pub fn new(min_depth: Duration, frame_duration: Duration) -> Self {
        Self::from_buffer(JitterBuffer::new(min_depth, frame_duration))
    }

    pub fn from_buffer(buffer: JitterBuffer) -> Self {
        Self { inner: Mutex::new(buffer) }
    }

    pub fn write(&self, unit: FrameUnit) -> Result<(), WriteRejected> {
        self.inner.lock().write(unit)
    }

    pub fn read(&self) -> Option<FrameUnit> {
        self.inner.lock().read()
    }

    pub fn flush_to(&self, target_group: u32) -> usize {
        self.inner.lock().flush_to(target_group)
    }

    pub fn depth(&self) -> Duration {
        self.inner.lock().depth()
    }

    /// Presentation timestamp of the next unit to be read
    pub fn peek_timestamp(&self) -> Option<Duration> {
        self.inner.lock().peek().map(|unit| unit.timestamp)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.lock().is_playing()
    }

    pub fn min_depth(&self) -> Duration {
        self.inner.lock().min_depth()
    }

    pub fn frame_duration(&self) -> Duration {
        self.inner.lock().frame_duration()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats()
    }
}
