//! Ordered, bounded jitter buffer keyed by group/object sequence

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::types::FrameUnit;

/// Slack for comparing accumulated depth with the prefill target. Frame durations such
/// as 1/30s are not representable in whole nanoseconds, so N of them can land a few
/// nanoseconds short of the intended total.
const DEPTH_TOLERANCE: Duration = Duration::from_micros(1);

/// Capacity in multiples of the prefill frame count.
const CAPACITY_FACTOR: usize = 10;

const MIN_CAPACITY: usize = 16;

/// Why a write was refused. These are expected outcomes under reordering and loss.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRejected {
    #[error("sequence {sequence} is not newer than last read sequence {last_read}")]
    TooOld { sequence: u64, last_read: u64 },

    #[error("sequence {sequence} is already buffered")]
    Duplicate { sequence: u64 },

    #[error("buffer is full and sequence {sequence} is older than every buffered unit")]
    Full { sequence: u64 },
}

/// Counters describing buffer behaviour since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub written: u64,
    pub read: u64,
    pub rejected_too_old: u64,
    pub duplicates: u64,
    /// Units evicted because the buffer was full
    pub overflowed: u64,
    pub flushed: u64,
    /// Reads that found the buffer empty after playout started
    pub underruns: u64,
}

/// Jitter buffer for one stream variant.
///
/// Units are kept sorted by [`FrameUnit::sequence`]. Reading is refused until the buffered
/// duration first reaches `min_depth`; after that the buffer plays out until empty and
/// never re-enters prefill. Once a sequence has been read, nothing at or below it is
/// accepted again.
///
/// This type is not synchronised. [`super::SharedJitterBuffer`] wraps it in a lock for
/// the writer/reader split between network arrival and the dequeue task.
#[derive(Debug)]
pub struct JitterBuffer {
    units: BTreeMap<u64, FrameUnit>,
    frame_duration: Duration,
    min_depth: Duration,
    capacity: usize,
    last_sequence_read: Option<u64>,
    playing: bool,
    depth: Duration,
    stats: BufferStats,
}

impl JitterBuffer {
    /// Create a buffer sized for `min_depth` of `frame_duration` frames.
    pub fn new(min_depth: Duration, frame_duration: Duration) -> Self {
        let prefill_frames = if frame_duration.is_zero() {
            0
        } else {
            (min_depth.as_secs_f64() / frame_duration.as_secs_f64()).ceil() as usize
        };
        let capacity = (prefill_frames * CAPACITY_FACTOR).max(MIN_CAPACITY);
        Self::with_capacity(min_depth, frame_duration, capacity)
    }

    /// Create a buffer with an explicit capacity (at least one unit).
    pub fn with_capacity(min_depth: Duration, frame_duration: Duration, capacity: usize) -> Self {
        Self {
            units: BTreeMap::new(),
            frame_duration,
            min_depth,
            capacity: capacity.max(1),
            last_sequence_read: None,
            playing: min_depth.is_zero(),
            depth: Duration::ZERO,
            stats: BufferStats::default(),
        }
    }

    /// Insert a unit in sequence order.
    pub fn write(&mut self, unit: FrameUnit) -> Result<(), WriteRejected> {
        let sequence = unit.sequence();

        if let Some(last_read) = self.last_sequence_read {
            if sequence <= last_read {
                self.stats.rejected_too_old += 1;
                trace!(sequence, last_read, "Rejecting stale unit");
                return Err(WriteRejected::TooOld { sequence, last_read });
            }
        }

        if self.units.contains_key(&sequence) {
            self.stats.duplicates += 1;
            return Err(WriteRejected::Duplicate { sequence });
        }

        if self.units.len() >= self.capacity {
            let oldest = match self.units.first_key_value() {
                Some((&oldest, _)) => oldest,
                None => return Err(WriteRejected::Full { sequence }),
            };
            if sequence < oldest {
                return Err(WriteRejected::Full { sequence });
            }
            // Treat the evicted unit as consumed so the read barrier still holds
            if let Some(evicted) = self.units.remove(&oldest) {
                self.depth = self.depth.saturating_sub(evicted.nominal_duration(self.frame_duration));
                self.last_sequence_read = Some(oldest);
                self.stats.overflowed += 1;
                warn!(evicted = oldest, capacity = self.capacity, "Jitter buffer full, evicting oldest unit");
            }
        }

        self.depth += unit.nominal_duration(self.frame_duration);
        self.units.insert(sequence, unit);
        self.stats.written += 1;

        if !self.playing && self.depth + DEPTH_TOLERANCE >= self.min_depth {
            self.playing = true;
            debug!(depth = ?self.depth, units = self.units.len(), "Prefill complete, starting playout");
        }

        Ok(())
    }

    /// Pop the lowest-sequence unit once playout has started.
    pub fn read(&mut self) -> Option<FrameUnit> {
        if !self.playing {
            return None;
        }

        match self.units.pop_first() {
            Some((sequence, unit)) => {
                self.depth = self.depth.saturating_sub(unit.nominal_duration(self.frame_duration));
                self.last_sequence_read = Some(sequence);
                self.stats.read += 1;
                Some(unit)
            }
            None => {
                self.stats.underruns += 1;
                None
            }
        }
    }

    /// Discard every unit whose group is older than `target_group`.
    ///
    /// Returns the number of units discarded.
    pub fn flush_to(&mut self, target_group: u32) -> usize {
        let mut flushed = 0;
        while let Some(entry) = self.units.first_entry() {
            if entry.get().group_id >= target_group {
                break;
            }
            let (sequence, unit) = entry.remove_entry();
            self.depth = self.depth.saturating_sub(unit.nominal_duration(self.frame_duration));
            self.last_sequence_read = Some(sequence);
            flushed += 1;
        }

        if flushed > 0 {
            self.stats.flushed += flushed as u64;
            debug!(target_group, flushed, "Flushed jitter buffer");
        }
        flushed
    }

    /// Look at the next unit without removing it
    pub fn peek(&self) -> Option<&FrameUnit> {
        self.units.first_key_value().map(|(_, unit)| unit)
    }

    /// Sum of the buffered units' nominal durations
    pub fn depth(&self) -> Duration {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Whether the prefill target has been reached
    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn last_sequence_read(&self) -> Option<u64> {
        self.last_sequence_read
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn min_depth(&self) -> Duration {
        self.min_depth
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }
}
