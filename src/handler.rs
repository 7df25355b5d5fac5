//! Per-variant stream handling.
//!
//! A [`StreamHandler`] owns everything needed to turn one variant's payloads into decoded
//! images: the depacketizer picked for its codec, an optional jitter buffer with its
//! dequeue task, the name gate, the decoder session, and the single-slot cache the
//! simulreceive engine reads from.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{CodecRegistry, Decoder, DecoderFactory, DecoderOutput, Depacketizer, RenderSink};
use crate::config::{JitterMode, PlayoutConfig};
use crate::driver::Driver;
use crate::gate::{GapPolicy, NameGate};
use crate::jitter::{SharedJitterBuffer, WriteRejected};
use crate::metrics::{MetricField, Metrics};
use crate::pacer::Pacer;
use crate::types::{DecodedFrame, DecodedImage, FrameUnit, FullTrackName, VariantProfile, frame_duration_for};
use crate::{PlayoutError, Result};

/// Where the handler's media clock was pinned to the wall clock.
#[derive(Debug, Clone, Copy)]
struct TimeAnchor {
    wall: Instant,
    media: Duration,
}

impl TimeAnchor {
    fn deadline(&self, timestamp: Duration) -> Instant {
        if timestamp >= self.media {
            self.wall + (timestamp - self.media)
        } else {
            self.wall.checked_sub(self.media - timestamp).unwrap_or(self.wall)
        }
    }
}

/// What a unit carried into the decoder, matched back up by timestamp on output.
#[derive(Debug, Clone, Copy)]
struct UnitMeta {
    fps: f64,
    discontinuous: bool,
}

struct DecodeState {
    gate: NameGate,
    decoder: Box<dyn Decoder>,
}

/// State of a handler's decoded-image slot as seen by the simulreceive engine
#[derive(Debug, Clone)]
pub enum SlotState {
    Empty,
    /// The image was not newer than the last displayed one and has been discarded
    Stale,
    Fresh(Arc<DecodedImage>),
}

/// Pipeline for one encoded variant of a source.
pub struct StreamHandler {
    profile: VariantProfile,
    config: Arc<PlayoutConfig>,
    depacketizer: Arc<dyn Depacketizer>,
    decode: Mutex<DecodeState>,
    buffer: OnceLock<Arc<SharedJitterBuffer>>,
    anchor: Mutex<Option<TimeAnchor>>,
    pending: Mutex<BTreeMap<Duration, UnitMeta>>,
    slot: Mutex<Option<Arc<DecodedImage>>>,
    last_update: Mutex<Instant>,
    sink: Arc<dyn RenderSink>,
    metrics: Metrics,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl StreamHandler {
    /// Create a handler for `profile` and start its decoder inbox task.
    ///
    /// Fails if no depacketizer is registered for the profile's codec or the decoder
    /// cannot be created. `cancel` should be a child of the owning subscription's token.
    pub async fn create(
        profile: VariantProfile,
        config: Arc<PlayoutConfig>,
        codecs: &CodecRegistry,
        decoders: &dyn DecoderFactory,
        sink: Arc<dyn RenderSink>,
        metrics: Metrics,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>> {
        let depacketizer = codecs.get(profile.codec)?;
        let (output, inbox) = DecoderOutput::channel();
        let decoder = decoders
            .create(&profile, output)
            .await
            .map_err(|e| PlayoutError::decoder_creation(profile.track.clone(), e))?;

        let gate = NameGate::new(config.name_gate);
        let handler = Arc::new(Self {
            metrics: metrics.scoped(profile.track.to_string()),
            profile,
            config,
            depacketizer,
            decode: Mutex::new(DecodeState { gate, decoder }),
            buffer: OnceLock::new(),
            anchor: Mutex::new(None),
            pending: Mutex::new(BTreeMap::new()),
            slot: Mutex::new(None),
            last_update: Mutex::new(Instant::now()),
            sink,
            cancel,
            tasks: TaskTracker::new(),
        });

        Driver::spawn_inbox(Arc::clone(&handler), inbox);
        info!(track = %handler.track(), jitter = ?handler.config.jitter_mode, "Stream handler created");
        Ok(handler)
    }

    pub fn track(&self) -> &FullTrackName {
        &self.profile.track
    }

    pub fn profile(&self) -> &VariantProfile {
        &self.profile
    }

    /// Accept one payload from the transport.
    ///
    /// Buffered modes create the jitter buffer and dequeue task on the first payload,
    /// learning the frame rate from it. Unbuffered modes decode inline; every unit of the
    /// payload is attempted and the first decode error is returned. Stale or duplicate
    /// units are counted, not returned as errors.
    pub fn submit_encoded_data(self: &Arc<Self>, payload: &[u8], group_id: u32, object_id: u16) -> Result<()> {
        *self.last_update.lock() = Instant::now();

        let units = self
            .depacketizer
            .depacketize(payload, group_id, object_id)
            .map_err(|e| PlayoutError::depacketize(self.track().clone(), e))?;

        if let Some(first) = units.first() {
            self.anchor.lock().get_or_insert_with(|| {
                debug!(track = %self.track(), timestamp = ?first.timestamp, "Media clock anchored");
                TimeAnchor { wall: Instant::now(), media: first.timestamp }
            });
        }

        if !self.config.jitter_mode.is_buffered() {
            // One bad unit must not cost the rest of the payload
            let mut first_error = None;
            for unit in units {
                if let Err(e) = self.decode(unit) {
                    error!(track = %self.track(), "Decode failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
            return first_error.map_or(Ok(()), Err);
        }

        let buffer = self.buffer.get_or_init(|| self.start_buffering(&units));
        for unit in units {
            match buffer.write(unit) {
                Ok(()) => {}
                Err(WriteRejected::TooOld { sequence, last_read }) => {
                    trace!(track = %self.track(), sequence, last_read, "Late unit dropped");
                    self.metrics.count(MetricField::RejectedTooOld);
                }
                Err(WriteRejected::Duplicate { .. }) => self.metrics.count(MetricField::Duplicate),
                Err(rejected @ WriteRejected::Full { .. }) => {
                    warn!(track = %self.track(), %rejected, "Unit dropped");
                    self.metrics.count(MetricField::Dropped);
                }
            }
        }
        Ok(())
    }

    fn start_buffering(self: &Arc<Self>, units: &[FrameUnit]) -> Arc<SharedJitterBuffer> {
        let frame_duration = units
            .iter()
            .find_map(|u| u.fps.and_then(frame_duration_for))
            .unwrap_or_else(|| self.profile.frame_duration());

        let buffer = Arc::new(SharedJitterBuffer::new(self.config.min_depth(), frame_duration));
        match Pacer::for_config(&self.config, frame_duration) {
            Some(pacer) => Driver::spawn_dequeue(Arc::clone(self), Arc::clone(&buffer), pacer),
            None => warn!(track = %self.track(), "Buffered mode without a pacer, buffer will not drain"),
        }

        debug!(
            track = %self.track(),
            ?frame_duration,
            min_depth = ?self.config.min_depth(),
            "Jitter buffer created"
        );
        buffer
    }

    /// Pass a unit through the name gate and on to the decoder.
    pub(crate) fn decode(&self, mut unit: FrameUnit) -> Result<()> {
        let mut state = self.decode.lock();

        if !state.gate.check(unit.group_id, unit.object_id) {
            self.metrics.count(MetricField::GateRejected);
            debug!(
                track = %self.track(),
                group = unit.group_id,
                object = unit.object_id,
                last = ?state.gate.last(),
                policy = ?self.config.gap_policy,
                "Name gate rejected unit"
            );

            if let Some(buffer) = self.buffer.get() {
                let flushed = buffer.flush_to(unit.group_id.saturating_add(1));
                if flushed > 0 {
                    self.metrics.record(MetricField::Flushed, flushed as f64);
                }
            }

            match self.config.gap_policy {
                GapPolicy::Freeze => return Ok(()),
                GapPolicy::Artifact => unit.discontinuous = true,
            }
        }

        state.gate.accept(unit.group_id, unit.object_id);
        self.pending.lock().insert(
            unit.timestamp,
            UnitMeta { fps: unit.fps.unwrap_or(self.profile.fps), discontinuous: unit.discontinuous },
        );
        self.metrics.count(MetricField::Decoded);

        state.decoder.submit(unit).map_err(|e| PlayoutError::decode(self.track().clone(), e))
    }

    /// Handle a frame posted by the decoder.
    pub(crate) fn on_decoded(&self, frame: DecodedFrame) {
        let meta = {
            let mut pending = self.pending.lock();
            // Anything older than this frame will never come back out
            let mut newer = pending.split_off(&frame.timestamp);
            let meta = newer.remove(&frame.timestamp);
            *pending = newer;
            meta
        }
        .unwrap_or(UnitMeta { fps: self.profile.fps, discontinuous: false });

        let orientation = frame.orientation;
        let image = Arc::new(DecodedImage {
            track: self.track().clone(),
            frame,
            fps: meta.fps,
            discontinuous: meta.discontinuous,
        });
        trace!(track = %self.track(), timestamp = ?image.timestamp(), "Decoded image ready");

        let mode = self.config.simulreceive_mode;
        if mode.uses_engine() {
            let previous = self.slot.lock().replace(Arc::clone(&image));
            if previous.is_some() && !mode.forwards_directly() {
                self.metrics.count(MetricField::Dropped);
            }
        }

        if mode.forwards_directly() {
            let display_immediately = self.config.jitter_mode != JitterMode::PerLayer;
            self.sink.enqueue(image, display_immediately, orientation);
            self.metrics.count(MetricField::Rendered);
        }
    }

    /// Look at the decoded-image slot for the simulreceive engine.
    ///
    /// An image not newer than `last_displayed` can never be shown and is cleared.
    pub fn candidate(&self, last_displayed: Option<Duration>) -> SlotState {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            None => SlotState::Empty,
            Some(image) if last_displayed.is_some_and(|shown| image.timestamp() <= shown) => {
                *slot = None;
                SlotState::Stale
            }
            Some(image) => SlotState::Fresh(Arc::clone(image)),
        }
    }

    /// Clear the slot if it still holds the image at `timestamp`.
    pub fn consume(&self, timestamp: Duration) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|image| image.timestamp() == timestamp) {
            *slot = None;
        }
    }

    /// Time from `now` until the next buffered unit is due.
    ///
    /// The deadline is the unit's timestamp mapped through the wall-clock anchor taken
    /// from the first unit this handler saw, plus the buffer's playout delay. `None` until
    /// the anchor exists or while nothing is buffered.
    pub fn calculate_wait_time(&self, now: Instant) -> Option<Duration> {
        let anchor = (*self.anchor.lock())?;
        let buffer = self.buffer.get()?;
        let next = buffer.peek_timestamp()?;
        let deadline = anchor.deadline(next) + buffer.min_depth();
        Some(deadline.saturating_duration_since(now))
    }

    /// Nominal frame duration, learned from the stream once buffering starts
    pub fn frame_duration(&self) -> Duration {
        match self.buffer.get() {
            Some(buffer) => buffer.frame_duration(),
            None => self.profile.frame_duration(),
        }
    }

    /// Wait until this handler's next frame is due, or one frame if unknown
    pub fn next_wait(&self, now: Instant) -> Duration {
        self.calculate_wait_time(now).unwrap_or_else(|| self.frame_duration())
    }

    /// Time since the last payload arrived (or since creation)
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_update.lock())
    }

    pub fn buffer(&self) -> Option<&Arc<SharedJitterBuffer>> {
        self.buffer.get()
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel this handler's tasks and wait for them to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(track = %self.track(), "Stream handler stopped");
    }
}

impl std::fmt::Debug for StreamHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandler")
            .field("track", &self.profile.track)
            .field("buffered", &self.buffer.get().is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
