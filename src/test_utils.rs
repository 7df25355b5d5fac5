//! Test doubles for the codec, render and metrics seams
//!
//! The fakes here stand in for platform depacketizers, hardware decoders and display
//! surfaces in unit tests and benchmarks.
//!
//! Payloads built with [`payload`] carry a 12-byte header: the presentation timestamp
//! in microseconds (big-endian `u64`) and an fps hint in millihertz (big-endian `u32`,
//! zero for none). [`HeaderDepacketizer`] parses it back into one [`FrameUnit`].

#![cfg(any(test, feature = "benchmark"))]

use anyhow::{bail, ensure};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::codec::{Decoder, DecoderFactory, DecoderOutput, Depacketizer, RenderSink};
use crate::metrics::{MetricField, MetricsSink};
use crate::types::{
    CodecKind, DecodedFrame, DecodedImage, FrameUnit, FullTrackName, Orientation, SourceManifest, VariantProfile,
};

/// Namespace used by [`profile`] and [`manifest`]
pub const TEST_NAMESPACE: &str = "cam";

const HEADER_LEN: usize = 12;

/// Build a payload for [`HeaderDepacketizer`]
pub fn payload(timestamp: Duration, fps: Option<f64>) -> Vec<u8> {
    let micros = u64::try_from(timestamp.as_micros()).unwrap_or(u64::MAX);
    let millihertz = fps.map(|fps| (fps * 1000.0).round() as u32).unwrap_or(0);

    let mut bytes = Vec::with_capacity(HEADER_LEN + 4);
    bytes.extend_from_slice(&micros.to_be_bytes());
    bytes.extend_from_slice(&millihertz.to_be_bytes());
    bytes.extend_from_slice(b"unit");
    bytes
}

/// H.264 profile in [`TEST_NAMESPACE`] with a 16:9 height
pub fn profile(name: &str, width: u32, fps: f64) -> VariantProfile {
    VariantProfile {
        track: FullTrackName::new(TEST_NAMESPACE, name),
        codec: CodecKind::H264,
        width,
        height: width * 9 / 16,
        fps,
    }
}

/// Manifest of `(name, width, fps)` variants
pub fn manifest(source_id: &str, variants: &[(&str, u32, f64)]) -> SourceManifest {
    SourceManifest {
        source_id: source_id.to_string(),
        variants: variants.iter().map(|(name, width, fps)| profile(name, *width, *fps)).collect(),
    }
}

pub fn track(name: &str) -> FullTrackName {
    FullTrackName::new(TEST_NAMESPACE, name)
}

/// Depacketizer for payloads built with [`payload`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderDepacketizer;

impl Depacketizer for HeaderDepacketizer {
    fn depacketize(&self, payload: &[u8], group_id: u32, object_id: u16) -> anyhow::Result<Vec<FrameUnit>> {
        ensure!(payload.len() >= HEADER_LEN, "payload of {} bytes has no header", payload.len());

        let (micros, rest) = payload.split_at(8);
        let (millihertz, body) = rest.split_at(4);
        let Ok(micros) = <[u8; 8]>::try_from(micros) else { bail!("bad timestamp") };
        let Ok(millihertz) = <[u8; 4]>::try_from(millihertz) else { bail!("bad fps") };

        let timestamp = Duration::from_micros(u64::from_be_bytes(micros));
        let mut unit = FrameUnit::new(group_id, object_id, timestamp, body.to_vec());
        let millihertz = u32::from_be_bytes(millihertz);
        if millihertz > 0 {
            unit = unit.with_fps(f64::from(millihertz) / 1000.0);
        }
        Ok(vec![unit])
    }
}

/// Decoder factory whose decoders echo each unit back as a frame of the profile's size.
#[derive(Debug, Default)]
pub struct EchoDecoderFactory {
    failing: Mutex<HashSet<String>>,
    created: AtomicUsize,
    orientation: Orientation,
    corrupt: Arc<Mutex<HashSet<Duration>>>,
}

impl EchoDecoderFactory {
    /// Factory that refuses to create decoders for the named variants
    pub fn failing_for<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let factory = Self::default();
        factory.failing.lock().extend(names.into_iter().map(str::to_string));
        factory
    }

    /// Decoders report every frame with `orientation`
    pub fn with_orientation(mut self, orientation: Orientation) -> Self {
        self.orientation = orientation;
        self
    }

    /// Decoders fail on the unit with this timestamp
    pub fn corrupt_at(&self, timestamp: Duration) {
        self.corrupt.lock().insert(timestamp);
    }

    pub fn set_failing(&self, name: &str, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    /// Decoders created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DecoderFactory for EchoDecoderFactory {
    async fn create(&self, profile: &VariantProfile, output: DecoderOutput) -> anyhow::Result<Box<dyn Decoder>> {
        if self.failing.lock().contains(&profile.track.name) {
            bail!("no decoder available for {}", profile.track);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(EchoDecoder {
            width: profile.width,
            height: profile.height,
            orientation: self.orientation,
            corrupt: Arc::clone(&self.corrupt),
            output,
        }))
    }
}

struct EchoDecoder {
    width: u32,
    height: u32,
    orientation: Orientation,
    corrupt: Arc<Mutex<HashSet<Duration>>>,
    output: DecoderOutput,
}

impl Decoder for EchoDecoder {
    fn submit(&mut self, unit: FrameUnit) -> anyhow::Result<()> {
        ensure!(!self.corrupt.lock().contains(&unit.timestamp), "corrupt unit at {:?}", unit.timestamp);
        let mut frame = DecodedFrame::new(unit.timestamp, self.width, self.height, unit.payload.to_vec());
        frame.orientation = self.orientation;
        ensure!(self.output.deliver(frame), "decoder output closed");
        Ok(())
    }
}

/// An image handed to a [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct Rendered {
    pub track: FullTrackName,
    pub timestamp: Duration,
    pub width: u32,
    pub discontinuous: bool,
    pub display_immediately: bool,
    pub orientation: Orientation,
}

/// Render sink that records everything it is given.
#[derive(Debug, Default)]
pub struct RecordingSink {
    rendered: Mutex<Vec<Rendered>>,
    removed: AtomicUsize,
}

impl RecordingSink {
    pub fn rendered(&self) -> Vec<Rendered> {
        self.rendered.lock().clone()
    }

    /// Widths of rendered images, in order
    pub fn widths(&self) -> Vec<u32> {
        self.rendered.lock().iter().map(|r| r.width).collect()
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl RenderSink for RecordingSink {
    fn enqueue(&self, image: Arc<DecodedImage>, display_immediately: bool, orientation: Orientation) {
        self.rendered.lock().push(Rendered {
            track: image.track.clone(),
            timestamp: image.timestamp(),
            width: image.width(),
            discontinuous: image.discontinuous,
            display_immediately,
            orientation,
        });
    }

    fn remove(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Metrics sink that keeps every measurement.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    records: Mutex<Vec<(String, MetricField, f64)>>,
}

impl RecordingMetrics {
    /// Number of measurements of `field`
    pub fn count(&self, field: MetricField) -> usize {
        self.records.lock().iter().filter(|(_, f, _)| *f == field).count()
    }

    /// Sum of the values recorded for `field`
    pub fn total(&self, field: MetricField) -> f64 {
        self.records.lock().iter().filter(|(_, f, _)| *f == field).map(|(_, _, v)| v).sum()
    }

    /// Labels that reported `field`
    pub fn labels(&self, field: MetricField) -> HashSet<String> {
        self.records.lock().iter().filter(|(_, f, _)| *f == field).map(|(label, _, _)| label.clone()).collect()
    }
}

impl MetricsSink for RecordingMetrics {
    fn record(&self, label: &str, field: MetricField, value: f64, _at: Instant) {
        self.records.lock().push((label.to_string(), field, value));
    }
}
