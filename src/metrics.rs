//! Metrics reporting.
//!
//! Every component receives a [`Metrics`] handle at construction; there is no global
//! registry. The default sink is [`NoopMetrics`], and the pipeline behaves identically
//! with or without a real sink attached.

use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;

/// Measurements the pipeline reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricField {
    /// Buffered duration in seconds, sampled each dequeue cycle
    BufferDepth,
    /// Read found a playing buffer empty
    Underrun,
    /// Write rejected as already played out
    RejectedTooOld,
    /// Write rejected as already buffered
    Duplicate,
    /// Units discarded by a flush after a gap
    Flushed,
    /// Unit rejected by the name gate
    GateRejected,
    /// Unit handed to the decoder
    Decoded,
    /// Decoded image handed to the render sink
    Rendered,
    /// Step-down damped instead of rendered
    QualityMiss,
    /// Decoded image already stale when the engine looked at it
    PauseMiss,
    /// Decoded image discarded without being displayed
    Dropped,
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MetricField::BufferDepth => "buffer_depth",
            MetricField::Underrun => "underrun",
            MetricField::RejectedTooOld => "rejected_too_old",
            MetricField::Duplicate => "duplicate",
            MetricField::Flushed => "flushed",
            MetricField::GateRejected => "gate_rejected",
            MetricField::Decoded => "decoded",
            MetricField::Rendered => "rendered",
            MetricField::QualityMiss => "quality_miss",
            MetricField::PauseMiss => "pause_miss",
            MetricField::Dropped => "dropped",
        };
        f.write_str(name)
    }
}

/// Destination for measurements. Implementations must not block.
pub trait MetricsSink: Send + Sync + 'static {
    fn record(&self, label: &str, field: MetricField, value: f64, at: Instant);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _label: &str, _field: MetricField, _value: f64, _at: Instant) {}
}

/// A sink bound to the label of the component reporting through it.
#[derive(Clone)]
pub struct Metrics {
    sink: Arc<dyn MetricsSink>,
    label: Arc<str>,
}

impl Metrics {
    pub fn new(sink: Arc<dyn MetricsSink>, label: impl Into<Arc<str>>) -> Self {
        Self { sink, label: label.into() }
    }

    pub fn disabled() -> Self {
        Self::new(Arc::new(NoopMetrics), "")
    }

    /// Same sink, different label
    pub fn scoped(&self, label: impl Into<Arc<str>>) -> Self {
        Self { sink: Arc::clone(&self.sink), label: label.into() }
    }

    pub fn record(&self, field: MetricField, value: f64) {
        self.sink.record(&self.label, field, value, Instant::now());
    }

    /// Record a single occurrence
    pub fn count(&self, field: MetricField) {
        self.record(field, 1.0);
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").field("label", &self.label).finish_non_exhaustive()
    }
}
