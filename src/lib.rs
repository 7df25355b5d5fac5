//! Receive-side adaptive video playout.
//!
//! Playout takes encoded video payloads as they arrive from a low-latency pub/sub
//! transport, absorbs network jitter, paces frames into a decoder, and when a source is
//! published in several simultaneous variants picks which one to show on every render
//! tick.
//!
//! # Features
//!
//! - **Jitter buffering**: ordered by group/object name, prefilled to a minimum depth,
//!   with a monotonic read barrier and gap flushing
//! - **Pacing**: PID control of buffer depth, or fixed-interval dequeue
//! - **Simulreceive**: per-tick selection of the oldest instant at the highest
//!   resolution, with damping of quality downgrades
//! - **Lifecycle**: idle variants are swept and transparently recreated
//!
//! Depacketizing, decoding and rendering are supplied by the caller through the traits
//! in [`codec`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use playout::{Collaborators, Playout, PlayoutConfig, SourceManifest};
//!
//! # async fn run(collaborators: Collaborators, payload: Vec<u8>) -> playout::Result<()> {
//! let manifest = SourceManifest::from_file("alice.yaml")?;
//! let config = PlayoutConfig::from_file("playout.yaml")?;
//! let track = manifest.variants[0].track.clone();
//!
//! let subscription = Playout::subscribe(manifest, config, collaborators).await?;
//! subscription.on_payload(&track, &payload, 0, 0).await?;
//!
//! subscription.unsubscribe().await;
//! # Ok(())
//! # }
//! ```

// Core types and error handling
pub mod config;
mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod types;

// Receive pipeline
pub mod codec;
pub mod gate;
pub mod jitter;
pub mod metrics;
pub mod pacer;

// Orchestration
pub mod driver;
pub mod handler;
pub mod simulreceive;
pub mod subscription;

pub use config::{JitterMode, PlayoutConfig, SimulreceiveMode};
pub use error::*;
pub use types::*;

pub use codec::{CodecRegistry, Decoder, DecoderFactory, DecoderOutput, Depacketizer, RenderSink};
pub use handler::StreamHandler;
pub use jitter::{JitterBuffer, SharedJitterBuffer, WriteRejected};
pub use metrics::{MetricField, MetricsSink, NoopMetrics};
pub use subscription::{Collaborators, SelectedVariant, Subscription, SubscriptionStatus};

/// Entry point for playout subscriptions.
pub struct Playout;

impl Playout {
    /// Subscribe to every variant of a source.
    ///
    /// Validates `config` and `manifest`, creates a stream handler per variant, and starts
    /// the idle sweep. The render task starts with the first payload.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The configuration is invalid, e.g. simulreceive with per-layer buffering
    /// - The manifest is empty or lists a variant twice
    /// - No depacketizer is registered for a variant's codec
    pub async fn subscribe(
        manifest: SourceManifest,
        config: PlayoutConfig,
        collaborators: Collaborators,
    ) -> Result<Subscription> {
        Subscription::subscribe(manifest, config, collaborators).await
    }

    /// Subscribe to a subset of a source's variants.
    ///
    /// Fails with [`PlayoutError::MissingProfile`] if a listed track is not in the
    /// manifest.
    pub async fn subscribe_to(
        manifest: SourceManifest,
        tracks: &[FullTrackName],
        config: PlayoutConfig,
        collaborators: Collaborators,
    ) -> Result<Subscription> {
        Subscription::subscribe_to(manifest, tracks, config, collaborators).await
    }
}
