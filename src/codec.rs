//! Seams to the codec and rendering collaborators.
//!
//! Bitstream parsing, hardware decode and rendering live outside this crate. They plug in
//! through the traits here:
//!
//! - [`Depacketizer`]: raw payload bytes to timestamped [`FrameUnit`]s, one per codec,
//!   chosen once per stream handler through a [`CodecRegistry`]
//! - [`DecoderFactory`] / [`Decoder`]: frame units in, [`DecodedFrame`]s posted
//!   asynchronously to the handler's inbox through a [`DecoderOutput`]
//! - [`RenderSink`]: where selected images go

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::{CodecKind, DecodedFrame, DecodedImage, FrameUnit, Orientation, VariantProfile};
use crate::{PlayoutError, Result};

/// Codec-specific payload parser.
pub trait Depacketizer: Send + Sync + 'static {
    /// Split one payload into decodable units.
    ///
    /// Units inherit `group_id`/`object_id`; the parser supplies the presentation
    /// timestamp and, when the bitstream carries one, an fps hint.
    fn depacketize(&self, payload: &[u8], group_id: u32, object_id: u16) -> anyhow::Result<Vec<FrameUnit>>;
}

/// Depacketizers by codec.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    depacketizers: HashMap<CodecKind, Arc<dyn Depacketizer>>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the depacketizer for `codec`, replacing any previous one
    pub fn with(mut self, codec: CodecKind, depacketizer: Arc<dyn Depacketizer>) -> Self {
        self.depacketizers.insert(codec, depacketizer);
        self
    }

    pub fn get(&self, codec: CodecKind) -> Result<Arc<dyn Depacketizer>> {
        self.depacketizers.get(&codec).cloned().ok_or(PlayoutError::MissingCodec { codec })
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.depacketizers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Where a decoder posts its output. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DecoderOutput {
    tx: mpsc::UnboundedSender<DecodedFrame>,
}

impl DecoderOutput {
    /// Create an output and the inbox that receives from it
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DecodedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post a decoded frame. Returns `false` once the owning handler is gone.
    pub fn deliver(&self, frame: DecodedFrame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// One decoder session bound to a variant.
///
/// `submit` must not block on decode completion; results are posted to the
/// [`DecoderOutput`] the decoder was created with, from any thread.
pub trait Decoder: Send + 'static {
    fn submit(&mut self, unit: FrameUnit) -> anyhow::Result<()>;
}

/// Creates decoders for variants.
#[async_trait::async_trait]
pub trait DecoderFactory: Send + Sync + 'static {
    async fn create(&self, profile: &VariantProfile, output: DecoderOutput) -> anyhow::Result<Box<dyn Decoder>>;
}

/// Display surface for one source.
pub trait RenderSink: Send + Sync + 'static {
    /// Hand an image to the display. `display_immediately` bypasses the sink's own
    /// presentation-time pacing.
    fn enqueue(&self, image: Arc<DecodedImage>, display_immediately: bool, orientation: Orientation);

    /// Remove or hide the surface: the source has no live variants.
    fn remove(&self);
}
