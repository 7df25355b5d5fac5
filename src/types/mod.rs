//! Core types for media units, decoded images and track identity.
//!
//! ## Architecture
//!
//! - [`FrameUnit`] is an encoded unit keyed by a two-level group/object name
//! - [`DecodedFrame`] is what a decoder hands back; [`DecodedImage`] is the same frame
//!   stamped with the variant, frame rate and discontinuity flag by its stream handler
//! - [`FullTrackName`], [`VariantProfile`] and [`SourceManifest`] describe which variants
//!   of a source exist and how they are encoded
//!
//! ## Usage Example
//!
//! ```rust
//! use playout::types::{FrameUnit, sequence_of};
//! use std::time::Duration;
//!
//! let unit = FrameUnit::new(3, 7, Duration::from_millis(100), vec![0u8; 16]);
//! assert_eq!(unit.sequence(), (3 << 16) | 7);
//! assert_eq!(unit.sequence(), sequence_of(3, 7));
//!
//! // Units carrying an fps hint report their own nominal duration
//! let hinted = unit.with_fps(50.0);
//! assert_eq!(hinted.nominal_duration(Duration::from_millis(33)), Duration::from_millis(20));
//! ```

mod frame;
mod image;
mod track;

pub use frame::{FALLBACK_FRAME_DURATION, FrameUnit, frame_duration_for, sequence_of};
pub use image::{DecodedFrame, DecodedImage, Orientation};
pub use track::{CodecKind, FullTrackName, SourceManifest, VariantProfile};
