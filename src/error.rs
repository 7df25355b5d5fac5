//! Error types for the playout pipeline.
//!
//! Only failures that a caller must act on surface as [`PlayoutError`]. Outcomes that are
//! expected under reordering and loss (a stale unit rejected by the jitter buffer, an
//! underrun, a name-gate rejection, a damped quality step-down) are recorded as metrics
//! and never reach this type.
//!
//! ## Error Categories
//!
//! - **Configuration errors**: incompatible modes, missing variant profiles, unreadable
//!   configuration files. Fatal at construction.
//! - **Resource errors**: a decoder that cannot be created for one variant. The variant is
//!   absent while its siblings keep playing.
//! - **Stream errors**: a payload that cannot be depacketized or decoded.
//!
//! ```rust
//! use playout::PlayoutError;
//!
//! let error = PlayoutError::invalid_configuration("simulreceive cannot use per-layer buffering");
//! assert!(error.is_fatal());
//! for suggestion in error.recovery_suggestions() {
//!     println!("  - {}", suggestion);
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{CodecKind, FullTrackName};

/// Result type alias for playout operations.
pub type Result<T, E = PlayoutError> = std::result::Result<T, E>;

/// Boxed source error carried by collaborator failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for playout operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PlayoutError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("No profile configured for expected variant {track}")]
    MissingProfile { track: FullTrackName },

    #[error("Payload for variant {track} which is not part of this subscription")]
    UnknownVariant { track: FullTrackName },

    #[error("No depacketizer registered for codec {codec}")]
    MissingCodec { codec: CodecKind },

    #[error("Failed to depacketize payload for {track}")]
    Depacketize {
        track: FullTrackName,
        #[source]
        source: BoxError,
    },

    #[error("Failed to create decoder for {track}")]
    DecoderCreation {
        track: FullTrackName,
        #[source]
        source: BoxError,
    },

    #[error("Decoder for {track} rejected a frame")]
    Decode {
        track: FullTrackName,
        #[source]
        source: BoxError,
    },

    #[error("Configuration file error: {path}")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration parse error: {details}")]
    ConfigParse { details: String },

    #[error("Subscription has been shut down")]
    Shutdown,
}

impl PlayoutError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            PlayoutError::Depacketize { .. } => true,
            PlayoutError::Decode { .. } => true,
            PlayoutError::DecoderCreation { .. } => true,
            PlayoutError::ConfigFile { .. } => true,
            PlayoutError::InvalidConfiguration { .. } => false,
            PlayoutError::MissingProfile { .. } => false,
            PlayoutError::UnknownVariant { .. } => false,
            PlayoutError::MissingCodec { .. } => false,
            PlayoutError::ConfigParse { .. } => false,
            PlayoutError::Shutdown => false,
        }
    }

    /// Returns whether this error prevents a subscription from being constructed at all.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlayoutError::InvalidConfiguration { .. }
                | PlayoutError::MissingProfile { .. }
                | PlayoutError::MissingCodec { .. }
                | PlayoutError::ConfigFile { .. }
                | PlayoutError::ConfigParse { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            PlayoutError::InvalidConfiguration { .. } => vec![
                "Use pid or interval jitter buffering with simulreceive",
                "Check numeric options are finite and positive",
            ],
            PlayoutError::MissingProfile { .. } => vec![
                "Add the variant to the source manifest",
                "Verify the manifest was retrieved for the right source",
            ],
            PlayoutError::UnknownVariant { .. } => vec![
                "Check the transport routes payloads to the correct subscription",
                "Refresh the source manifest",
            ],
            PlayoutError::MissingCodec { .. } => vec![
                "Register a depacketizer for the codec before subscribing",
                "Remove variants with unsupported codecs from the manifest",
            ],
            PlayoutError::Depacketize { .. } => vec![
                "Verify the publisher's codec matches the manifest",
                "Wait for the next group to resynchronise",
            ],
            PlayoutError::DecoderCreation { .. } => vec![
                "Check hardware decoder availability",
                "Retry once other sessions release decoder resources",
            ],
            PlayoutError::Decode { .. } => vec![
                "Wait for the next keyframe",
                "Check decoder health",
            ],
            PlayoutError::ConfigFile { .. } => vec![
                "Check the configuration file exists and is readable",
                "Check file permissions",
            ],
            PlayoutError::ConfigParse { .. } => vec![
                "Validate the YAML syntax",
                "Check option names and value types",
            ],
            PlayoutError::Shutdown => vec!["Subscribe again to resume playout"],
        }
    }

    /// Helper constructor for configuration errors.
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        PlayoutError::InvalidConfiguration { reason: reason.into() }
    }

    /// Helper constructor for configuration file errors with path context.
    pub fn config_file(path: PathBuf, source: std::io::Error) -> Self {
        PlayoutError::ConfigFile { path, source }
    }

    /// Helper constructor for decoder construction failures.
    pub fn decoder_creation(track: FullTrackName, source: impl Into<BoxError>) -> Self {
        PlayoutError::DecoderCreation { track, source: source.into() }
    }

    /// Helper constructor for depacketization failures.
    pub fn depacketize(track: FullTrackName, source: impl Into<BoxError>) -> Self {
        PlayoutError::Depacketize { track, source: source.into() }
    }

    /// Helper constructor for decode failures.
    pub fn decode(track: FullTrackName, source: impl Into<BoxError>) -> Self {
        PlayoutError::Decode { track, source: source.into() }
    }
}

impl From<serde_yaml_ng::Error> for PlayoutError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        PlayoutError::ConfigParse { details: err.to_string() }
    }
}
