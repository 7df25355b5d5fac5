//! Track identity and source manifest types

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use super::{FALLBACK_FRAME_DURATION, frame_duration_for};
use crate::{PlayoutError, Result};

/// Unique identity of one variant's data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FullTrackName {
    pub namespace: String,
    pub name: String,
}

impl FullTrackName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for FullTrackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Video codec of a variant. Selects the depacketizer once per handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264,
    Hevc,
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecKind::H264 => f.write_str("h264"),
            CodecKind::Hevc => f.write_str("hevc"),
        }
    }
}

/// Encoding profile of one variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantProfile {
    pub track: FullTrackName,
    pub codec: CodecKind,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

impl VariantProfile {
    /// Nominal frame duration at the profile's frame rate
    ///
    /// Falls back to 30 fps if the profile never went through [`SourceManifest::validate`]
    /// and its rate has no usable period.
    pub fn frame_duration(&self) -> Duration {
        frame_duration_for(self.fps).unwrap_or(FALLBACK_FRAME_DURATION)
    }
}

/// The set of variants published for one logical source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceManifest {
    pub source_id: String,
    pub variants: Vec<VariantProfile>,
}

impl SourceManifest {
    /// Parse and validate a manifest from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let manifest: SourceManifest = serde_yaml_ng::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load a manifest from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| PlayoutError::config_file(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    /// Validate the manifest for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.variants.is_empty() {
            return Err(PlayoutError::invalid_configuration(format!(
                "source '{}' has no variants",
                self.source_id
            )));
        }

        let mut seen = HashSet::new();
        for variant in &self.variants {
            if !seen.insert(&variant.track) {
                return Err(PlayoutError::invalid_configuration(format!(
                    "variant {} listed twice",
                    variant.track
                )));
            }
            if frame_duration_for(variant.fps).is_none() {
                return Err(PlayoutError::invalid_configuration(format!(
                    "variant {} has invalid fps {}",
                    variant.track, variant.fps
                )));
            }
        }

        Ok(())
    }

    /// Look up a variant's profile
    pub fn profile(&self, track: &FullTrackName) -> Option<&VariantProfile> {
        self.variants.iter().find(|v| &v.track == track)
    }

    /// Highest frame rate across all variants
    pub fn highest_fps(&self) -> Option<f64> {
        self.variants.iter().map(|v| v.fps).fold(None, |max, fps| match max {
            Some(m) if m >= fps => Some(m),
            _ => Some(fps),
        })
    }
}
