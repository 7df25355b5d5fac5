//! Simulreceive selection.
//!
//! Several variants of one source decode side by side; each render tick the engine looks
//! at every variant's latest decoded image and picks at most one to show. This module is
//! the pure part of that: candidate selection and downgrade damping. The subscription
//! owns the state and the tick loop.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::types::{DecodedImage, FullTrackName};

/// One variant's latest decoded image, offered for this tick
#[derive(Debug, Clone)]
pub struct Candidate {
    pub track: FullTrackName,
    pub image: Arc<DecodedImage>,
}

impl Candidate {
    pub fn new(track: FullTrackName, image: Arc<DecodedImage>) -> Self {
        Self { track, image }
    }

    pub fn timestamp(&self) -> Duration {
        self.image.timestamp()
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }
}

/// Which candidate to render and why
#[derive(Debug, Clone)]
pub enum Decision {
    /// The only candidate this tick
    OnlyChoice(Candidate),
    /// Highest resolution among the oldest instant; `pristine` if it has no gap behind it
    HighestRes { candidate: Candidate, pristine: bool },
}

impl Decision {
    pub fn candidate(&self) -> &Candidate {
        match self {
            Decision::OnlyChoice(candidate) => candidate,
            Decision::HighestRes { candidate, .. } => candidate,
        }
    }

    pub fn into_candidate(self) -> Candidate {
        match self {
            Decision::OnlyChoice(candidate) => candidate,
            Decision::HighestRes { candidate, .. } => candidate,
        }
    }
}

/// Pick the candidate to render this tick.
///
/// With several candidates only those at the oldest timestamp are compared. Among them
/// the widest pristine image wins, falling back to the widest overall. Equal widths are
/// broken by track name so the outcome never depends on input order.
pub fn decide(candidates: &[Candidate]) -> Option<Decision> {
    match candidates {
        [] => None,
        [only] => Some(Decision::OnlyChoice(only.clone())),
        _ => {
            let mut instant = consumed(candidates);
            instant.sort_by_key(|c| (Reverse(c.width()), c.track.clone()));

            let pristine = instant.iter().find(|c| !c.image.discontinuous);
            let (winner, pristine) = match pristine {
                Some(candidate) => (*candidate, true),
                None => (instant[0], false),
            };
            Some(Decision::HighestRes { candidate: winner.clone(), pristine })
        }
    }
}

/// Candidates sharing the oldest timestamp: everything one decision uses up.
pub fn consumed(candidates: &[Candidate]) -> Vec<&Candidate> {
    let Some(oldest) = candidates.iter().map(Candidate::timestamp).min() else {
        return Vec::new();
    };
    candidates.iter().filter(|c| c.timestamp() == oldest).collect()
}

/// Outcome of [`QualityDamper::evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Render,
    /// A step down that has not persisted long enough yet
    Skip { misses: u32 },
}

/// Holds back quality downgrades until they persist.
///
/// A step down is a narrower image than the last rendered one, or a discontinuous image
/// after a pristine one. Each consecutive step down is a miss; the downgrade is committed
/// on the `threshold`-th miss. Any render resets the count.
#[derive(Debug, Clone)]
pub struct QualityDamper {
    threshold: u32,
    misses: u32,
    last_width: Option<u32>,
    last_discontinuous: bool,
}

impl QualityDamper {
    pub fn new(threshold: u32) -> Self {
        Self { threshold: threshold.max(1), misses: 0, last_width: None, last_discontinuous: false }
    }

    pub fn evaluate(&mut self, image: &DecodedImage) -> Verdict {
        let Some(last_width) = self.last_width else {
            self.commit(image);
            return Verdict::Render;
        };

        let narrower = image.width() < last_width;
        let newly_broken = image.discontinuous && !self.last_discontinuous;
        if narrower || newly_broken {
            self.misses += 1;
            if self.misses < self.threshold {
                return Verdict::Skip { misses: self.misses };
            }
            debug!(from = last_width, to = image.width(), discontinuous = image.discontinuous, "Committing downgrade");
        }

        self.commit(image);
        Verdict::Render
    }

    fn commit(&mut self, image: &DecodedImage) {
        self.misses = 0;
        self.last_width = Some(image.width());
        self.last_discontinuous = image.discontinuous;
    }

    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn last_width(&self) -> Option<u32> {
        self.last_width
    }

    /// Forget the last rendered image, e.g. when its variant went away
    pub fn reset(&mut self) {
        self.misses = 0;
        self.last_width = None;
        self.last_discontinuous = false;
    }
}
