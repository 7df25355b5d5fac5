//! Subscription orchestration for one source.
//!
//! A [`Subscription`] owns one [`StreamHandler`] per subscribed variant, routes payloads to
//! them, sweeps handlers that stop receiving data, and while simulreceive is in use runs
//! the render task that picks which variant's image is shown each tick.

use futures::Stream;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{CodecRegistry, DecoderFactory, RenderSink};
use crate::config::{PlayoutConfig, SimulreceiveMode};
use crate::driver::Driver;
use crate::handler::{SlotState, StreamHandler};
use crate::metrics::{MetricField, Metrics, MetricsSink, NoopMetrics};
use crate::simulreceive::{Candidate, Decision, QualityDamper, Verdict, consumed, decide};
use crate::types::{DecodedImage, FullTrackName, SourceManifest, VariantProfile, frame_duration_for};
use crate::{PlayoutError, Result};

#[cfg(test)]
mod tests;

/// External collaborators a subscription drives.
#[derive(Clone)]
pub struct Collaborators {
    pub codecs: CodecRegistry,
    pub decoders: Arc<dyn DecoderFactory>,
    pub sink: Arc<dyn RenderSink>,
    pub metrics: Arc<dyn MetricsSink>,
}

impl Collaborators {
    /// Collaborators with metrics discarded
    pub fn new(codecs: CodecRegistry, decoders: Arc<dyn DecoderFactory>, sink: Arc<dyn RenderSink>) -> Self {
        Self { codecs, decoders, sink, metrics: Arc::new(NoopMetrics) }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").field("codecs", &self.codecs).finish_non_exhaustive()
    }
}

/// The variant the simulreceive engine last rendered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedVariant {
    pub track: FullTrackName,
    pub width: u32,
    /// No gap behind the selected image
    pub pristine: bool,
}

/// Observable state of a subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub selected: Option<SelectedVariant>,
    /// Variants whose images have been stale for `pauseMissThreshold` consecutive ticks
    pub paused: BTreeSet<FullTrackName>,
    /// Variants with a live stream handler
    pub live_variants: BTreeSet<FullTrackName>,
}

/// Simulreceive state carried between render ticks
#[derive(Debug)]
struct EngineState {
    last_selected: Option<FullTrackName>,
    last_image: Option<Arc<DecodedImage>>,
    last_displayed: Option<Duration>,
    damper: QualityDamper,
    pause_misses: HashMap<FullTrackName, u32>,
}

impl EngineState {
    fn new(quality_miss_threshold: u32) -> Self {
        Self {
            last_selected: None,
            last_image: None,
            last_displayed: None,
            damper: QualityDamper::new(quality_miss_threshold),
            pause_misses: HashMap::new(),
        }
    }

    /// Drop everything remembered about `track`. Returns whether it was the selection.
    fn forget(&mut self, track: &FullTrackName) -> bool {
        self.pause_misses.remove(track);
        if self.last_selected.as_ref() == Some(track) {
            self.last_selected = None;
            self.last_image = None;
            self.damper.reset();
            true
        } else {
            false
        }
    }
}

pub(crate) struct SubscriptionInner {
    /// Source identity and the subscribed subset of its variants
    manifest: SourceManifest,
    config: Arc<PlayoutConfig>,
    collaborators: Collaborators,
    metrics: Metrics,
    handlers: Mutex<HashMap<FullTrackName, Arc<StreamHandler>>>,
    engine: Mutex<EngineState>,
    render_task: Mutex<Option<JoinHandle<()>>>,
    status: watch::Sender<SubscriptionStatus>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl SubscriptionInner {
    pub(crate) fn source_id(&self) -> &str {
        &self.manifest.source_id
    }

    pub(crate) fn config(&self) -> &PlayoutConfig {
        &self.config
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    fn snapshot(&self) -> Vec<Arc<StreamHandler>> {
        self.handlers.lock().values().cloned().collect()
    }

    async fn create_handler(&self, profile: VariantProfile) -> Result<Arc<StreamHandler>> {
        StreamHandler::create(
            profile,
            Arc::clone(&self.config),
            &self.collaborators.codecs,
            self.collaborators.decoders.as_ref(),
            Arc::clone(&self.collaborators.sink),
            self.metrics.clone(),
            self.cancel.child_token(),
        )
        .await
    }

    /// Existing handler for `track`, or a new one if the variant is subscribed
    async fn handler_for(&self, track: &FullTrackName) -> Result<Arc<StreamHandler>> {
        let existing = self.handlers.lock().get(track).cloned();
        if let Some(handler) = existing {
            return Ok(handler);
        }

        let profile = self
            .manifest
            .profile(track)
            .cloned()
            .ok_or_else(|| PlayoutError::UnknownVariant { track: track.clone() })?;

        let created = self.create_handler(profile).await?;
        let handler = match self.handlers.lock().entry(track.clone()) {
            Entry::Occupied(entry) => {
                // Lost a creation race
                created.cancel_token().cancel();
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                info!(track = %track, "Recreated stream handler");
                Arc::clone(entry.insert(created))
            }
        };
        self.publish_live_variants();
        Ok(handler)
    }

    fn ensure_render_task(self: &Arc<Self>) {
        if !self.config.simulreceive_mode.uses_engine() {
            return;
        }
        let mut task = self.render_task.lock();
        let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
        if !running && !self.cancel.is_cancelled() {
            debug!(source = %self.manifest.source_id, restart = task.is_some(), "Starting render task");
            *task = Some(Driver::spawn_render(Arc::clone(self)));
        }
    }

    /// One simulreceive tick. Returns the wait before the next tick, or `None` once the
    /// source has no handlers left.
    pub(crate) fn render_tick(&self, now: Instant) -> Option<Duration> {
        let handlers = self.snapshot();
        if handlers.is_empty() {
            return None;
        }

        let mut engine = self.engine.lock();
        let pause_threshold = self.config.pause_miss_threshold;
        let mut candidates = Vec::with_capacity(handlers.len());
        let mut paused_changed = false;

        for handler in &handlers {
            let track = handler.track();
            match handler.candidate(engine.last_displayed) {
                SlotState::Fresh(image) => {
                    if engine.pause_misses.remove(track).is_some_and(|m| pause_threshold > 0 && m >= pause_threshold) {
                        debug!(track = %track, "Variant resumed");
                        paused_changed = true;
                    }
                    candidates.push(Candidate::new(track.clone(), image));
                }
                SlotState::Stale => {
                    handler.metrics().count(MetricField::PauseMiss);
                    let misses = engine.pause_misses.entry(track.clone()).or_insert(0);
                    *misses += 1;
                    if pause_threshold > 0 && *misses == pause_threshold {
                        info!(track = %track, misses = *misses, "Variant paused");
                        paused_changed = true;
                    }
                }
                SlotState::Empty => {}
            }
        }

        let paused = paused_changed.then(|| {
            engine
                .pause_misses
                .iter()
                .filter(|(_, misses)| pause_threshold > 0 && **misses >= pause_threshold)
                .map(|(track, _)| track.clone())
                .collect::<BTreeSet<_>>()
        });

        let Some(decision) = decide(&candidates) else {
            let wait = self.fallback_wait(&engine, &handlers, now);
            drop(engine);
            if let Some(paused) = paused {
                self.status.send_modify(|status| status.paused = paused);
            }
            return Some(wait);
        };

        for used in consumed(&candidates) {
            if let Some(handler) = handlers.iter().find(|h| h.track() == &used.track) {
                handler.consume(used.timestamp());
            }
        }

        let pristine = match &decision {
            Decision::OnlyChoice(candidate) => !candidate.image.discontinuous,
            Decision::HighestRes { pristine, .. } => *pristine,
        };
        let Candidate { track, image } = decision.into_candidate();
        let Some(handler) = handlers.iter().find(|h| h.track() == &track) else {
            // Candidates come from `handlers`, so this cannot happen
            debug_assert!(false, "selected variant {track} has no handler");
            error!(track = %track, "Selected variant has no handler");
            return Some(self.config.default_frame_duration());
        };
        let wait = handler.next_wait(now);

        if let Verdict::Skip { misses } = engine.damper.evaluate(&image) {
            trace!(track = %track, misses, width = image.width(), "Downgrade held back");
            self.metrics.count(MetricField::QualityMiss);
            drop(engine);
            if let Some(paused) = paused {
                self.status.send_modify(|status| status.paused = paused);
            }
            return Some(wait);
        }

        engine.last_displayed = Some(image.timestamp());
        if engine.last_selected.as_ref() != Some(&track) {
            debug!(
                from = ?engine.last_selected.as_ref().map(ToString::to_string),
                to = %track,
                width = image.width(),
                pristine,
                "Switching variant"
            );
        }
        engine.last_selected = Some(track.clone());
        engine.last_image = Some(Arc::clone(&image));
        drop(engine);

        let selected = SelectedVariant { track, width: image.width(), pristine };
        if self.config.simulreceive_mode == SimulreceiveMode::Enabled {
            let orientation = image.frame.orientation;
            self.collaborators.sink.enqueue(image, true, orientation);
            self.metrics.count(MetricField::Rendered);
        }

        self.status.send_if_modified(|status| {
            let mut changed = false;
            if status.selected.as_ref() != Some(&selected) {
                status.selected = Some(selected);
                changed = true;
            }
            if let Some(paused) = paused {
                status.paused = paused;
                changed = true;
            }
            changed
        });

        Some(wait)
    }

    /// Wait used when no variant has anything new: the last selected variant's pacing,
    /// or one frame at the highest subscribed rate
    fn fallback_wait(&self, engine: &EngineState, handlers: &[Arc<StreamHandler>], now: Instant) -> Duration {
        if let Some(track) = &engine.last_selected {
            match handlers.iter().find(|h| h.track() == track) {
                Some(handler) => return handler.next_wait(now),
                None => {
                    // Cleanup clears the selection under the handlers lock
                    debug_assert!(false, "last selected variant {track} has no handler");
                    error!(track = %track, "Last selected variant has no handler");
                }
            }
        }

        self.manifest
            .highest_fps()
            .and_then(frame_duration_for)
            .unwrap_or_else(|| self.config.default_frame_duration())
    }

    pub(crate) fn on_render_exit(&self) {
        debug!(source = %self.manifest.source_id, "No variants left to render");
        self.status.send_if_modified(|status| status.selected.take().is_some());
    }

    /// Remove handlers that have not received data within the cleanup timeout.
    pub(crate) async fn cleanup(&self, now: Instant) {
        let timeout = self.config.cleanup_timeout();
        let (expired, emptied) = {
            let mut handlers = self.handlers.lock();
            let stale: Vec<_> =
                handlers.iter().filter(|(_, h)| h.idle_for(now) > timeout).map(|(track, _)| track.clone()).collect();
            let expired: Vec<_> = stale.iter().filter_map(|track| handlers.remove(track)).collect();

            if !expired.is_empty() {
                let mut engine = self.engine.lock();
                for handler in &expired {
                    if engine.forget(handler.track()) {
                        debug!(track = %handler.track(), "Cleared selection of expired variant");
                    }
                }
            }
            (expired, handlers.is_empty())
        };

        if expired.is_empty() {
            return;
        }

        for handler in &expired {
            info!(track = %handler.track(), idle = ?handler.idle_for(now), "Removing idle stream handler");
            handler.shutdown().await;
        }

        let removed: BTreeSet<_> = expired.iter().map(|h| h.track().clone()).collect();
        self.status.send_modify(|status| {
            status.paused.retain(|track| !removed.contains(track));
            if status.selected.as_ref().is_some_and(|s| removed.contains(&s.track)) {
                status.selected = None;
            }
        });
        self.publish_live_variants();

        if emptied {
            warn!(source = %self.manifest.source_id, "All variants expired, removing render surface");
            self.collaborators.sink.remove();
        }
    }

    fn publish_live_variants(&self) {
        let live: BTreeSet<_> = self.handlers.lock().keys().cloned().collect();
        self.status.send_if_modified(|status| {
            if status.live_variants == live {
                false
            } else {
                status.live_variants = live;
                true
            }
        });
    }
}

/// Playout of one source.
///
/// Dropping a subscription cancels its tasks; [`Subscription::unsubscribe`] also waits for
/// them to exit and removes the render surface.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Subscribe to every variant in `manifest`.
    pub async fn subscribe(manifest: SourceManifest, config: PlayoutConfig, collaborators: Collaborators) -> Result<Self> {
        let tracks: Vec<_> = manifest.variants.iter().map(|v| v.track.clone()).collect();
        Self::subscribe_to(manifest, &tracks, config, collaborators).await
    }

    /// Subscribe to the listed variants of `manifest`.
    ///
    /// Fails if the configuration or manifest is invalid, a listed variant has no
    /// profile, or a variant's codec has no depacketizer. A decoder that cannot be
    /// created is logged and its variant retried on its first payload.
    pub async fn subscribe_to(
        manifest: SourceManifest,
        tracks: &[FullTrackName],
        config: PlayoutConfig,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        manifest.validate()?;

        let mut variants = Vec::with_capacity(tracks.len());
        for track in tracks {
            let profile =
                manifest.profile(track).cloned().ok_or_else(|| PlayoutError::MissingProfile { track: track.clone() })?;
            if !variants.iter().any(|v: &VariantProfile| &v.track == track) {
                variants.push(profile);
            }
        }
        if variants.is_empty() {
            return Err(PlayoutError::invalid_configuration("no variants to subscribe to"));
        }

        let metrics = Metrics::new(Arc::clone(&collaborators.metrics), manifest.source_id.clone());
        let (status, _) = watch::channel(SubscriptionStatus::default());
        let inner = Arc::new(SubscriptionInner {
            manifest: SourceManifest { source_id: manifest.source_id, variants },
            engine: Mutex::new(EngineState::new(config.quality_miss_threshold)),
            config: Arc::new(config),
            collaborators,
            metrics,
            handlers: Mutex::new(HashMap::new()),
            render_task: Mutex::new(None),
            status,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        for profile in inner.manifest.variants.clone() {
            let track = profile.track.clone();
            match inner.create_handler(profile).await {
                Ok(handler) => {
                    inner.handlers.lock().insert(track, handler);
                }
                Err(e @ PlayoutError::DecoderCreation { .. }) => {
                    error!(track = %track, "Variant unavailable: {}", e);
                }
                Err(e) => {
                    inner.cancel.cancel();
                    return Err(e);
                }
            }
        }
        inner.publish_live_variants();
        Driver::spawn_cleanup(Arc::clone(&inner));

        info!(
            source = %inner.manifest.source_id,
            variants = inner.manifest.variants.len(),
            live = inner.handlers.lock().len(),
            jitter = ?inner.config.jitter_mode,
            simulreceive = ?inner.config.simulreceive_mode,
            "Subscribed"
        );
        Ok(Self { inner })
    }

    /// Route one payload to its variant's handler.
    ///
    /// A handler removed by the idle sweep is recreated. Payloads for variants outside
    /// this subscription fail with [`PlayoutError::UnknownVariant`].
    pub async fn on_payload(&self, track: &FullTrackName, payload: &[u8], group_id: u32, object_id: u16) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(PlayoutError::Shutdown);
        }
        let handler = self.inner.handler_for(track).await?;
        self.inner.ensure_render_task();
        handler.submit_encoded_data(payload, group_id, object_id)
    }

    pub fn source_id(&self) -> &str {
        &self.inner.manifest.source_id
    }

    pub fn config(&self) -> &PlayoutConfig {
        &self.inner.config
    }

    /// Number of live stream handlers
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// The live handler for `track`, if any
    pub fn handler(&self, track: &FullTrackName) -> Option<Arc<StreamHandler>> {
        self.inner.handlers.lock().get(track).cloned()
    }

    /// The image the simulreceive engine last selected, if its variant is still live
    pub fn last_selected_image(&self) -> Option<Arc<DecodedImage>> {
        self.inner.engine.lock().last_image.clone()
    }

    /// Current status
    pub fn status(&self) -> SubscriptionStatus {
        self.inner.status.borrow().clone()
    }

    /// Status changes as a stream, starting with the current value
    pub fn status_updates(&self) -> impl Stream<Item = SubscriptionStatus> + 'static {
        WatchStream::new(self.inner.status.subscribe())
    }

    /// Stop every task, drop every handler and remove the render surface.
    pub async fn unsubscribe(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        info!(source = %self.inner.manifest.source_id, "Unsubscribing");
        self.inner.cancel.cancel();

        let handlers: Vec<_> = self.inner.handlers.lock().drain().map(|(_, h)| h).collect();
        for handler in &handlers {
            handler.shutdown().await;
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.collaborators.sink.remove();
        self.inner.status.send_replace(SubscriptionStatus::default());
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("source_id", &self.inner.manifest.source_id)
            .field("handlers", &self.handler_count())
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        debug!(source = %self.inner.manifest.source_id, "Dropping subscription");
        self.inner.cancel.cancel();
    }
}
