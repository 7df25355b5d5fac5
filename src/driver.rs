//! Driver spawns and manages the playout tasks
//!
//! Each stream handler runs an inbox task (decoder output) and, in buffered modes, a
//! dequeue task. A subscription runs a render task while the simulreceive engine is in
//! use, plus a cleanup task for its whole lifetime. Every task races its work against a
//! cancellation token and exits as soon as it fires.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::handler::StreamHandler;
use crate::jitter::SharedJitterBuffer;
use crate::metrics::MetricField;
use crate::pacer::Pacer;
use crate::subscription::SubscriptionInner;
use crate::types::DecodedFrame;

/// Pause after a dequeue attempt that was due but found nothing to read
pub const UNDERRUN_BACKOFF: Duration = Duration::from_millis(5);

/// Shortest pause between render ticks
pub const MIN_RENDER_WAIT: Duration = Duration::from_millis(1);

/// Driver spawns and manages playout tasks
pub struct Driver;

impl Driver {
    /// Spawn the task that receives decoded frames for `handler`
    pub fn spawn_inbox(handler: Arc<StreamHandler>, inbox: mpsc::UnboundedReceiver<DecodedFrame>) {
        let tasks = handler.tasks().clone();
        tasks.spawn(Self::inbox_task(handler, inbox));
    }

    /// Spawn the task that drains `buffer` into `handler`'s decoder at the pace `pacer` sets
    pub fn spawn_dequeue(handler: Arc<StreamHandler>, buffer: Arc<SharedJitterBuffer>, pacer: Pacer) {
        let tasks = handler.tasks().clone();
        tasks.spawn(Self::dequeue_task(handler, buffer, pacer));
    }

    /// Spawn the simulreceive render task for a subscription
    pub(crate) fn spawn_render(inner: Arc<SubscriptionInner>) -> JoinHandle<()> {
        let tasks = inner.tasks().clone();
        tasks.spawn(Self::render_task(inner))
    }

    /// Spawn the idle-handler cleanup task for a subscription
    pub(crate) fn spawn_cleanup(inner: Arc<SubscriptionInner>) {
        let tasks = inner.tasks().clone();
        tasks.spawn(Self::cleanup_task(inner));
    }

    async fn inbox_task(handler: Arc<StreamHandler>, mut inbox: mpsc::UnboundedReceiver<DecodedFrame>) {
        let cancel = handler.cancel_token().clone();
        let mut delivered = 0u64;

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = inbox.recv() => frame,
            };
            match frame {
                Some(frame) => {
                    delivered += 1;
                    handler.on_decoded(frame);
                }
                None => {
                    debug!(track = %handler.track(), "Decoder output closed");
                    break;
                }
            }
        }

        debug!(track = %handler.track(), delivered, "Inbox task ended");
    }

    async fn dequeue_task(handler: Arc<StreamHandler>, buffer: Arc<SharedJitterBuffer>, mut pacer: Pacer) {
        let cancel = handler.cancel_token().clone();
        let metrics = handler.metrics().clone();
        info!(track = %handler.track(), "Dequeue task started");
        let mut dequeued = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let depth = buffer.depth();
            metrics.record(MetricField::BufferDepth, depth.as_secs_f64());

            let wait = pacer.next_wait(depth, Instant::now());
            if !wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            match buffer.read() {
                Some(unit) => {
                    dequeued += 1;
                    pacer.dequeued(Instant::now());
                    trace!(track = %handler.track(), sequence = unit.sequence(), "Dequeued unit");
                    if let Err(e) = handler.decode(unit) {
                        error!(track = %handler.track(), "Decode failed: {}", e);
                    }
                }
                None => {
                    if buffer.is_playing() {
                        metrics.count(MetricField::Underrun);
                    }
                    if wait.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(UNDERRUN_BACKOFF) => {}
                        }
                    }
                }
            }
        }

        info!(track = %handler.track(), dequeued, "Dequeue task ended");
    }

    async fn render_task(inner: Arc<SubscriptionInner>) {
        let cancel = inner.cancel_token().clone();
        debug!(source = %inner.source_id(), "Render task started");
        let mut ticks = 0u64;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(wait) = inner.render_tick(Instant::now()) else {
                inner.on_render_exit();
                break;
            };
            ticks += 1;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait.max(MIN_RENDER_WAIT)) => {}
            }
        }

        debug!(source = %inner.source_id(), ticks, "Render task ended");
    }

    async fn cleanup_task(inner: Arc<SubscriptionInner>) {
        let cancel = inner.cancel_token().clone();
        let period = inner.config().cleanup_interval();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            inner.cleanup(Instant::now()).await;
        }

        debug!(source = %inner.source_id(), "Cleanup task ended");
    }
}
