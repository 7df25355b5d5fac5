//! Integration tests for the subscription layer
//!
//! These drive real stream handlers with the fakes from `test_utils`. Engine tests feed
//! handlers directly and call `render_tick` by hand so selection is deterministic; the
//! task tests go through `on_payload` and let the paused clock run the loops.

use super::*;
use crate::codec::CodecRegistry;
use crate::config::JitterMode;
use crate::gate::GapPolicy;
use crate::test_utils::{
    EchoDecoderFactory, HeaderDepacketizer, RecordingMetrics, RecordingSink, manifest, payload, track,
};
use crate::types::{CodecKind, Orientation};
use futures::StreamExt;

const TWO_VARIANTS: &[(&str, u32, f64)] = &[("360p", 640, 30.0), ("720p", 1280, 30.0)];

struct Rig {
    subscription: Subscription,
    sink: Arc<RecordingSink>,
    metrics: Arc<RecordingMetrics>,
    decoders: Arc<EchoDecoderFactory>,
}

fn collaborators(decoders: &Arc<EchoDecoderFactory>, sink: &Arc<RecordingSink>, metrics: &Arc<RecordingMetrics>) -> Collaborators {
    let codecs = CodecRegistry::new().with(CodecKind::H264, Arc::new(HeaderDepacketizer));
    Collaborators::new(codecs, decoders.clone(), sink.clone()).with_metrics(metrics.clone())
}

async fn rig_with(config: PlayoutConfig, variants: &[(&str, u32, f64)], decoders: EchoDecoderFactory) -> Rig {
    let _ = tracing_subscriber::fmt::try_init();
    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(RecordingMetrics::default());
    let decoders = Arc::new(decoders);
    let subscription = Subscription::subscribe(
        manifest("alice", variants),
        config,
        collaborators(&decoders, &sink, &metrics),
    )
    .await
    .expect("subscribe");
    Rig { subscription, sink, metrics, decoders }
}

async fn rig(config: PlayoutConfig) -> Rig {
    rig_with(config, TWO_VARIANTS, EchoDecoderFactory::default()).await
}

fn engine_config() -> PlayoutConfig {
    PlayoutConfig { jitter_mode: JitterMode::None, simulreceive_mode: SimulreceiveMode::Enabled, ..Default::default() }
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

/// Hand a payload straight to a handler, bypassing render task start-up
fn feed(rig: &Rig, name: &str, at: u64, group: u32, object: u16) {
    let handler = rig.subscription.handler(&track(name)).expect("live handler");
    handler.submit_encoded_data(&payload(ms(at), None), group, object).expect("submit");
}

async fn settle() {
    tokio::time::sleep(ms(1)).await;
}

fn tick(rig: &Rig) -> Option<Duration> {
    rig.subscription.inner.render_tick(Instant::now())
}

#[tokio::test(start_paused = true)]
async fn subscribe_creates_every_variant_up_front() {
    let rig = rig(engine_config()).await;
    assert_eq!(rig.subscription.handler_count(), 2);
    assert_eq!(rig.decoders.created(), 2);

    let status = rig.subscription.status();
    assert_eq!(status.live_variants, [track("360p"), track("720p")].into_iter().collect::<BTreeSet<_>>());
    assert!(status.selected.is_none());
}

#[tokio::test(start_paused = true)]
async fn simulreceive_with_per_layer_is_rejected() {
    let config = PlayoutConfig {
        jitter_mode: JitterMode::PerLayer,
        simulreceive_mode: SimulreceiveMode::Enabled,
        ..Default::default()
    };
    let decoders = Arc::new(EchoDecoderFactory::default());
    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(RecordingMetrics::default());

    let err = Subscription::subscribe(manifest("alice", TWO_VARIANTS), config, collaborators(&decoders, &sink, &metrics))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PlayoutError::InvalidConfiguration { .. }));
    assert!(err.is_fatal());
    assert_eq!(decoders.created(), 0);
}

#[tokio::test(start_paused = true)]
async fn listed_variant_without_profile_is_fatal() {
    let decoders = Arc::new(EchoDecoderFactory::default());
    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(RecordingMetrics::default());

    let err = Subscription::subscribe_to(
        manifest("alice", TWO_VARIANTS),
        &[track("720p"), track("1080p")],
        PlayoutConfig::default(),
        collaborators(&decoders, &sink, &metrics),
    )
    .await
    .err()
    .unwrap();
    assert!(matches!(err, PlayoutError::MissingProfile { track: t } if t == track("1080p")));
}

#[tokio::test(start_paused = true)]
async fn missing_depacketizer_is_fatal() {
    let decoders: Arc<dyn DecoderFactory> = Arc::new(EchoDecoderFactory::default());
    let collaborators = Collaborators::new(CodecRegistry::new(), decoders, Arc::new(RecordingSink::default()));

    let err = Subscription::subscribe(manifest("alice", TWO_VARIANTS), PlayoutConfig::default(), collaborators)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, PlayoutError::MissingCodec { codec: CodecKind::H264 }));
}

#[tokio::test(start_paused = true)]
async fn failed_decoder_leaves_variant_absent_until_retried() {
    let config = PlayoutConfig { simulreceive_mode: SimulreceiveMode::Disabled, ..engine_config() };
    let rig = rig_with(config, TWO_VARIANTS, EchoDecoderFactory::failing_for(["360p"])).await;
    assert_eq!(rig.subscription.handler_count(), 1);
    assert!(rig.subscription.handler(&track("360p")).is_none());

    let err = rig.subscription.on_payload(&track("360p"), &payload(ms(0), None), 0, 0).await.err().unwrap();
    assert!(matches!(err, PlayoutError::DecoderCreation { .. }));
    assert!(err.is_retryable());

    rig.decoders.set_failing("360p", false);
    rig.subscription.on_payload(&track("360p"), &payload(ms(0), None), 0, 0).await.unwrap();
    assert_eq!(rig.subscription.handler_count(), 2);
    assert!(rig.subscription.status().live_variants.contains(&track("360p")));
}

#[tokio::test(start_paused = true)]
async fn payload_for_unknown_variant_is_rejected() {
    let rig = rig(engine_config()).await;
    let err = rig.subscription.on_payload(&track("4k"), &payload(ms(0), None), 0, 0).await.err().unwrap();
    assert!(matches!(err, PlayoutError::UnknownVariant { .. }));
    assert_eq!(rig.subscription.handler_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn engine_prefers_highest_resolution_at_same_instant() {
    let rig = rig(engine_config()).await;
    feed(&rig, "360p", 0, 0, 0);
    feed(&rig, "720p", 0, 0, 0);
    settle().await;

    assert!(tick(&rig).is_some());

    let rendered = rig.sink.rendered();
    assert_eq!(rendered.len(), 1);
    assert_eq!(rendered[0].width, 1280);
    assert!(rendered[0].display_immediately);

    // Both images at that instant are used up
    for name in ["360p", "720p"] {
        let handler = rig.subscription.handler(&track(name)).unwrap();
        assert!(matches!(handler.candidate(None), SlotState::Empty));
    }

    let selected = rig.subscription.status().selected.unwrap();
    assert_eq!(selected, SelectedVariant { track: track("720p"), width: 1280, pristine: true });
}

#[tokio::test(start_paused = true)]
async fn engine_renders_oldest_instant_first() {
    let rig = rig(engine_config()).await;
    feed(&rig, "720p", 33, 0, 0);
    feed(&rig, "360p", 0, 0, 0);
    settle().await;

    tick(&rig);
    tick(&rig);

    let shown: Vec<_> = rig.sink.rendered().iter().map(|r| (r.timestamp, r.width)).collect();
    assert_eq!(shown, vec![(ms(0), 640), (ms(33), 1280)]);
}

#[tokio::test(start_paused = true)]
async fn images_not_newer_than_last_displayed_are_discarded() {
    let rig = rig(engine_config()).await;
    feed(&rig, "720p", 100, 0, 0);
    settle().await;
    tick(&rig);

    feed(&rig, "360p", 33, 0, 0);
    settle().await;
    tick(&rig);

    assert_eq!(rig.sink.widths(), vec![1280]);
    assert_eq!(rig.metrics.count(MetricField::PauseMiss), 1);
    let handler = rig.subscription.handler(&track("360p")).unwrap();
    assert!(matches!(handler.candidate(None), SlotState::Empty));
}

#[tokio::test(start_paused = true)]
async fn downgrade_is_damped_until_threshold() {
    let config = PlayoutConfig { quality_miss_threshold: 3, ..engine_config() };
    let rig = rig(config).await;

    feed(&rig, "720p", 0, 0, 0);
    settle().await;
    tick(&rig);

    for (object, at) in [(0u16, 33u64), (1, 66), (2, 100)] {
        feed(&rig, "360p", at, 0, object);
        settle().await;
        tick(&rig);
    }

    assert_eq!(rig.sink.widths(), vec![1280, 640]);
    assert_eq!(rig.sink.rendered()[1].timestamp, ms(100));
    assert_eq!(rig.subscription.last_selected_image().map(|i| i.width()), Some(640));
    assert_eq!(rig.metrics.count(MetricField::QualityMiss), 2);
    assert_eq!(rig.subscription.status().selected.unwrap().track, track("360p"));
}

#[tokio::test(start_paused = true)]
async fn discontinuity_is_damped_like_a_downgrade() {
    let config = PlayoutConfig { quality_miss_threshold: 3, gap_policy: GapPolicy::Artifact, ..engine_config() };
    let rig = rig_with(config, &[("720p", 1280, 30.0)], EchoDecoderFactory::default()).await;

    feed(&rig, "720p", 0, 0, 0);
    settle().await;
    tick(&rig);

    // Every unit skips one object, so each decoded image is discontinuous
    for (object, at) in [(2u16, 66u64), (4, 133), (6, 200)] {
        feed(&rig, "720p", at, 0, object);
        settle().await;
        tick(&rig);
    }

    let rendered = rig.sink.rendered();
    let shown: Vec<_> = rendered.iter().map(|r| (r.timestamp, r.discontinuous)).collect();
    assert_eq!(shown, vec![(ms(0), false), (ms(200), true)]);

    let selected = rig.subscription.status().selected.unwrap();
    assert!(!selected.pristine);
}

#[tokio::test(start_paused = true)]
async fn stale_variant_is_paused_then_resumed() {
    let config = PlayoutConfig { pause_miss_threshold: 2, ..engine_config() };
    let rig = rig(config).await;

    feed(&rig, "720p", 100, 0, 0);
    settle().await;
    tick(&rig);

    for (object, at) in [(0u16, 33u64), (1, 66)] {
        feed(&rig, "360p", at, 0, object);
        settle().await;
        tick(&rig);
    }
    assert_eq!(rig.subscription.status().paused, [track("360p")].into_iter().collect::<BTreeSet<_>>());

    feed(&rig, "360p", 200, 0, 2);
    settle().await;
    tick(&rig);
    assert!(rig.subscription.status().paused.is_empty());
}

#[tokio::test(start_paused = true)]
async fn idle_wait_falls_back_to_highest_frame_rate() {
    let rig = rig_with(engine_config(), &[("360p", 640, 15.0), ("720p", 1280, 60.0)], EchoDecoderFactory::default()).await;
    let wait = tick(&rig).unwrap();
    assert_eq!(wait, Duration::from_secs_f64(1.0 / 60.0));
}

#[tokio::test(start_paused = true)]
async fn idle_wait_only_counts_subscribed_variants() {
    let decoders = Arc::new(EchoDecoderFactory::default());
    let sink = Arc::new(RecordingSink::default());
    let metrics = Arc::new(RecordingMetrics::default());

    let subscription = Subscription::subscribe_to(
        manifest("alice", &[("360p", 640, 15.0), ("720p", 1280, 60.0)]),
        &[track("360p")],
        engine_config(),
        collaborators(&decoders, &sink, &metrics),
    )
    .await
    .unwrap();

    let wait = subscription.inner.render_tick(Instant::now()).unwrap();
    assert_eq!(wait, Duration::from_secs_f64(1.0 / 15.0));
}

#[tokio::test(start_paused = true)]
async fn selected_image_keeps_decoder_orientation() {
    let decoders = EchoDecoderFactory::default().with_orientation(Orientation::Right);
    let rig = rig_with(engine_config(), TWO_VARIANTS, decoders).await;
    feed(&rig, "360p", 0, 0, 0);
    feed(&rig, "720p", 0, 0, 0);
    settle().await;

    tick(&rig);

    let rendered = rig.sink.rendered();
    assert_eq!(rendered.len(), 1);
    assert_eq!((rendered[0].width, rendered[0].orientation), (1280, Orientation::Right));
}

#[tokio::test(start_paused = true)]
async fn visualize_only_forwards_and_reports_selection() {
    let config = PlayoutConfig { simulreceive_mode: SimulreceiveMode::VisualizeOnly, ..engine_config() };
    let rig = rig(config).await;

    feed(&rig, "360p", 0, 0, 0);
    feed(&rig, "720p", 0, 0, 0);
    settle().await;
    assert_eq!(rig.sink.rendered().len(), 2);

    tick(&rig);
    assert_eq!(rig.sink.rendered().len(), 2);
    assert_eq!(rig.subscription.status().selected.unwrap().track, track("720p"));
}

#[tokio::test(start_paused = true)]
async fn render_task_plays_buffered_variants_in_order() {
    let config = PlayoutConfig {
        jitter_mode: JitterMode::IntervalBased,
        min_depth_seconds: 0.1,
        simulreceive_mode: SimulreceiveMode::Enabled,
        ..Default::default()
    };
    let rig = rig(config).await;

    for object in 0..10u16 {
        let at = Duration::from_secs_f64(f64::from(object) / 30.0);
        for name in ["360p", "720p"] {
            rig.subscription.on_payload(&track(name), &payload(at, None), 0, object).await.unwrap();
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    let rendered = rig.sink.rendered();
    assert!(!rendered.is_empty());
    assert!(rendered.len() <= 10);
    assert!(rendered.windows(2).all(|pair| pair[0].timestamp < pair[1].timestamp));
    assert!(rendered.iter().all(|r| r.display_immediately));
    assert!(rig.subscription.status().selected.is_some());

    rig.subscription.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn idle_handlers_are_swept_and_recreated() {
    let config = PlayoutConfig { simulreceive_mode: SimulreceiveMode::Disabled, ..engine_config() };
    let rig = rig(config).await;

    // Keep 720p alive past the first two sweeps (1.5 s, 3.0 s)
    for object in 0..3u16 {
        tokio::time::sleep(ms(900)).await;
        rig.subscription.on_payload(&track("720p"), &payload(ms(u64::from(object) * 33), None), 0, object).await.unwrap();
    }
    tokio::time::sleep(ms(500)).await;

    assert_eq!(rig.subscription.handler_count(), 1);
    assert!(rig.subscription.handler(&track("720p")).is_some());
    assert_eq!(rig.subscription.status().live_variants, [track("720p")].into_iter().collect::<BTreeSet<_>>());
    assert_eq!(rig.sink.removed(), 0);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(rig.subscription.handler_count(), 0);
    assert_eq!(rig.sink.removed(), 1);
    assert!(rig.subscription.status().live_variants.is_empty());

    rig.subscription.on_payload(&track("360p"), &payload(ms(500), None), 1, 0).await.unwrap();
    assert_eq!(rig.subscription.handler_count(), 1);
    assert_eq!(rig.decoders.created(), 3);
}

#[tokio::test(start_paused = true)]
async fn expired_selection_falls_back_to_frame_rate() {
    let rig = rig(engine_config()).await;
    feed(&rig, "360p", 0, 0, 0);
    settle().await;
    tick(&rig);
    assert_eq!(rig.subscription.status().selected.unwrap().track, track("360p"));

    // Only 720p stays alive, and never with anything newer than what was shown
    for object in 0..3u16 {
        tokio::time::sleep(ms(900)).await;
        feed(&rig, "720p", 0, 0, object);
    }
    tokio::time::sleep(ms(500)).await;
    assert!(rig.subscription.handler(&track("360p")).is_none());
    assert!(rig.subscription.status().selected.is_none());

    let wait = tick(&rig).unwrap();
    assert_eq!(wait, Duration::from_secs_f64(1.0 / 30.0));
    assert_eq!(rig.sink.rendered().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn render_surface_removed_when_last_variant_expires() {
    let rig = rig_with(engine_config(), &[("720p", 1280, 30.0)], EchoDecoderFactory::default()).await;

    rig.subscription.on_payload(&track("720p"), &payload(ms(0), None), 0, 0).await.unwrap();
    tokio::time::sleep(ms(100)).await;
    assert_eq!(rig.sink.widths(), vec![1280]);
    assert!(rig.subscription.status().selected.is_some());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(rig.subscription.handler_count(), 0);
    assert_eq!(rig.sink.removed(), 1);

    let status = rig.subscription.status();
    assert!(status.selected.is_none());
    assert!(status.live_variants.is_empty());

    let render = rig.subscription.inner.render_task.lock().take().unwrap();
    assert!(render.is_finished());
}

#[tokio::test(start_paused = true)]
async fn status_updates_stream_current_value_first() {
    let rig = rig(engine_config()).await;
    let mut updates = rig.subscription.status_updates();

    let first = updates.next().await.unwrap();
    assert_eq!(first.live_variants.len(), 2);

    feed(&rig, "720p", 0, 0, 0);
    settle().await;
    tick(&rig);

    let next = updates.next().await.unwrap();
    assert_eq!(next.selected.map(|s| s.width), Some(1280));
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_tears_everything_down() {
    let rig = rig(engine_config()).await;
    rig.subscription.on_payload(&track("720p"), &payload(ms(0), None), 0, 0).await.unwrap();
    settle().await;

    let handler = rig.subscription.handler(&track("720p")).unwrap();
    rig.subscription.unsubscribe().await;

    assert!(handler.is_cancelled());
    assert!(handler.tasks().is_empty());
    assert!(rig.subscription.inner.tasks.is_empty());
    assert_eq!(rig.subscription.handler_count(), 0);
    assert_eq!(rig.sink.removed(), 1);
    assert_eq!(rig.subscription.status(), SubscriptionStatus::default());

    let err = rig.subscription.on_payload(&track("720p"), &payload(ms(33), None), 0, 1).await.err().unwrap();
    assert!(matches!(err, PlayoutError::Shutdown));

    // Idempotent
    rig.subscription.unsubscribe().await;
    assert_eq!(rig.sink.removed(), 1);
}
