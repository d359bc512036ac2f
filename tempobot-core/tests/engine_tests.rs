//! tests/engine_tests.rs
//!
//! End-to-end tests of the playback engine over mock collaborators. The
//! mock decoder is byte-paced (PCM byte math, not wall clocks), so elapsed
//! and seek-offset assertions are exact.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::sync::mpsc::unbounded_channel;

use tempobot_common::Error;
use tempobot_common::models::player::{PlayerSnapshot, PlayerStatus, RepeatMode};
use tempobot_common::traits::notify::NotificationSink;
use tempobot_common::traits::transport::{TransportEvent, VoiceConnection};
use tempobot_core::player::{EngineConfig, PlaybackEngine, PlayerStore, run_transport_events};
use tempobot_core::test_utils::{
    DecoderScript, MockDecoder, MockProbe, MockTransport, RecordingNotifier, pcm_bytes_for_secs,
    test_track, wait_for,
};

const GUILD: &str = "100200300";

struct Harness {
    store: Arc<PlayerStore>,
    engine: PlaybackEngine,
    transport: Arc<MockTransport>,
    decoder: Arc<MockDecoder>,
    probe: Arc<MockProbe>,
    notifier: Arc<RecordingNotifier>,
}

fn harness_with_config(script: DecoderScript, config: EngineConfig) -> Harness {
    let store = Arc::new(PlayerStore::new());
    let transport = Arc::new(MockTransport::new());
    let decoder = Arc::new(MockDecoder::new(script));
    let probe = Arc::new(MockProbe::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let engine = PlaybackEngine::with_config(
        Arc::clone(&store),
        transport.clone(),
        decoder.clone(),
        probe.clone(),
        notifier.clone(),
        config,
    );
    store.create_player(GUILD);
    engine.set_voice_channel(GUILD, "voice-1").unwrap();
    Harness {
        store,
        engine,
        transport,
        decoder,
        probe,
        notifier,
    }
}

fn harness(script: DecoderScript) -> Harness {
    harness_with_config(script, EngineConfig::default())
}

#[tokio::test]
async fn enqueue_at_head_splices_after_current_head() {
    let h = harness(DecoderScript::EmitThenPend(0));
    let titles = |h: &Harness| -> Vec<String> {
        h.store
            .get(GUILD)
            .unwrap()
            .queue_tracks()
            .iter()
            .map(|t| t.title.clone())
            .collect()
    };

    let initial = ["H", "X", "Y"].iter().map(|t| test_track(t, None)).collect();
    h.engine.enqueue(GUILD, initial, false).await.unwrap();

    let spliced = ["A", "B", "C"].iter().map(|t| test_track(t, None)).collect();
    h.engine.enqueue(GUILD, spliced, true).await.unwrap();

    assert_eq!(titles(&h), vec!["H", "A", "B", "C", "X", "Y"]);
}

#[tokio::test]
async fn enqueue_at_head_on_empty_queue_appends() {
    let h = harness(DecoderScript::EmitThenPend(0));
    let tracks = ["A", "B"].iter().map(|t| test_track(t, None)).collect();
    h.engine.enqueue(GUILD, tracks, true).await.unwrap();
    let queue = h.store.get(GUILD).unwrap().queue_tracks();
    assert_eq!(queue[0].title, "A");
    assert_eq!(queue[1].title, "B");
}

#[tokio::test]
async fn shuffle_never_moves_the_head() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(60)));
    let tracks: Vec<_> = (0..10).map(|i| test_track(&format!("t{i}"), None)).collect();
    h.engine.enqueue(GUILD, tracks, false).await.unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert!(wait_for(|| state.status() == PlayerStatus::Playing, Duration::from_secs(1)).await);

    for _ in 0..5 {
        h.engine.shuffle(GUILD).await.unwrap();
        let queue = state.queue_tracks();
        assert_eq!(queue[0].title, "t0", "head must not move while playing");
        assert_eq!(queue.len(), 10);
    }
}

#[tokio::test]
async fn double_play_spawns_one_loop_and_one_refresh_with_second_reason() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(1)));
    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(120)))], false)
        .await
        .unwrap();

    // Two plays back to back; the loop task has not run between them on
    // this single-threaded test runtime.
    h.engine.play(GUILD, "first", false).await.unwrap();
    h.engine.play(GUILD, "second", false).await.unwrap();

    assert!(wait_for(|| h.decoder.spawn_count() >= 1, Duration::from_secs(1)).await);
    assert_eq!(h.decoder.spawn_count(), 1, "exactly one loop may start");
    assert_eq!(h.decoder.peak_active(), 1);
    assert_eq!(
        h.notifier.messages(),
        vec!["second".to_string()],
        "one display refresh, carrying the second call's reason"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_loop_even_under_play_spam() {
    // A parked stream keeps the queue from draining, so every spammed
    // play races against a live loop rather than an already-finished one.
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(1)));
    let tracks: Vec<_> = (0..3).map(|i| test_track(&format!("t{i}"), None)).collect();
    h.engine.enqueue(GUILD, tracks, false).await.unwrap();

    let mut joins = Vec::new();
    for i in 0..8 {
        let engine = h.engine.clone();
        joins.push(tokio::spawn(async move {
            engine.play(GUILD, format!("spam {i}"), false).await
        }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }

    assert!(wait_for(|| h.decoder.spawn_count() >= 1, Duration::from_secs(1)).await);
    assert_eq!(h.decoder.peak_active(), 1, "two loops were live at once");
    assert_eq!(h.transport.connect_count(), 1);

    h.engine.clear(GUILD).await.unwrap();
    let state = h.store.get(GUILD).unwrap();
    assert_eq!(state.status(), PlayerStatus::Stopped);
    assert!(!state.loop_active());
}

#[tokio::test]
async fn skip_on_single_track_queue_ends_stopped() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(60)));
    h.engine.enqueue(GUILD, vec![test_track("A", None)], false).await.unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 1, Duration::from_secs(1)).await);

    h.engine.skip(GUILD).await.unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert!(
        wait_for(
            || state.status() == PlayerStatus::Stopped && !state.loop_active(),
            Duration::from_secs(2)
        )
        .await
    );
    assert!(state.queue_tracks().is_empty());
    let history = state.history_tracks();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].title, "A");
    let conn = h.transport.last_connection().unwrap();
    assert!(!conn.is_connected(), "queue end must release the transport");
}

#[tokio::test]
async fn previous_with_empty_history_is_a_noop() {
    let h = harness(DecoderScript::EmitThenPend(0));
    h.engine.enqueue(GUILD, vec![test_track("A", None)], false).await.unwrap();
    let refreshes_before = h.notifier.refresh_count();

    h.engine.previous(GUILD).await.unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert_eq!(state.status(), PlayerStatus::Stopped);
    assert_eq!(state.queue_tracks().len(), 1);
    assert_eq!(
        h.notifier.refresh_count(),
        refreshes_before,
        "no display refresh on an empty-history previous"
    );
}

#[tokio::test]
async fn previous_reinserts_history_head_and_restarts() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(60)));
    h.engine
        .enqueue(GUILD, vec![test_track("A", None), test_track("B", None)], false)
        .await
        .unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 1, Duration::from_secs(1)).await);

    // Move past A.
    h.engine.skip(GUILD).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 2, Duration::from_secs(1)).await);

    h.engine.previous(GUILD).await.unwrap();
    let state = h.store.get(GUILD).unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 3, Duration::from_secs(1)).await);

    let queue = state.queue_tracks();
    assert_eq!(queue[0].title, "A", "history head returns to the front");
    assert_eq!(queue[1].title, "B");
    assert!(state.history_tracks().is_empty());
    // Previous always restarts from the beginning of the track.
    assert_eq!(h.decoder.spawn_offsets()[2], Duration::ZERO);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeat_queue_requeues_after_natural_finish() {
    let h = harness(DecoderScript::EmitThenEof(pcm_bytes_for_secs(1)));
    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(10)))], false)
        .await
        .unwrap();
    h.engine.set_repeat(GUILD, RepeatMode::Queue).await.unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();

    // A finishing naturally re-enqueues it, so it plays again.
    assert!(wait_for(|| h.decoder.spawn_count() >= 2, Duration::from_secs(2)).await);

    let state = h.store.get(GUILD).unwrap();
    let queue = state.queue_tracks();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].title, "A");
    let history = state.history_tracks();
    assert!(!history.is_empty());
    assert_eq!(history[0].title, "A");

    h.engine.clear(GUILD).await.unwrap();
    assert_eq!(state.status(), PlayerStatus::Stopped);
    assert!(state.queue_tracks().is_empty());
}

#[tokio::test]
async fn pause_keeps_elapsed_and_resume_seeks_to_it() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(3)));
    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(30)))], false)
        .await
        .unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();

    // The mock stream emits exactly 3 seconds of PCM, then goes quiet.
    let conn = {
        assert!(wait_for(|| h.transport.connect_count() == 1, Duration::from_secs(1)).await);
        h.transport.last_connection().unwrap()
    };
    assert!(
        wait_for(|| conn.written_bytes() == pcm_bytes_for_secs(3), Duration::from_secs(2)).await
    );

    h.engine.pause(GUILD).await.unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert_eq!(state.status(), PlayerStatus::Paused);
    assert_eq!(state.elapsed(), Duration::from_secs(3));
    assert!(!state.loop_active());

    h.engine.play(GUILD, "resume", false).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 2, Duration::from_secs(1)).await);
    assert_eq!(
        h.decoder.spawn_offsets()[1],
        Duration::from_secs(3),
        "resume must seek the decoder to the paused offset"
    );
}

#[tokio::test]
async fn dead_stream_url_is_skipped_silently() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(60)));
    // test_track URLs follow the https://cdn.test/<title> convention.
    h.probe.mark_unreachable("https://cdn.test/A");
    h.engine
        .enqueue(GUILD, vec![test_track("A", None), test_track("B", None)], false)
        .await
        .unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert!(
        wait_for(
            || state.queue_tracks().first().map(|t| t.title.clone()) == Some("B".into())
                && h.decoder.spawn_count() == 1,
            Duration::from_secs(2)
        )
        .await,
        "A should be dropped and B playing"
    );
    let spawned_urls: Vec<String> =
        h.decoder.spawns.lock().iter().map(|(url, _)| url.clone()).collect();
    assert_eq!(spawned_urls, vec!["https://cdn.test/B".to_string()]);
    assert_eq!(state.status(), PlayerStatus::Playing);
}

#[tokio::test(start_paused = true)]
async fn pause_returns_within_bound_when_ack_never_arrives() {
    let h = harness_with_config(
        DecoderScript::HangOnSpawn,
        EngineConfig {
            stop_ack_timeout: Duration::from_millis(200),
            reconnect_delay: Duration::from_millis(10),
        },
    );
    h.engine.enqueue(GUILD, vec![test_track("A", None)], false).await.unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 1, Duration::from_secs(1)).await);

    // The decoder is wedged inside spawn; the loop never reaches the copy
    // select, so the stop is never acknowledged.
    h.engine.pause(GUILD).await.unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert_eq!(state.status(), PlayerStatus::Paused);
    assert!(!state.loop_active(), "forced stop must clear the loop guard");

    // The player is not wedged: playback can start again.
    h.decoder.set_script(DecoderScript::EmitThenPend(pcm_bytes_for_secs(1)));
    h.engine.play(GUILD, "again", false).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 2, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn unexpected_disconnect_pauses_with_elapsed_preserved() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(2)));
    let (tx, rx) = unbounded_channel::<TransportEvent>();
    tokio::spawn(run_transport_events(h.engine.clone(), rx));

    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(30)))], false)
        .await
        .unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();

    assert!(wait_for(|| h.transport.connect_count() == 1, Duration::from_secs(1)).await);
    let conn = h.transport.last_connection().unwrap();
    assert!(
        wait_for(|| conn.written_bytes() == pcm_bytes_for_secs(2), Duration::from_secs(2)).await
    );

    conn.drop_link();
    tx.send(TransportEvent::Disconnected { guild_id: GUILD.into() }).unwrap();

    let state = h.store.get(GUILD).unwrap();
    assert!(
        wait_for(
            || state.status() == PlayerStatus::Paused && !state.loop_active(),
            Duration::from_secs(2)
        )
        .await,
        "unexpected disconnect must park the player Paused"
    );
    assert_eq!(state.elapsed(), Duration::from_secs(2));
    // No auto-resume.
    assert_eq!(h.transport.connect_count(), 1);

    // A manual play resumes from the preserved offset on a new connection.
    h.engine.play(GUILD, "resume", false).await.unwrap();
    assert!(wait_for(|| h.decoder.spawn_count() == 2, Duration::from_secs(1)).await);
    assert_eq!(h.transport.connect_count(), 2);
    assert_eq!(h.decoder.spawn_offsets()[1], Duration::from_secs(2));
}

#[tokio::test]
async fn expected_disconnect_reconnects_and_resumes() {
    let h = harness_with_config(
        DecoderScript::EmitThenPend(pcm_bytes_for_secs(1)),
        EngineConfig {
            stop_ack_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(10),
        },
    );
    let (tx, rx) = unbounded_channel::<TransportEvent>();
    tokio::spawn(run_transport_events(h.engine.clone(), rx));

    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(30)))], false)
        .await
        .unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();
    assert!(wait_for(|| h.transport.connect_count() == 1, Duration::from_secs(1)).await);
    let conn = h.transport.last_connection().unwrap();
    assert!(
        wait_for(|| conn.written_bytes() == pcm_bytes_for_secs(1), Duration::from_secs(2)).await
    );

    // Channel move: the next disconnect is expected and targets voice-2.
    h.engine.request_reconnect(GUILD, Some("voice-2")).unwrap();
    conn.drop_link();
    tx.send(TransportEvent::Disconnected { guild_id: GUILD.into() }).unwrap();

    assert!(
        wait_for(|| h.transport.connect_count() == 2, Duration::from_secs(2)).await,
        "expected disconnect must auto-reconnect"
    );
    let new_conn = h.transport.last_connection().unwrap();
    assert_eq!(new_conn.channel_id, "voice-2");
    assert!(wait_for(|| h.decoder.spawn_count() == 2, Duration::from_secs(1)).await);
    assert_eq!(
        h.decoder.spawn_offsets()[1],
        Duration::from_secs(1),
        "resume after reconnect keeps the elapsed offset"
    );
    let state = h.store.get(GUILD).unwrap();
    assert!(wait_for(|| state.status() == PlayerStatus::Playing, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn moving_voice_channel_resumes_on_the_new_connection() {
    let h = harness(DecoderScript::EmitThenPend(pcm_bytes_for_secs(2)));
    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(30)))], false)
        .await
        .unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();
    assert!(wait_for(|| h.transport.connect_count() == 1, Duration::from_secs(1)).await);
    let conn = h.transport.last_connection().unwrap();
    assert!(
        wait_for(|| conn.written_bytes() == pcm_bytes_for_secs(2), Duration::from_secs(2)).await
    );

    h.engine.move_voice_channel(GUILD, "voice-2").await.unwrap();

    assert!(wait_for(|| h.transport.connect_count() == 2, Duration::from_secs(1)).await);
    let new_conn = h.transport.last_connection().unwrap();
    assert_eq!(new_conn.channel_id, "voice-2");
    assert!(!conn.is_connected(), "old connection must be released");
    assert!(wait_for(|| h.decoder.spawn_count() == 2, Duration::from_secs(1)).await);
    assert_eq!(
        h.decoder.spawn_offsets()[1],
        Duration::from_secs(2),
        "the move must not lose the playback position"
    );
}

/// A notifier that blocks inside the queue-finished refresh until the test
/// opens the gate, holding the loop on its final await so other operations
/// can land while the loop is still accounted active.
struct GatedNotifier {
    inner: RecordingNotifier,
    gate: Notify,
    reached_finish: AtomicBool,
}

impl GatedNotifier {
    fn new() -> Self {
        Self {
            inner: RecordingNotifier::new(),
            gate: Notify::new(),
            reached_finish: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl NotificationSink for GatedNotifier {
    async fn refresh(
        &self,
        guild_id: &str,
        snapshot: PlayerSnapshot,
        message: Option<String>,
    ) -> Result<(), Error> {
        if message.as_deref() == Some("Queue finished") {
            self.reached_finish.store(true, Ordering::SeqCst);
            self.gate.notified().await;
        }
        self.inner.refresh(guild_id, snapshot, message).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pause_racing_queue_end_does_not_resurrect_the_player() {
    let store = Arc::new(PlayerStore::new());
    let transport = Arc::new(MockTransport::new());
    let notifier = Arc::new(GatedNotifier::new());
    let engine = PlaybackEngine::new(
        Arc::clone(&store),
        transport.clone(),
        Arc::new(MockDecoder::new(DecoderScript::EmitThenEof(pcm_bytes_for_secs(1)))),
        Arc::new(MockProbe::new()),
        notifier.clone(),
    );
    store.create_player(GUILD);
    engine.set_voice_channel(GUILD, "voice-1").unwrap();

    engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(1)))], false)
        .await
        .unwrap();
    engine.play(GUILD, "start", false).await.unwrap();

    // The last track drains and the loop parks inside the queue-finished
    // refresh, after marking the player Stopped but before releasing the
    // loop guard.
    assert!(
        wait_for(
            || notifier.reached_finish.load(Ordering::SeqCst),
            Duration::from_secs(2)
        )
        .await
    );
    let state = store.get(GUILD).unwrap();
    assert!(state.loop_active(), "the loop must still be live behind the gate");

    let pause = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.pause(GUILD).await })
    };
    // Give the pause time to request the stop while the loop is gated.
    tokio::time::sleep(Duration::from_millis(50)).await;
    notifier.gate.notify_one();
    pause.await.unwrap().unwrap();

    // The queue ended first, so Stopped wins over the late pause.
    assert_eq!(state.status(), PlayerStatus::Stopped);
    assert!(state.queue_tracks().is_empty());
    assert!(wait_for(|| !state.loop_active(), Duration::from_secs(1)).await);
    assert!(
        !notifier.inner.messages().iter().any(|m| m == "Paused"),
        "a pause that lost to queue end must not refresh as Paused"
    );
    let conn = transport.last_connection().unwrap();
    assert!(!conn.is_connected(), "queue end released the connection; pause must not touch it");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeat_track_replays_the_head_without_dequeue() {
    let h = harness(DecoderScript::EmitThenEof(pcm_bytes_for_secs(1)));
    h.engine
        .enqueue(GUILD, vec![test_track("A", Some(Duration::from_secs(10)))], false)
        .await
        .unwrap();
    h.engine.set_repeat(GUILD, RepeatMode::Track).await.unwrap();
    h.engine.play(GUILD, "start", false).await.unwrap();

    assert!(wait_for(|| h.decoder.spawn_count() >= 3, Duration::from_secs(2)).await);

    let state = h.store.get(GUILD).unwrap();
    assert_eq!(state.queue_tracks().len(), 1);
    assert!(state.history_tracks().is_empty(), "RepeatTrack must not touch history");
    h.engine.clear(GUILD).await.unwrap();
}
