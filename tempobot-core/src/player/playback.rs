//! The per-guild streaming loop.
//!
//! One logical task per `play()` invocation. Each iteration peeks (never
//! pops) the queue head, resolves and probes its stream URL, spawns the
//! decoder subprocess seeked to the current elapsed offset, and copies PCM
//! into the voice sink until EOF or cancellation. The head is dequeued only
//! once the track's outcome is known. Per-track failures are logged and the
//! track skipped; they never take the loop down.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tempobot_common::Error;
use tempobot_common::models::player::{PlayerStatus, RepeatMode};
use tempobot_common::models::track::Track;

use crate::decoder::pcm_duration;
use crate::player::engine::EngineInner;
use crate::player::state::PlayerState;

/// Number of cells in the rendered progress bar; the progress timer fires
/// once per cell.
pub const PROGRESS_SEGMENTS: u32 = 12;

const COPY_CHUNK: usize = 8192;

/// Fallback progress-timer period when the track duration is unknown.
const UNKNOWN_DURATION_TICK: Duration = Duration::from_secs(10);

enum CopyOutcome {
    Finished,
    Cancelled,
    Failed(Error),
}

/// Clears the loop-active bookkeeping exactly once, either explicitly
/// before acknowledging a stop or on drop (covering error paths and task
/// abort). Dropping the ack sender on the way out wakes any control
/// operation still waiting on a loop that exits without acknowledging.
struct LoopGuard {
    state: Arc<PlayerState>,
    armed: bool,
}

impl LoopGuard {
    fn new(state: Arc<PlayerState>) -> Self {
        Self { state, armed: true }
    }

    fn release(&mut self) {
        if self.armed {
            self.armed = false;
            self.state.loop_active.store(false, Ordering::SeqCst);
            *self.state.cancel.lock() = None;
            *self.state.loop_task.lock() = None;
        }
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.release();
        *self.state.stop_ack.lock() = None;
    }
}

pub(crate) async fn run_playback_loop(
    engine: Arc<EngineInner>,
    state: Arc<PlayerState>,
    cancel: CancellationToken,
) {
    let mut guard = LoopGuard::new(Arc::clone(&state));

    loop {
        let Some(track) = state.peek_head() else {
            break;
        };

        state.set_status(PlayerStatus::Playing);
        let reason = state.pending_reason.lock().take();
        engine.notify(&state, reason).await;

        let url = match resolve_playable(&engine, &track).await {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    "guild {}: skipping unplayable track '{}': {e}",
                    state.guild_id(),
                    track.title
                );
                state.drop_head(&track);
                state.set_elapsed(Duration::ZERO);
                continue;
            }
        };

        let start_at = state.elapsed();

        // Fast-forward: a resumed offset at or past the end means the track
        // already finished; advance without spawning a decoder.
        if let Some(duration) = track.duration {
            if !duration.is_zero() && start_at >= duration {
                state.set_elapsed(Duration::ZERO);
                advance_after_finish(&state, &track);
                continue;
            }
        }

        let conn = state.connection.lock().clone();
        let Some(conn) = conn else {
            warn!("guild {}: no live voice connection; stopping loop", state.guild_id());
            break;
        };
        let mut sink = match conn.open_sink().await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(
                    "guild {}: could not open voice sink for '{}': {e}",
                    state.guild_id(),
                    track.title
                );
                state.drop_head(&track);
                state.set_elapsed(Duration::ZERO);
                continue;
            }
        };

        let mut stream = match engine.decoder.spawn(&url, start_at).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "guild {}: decoder failed for '{}': {e}",
                    state.guild_id(),
                    track.title
                );
                state.drop_head(&track);
                state.set_elapsed(Duration::ZERO);
                continue;
            }
        };

        debug!(
            "guild {}: streaming '{}' from {:?}",
            state.guild_id(),
            track.title,
            start_at
        );

        let copied = Arc::new(AtomicU64::new(0));
        let timer = spawn_progress_timer(
            Arc::clone(&engine),
            Arc::clone(&state),
            track.duration,
            start_at,
            Arc::clone(&copied),
        );

        let outcome = copy_pcm(stream.reader_mut(), sink.as_mut(), &cancel, &copied).await;

        timer.abort();
        stream.shutdown().await;
        let played = pcm_duration(copied.load(Ordering::SeqCst));

        match outcome {
            CopyOutcome::Cancelled => {
                state.set_elapsed(start_at + played);
                state.set_status(PlayerStatus::Paused);
                if state.stop_requested.swap(false, Ordering::SeqCst) {
                    // Deliberate stop: clear the bookkeeping first so the
                    // waiting control operation sees a quiesced loop the
                    // moment the ack lands.
                    guard.release();
                    state.ack_stop();
                } else {
                    // Transport dropped mid-stream. Not acknowledged as a
                    // clean stop; the reconnect path decides what happens
                    // next, with elapsed preserved for resume.
                    info!(
                        "guild {}: stream interrupted at {:?} without a stop request",
                        state.guild_id(),
                        start_at + played
                    );
                }
                return;
            }
            CopyOutcome::Finished => {
                state.set_elapsed(Duration::ZERO);
                state.set_status(PlayerStatus::Paused);
                advance_after_finish(&state, &track);
                continue;
            }
            CopyOutcome::Failed(e) => {
                warn!(
                    "guild {}: playback error on '{}': {e}; skipping",
                    state.guild_id(),
                    track.title
                );
                state.set_elapsed(Duration::ZERO);
                state.drop_head(&track);
                continue;
            }
        }
    }

    engine.finish_idle(&state).await;
}

/// Resolve the track's stream URL and make sure it still answers; a stale
/// URL gets exactly one re-resolve before the track is given up on.
async fn resolve_playable(engine: &EngineInner, track: &Arc<Track>) -> Result<String, Error> {
    let url = track.stream_url().await?;
    if engine.probe.is_reachable(&url).await {
        return Ok(url);
    }
    debug!("stream URL for '{}' went stale; re-resolving", track.title);
    track.invalidate_stream_url();
    let url = track.stream_url().await?;
    if engine.probe.is_reachable(&url).await {
        return Ok(url);
    }
    Err(Error::NotFound(format!(
        "stream for '{}' is unreachable after re-resolve",
        track.title
    )))
}

/// Natural end of a track: push it to history and advance the queue
/// according to the repeat mode. RepeatTrack leaves the head in place.
fn advance_after_finish(state: &Arc<PlayerState>, track: &Arc<Track>) {
    match state.repeat_mode() {
        RepeatMode::Track => {}
        RepeatMode::Off => {
            state.drop_head_to_history(track);
        }
        RepeatMode::Queue => {
            if state.drop_head_to_history(track) {
                state.queue.lock().push_back(Arc::clone(track));
            }
        }
    }
}

/// Periodic display refresh while a track streams. Elapsed time is derived
/// from the copied byte count, which is exact for the fixed PCM format.
fn spawn_progress_timer(
    engine: Arc<EngineInner>,
    state: Arc<PlayerState>,
    duration: Option<Duration>,
    start_at: Duration,
    copied: Arc<AtomicU64>,
) -> JoinHandle<()> {
    let tick = match duration {
        Some(d) if !d.is_zero() => {
            let t = d / PROGRESS_SEGMENTS;
            if t < Duration::from_secs(1) { Duration::from_secs(1) } else { t }
        }
        _ => UNKNOWN_DURATION_TICK,
    };
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.tick().await; // first tick completes immediately
        loop {
            interval.tick().await;
            let played = pcm_duration(copied.load(Ordering::SeqCst));
            state.set_elapsed(start_at + played);
            engine.notify(&state, None).await;
        }
    })
}

/// Copy decoder output into the voice sink until EOF or cancellation.
/// Cancellation is cooperative at chunk granularity: an in-flight chunk
/// write always completes before the loop yields.
async fn copy_pcm(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    sink: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
    copied: &AtomicU64,
) -> CopyOutcome {
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return CopyOutcome::Cancelled,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = sink.flush().await;
                    return CopyOutcome::Finished;
                }
                Ok(n) => {
                    if let Err(e) = sink.write_all(&buf[..n]).await {
                        return CopyOutcome::Failed(e.into());
                    }
                    copied.fetch_add(n as u64, Ordering::SeqCst);
                }
                Err(e) => return CopyOutcome::Failed(e.into()),
            },
        }
    }
}
