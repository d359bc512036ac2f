//! Playback engine control surface.
//!
//! One engine serves every guild; per-guild isolation comes from the
//! `PlayerState` looked up in the store. All operations are safe to call
//! from any number of concurrent command handlers. Conflicting effects are
//! serialized by stopping the streaming loop and waiting for its
//! stop-completion signal before touching what the loop owns.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tempobot_common::Error;
use tempobot_common::models::player::{PlayerStatus, RepeatMode};
use tempobot_common::models::track::Track;
use tempobot_common::traits::notify::NotificationSink;
use tempobot_common::traits::transport::VoiceTransport;

use crate::decoder::PcmDecoder;
use crate::player::playback::run_playback_loop;
use crate::player::state::{PlayerState, PlayerStore};
use crate::probe::StreamProbe;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a control operation waits for the loop to acknowledge a
    /// stop before force-terminating it.
    pub stop_ack_timeout: Duration,
    /// Grace period before re-connecting after an expected disconnect.
    pub reconnect_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_ack_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Shared collaborators and config, behind one Arc so the streaming loop
/// can be spawned from `&self` methods.
pub(crate) struct EngineInner {
    pub(crate) store: Arc<PlayerStore>,
    pub(crate) transport: Arc<dyn VoiceTransport>,
    pub(crate) decoder: Arc<dyn PcmDecoder>,
    pub(crate) probe: Arc<dyn StreamProbe>,
    pub(crate) notifier: Arc<dyn NotificationSink>,
    pub(crate) config: EngineConfig,
}

#[derive(Clone)]
pub struct PlaybackEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl PlaybackEngine {
    pub fn new(
        store: Arc<PlayerStore>,
        transport: Arc<dyn VoiceTransport>,
        decoder: Arc<dyn PcmDecoder>,
        probe: Arc<dyn StreamProbe>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self::with_config(store, transport, decoder, probe, notifier, EngineConfig::default())
    }

    pub fn with_config(
        store: Arc<PlayerStore>,
        transport: Arc<dyn VoiceTransport>,
        decoder: Arc<dyn PcmDecoder>,
        probe: Arc<dyn StreamProbe>,
        notifier: Arc<dyn NotificationSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                transport,
                decoder,
                probe,
                notifier,
                config,
            }),
        }
    }

    pub fn store(&self) -> &Arc<PlayerStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Record which voice channel this guild's playback targets. The
    /// association itself is resolved by the command layer.
    pub fn set_voice_channel(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        *state.voice_channel.lock() = Some(channel_id.to_string());
        Ok(())
    }

    pub async fn set_repeat(&self, guild_id: &str, mode: RepeatMode) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        *state.repeat.lock() = mode;
        self.inner
            .notify(&state, Some(format!("Repeat mode: {}", mode.as_str())))
            .await;
        Ok(())
    }

    /// Refresh the display without changing any state (e.g. for a `queue`
    /// command).
    pub async fn refresh_display(&self, guild_id: &str, message: Option<String>) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        self.inner.notify(&state, message).await;
        Ok(())
    }

    /// Append tracks to the queue tail, or splice them in right after the
    /// current head so the playing track is undisturbed. Never starts
    /// playback by itself.
    pub async fn enqueue(
        &self,
        guild_id: &str,
        tracks: Vec<Arc<Track>>,
        at_head: bool,
    ) -> Result<(), Error> {
        if tracks.is_empty() {
            return Ok(());
        }
        let state = self.inner.store.get(guild_id)?;
        let count = tracks.len();
        {
            let mut queue = state.queue.lock();
            if at_head && !queue.is_empty() {
                for track in tracks.into_iter().rev() {
                    queue.insert(1, track);
                }
            } else {
                queue.extend(tracks);
            }
        }
        debug!("guild {guild_id}: enqueued {count} track(s), at_head={at_head}");
        self.inner.notify(&state, None).await;
        Ok(())
    }

    /// Start (or resume) playback. If a loop is already running and
    /// `force` is false this only affects the display: the pending reason
    /// is replaced if the loop has not shown it yet, otherwise a refresh
    /// with `reason` goes out directly. `force` is the reconnect path's
    /// bypass, used when the previous loop has already unwound.
    pub async fn play(
        &self,
        guild_id: &str,
        reason: impl Into<String>,
        force: bool,
    ) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        let reason = reason.into();

        if force && state.loop_active.load(Ordering::SeqCst) {
            // Forced restart while a loop is still winding down: quiesce it
            // first so two loops never overlap.
            self.inner.stop_loop_and_wait(&state).await;
        }

        // Claim the loop slot up front so concurrent plays cannot
        // double-connect or double-spawn.
        if state.loop_active.swap(true, Ordering::SeqCst) {
            if force {
                warn!("guild {guild_id}: loop survived a forced stop; not spawning another");
                return Ok(());
            }
            // Already playing: this call only affects the display. If the
            // loop has not shown the previous reason yet, replace it and
            // let the loop's refresh carry it; otherwise refresh directly.
            let direct_refresh = {
                let mut pending = state.pending_reason.lock();
                if pending.is_some() {
                    *pending = Some(reason.clone());
                    false
                } else {
                    true
                }
            };
            if direct_refresh {
                self.inner.notify(&state, Some(reason)).await;
            }
            return Ok(());
        }

        let Some(channel) = state.voice_channel.lock().clone() else {
            state.loop_active.store(false, Ordering::SeqCst);
            return Err(Error::Platform(format!("guild {guild_id} has no voice channel set")));
        };

        // Reuse a live connection; otherwise establish a fresh one.
        let live = state
            .connection
            .lock()
            .as_ref()
            .map(|c| c.is_connected())
            .unwrap_or(false);
        if !live {
            match self.inner.transport.connect(guild_id, &channel).await {
                Ok(conn) => *state.connection.lock() = Some(conn),
                Err(e) => {
                    state.loop_active.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        *state.pending_reason.lock() = Some(reason);

        let cancel = CancellationToken::new();
        *state.cancel.lock() = Some(cancel.clone());

        state.set_status(PlayerStatus::Playing);
        state.stop_requested.store(false, Ordering::SeqCst);

        let inner = Arc::clone(&self.inner);
        let loop_state = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            run_playback_loop(inner, loop_state, cancel).await;
        });
        *state.loop_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop after the current chunk write and hold position. Blocks until
    /// the loop acknowledges, bounded by the stop-ack timeout; a wedged
    /// decoder is force-terminated rather than left to hang the caller.
    pub async fn pause(&self, guild_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        if !state.loop_active.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop_loop_and_wait(&state).await;
        if state.status() == PlayerStatus::Stopped {
            // The loop drained the queue and parked the player before it
            // could observe the stop request. Stopped wins over a late
            // pause; Paused with no head would be a lie.
            state.stop_requested.store(false, Ordering::SeqCst);
            debug!("guild {guild_id}: queue ended before the pause landed");
            return Ok(());
        }
        state.set_status(PlayerStatus::Paused);
        self.inner.notify(&state, Some("Paused".to_string())).await;
        Ok(())
    }

    /// Drop the current head (into history), stop the loop and restart
    /// playback on the next track. No-op on an empty queue.
    pub async fn skip(&self, guild_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        let Some(track) = state.queue.lock().pop_front() else {
            return Ok(());
        };
        state.push_history(track.clone());
        if state.repeat_mode() == RepeatMode::Queue {
            state.queue.lock().push_back(track);
        }
        if state.loop_active.load(Ordering::SeqCst) {
            self.inner.stop_loop_and_wait(&state).await;
        }
        // The head changed, so the old offset is meaningless. Reset after
        // the loop has quiesced; its cancellation path writes elapsed too.
        state.set_elapsed(Duration::ZERO);
        self.play(guild_id, "Skipped", false).await
    }

    /// Return to the most recent history entry. With no history this is a
    /// no-op and does not refresh the display.
    pub async fn previous(&self, guild_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        let Some(track) = state.pop_history() else {
            return Ok(());
        };
        if state.loop_active.load(Ordering::SeqCst) {
            self.inner.stop_loop_and_wait(&state).await;
        }
        state.queue.lock().push_front(track);
        state.set_elapsed(Duration::ZERO);
        self.play(guild_id, "Previous track", false).await
    }

    /// Randomly permute everything behind the head. The head is the track
    /// the loop is streaming and must not move; holding the queue lock for
    /// the whole permutation keeps the loop's peek consistent.
    pub async fn shuffle(&self, guild_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        {
            let mut queue = state.queue.lock();
            if queue.len() > 2 {
                let mut rest: Vec<Arc<Track>> = queue.iter().skip(1).cloned().collect();
                rest.shuffle(&mut rand::rng());
                queue.truncate(1);
                queue.extend(rest);
            }
        }
        self.inner.notify(&state, Some("Queue shuffled".to_string())).await;
        Ok(())
    }

    /// Full stop: loop terminated, queue emptied, transport disconnected,
    /// player back to Stopped.
    pub async fn clear(&self, guild_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        if state.loop_active.load(Ordering::SeqCst) {
            self.inner.stop_loop_and_wait(&state).await;
        }
        state.queue.lock().clear();
        state.set_elapsed(Duration::ZERO);
        let conn = state.connection.lock().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.disconnect().await {
                warn!("guild {guild_id}: disconnect failed: {e}");
            }
        }
        state.set_status(PlayerStatus::Stopped);
        state.stop_requested.store(false, Ordering::SeqCst);
        self.inner.notify(&state, Some("Queue cleared".to_string())).await;
        Ok(())
    }

    /// Move playback to another voice channel. An idle player just records
    /// the new target; a playing one is quiesced, re-connected there and
    /// resumed from its elapsed offset.
    pub async fn move_voice_channel(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        let was_playing = state.status() == PlayerStatus::Playing;
        if state.loop_active.load(Ordering::SeqCst) {
            self.inner.stop_loop_and_wait(&state).await;
        }
        *state.voice_channel.lock() = Some(channel_id.to_string());
        let conn = state.connection.lock().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.disconnect().await {
                warn!("guild {guild_id}: disconnect during move failed: {e}");
            }
        }
        if was_playing {
            self.play(guild_id, "Moved voice channel", false).await
        } else {
            Ok(())
        }
    }

    /// Flag the next transport disconnect as expected (channel move); the
    /// disconnect handler will re-connect and resume instead of pausing.
    pub fn request_reconnect(&self, guild_id: &str, new_channel: Option<&str>) -> Result<(), Error> {
        let state = self.inner.store.get(guild_id)?;
        if let Some(channel) = new_channel {
            *state.voice_channel.lock() = Some(channel.to_string());
        }
        state.reconnect_requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl EngineInner {
    /// Refresh the user-facing display. Sink failures are logged and
    /// swallowed; they must never break playback.
    pub(crate) async fn notify(&self, state: &Arc<PlayerState>, message: Option<String>) {
        let snapshot = state.snapshot();
        if let Err(e) = self
            .notifier
            .refresh(state.guild_id(), snapshot, message)
            .await
        {
            warn!("display refresh failed for guild {}: {e}", state.guild_id());
        }
    }

    /// Ask the running loop to stop and wait for its acknowledgment.
    /// Returns true when the loop acknowledged (or had already exited);
    /// false means the timeout fired and the loop was force-terminated.
    pub(crate) async fn stop_loop_and_wait(&self, state: &Arc<PlayerState>) -> bool {
        if !state.loop_active.load(Ordering::SeqCst) {
            return true;
        }

        let (tx, rx) = oneshot::channel();
        *state.stop_ack.lock() = Some(tx);
        state.stop_requested.store(true, Ordering::SeqCst);
        let token = state.cancel.lock().clone();
        if let Some(token) = token {
            token.cancel();
        }

        // The loop may have exited between the first check and installing
        // the ack sender; its guard closes the channel, which resolves the
        // wait below immediately, so no special case is needed here.
        match tokio::time::timeout(self.config.stop_ack_timeout, rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => {
                // Sender dropped: the loop unwound without acknowledging
                // (disconnect path or plain exit). It is gone either way.
                debug!("guild {}: loop exited without stop ack", state.guild_id());
                true
            }
            Err(_) => {
                warn!(
                    "guild {}: stop not acknowledged within {:?}; force-terminating playback",
                    state.guild_id(),
                    self.config.stop_ack_timeout
                );
                let handle = state.loop_task.lock().take();
                if let Some(handle) = handle {
                    handle.abort();
                    let _ = handle.await;
                }
                state.loop_active.store(false, Ordering::SeqCst);
                *state.cancel.lock() = None;
                *state.stop_ack.lock() = None;
                state.stop_requested.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Loop epilogue once the queue is observed empty: release the voice
    /// connection and park the player in Stopped.
    pub(crate) async fn finish_idle(&self, state: &Arc<PlayerState>) {
        let conn = state.connection.lock().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.disconnect().await {
                warn!("guild {}: disconnect failed: {e}", state.guild_id());
            }
        }
        state.set_status(PlayerStatus::Stopped);
        state.set_elapsed(Duration::ZERO);
        info!("guild {}: queue finished", state.guild_id());
        self.notify(state, Some("Queue finished".to_string())).await;
    }
}
