//! Per-guild player state and the store that owns it.
//!
//! One `PlayerState` per guild, shared between the control operations and
//! the streaming loop. Field-level locking: the queue, history and scalar
//! fields sit behind short-lived parking_lot mutexes that are never held
//! across an await; the coordination flags are atomics. By convention only
//! the loop transitions Playing -> Paused on completion, and only control
//! operations raise `stop_requested`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tempobot_common::Error;
use tempobot_common::models::player::{PlayerSnapshot, PlayerStatus, RepeatMode};
use tempobot_common::models::track::Track;
use tempobot_common::traits::transport::VoiceConnection;

/// Previously played tracks kept for "previous" and display.
const HISTORY_CAP: usize = 50;

/// How much of the queue a snapshot carries beyond the head.
const SNAPSHOT_UPCOMING: usize = 10;

pub struct PlayerState {
    guild_id: String,

    pub(crate) queue: Mutex<VecDeque<Arc<Track>>>,
    pub(crate) history: Mutex<Vec<Arc<Track>>>,

    pub(crate) status: Mutex<PlayerStatus>,
    pub(crate) repeat: Mutex<RepeatMode>,
    /// Cumulative offset within the current head track. Only meaningful
    /// while the head has not changed.
    pub(crate) elapsed: Mutex<Duration>,

    pub(crate) stop_requested: AtomicBool,
    pub(crate) reconnect_requested: AtomicBool,

    pub(crate) cancel: Mutex<Option<CancellationToken>>,
    pub(crate) stop_ack: Mutex<Option<oneshot::Sender<()>>>,
    /// Display reason stored by `play()` and consumed once by the loop.
    pub(crate) pending_reason: Mutex<Option<String>>,

    pub(crate) loop_active: AtomicBool,
    pub(crate) loop_task: Mutex<Option<JoinHandle<()>>>,

    pub(crate) voice_channel: Mutex<Option<String>>,
    pub(crate) connection: Mutex<Option<Arc<dyn VoiceConnection>>>,
}

impl PlayerState {
    fn new(guild_id: impl Into<String>) -> Self {
        Self {
            guild_id: guild_id.into(),
            queue: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            status: Mutex::new(PlayerStatus::Stopped),
            repeat: Mutex::new(RepeatMode::Off),
            elapsed: Mutex::new(Duration::ZERO),
            stop_requested: AtomicBool::new(false),
            reconnect_requested: AtomicBool::new(false),
            cancel: Mutex::new(None),
            stop_ack: Mutex::new(None),
            pending_reason: Mutex::new(None),
            loop_active: AtomicBool::new(false),
            loop_task: Mutex::new(None),
            voice_channel: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    pub fn guild_id(&self) -> &str {
        &self.guild_id
    }

    pub fn status(&self) -> PlayerStatus {
        *self.status.lock()
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        *self.repeat.lock()
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    pub fn loop_active(&self) -> bool {
        self.loop_active.load(Ordering::SeqCst)
    }

    pub fn queue_tracks(&self) -> Vec<Arc<Track>> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn history_tracks(&self) -> Vec<Arc<Track>> {
        self.history.lock().clone()
    }

    pub fn voice_channel(&self) -> Option<String> {
        self.voice_channel.lock().clone()
    }

    pub(crate) fn set_status(&self, status: PlayerStatus) {
        *self.status.lock() = status;
    }

    pub(crate) fn set_elapsed(&self, elapsed: Duration) {
        *self.elapsed.lock() = elapsed;
    }

    pub(crate) fn peek_head(&self) -> Option<Arc<Track>> {
        self.queue.lock().front().cloned()
    }

    /// Dequeue the head only if it is still `track`. The identity check is
    /// what keeps a loop advance and a concurrent `skip` from both removing
    /// an element.
    pub(crate) fn drop_head(&self, track: &Arc<Track>) -> bool {
        let mut queue = self.queue.lock();
        match queue.front() {
            Some(head) if Arc::ptr_eq(head, track) => {
                queue.pop_front();
                true
            }
            _ => false,
        }
    }

    pub(crate) fn drop_head_to_history(&self, track: &Arc<Track>) -> bool {
        if self.drop_head(track) {
            self.push_history(track.clone());
            true
        } else {
            false
        }
    }

    pub(crate) fn push_history(&self, track: Arc<Track>) {
        let mut history = self.history.lock();
        history.push(track);
        if history.len() > HISTORY_CAP {
            history.remove(0);
        }
    }

    pub(crate) fn pop_history(&self) -> Option<Arc<Track>> {
        self.history.lock().pop()
    }

    /// Fulfill the stop-completion signal, if a control operation is
    /// waiting on one.
    pub(crate) fn ack_stop(&self) {
        if let Some(tx) = self.stop_ack.lock().take() {
            let _ = tx.send(());
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        let status = self.status();
        let queue = self.queue.lock();
        let now_playing = match status {
            PlayerStatus::Playing | PlayerStatus::Paused => queue.front().map(|t| t.info()),
            PlayerStatus::Stopped => None,
        };
        PlayerSnapshot {
            guild_id: self.guild_id.clone(),
            status,
            repeat: self.repeat_mode(),
            elapsed_secs: self.elapsed().as_secs(),
            now_playing,
            upcoming: queue.iter().skip(1).take(SNAPSHOT_UPCOMING).map(|t| t.info()).collect(),
            queue_len: queue.len(),
            history_len: self.history.lock().len(),
        }
    }
}

/// Guild id -> player state. Constructed once at startup and handed to the
/// engine; entries are added when the bot joins a guild and removed when it
/// leaves. Deliberately not a process-wide static.
pub struct PlayerStore {
    players: DashMap<String, Arc<PlayerState>>,
}

impl PlayerStore {
    pub fn new() -> Self {
        Self {
            players: DashMap::new(),
        }
    }

    /// Register a guild, returning the existing state if already present.
    pub fn create_player(&self, guild_id: &str) -> Arc<PlayerState> {
        self.players
            .entry(guild_id.to_string())
            .or_insert_with(|| Arc::new(PlayerState::new(guild_id)))
            .clone()
    }

    /// Unknown guilds are a caller error: the guild must be registered
    /// before any control operation is issued for it.
    pub fn get(&self, guild_id: &str) -> Result<Arc<PlayerState>, Error> {
        self.players
            .get(guild_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::NotFound(format!("no player registered for guild {guild_id}")))
    }

    pub fn remove_player(&self, guild_id: &str) -> Option<Arc<PlayerState>> {
        self.players.remove(guild_id).map(|(_, state)| state)
    }

    pub fn guild_ids(&self) -> Vec<String> {
        self.players.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for PlayerStore {
    fn default() -> Self {
        Self::new()
    }
}
