use serde::{Deserialize, Serialize};

/// Player state machine. Stopped means no queue position is meaningful;
/// Paused keeps the head of the queue and its elapsed offset so playback
/// can resume mid-track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerStatus {
    Stopped,
    Paused,
    Playing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeatMode {
    Off,
    Track,
    Queue,
}

impl RepeatMode {
    pub fn from_string(s: &str) -> Option<RepeatMode> {
        match s.to_lowercase().as_str() {
            "off" | "none" => Some(RepeatMode::Off),
            "track" | "one" => Some(RepeatMode::Track),
            "queue" | "all" => Some(RepeatMode::Queue),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatMode::Off => "off",
            RepeatMode::Track => "track",
            RepeatMode::Queue => "queue",
        }
    }
}

/// Display-facing projection of a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub title: String,
    pub author: String,
    pub duration_secs: Option<u64>,
    pub public_url: Option<String>,
    pub provider: String,
}

/// Immutable snapshot of a guild's player, handed to the notification sink
/// on every state change. The sink never reaches back into live state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSnapshot {
    pub guild_id: String,
    pub status: PlayerStatus,
    pub repeat: RepeatMode,
    pub elapsed_secs: u64,
    /// Head of the queue while status is Playing or Paused.
    pub now_playing: Option<TrackInfo>,
    /// Queue beyond the head, truncated for display.
    pub upcoming: Vec<TrackInfo>,
    pub queue_len: usize,
    pub history_len: usize,
}
