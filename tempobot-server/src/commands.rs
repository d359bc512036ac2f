//! tempobot-server/src/commands.rs
//!
//! Chat command parsing and dispatch. Every inbound guild message runs
//! through `handle_message`; unknown or non-prefixed text is ignored.
//! Commands that start playback need the invoker to sit in a voice
//! channel, resolved from the gateway cache.

use std::sync::Arc;

use tracing::{info, warn};

use tempobot_common::Error;
use tempobot_common::models::player::{PlayerStatus, RepeatMode};
use tempobot_common::traits::provider::TrackProvider;
use tempobot_core::player::PlaybackEngine;

use crate::discord::{DiscordMessageEvent, DiscordPlatform};
use crate::panel::PanelNotifier;

/// How many results a free-text query may enqueue at once. URL playlists
/// are not capped by this.
const QUERY_LIMIT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `play` with no argument resumes; with an argument it queues.
    Play(Option<String>),
    /// Queue right after the current track.
    PlayNext(String),
    Pause,
    Skip,
    Previous,
    Shuffle,
    Clear,
    Queue,
    Repeat(Option<String>),
    Join,
}

/// Parse a chat line into a command. Returns None for anything that is
/// not ours, including a bare prefix.
pub fn parse_command(prefix: &str, text: &str) -> Option<Command> {
    let rest = text.strip_prefix(prefix)?.trim();
    if rest.is_empty() {
        return None;
    }
    let (word, arg) = match rest.split_once(char::is_whitespace) {
        Some((w, a)) => (w, a.trim()),
        None => (rest, ""),
    };
    let arg_opt = if arg.is_empty() { None } else { Some(arg.to_string()) };

    match word.to_lowercase().as_str() {
        "play" | "p" => Some(Command::Play(arg_opt)),
        "playnext" | "pn" => arg_opt.map(Command::PlayNext),
        "pause" => Some(Command::Pause),
        "skip" | "next" | "s" => Some(Command::Skip),
        "prev" | "previous" | "back" => Some(Command::Previous),
        "shuffle" => Some(Command::Shuffle),
        "clear" | "stop" => Some(Command::Clear),
        "queue" | "q" => Some(Command::Queue),
        "repeat" | "loop" => Some(Command::Repeat(arg_opt)),
        "join" | "summon" => Some(Command::Join),
        _ => None,
    }
}

pub struct CommandContext {
    pub engine: PlaybackEngine,
    pub provider: Arc<dyn TrackProvider>,
    pub discord: Arc<DiscordPlatform>,
    pub panel: Arc<PanelNotifier>,
    pub prefix: String,
}

impl CommandContext {
    pub async fn handle_message(&self, event: &DiscordMessageEvent) {
        let Some(command) = parse_command(&self.prefix, &event.text) else {
            return;
        };
        info!(
            "guild {}: {} ran {:?}",
            event.guild_id, event.username, command
        );

        self.engine.store().create_player(&event.guild_id);
        if let Err(e) = self.panel.bind_channel(&event.guild_id, &event.channel_id) {
            warn!("guild {}: could not bind panel channel: {e}", event.guild_id);
        }

        if let Err(e) = self.dispatch(command, event).await {
            warn!("guild {}: command failed: {e}", event.guild_id);
            let _ = self
                .engine
                .refresh_display(&event.guild_id, Some(user_facing(&e)))
                .await;
        }
    }

    async fn dispatch(&self, command: Command, event: &DiscordMessageEvent) -> Result<(), Error> {
        let guild_id = event.guild_id.as_str();
        match command {
            Command::Play(None) => self.resume(event).await,
            Command::Play(Some(query)) => self.queue_tracks(event, &query, false).await,
            Command::PlayNext(query) => self.queue_tracks(event, &query, true).await,
            Command::Pause => self.engine.pause(guild_id).await,
            Command::Skip => self.engine.skip(guild_id).await,
            Command::Previous => self.engine.previous(guild_id).await,
            Command::Shuffle => self.engine.shuffle(guild_id).await,
            Command::Clear => self.engine.clear(guild_id).await,
            Command::Queue => self.engine.refresh_display(guild_id, None).await,
            Command::Repeat(arg) => {
                let Some(mode) = arg.as_deref().and_then(RepeatMode::from_string) else {
                    return self
                        .engine
                        .refresh_display(
                            guild_id,
                            Some("Repeat mode must be off, track or queue".to_string()),
                        )
                        .await;
                };
                self.engine.set_repeat(guild_id, mode).await
            }
            Command::Join => {
                let channel = self.require_voice(event)?;
                self.engine.move_voice_channel(guild_id, &channel).await
            }
        }
    }

    async fn resume(&self, event: &DiscordMessageEvent) -> Result<(), Error> {
        let guild_id = event.guild_id.as_str();
        let state = self.engine.store().get(guild_id)?;
        if state.queue_tracks().is_empty() {
            return self
                .engine
                .refresh_display(guild_id, Some("Nothing to play".to_string()))
                .await;
        }
        self.ensure_voice_target(event)?;
        self.engine.play(guild_id, "Resumed", false).await
    }

    async fn queue_tracks(
        &self,
        event: &DiscordMessageEvent,
        query: &str,
        at_head: bool,
    ) -> Result<(), Error> {
        let guild_id = event.guild_id.as_str();
        let tracks = self.provider.resolve(query, QUERY_LIMIT).await?;
        let reason = match tracks.as_slice() {
            [only] => format!("Queued {}", only.title),
            many => format!("Queued {} tracks", many.len()),
        };
        self.engine.enqueue(guild_id, tracks, at_head).await?;

        let state = self.engine.store().get(guild_id)?;
        if state.status() == PlayerStatus::Playing {
            // Already streaming; the enqueue refresh has shown the queue.
            return Ok(());
        }
        self.ensure_voice_target(event)?;
        self.engine.play(guild_id, reason, false).await
    }

    /// Point the player at the invoker's voice channel unless one is
    /// already set.
    fn ensure_voice_target(&self, event: &DiscordMessageEvent) -> Result<(), Error> {
        let state = self.engine.store().get(&event.guild_id)?;
        if state.voice_channel().is_some() {
            return Ok(());
        }
        let channel = self.require_voice(event)?;
        self.engine.set_voice_channel(&event.guild_id, &channel)
    }

    fn require_voice(&self, event: &DiscordMessageEvent) -> Result<String, Error> {
        self.discord
            .voice_channel_of(&event.guild_id, &event.user_id)
            .ok_or_else(|| {
                Error::Platform("Join a voice channel first".to_string())
            })
    }
}

/// Map an error to the short line shown in the panel. Internal detail
/// stays in the logs.
fn user_facing(e: &Error) -> String {
    match e {
        Error::NotFound(_) => "No results for that".to_string(),
        Error::PermissionDenied(_) => "That track is private or region-locked".to_string(),
        Error::UnsupportedLink(_) => "That link is not supported".to_string(),
        Error::Platform(msg) => msg.clone(),
        _ => "Something went wrong, try again".to_string(),
    }
}
