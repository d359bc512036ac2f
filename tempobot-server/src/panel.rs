//! tempobot-server/src/panel.rs
//!
//! The "now playing" panel: one text message per guild, edited in place on
//! every state change. The panel channel is bound to wherever the last
//! command came from; if the edit fails (message deleted, permissions) a
//! fresh message is posted and its id remembered instead.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use twilight_http::Client as HttpClient;
use twilight_model::id::Id;
use twilight_model::id::marker::{ChannelMarker, MessageMarker};

use tempobot_common::Error;
use tempobot_common::models::player::{PlayerSnapshot, PlayerStatus, RepeatMode};
use tempobot_common::traits::notify::NotificationSink;
use tempobot_core::player::PROGRESS_SEGMENTS;

struct PanelRef {
    channel_id: Id<ChannelMarker>,
    message_id: Option<Id<MessageMarker>>,
}

pub struct PanelNotifier {
    http: Arc<HttpClient>,
    panels: DashMap<String, PanelRef>,
}

impl PanelNotifier {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http, panels: DashMap::new() }
    }

    /// Point the guild's panel at a channel. A channel change orphans the
    /// old message; a fresh one is posted on the next refresh.
    pub fn bind_channel(&self, guild_id: &str, channel_id: &str) -> Result<(), Error> {
        let parsed: u64 = channel_id
            .parse()
            .map_err(|_| Error::Parse(format!("invalid channel id: {channel_id}")))?;
        let channel_id = Id::new(parsed);
        let mut entry = self.panels.entry(guild_id.to_string()).or_insert(PanelRef {
            channel_id,
            message_id: None,
        });
        if entry.channel_id != channel_id {
            entry.channel_id = channel_id;
            entry.message_id = None;
        }
        Ok(())
    }

    async fn post_new(&self, guild_id: &str, channel_id: Id<ChannelMarker>, text: &str) {
        match self.http.create_message(channel_id).content(text).await {
            Ok(resp) => match resp.model().await {
                Ok(msg) => {
                    if let Some(mut entry) = self.panels.get_mut(guild_id) {
                        entry.message_id = Some(msg.id);
                    }
                }
                Err(e) => warn!("guild {guild_id}: could not read posted panel: {e}"),
            },
            Err(e) => warn!("guild {guild_id}: could not post panel: {e}"),
        }
    }
}

#[async_trait]
impl NotificationSink for PanelNotifier {
    async fn refresh(
        &self,
        guild_id: &str,
        snapshot: PlayerSnapshot,
        message: Option<String>,
    ) -> Result<(), Error> {
        let (channel_id, message_id) = match self.panels.get(guild_id) {
            Some(entry) => (entry.channel_id, entry.message_id),
            None => {
                debug!("guild {guild_id}: no panel channel bound; dropping refresh");
                return Ok(());
            }
        };

        let text = render_panel(&snapshot, message.as_deref());

        if let Some(message_id) = message_id {
            match self
                .http
                .update_message(channel_id, message_id)
                .content(Some(&text))
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => {
                    debug!("guild {guild_id}: panel edit failed ({e}); reposting");
                }
            }
        }
        self.post_new(guild_id, channel_id, &text).await;
        Ok(())
    }
}

fn format_time(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

fn progress_bar(elapsed_secs: u64, duration_secs: Option<u64>) -> String {
    let segments = PROGRESS_SEGMENTS as u64;
    let filled = match duration_secs {
        Some(d) if d > 0 => (elapsed_secs * segments / d).min(segments),
        _ => 0,
    };
    let mut bar = String::new();
    for i in 0..segments {
        bar.push(if i < filled { '▰' } else { '▱' });
    }
    bar
}

/// Pure renderer, so the layout is unit-testable without an HTTP client.
fn render_panel(snapshot: &PlayerSnapshot, message: Option<&str>) -> String {
    let mut out = String::new();

    if let Some(msg) = message {
        out.push_str(&format!("> {msg}\n\n"));
    }

    match (&snapshot.now_playing, snapshot.status) {
        (Some(track), status) => {
            let marker = match status {
                PlayerStatus::Playing => "▶",
                PlayerStatus::Paused => "⏸",
                PlayerStatus::Stopped => "⏹",
            };
            out.push_str(&format!("{marker} **{}** — {}\n", track.title, track.author));
            let elapsed = format_time(snapshot.elapsed_secs);
            match track.duration_secs {
                Some(total) => {
                    out.push_str(&format!(
                        "{} {elapsed} / {}\n",
                        progress_bar(snapshot.elapsed_secs, Some(total)),
                        format_time(total)
                    ));
                }
                None => {
                    out.push_str(&format!(
                        "{} {elapsed} / ?\n",
                        progress_bar(snapshot.elapsed_secs, None)
                    ));
                }
            }
        }
        (None, _) => {
            out.push_str("⏹ Nothing playing\n");
        }
    }

    if !snapshot.upcoming.is_empty() {
        out.push_str("\n**Up next**\n");
        for (i, track) in snapshot.upcoming.iter().enumerate() {
            out.push_str(&format!("{}. {} — {}\n", i + 1, track.title, track.author));
        }
        let shown = snapshot.upcoming.len() + 1;
        if snapshot.queue_len > shown {
            out.push_str(&format!("…and {} more\n", snapshot.queue_len - shown));
        }
    }

    if snapshot.repeat != RepeatMode::Off {
        out.push_str(&format!("\nRepeat: {}", snapshot.repeat.as_str()));
    }

    out
}
