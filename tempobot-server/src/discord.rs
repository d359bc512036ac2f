//! tempobot-server/src/discord.rs
//!
//! Twilight gateway runtime. One shard runner task per shard pushes inbound
//! chat messages into an unbounded channel; the command loop consumes them
//! via `next_message_event`. Voice-state lookups go through the in-memory
//! cache so the command layer can tell where the invoking user sits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

use twilight_cache_inmemory::{InMemoryCache, ResourceType};
use twilight_gateway::{
    self as gateway, CloseFrame, Config, Event, EventTypeFlags, Intents, MessageSender, Shard,
    StreamExt,
};
use twilight_http::Client as HttpClient;
use twilight_http::client::ClientBuilder;
use twilight_model::gateway::payload::incoming::Ready as ReadyPayload;
use twilight_model::id::Id;
use twilight_model::id::marker::{GuildMarker, UserMarker};

use tempobot_common::Error;

#[derive(Debug, Clone)]
pub struct DiscordMessageEvent {
    pub guild_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub username: String,
    pub text: String,
}

/// The bot's own voice state changed: it was moved to another channel
/// (`channel_id` set) or kicked from voice entirely (`channel_id` None).
#[derive(Debug, Clone)]
pub struct DiscordVoiceEvent {
    pub guild_id: String,
    pub channel_id: Option<String>,
}

async fn shard_runner(
    mut shard: Shard,
    tx: UnboundedSender<DiscordMessageEvent>,
    voice_tx: UnboundedSender<DiscordVoiceEvent>,
    cache: Arc<InMemoryCache>,
) {
    let shard_id = shard.id().number();
    info!("(ShardRunner) Shard {shard_id} started. Listening for events.");

    let mut bot_user: Option<Id<UserMarker>> = None;

    while let Some(item) = shard.next_event(EventTypeFlags::all()).await {
        match item {
            Ok(event) => {
                cache.update(&event);

                match &event {
                    Event::Ready(ready) => {
                        let data: &ReadyPayload = ready.as_ref();
                        info!(
                            "Shard {shard_id} => READY as {} (ID={})",
                            data.user.name, data.user.id
                        );
                        bot_user = Some(data.user.id);
                    }
                    Event::VoiceStateUpdate(vsu) => {
                        // Only our own moves matter here; other users'
                        // voice states are served from the cache.
                        if bot_user != Some(vsu.user_id) {
                            continue;
                        }
                        let Some(guild_id) = vsu.guild_id else {
                            continue;
                        };
                        let _ = voice_tx.send(DiscordVoiceEvent {
                            guild_id: guild_id.to_string(),
                            channel_id: vsu.channel_id.map(|c| c.to_string()),
                        });
                    }
                    Event::MessageCreate(msg) => {
                        if msg.author.bot {
                            continue;
                        }
                        // Guild messages only; the player is per-guild.
                        let Some(guild_id) = msg.guild_id else {
                            continue;
                        };
                        let _ = tx.send(DiscordMessageEvent {
                            guild_id: guild_id.to_string(),
                            channel_id: msg.channel_id.to_string(),
                            user_id: msg.author.id.to_string(),
                            username: msg.author.name.clone(),
                            text: msg.content.clone(),
                        });
                    }
                    _ => {
                        trace!("Shard {shard_id} => unhandled event: {event:?}");
                    }
                }
            }
            Err(err) => {
                error!("Shard {shard_id} => error receiving event: {err:?}");
            }
        }
    }

    warn!("(ShardRunner) Shard {shard_id} event loop ended.");
}

pub struct DiscordPlatform {
    token: String,
    connected: bool,

    rx: Mutex<Option<UnboundedReceiver<DiscordMessageEvent>>>,
    voice_rx: Mutex<Option<UnboundedReceiver<DiscordVoiceEvent>>>,

    shard_tasks: Vec<JoinHandle<()>>,
    shard_senders: Vec<MessageSender>,

    http: Option<Arc<HttpClient>>,
    cache: Option<Arc<InMemoryCache>>,
}

impl DiscordPlatform {
    pub fn new(token: String) -> Self {
        Self {
            token,
            connected: false,
            rx: Mutex::new(None),
            voice_rx: Mutex::new(None),
            shard_tasks: Vec::new(),
            shard_senders: Vec::new(),
            http: None,
            cache: None,
        }
    }

    pub fn http(&self) -> Option<Arc<HttpClient>> {
        self.http.clone()
    }

    /// Await the next inbound chat message. Returns None once the gateway
    /// has shut down.
    pub async fn next_message_event(&self) -> Option<DiscordMessageEvent> {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(r) => r.recv().await,
            None => None,
        }
    }

    /// Await the next change to the bot's own voice state. Returns None
    /// once the gateway has shut down.
    pub async fn next_voice_event(&self) -> Option<DiscordVoiceEvent> {
        let mut guard = self.voice_rx.lock().await;
        match guard.as_mut() {
            Some(r) => r.recv().await,
            None => None,
        }
    }

    /// The voice channel the given user currently occupies in the given
    /// guild, from the gateway cache. None when the user is not in voice.
    pub fn voice_channel_of(&self, guild_id: &str, user_id: &str) -> Option<String> {
        let cache = self.cache.as_ref()?;
        let guild: Id<GuildMarker> = Id::new(guild_id.parse().ok()?);
        let user: Id<UserMarker> = Id::new(user_id.parse().ok()?);
        cache
            .voice_state(user, guild)
            .map(|vs| vs.channel_id().to_string())
    }

    pub async fn connect(&mut self) -> Result<(), Error> {
        if self.connected {
            info!("(DiscordPlatform) Already connected => skipping");
            return Ok(());
        }
        if self.token.is_empty() {
            return Err(Error::Platform("Discord token is empty".into()));
        }

        let (tx, rx) = unbounded_channel::<DiscordMessageEvent>();
        {
            let mut guard = self.rx.lock().await;
            *guard = Some(rx);
        }
        let (voice_tx, voice_rx) = unbounded_channel::<DiscordVoiceEvent>();
        {
            let mut guard = self.voice_rx.lock().await;
            *guard = Some(voice_rx);
        }

        let http_client = Arc::new(
            ClientBuilder::new()
                .token(self.token.clone())
                .timeout(Duration::from_secs(30))
                .build(),
        );
        self.http = Some(http_client.clone());

        // VOICE_STATE is what voice_channel_of reads.
        let cache = InMemoryCache::builder()
            .resource_types(ResourceType::GUILD | ResourceType::CHANNEL | ResourceType::VOICE_STATE)
            .build();
        let cache = Arc::new(cache);
        self.cache = Some(cache.clone());

        let config = Config::new(
            self.token.clone(),
            Intents::GUILDS
                | Intents::GUILD_MESSAGES
                | Intents::MESSAGE_CONTENT
                | Intents::GUILD_VOICE_STATES,
        );

        let shards = gateway::create_recommended(&http_client, config, |_, b| b.build())
            .await
            .map_err(|e| Error::Platform(format!("create_recommended error: {e}")))?;

        for shard in shards {
            self.shard_senders.push(shard.sender());

            let tx_for_shard = tx.clone();
            let voice_tx_for_shard = voice_tx.clone();
            let cache_for_shard = cache.clone();
            let handle = tokio::spawn(async move {
                shard_runner(shard, tx_for_shard, voice_tx_for_shard, cache_for_shard).await;
            });
            self.shard_tasks.push(handle);
        }

        self.connected = true;
        Ok(())
    }

    pub async fn disconnect(&mut self) -> Result<(), Error> {
        self.connected = false;

        for sender in &self.shard_senders {
            let _ = sender.close(CloseFrame::NORMAL);
        }
        for task in &mut self.shard_tasks {
            let _ = task.await;
        }
        self.shard_senders.clear();
        self.shard_tasks.clear();

        {
            let mut guard = self.rx.lock().await;
            *guard = None;
        }
        {
            let mut guard = self.voice_rx.lock().await;
            *guard = None;
        }
        Ok(())
    }
}
