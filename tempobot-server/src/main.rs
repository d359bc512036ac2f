//! tempobot-server/src/main.rs

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use tempobot_common::traits::transport::TransportEvent;
use tempobot_core::decoder::FfmpegDecoder;
use tempobot_core::player::{PlaybackEngine, PlayerStore, run_transport_events};
use tempobot_core::probe::HttpStreamProbe;

mod commands;
mod discord;
mod panel;
mod provider;
mod transport;

use commands::CommandContext;
use discord::{DiscordPlatform, DiscordVoiceEvent};
use panel::PanelNotifier;
use provider::YtDlpProvider;
use transport::LocalTransport;

#[derive(Parser, Debug, Clone)]
#[command(name = "tempobot")]
#[command(author, version, about = "Tempobot - Discord music bot")]
struct Args {
    /// Discord bot token; falls back to the DISCORD_TOKEN env var.
    #[arg(long)]
    token: Option<String>,

    /// Chat command prefix.
    #[arg(long, default_value = "!")]
    prefix: String,

    /// Path to the ffmpeg binary used for decoding.
    #[arg(long, default_value = "ffmpeg")]
    ffmpeg: String,

    /// Path to the yt-dlp binary used for track resolution.
    #[arg(long, default_value = "yt-dlp")]
    ytdlp: String,

    /// Path to the ffplay binary backing the local voice transport.
    #[arg(long, default_value = "ffplay")]
    ffplay: String,
}

/// React to the bot's own voice state changing. A move to another channel
/// retargets the player and marks the disconnect that follows as expected,
/// so the transport event handler reconnects there and resumes. Leaving
/// voice entirely is left to the disconnect handler, which pauses.
fn apply_voice_event(engine: &PlaybackEngine, event: &DiscordVoiceEvent) {
    match &event.channel_id {
        Some(channel) => {
            if let Err(e) = engine.request_reconnect(&event.guild_id, Some(channel)) {
                // No player for this guild yet; nothing to retarget.
                debug!("guild {}: voice move ignored: {e}", event.guild_id);
            }
        }
        None => {
            debug!("guild {}: bot left voice", event.guild_id);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::from_default_env()
        .add_directive("tempobot=info".parse().unwrap_or_default());
    let sub = fmt().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(sub)
        .expect("Failed to set global subscriber");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    let token = match args.token.clone().or_else(|| std::env::var("DISCORD_TOKEN").ok()) {
        Some(t) if !t.is_empty() => t,
        _ => {
            error!("No Discord token. Pass --token or set DISCORD_TOKEN.");
            std::process::exit(1);
        }
    };

    info!("Tempobot starting. prefix={}", args.prefix);

    let mut platform = DiscordPlatform::new(token);
    platform.connect().await?;
    let http = platform
        .http()
        .ok_or("Discord platform has no HTTP client after connect")?;
    let discord = Arc::new(platform);

    let (transport_tx, transport_rx) = unbounded_channel::<TransportEvent>();

    let store = Arc::new(PlayerStore::new());
    let panel = Arc::new(PanelNotifier::new(http));
    let engine = PlaybackEngine::new(
        Arc::clone(&store),
        Arc::new(LocalTransport::new(args.ffplay.clone(), transport_tx)),
        Arc::new(FfmpegDecoder::new(args.ffmpeg.clone())),
        Arc::new(HttpStreamProbe::new()),
        panel.clone(),
    );
    tokio::spawn(run_transport_events(engine.clone(), transport_rx));
    {
        let discord = Arc::clone(&discord);
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(event) = discord.next_voice_event().await {
                apply_voice_event(&engine, &event);
            }
        });
    }

    let ctx = CommandContext {
        engine,
        provider: Arc::new(YtDlpProvider::new(args.ytdlp.clone())),
        discord: Arc::clone(&discord),
        panel,
        prefix: args.prefix.clone(),
    };

    loop {
        tokio::select! {
            maybe_event = discord.next_message_event() => {
                match maybe_event {
                    Some(event) => ctx.handle_message(&event).await,
                    None => {
                        warn!("Gateway message stream ended; shutting down.");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down.");
                break;
            }
        }
    }

    for guild_id in ctx.engine.store().guild_ids() {
        if let Err(e) = ctx.engine.clear(&guild_id).await {
            warn!("guild {guild_id}: shutdown clear failed: {e}");
        }
    }
    info!("Tempobot stopped.");
    Ok(())
}
