//! Transport disconnect handling.
//!
//! Transports report disconnects on an mpsc channel instead of invoking
//! callbacks from their own threads; this task is the single consumer and
//! the only place disconnects mutate player state. An expected disconnect
//! (channel move, flagged via `request_reconnect`) re-connects and resumes
//! playback; an unexpected one leaves the player Paused with its elapsed
//! offset intact, awaiting a manual play.

use std::sync::atomic::Ordering;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use tempobot_common::models::player::PlayerStatus;
use tempobot_common::traits::transport::TransportEvent;

use crate::player::engine::PlaybackEngine;

pub async fn run_transport_events(
    engine: PlaybackEngine,
    mut rx: UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Disconnected { guild_id } => {
                handle_disconnect(&engine, &guild_id).await;
            }
        }
    }
    info!("transport event channel closed; handler exiting");
}

async fn handle_disconnect(engine: &PlaybackEngine, guild_id: &str) {
    let state = match engine.store().get(guild_id) {
        Ok(state) => state,
        Err(_) => {
            warn!("disconnect event for unregistered guild {guild_id}");
            return;
        }
    };

    let had_connection = state.connection.lock().take().is_some();
    if !had_connection && !state.loop_active.load(Ordering::SeqCst) {
        // The engine itself tore the connection down (clear / queue end);
        // nothing left to coordinate.
        return;
    }

    // Interrupt the in-flight copy without raising stop_requested: the loop
    // exits on its accidental-disconnect path, preserving elapsed and NOT
    // acknowledging as a clean stop.
    let token = state.cancel.lock().clone();
    if let Some(token) = token {
        token.cancel();
    }

    if state.reconnect_requested.swap(false, Ordering::SeqCst) {
        info!("guild {guild_id}: expected disconnect; reconnecting");
        tokio::time::sleep(engine.config().reconnect_delay).await;
        if let Err(e) = engine.play(guild_id, "Reconnected", true).await {
            error!("guild {guild_id}: reconnect failed: {e}");
        }
    } else {
        info!("guild {guild_id}: unexpected disconnect; pausing until manual resume");
        if state.status() == PlayerStatus::Playing {
            state.set_status(PlayerStatus::Paused);
        }
        engine
            .inner
            .notify(&state, Some("Voice connection lost".to_string()))
            .await;
    }
}
