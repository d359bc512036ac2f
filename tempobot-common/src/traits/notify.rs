use async_trait::async_trait;

use crate::error::Error;
use crate::models::player::PlayerSnapshot;

/// Display refresh hook, called after every player state change.
/// Fire-and-forget from the engine's perspective: implementations may talk
/// to the chat platform, and their failures are logged by the engine but
/// never propagated into playback.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn refresh(
        &self,
        guild_id: &str,
        snapshot: PlayerSnapshot,
        message: Option<String>,
    ) -> Result<(), Error>;
}
