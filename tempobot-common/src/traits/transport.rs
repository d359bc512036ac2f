//! Voice transport contract.
//!
//! The playback engine writes raw PCM into a sink obtained from a live
//! connection; it never implements the connection itself. Disconnects are
//! reported on an mpsc channel handed to the transport at construction
//! time, so transport internals never mutate engine state directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::Error;

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Disconnected { guild_id: String },
}

#[async_trait]
pub trait VoiceTransport: Send + Sync {
    async fn connect(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>, Error>;
}

#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// A write-only byte sink accepting s16le / 48kHz / 2ch PCM.
    async fn open_sink(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, Error>;

    fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), Error>;
}
