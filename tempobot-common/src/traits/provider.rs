use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Error;
use crate::models::track::{ResolvedMedia, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Tracks,
    Playlists,
}

/// A music service that turns a URL or free-text query into playable
/// tracks. Stream URLs are NOT fetched here; each returned track carries a
/// `StreamSource` that resolves them lazily.
#[async_trait]
pub trait TrackProvider: Send + Sync {
    /// Resolve a URL or query into tracks. Errors surface as
    /// `Error::NotFound`, `Error::PermissionDenied` or
    /// `Error::UnsupportedLink` where the provider can tell them apart.
    async fn resolve(&self, query: &str, limit: usize) -> Result<Vec<Arc<Track>>, Error>;

    async fn search(&self, query: &str, kind: SearchKind, limit: usize)
        -> Result<Vec<Arc<Track>>, Error>;
}

/// Per-track capability object that knows how to (re-)resolve the track's
/// time-limited stream URL. One implementation per provider, attached to
/// the track at creation.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn resolve(&self) -> Result<ResolvedMedia, Error>;
}
