//! Track model.
//!
//! A track's identity (author, title, duration, public URL) is fixed once
//! known. The direct stream URL is time-limited on every provider we talk
//! to, so it lives in an explicit cache cell and is resolved through the
//! track's `StreamSource` capability object on first use. A stale URL is
//! dropped with `invalidate_stream_url` and resolved again on the next
//! access.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Error;
use crate::models::player::TrackInfo;
use crate::traits::provider::StreamSource;

/// Which music service a track came from. One struct for all providers;
/// provider-specific behavior lives in the `StreamSource` strategy object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProviderKind {
    YouTube,
    SoundCloud,
    Direct,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::YouTube => "youtube",
            ProviderKind::SoundCloud => "soundcloud",
            ProviderKind::Direct => "direct",
        }
    }
}

/// What a `StreamSource` hands back: the direct media URL plus whatever
/// artwork the provider surfaced alongside it.
#[derive(Debug, Clone)]
pub struct ResolvedMedia {
    pub stream_url: String,
    pub thumbnail: Option<String>,
}

pub struct Track {
    pub track_id: Uuid,
    pub author: String,
    pub title: String,
    /// Unknown until the stream has been probed for some providers.
    pub duration: Option<Duration>,
    /// Canonical public link, used for history/favorites display. Absent
    /// for per-session synthetic tracks.
    pub public_url: Option<String>,
    pub provider: ProviderKind,
    pub created_at: DateTime<Utc>,

    source: Arc<dyn StreamSource>,
    stream_url: Mutex<Option<String>>,
    thumbnail: Mutex<Option<String>>,
}

impl Track {
    pub fn new(
        author: impl Into<String>,
        title: impl Into<String>,
        duration: Option<Duration>,
        public_url: Option<String>,
        provider: ProviderKind,
        source: Arc<dyn StreamSource>,
    ) -> Self {
        Self {
            track_id: Uuid::new_v4(),
            author: author.into(),
            title: title.into(),
            duration,
            public_url,
            provider,
            created_at: Utc::now(),
            source,
            stream_url: Mutex::new(None),
            thumbnail: Mutex::new(None),
        }
    }

    /// Pre-seed the thumbnail when the provider already knows it at
    /// resolve time (saves a round-trip later).
    pub fn with_thumbnail(self, thumbnail: Option<String>) -> Self {
        *self.thumbnail.lock() = thumbnail;
        self
    }

    /// The direct media URL, resolved through the provider on first use.
    /// Resolution is idempotent; a failed attempt leaves the cell empty so
    /// the next call retries.
    pub async fn stream_url(&self) -> Result<String, Error> {
        {
            let cached = self.stream_url.lock();
            if let Some(url) = cached.as_ref() {
                return Ok(url.clone());
            }
        }
        let media = self.source.resolve().await?;
        {
            let mut cached = self.stream_url.lock();
            *cached = Some(media.stream_url.clone());
        }
        if media.thumbnail.is_some() {
            let mut thumb = self.thumbnail.lock();
            if thumb.is_none() {
                *thumb = media.thumbnail;
            }
        }
        Ok(media.stream_url)
    }

    /// Drop the cached stream URL so the next access re-resolves it.
    pub fn invalidate_stream_url(&self) {
        *self.stream_url.lock() = None;
    }

    pub fn cached_stream_url(&self) -> Option<String> {
        self.stream_url.lock().clone()
    }

    pub fn thumbnail(&self) -> Option<String> {
        self.thumbnail.lock().clone()
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            title: self.title.clone(),
            author: self.author.clone(),
            duration_secs: self.duration.map(|d| d.as_secs()),
            public_url: self.public_url.clone(),
            provider: self.provider.as_str().to_string(),
        }
    }
}

impl fmt::Debug for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Track")
            .field("track_id", &self.track_id)
            .field("author", &self.author)
            .field("title", &self.title)
            .field("duration", &self.duration)
            .field("public_url", &self.public_url)
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakySource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StreamSource for FlakySource {
        async fn resolve(&self) -> Result<ResolvedMedia, Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedMedia {
                stream_url: format!("https://cdn.example/{n}"),
                thumbnail: None,
            })
        }
    }

    #[tokio::test]
    async fn stream_url_is_cached_until_invalidated() {
        let track = Track::new(
            "artist",
            "song",
            Some(Duration::from_secs(180)),
            Some("https://example.com/song".into()),
            ProviderKind::Direct,
            Arc::new(FlakySource { calls: AtomicUsize::new(0) }),
        );

        let first = track.stream_url().await.unwrap();
        let second = track.stream_url().await.unwrap();
        assert_eq!(first, second, "cached URL should be reused");

        track.invalidate_stream_url();
        let third = track.stream_url().await.unwrap();
        assert_ne!(first, third, "invalidation should force a re-resolve");
    }
}
