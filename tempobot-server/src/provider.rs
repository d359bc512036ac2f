//! tempobot-server/src/provider.rs
//!
//! Track resolution through the `yt-dlp` subprocess. `-J` dumps metadata as
//! JSON (a single object, or a playlist object with `entries`); `-g -f
//! bestaudio` prints the time-limited direct stream URL. Each resolved
//! track carries a `YtDlpSource` so the engine can re-resolve an expired
//! URL without going back through the provider.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::debug;

use tempobot_common::Error;
use tempobot_common::models::track::{ProviderKind, ResolvedMedia, Track};
use tempobot_common::traits::provider::{SearchKind, StreamSource, TrackProvider};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct YtDlpProvider {
    ytdlp_path: String,
}

impl YtDlpProvider {
    pub fn new(ytdlp_path: impl Into<String>) -> Self {
        Self { ytdlp_path: ytdlp_path.into() }
    }

    async fn dump_json(&self, target: &str) -> Result<Value, Error> {
        let output = tokio::time::timeout(
            RESOLVE_TIMEOUT,
            Command::new(&self.ytdlp_path)
                .arg("-J")
                .arg("--no-warnings")
                .arg("--flat-playlist")
                .arg(target)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ytdlp_error(target, &stderr));
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    fn tracks_from_json(&self, value: &Value) -> Result<Vec<Arc<Track>>, Error> {
        match value.get("entries").and_then(Value::as_array) {
            Some(entries) => Ok(entries
                .iter()
                .filter_map(|e| self.track_from_entry(e))
                .collect()),
            None => Ok(self.track_from_entry(value).into_iter().collect()),
        }
    }

    fn track_from_entry(&self, entry: &Value) -> Option<Arc<Track>> {
        let title = entry.get("title").and_then(Value::as_str)?.to_string();
        let author = entry
            .get("uploader")
            .or_else(|| entry.get("channel"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let duration = entry
            .get("duration")
            .and_then(Value::as_f64)
            .filter(|d| *d > 0.0)
            .map(Duration::from_secs_f64);
        let public_url = entry
            .get("webpage_url")
            .or_else(|| entry.get("url"))
            .and_then(Value::as_str)
            .map(str::to_string)?;
        let thumbnail = entry
            .get("thumbnail")
            .and_then(Value::as_str)
            .map(str::to_string);
        let provider = provider_kind(entry.get("extractor").and_then(Value::as_str));

        let source = Arc::new(YtDlpSource {
            ytdlp_path: self.ytdlp_path.clone(),
            target_url: public_url.clone(),
        });
        Some(Arc::new(
            Track::new(author, title, duration, Some(public_url), provider, source)
                .with_thumbnail(thumbnail),
        ))
    }
}

#[async_trait]
impl TrackProvider for YtDlpProvider {
    async fn resolve(&self, query: &str, limit: usize) -> Result<Vec<Arc<Track>>, Error> {
        let is_url = query.starts_with("http://") || query.starts_with("https://");
        let target = if is_url {
            query.to_string()
        } else {
            format!("ytsearch{limit}:{query}")
        };
        debug!("resolving '{target}' via yt-dlp");
        let json = self.dump_json(&target).await?;
        let mut tracks = self.tracks_from_json(&json)?;
        if !is_url {
            // A pasted URL may expand into a whole playlist; only
            // free-text searches are capped.
            tracks.truncate(limit.max(1));
        }
        if tracks.is_empty() {
            return Err(Error::NotFound(format!("no playable tracks for '{query}'")));
        }
        Ok(tracks)
    }

    async fn search(
        &self,
        query: &str,
        kind: SearchKind,
        limit: usize,
    ) -> Result<Vec<Arc<Track>>, Error> {
        let target = match kind {
            SearchKind::Tracks => format!("ytsearch{limit}:{query}"),
            // yt-dlp has no playlist search operator; filter full results.
            SearchKind::Playlists => format!("ytsearch{}:{query} playlist", limit.max(1)),
        };
        let json = self.dump_json(&target).await?;
        let mut tracks = self.tracks_from_json(&json)?;
        tracks.truncate(limit.max(1));
        Ok(tracks)
    }
}

/// Re-resolves a track's direct stream URL. Attached per track so the
/// engine can refresh an expired URL without knowing about yt-dlp.
pub struct YtDlpSource {
    ytdlp_path: String,
    target_url: String,
}

#[async_trait]
impl StreamSource for YtDlpSource {
    async fn resolve(&self) -> Result<ResolvedMedia, Error> {
        let output = tokio::time::timeout(
            RESOLVE_TIMEOUT,
            Command::new(&self.ytdlp_path)
                .arg("-g")
                .arg("-f")
                .arg("bestaudio/best")
                .arg("--no-warnings")
                .arg(&self.target_url)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_ytdlp_error(&self.target_url, &stderr));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stream_url = stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| {
                Error::Provider(format!("yt-dlp returned no stream URL for {}", self.target_url))
            })?
            .to_string();
        Ok(ResolvedMedia { stream_url, thumbnail: None })
    }
}

fn provider_kind(extractor: Option<&str>) -> ProviderKind {
    match extractor {
        Some(e) if e.starts_with("youtube") => ProviderKind::YouTube,
        Some(e) if e.starts_with("soundcloud") => ProviderKind::SoundCloud,
        _ => ProviderKind::Direct,
    }
}

fn classify_ytdlp_error(target: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    if lower.contains("private video") || lower.contains("sign in") || lower.contains("members-only")
    {
        Error::PermissionDenied(format!("{target}: {}", stderr.trim()))
    } else if lower.contains("unsupported url") {
        Error::UnsupportedLink(target.to_string())
    } else if lower.contains("video unavailable") || lower.contains("not found") {
        Error::NotFound(format!("{target}: {}", stderr.trim()))
    } else {
        Error::Provider(format!("yt-dlp failed for {target}: {}", stderr.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractor_maps_to_provider_kind() {
        assert_eq!(provider_kind(Some("youtube")), ProviderKind::YouTube);
        assert_eq!(provider_kind(Some("youtube:tab")), ProviderKind::YouTube);
        assert_eq!(provider_kind(Some("soundcloud")), ProviderKind::SoundCloud);
        assert_eq!(provider_kind(Some("generic")), ProviderKind::Direct);
        assert_eq!(provider_kind(None), ProviderKind::Direct);
    }

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_ytdlp_error("u", "ERROR: Private video. Sign in if..."),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_ytdlp_error("u", "ERROR: Unsupported URL: https://x"),
            Error::UnsupportedLink(_)
        ));
        assert!(matches!(
            classify_ytdlp_error("u", "ERROR: Video unavailable"),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify_ytdlp_error("u", "ERROR: something exploded"),
            Error::Provider(_)
        ));
    }
}
