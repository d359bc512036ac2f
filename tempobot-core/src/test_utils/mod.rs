//! Shared mocks for engine tests: a transport writing into counters, a
//! decoder synthesizing PCM byte streams with scripted behavior, a
//! recording notification sink, and a probe with scripted reachability.
//! Mock streams are byte-paced rather than wall-clock paced, so timing
//! assertions (elapsed, seek offsets) are exact.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use tempobot_common::Error;
use tempobot_common::models::player::PlayerSnapshot;
use tempobot_common::models::track::{ProviderKind, ResolvedMedia, Track};
use tempobot_common::traits::notify::NotificationSink;
use tempobot_common::traits::provider::StreamSource;
use tempobot_common::traits::transport::{VoiceConnection, VoiceTransport};

use crate::decoder::{PCM_BYTES_PER_SECOND, PcmDecoder, PcmStream};
use crate::probe::StreamProbe;

pub fn pcm_bytes_for_secs(secs: u64) -> u64 {
    secs * PCM_BYTES_PER_SECOND
}

// ---------- Stream source ----------

pub struct StaticSource {
    url: Mutex<String>,
    pub resolve_count: AtomicUsize,
}

impl StaticSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            resolve_count: AtomicUsize::new(0),
        }
    }

    /// Change the URL handed out by future resolves (stale-link recovery).
    pub fn set_url(&self, url: impl Into<String>) {
        *self.url.lock() = url.into();
    }
}

#[async_trait]
impl StreamSource for StaticSource {
    async fn resolve(&self) -> Result<ResolvedMedia, Error> {
        self.resolve_count.fetch_add(1, Ordering::SeqCst);
        Ok(ResolvedMedia {
            stream_url: self.url.lock().clone(),
            thumbnail: None,
        })
    }
}

pub fn test_track(title: &str, duration: Option<Duration>) -> Arc<Track> {
    Arc::new(Track::new(
        "test artist",
        title,
        duration,
        Some(format!("https://tracks.test/{title}")),
        ProviderKind::Direct,
        Arc::new(StaticSource::new(format!("https://cdn.test/{title}"))),
    ))
}

pub fn test_track_with_source(
    title: &str,
    duration: Option<Duration>,
    source: Arc<StaticSource>,
) -> Arc<Track> {
    Arc::new(Track::new(
        "test artist",
        title,
        duration,
        Some(format!("https://tracks.test/{title}")),
        ProviderKind::Direct,
        source,
    ))
}

// ---------- Probe ----------

#[derive(Default)]
pub struct MockProbe {
    unreachable: Mutex<HashSet<String>>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unreachable(&self, url: &str) {
        self.unreachable.lock().insert(url.to_string());
    }
}

#[async_trait]
impl StreamProbe for MockProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        !self.unreachable.lock().contains(url)
    }
}

// ---------- Decoder ----------

/// Never completes and never yields data; used to simulate a live stream
/// that has gone quiet, leaving the copy loop parked on its read.
struct PendingReader;

impl AsyncRead for PendingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

/// Emits `remaining` zero bytes, then either EOF or pends forever.
struct ScriptedReader {
    remaining: u64,
    then_pend: bool,
}

impl AsyncRead for ScriptedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.remaining == 0 {
            if self.then_pend {
                return Poll::Pending;
            }
            return Poll::Ready(Ok(())); // EOF
        }
        let n = (self.remaining as usize).min(buf.remaining());
        buf.put_slice(&vec![0u8; n]);
        self.remaining -= n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Decrements the active-stream counter when the loop lets go of the
/// stream, so tests can assert the one-loop-per-guild invariant.
struct CountedReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    active: Arc<AtomicUsize>,
}

impl AsyncRead for CountedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for CountedReader {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub enum DecoderScript {
    /// Emit this many bytes, then EOF (a track that finishes naturally).
    EmitThenEof(u64),
    /// Emit this many bytes, then pend forever (a live stream; playback
    /// only ends via cancellation).
    EmitThenPend(u64),
    /// Block inside spawn() itself, so cancellation is never observed.
    HangOnSpawn,
}

pub struct MockDecoder {
    script: Mutex<DecoderScript>,
    /// (url, start offset) per spawn, in order.
    pub spawns: Mutex<Vec<(String, Duration)>>,
    active: Arc<AtomicUsize>,
    peak_active: Arc<AtomicUsize>,
}

impl MockDecoder {
    pub fn new(script: DecoderScript) -> Self {
        Self {
            script: Mutex::new(script),
            spawns: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            peak_active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_script(&self, script: DecoderScript) {
        *self.script.lock() = script;
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().len()
    }

    pub fn spawn_offsets(&self) -> Vec<Duration> {
        self.spawns.lock().iter().map(|(_, at)| *at).collect()
    }

    /// Highest number of simultaneously live decoder streams observed.
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PcmDecoder for MockDecoder {
    async fn spawn(&self, stream_url: &str, start_at: Duration) -> Result<PcmStream, Error> {
        let script = *self.script.lock();
        self.spawns.lock().push((stream_url.to_string(), start_at));

        let inner: Box<dyn AsyncRead + Send + Unpin> = match script {
            DecoderScript::EmitThenEof(bytes) => Box::new(ScriptedReader {
                remaining: bytes,
                then_pend: false,
            }),
            DecoderScript::EmitThenPend(bytes) => Box::new(ScriptedReader {
                remaining: bytes,
                then_pend: true,
            }),
            DecoderScript::HangOnSpawn => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Box::new(PendingReader)
            }
        };

        let n = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(n, Ordering::SeqCst);
        Ok(PcmStream::from_reader(Box::new(CountedReader {
            inner,
            active: Arc::clone(&self.active),
        })))
    }
}

// ---------- Transport ----------

struct CountingSink {
    written: Arc<AtomicU64>,
}

impl AsyncWrite for CountingSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.written.fetch_add(buf.len() as u64, Ordering::SeqCst);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct MockConnection {
    pub guild_id: String,
    pub channel_id: String,
    pub written: Arc<AtomicU64>,
    connected: AtomicBool,
    pub disconnect_count: AtomicUsize,
}

impl MockConnection {
    pub fn written_bytes(&self) -> u64 {
        self.written.load(Ordering::SeqCst)
    }

    /// Simulate the transport dropping the link (does not emit the event;
    /// tests push `TransportEvent::Disconnected` themselves).
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl VoiceConnection for MockConnection {
    async fn open_sink(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection is closed".into()));
        }
        Ok(Box::new(CountingSink {
            written: Arc::clone(&self.written),
        }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        self.disconnect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockTransport {
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        self.connections.lock().last().cloned()
    }
}

#[async_trait]
impl VoiceTransport for MockTransport {
    async fn connect(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>, Error> {
        let conn = Arc::new(MockConnection {
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            written: Arc::new(AtomicU64::new(0)),
            connected: AtomicBool::new(true),
            disconnect_count: AtomicUsize::new(0),
        });
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

// ---------- Notification sink ----------

#[derive(Default)]
pub struct RecordingNotifier {
    pub refreshes: Mutex<Vec<(PlayerSnapshot, Option<String>)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.lock().len()
    }

    pub fn messages(&self) -> Vec<String> {
        self.refreshes
            .lock()
            .iter()
            .filter_map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn refresh(
        &self,
        _guild_id: &str,
        snapshot: PlayerSnapshot,
        message: Option<String>,
    ) -> Result<(), Error> {
        self.refreshes.lock().push((snapshot, message));
        Ok(())
    }
}

// ---------- Polling helper ----------

/// Poll `cond` until it holds or `deadline` passes. Mock streams complete
/// in microseconds; the deadline only bounds a failing test.
pub async fn wait_for<F>(mut cond: F, deadline: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
