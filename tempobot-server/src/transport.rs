//! tempobot-server/src/transport.rs
//!
//! Development voice transport: PCM goes to a local `ffplay` subprocess
//! instead of a real voice gateway. Each sink is one ffplay process fed
//! s16le on stdin; ffplay exiting cleanly at stdin EOF is the normal
//! between-tracks case, any other exit while the connection is live is
//! reported as a disconnect on the transport event channel.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use tempobot_common::Error;
use tempobot_common::traits::transport::{TransportEvent, VoiceConnection, VoiceTransport};

const WATCH_INTERVAL: Duration = Duration::from_millis(250);

pub struct LocalTransport {
    ffplay_path: String,
    events: UnboundedSender<TransportEvent>,
}

impl LocalTransport {
    pub fn new(ffplay_path: impl Into<String>, events: UnboundedSender<TransportEvent>) -> Self {
        Self { ffplay_path: ffplay_path.into(), events }
    }
}

#[async_trait]
impl VoiceTransport for LocalTransport {
    async fn connect(
        &self,
        guild_id: &str,
        channel_id: &str,
    ) -> Result<Arc<dyn VoiceConnection>, Error> {
        info!("local transport: 'connecting' guild {guild_id} channel {channel_id}");
        let conn = Arc::new(LocalConnection {
            guild_id: guild_id.to_string(),
            ffplay_path: self.ffplay_path.clone(),
            child: Mutex::new(None),
            connected: AtomicBool::new(true),
            events: self.events.clone(),
        });
        conn.clone().spawn_watcher();
        Ok(conn)
    }
}

pub struct LocalConnection {
    guild_id: String,
    ffplay_path: String,
    /// The currently live ffplay process, if a sink is (or was) open.
    child: Mutex<Option<Child>>,
    connected: AtomicBool,
    events: UnboundedSender<TransportEvent>,
}

impl LocalConnection {
    fn spawn_watcher(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCH_INTERVAL).await;
                if !self.connected.load(Ordering::SeqCst) {
                    return;
                }
                let exited = {
                    let mut guard = self.child.lock();
                    match guard.as_mut().map(|c| c.try_wait()) {
                        Some(Ok(Some(status))) => {
                            *guard = None;
                            Some(status)
                        }
                        _ => None,
                    }
                };
                let Some(status) = exited else { continue };
                if status.success() {
                    // Clean exit at stdin EOF; the next sink starts fresh.
                    debug!("guild {}: ffplay finished", self.guild_id);
                    continue;
                }
                warn!(
                    "guild {}: ffplay died ({status}); reporting disconnect",
                    self.guild_id
                );
                self.connected.store(false, Ordering::SeqCst);
                let _ = self.events.send(TransportEvent::Disconnected {
                    guild_id: self.guild_id.clone(),
                });
                return;
            }
        });
    }

    fn kill_current(&self) {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            let _ = child.start_kill();
        }
    }
}

#[async_trait]
impl VoiceConnection for LocalConnection {
    async fn open_sink(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, Error> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "guild {}: connection is closed",
                self.guild_id
            )));
        }
        // One sink at a time; a leftover process from the previous track
        // is replaced.
        self.kill_current();

        let mut child = Command::new(&self.ffplay_path)
            .args(["-nodisp", "-autoexit", "-loglevel", "quiet"])
            .args(["-f", "s16le", "-ar", "48000", "-ac", "2"])
            .args(["-i", "pipe:0"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("could not start ffplay: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("ffplay stdin unavailable".into()))?;
        *self.child.lock() = Some(child);
        Ok(Box::new(stdin))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), Error> {
        // Deliberate teardown never reports a transport event.
        self.connected.store(false, Ordering::SeqCst);
        self.kill_current();
        info!("guild {}: local transport disconnected", self.guild_id);
        Ok(())
    }
}
