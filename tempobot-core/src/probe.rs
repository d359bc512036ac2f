//! Stream-URL reachability probe.
//!
//! Provider stream URLs expire; before handing one to the decoder the
//! playback loop HEAD-checks it with a short timeout so a dead link cannot
//! stall the whole loop. The trait exists so tests can stub reachability
//! without network access; the default implementation wraps reqwest.

use std::time::Duration;

use async_trait::async_trait;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait StreamProbe: Send + Sync {
    async fn is_reachable(&self, url: &str) -> bool;
}

#[derive(Clone)]
pub struct HttpStreamProbe {
    client: reqwest::Client,
}

impl HttpStreamProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpStreamProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamProbe for HttpStreamProbe {
    async fn is_reachable(&self, url: &str) -> bool {
        // Only http(s) URLs can be probed; anything else (local paths,
        // pipes) is assumed playable and left for the decoder to reject.
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return true;
        }
        match self
            .client
            .head(url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
