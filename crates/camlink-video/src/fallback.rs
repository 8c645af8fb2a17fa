//! Still-frame fallback used while peer-to-peer video is down.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::config::FallbackConfig;
use crate::error::VideoError;
use crate::peer::VideoSink;
use crate::signaling::with_trailing_slash;

/// Produces one still frame per call.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn fetch(&self) -> Result<Bytes, VideoError>;
}

/// `GET {base}/snapshot?t=<millis>`; the timestamp defeats intermediate caches.
pub struct HttpFrameSource {
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpFrameSource {
    pub fn new(base: Url, token: Option<String>, config: &FallbackConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: with_trailing_slash(base),
            token,
            timeout: config.request_timeout,
        }
    }

    fn snapshot_url(&self, millis: u128) -> Result<Url, VideoError> {
        let mut url = self.base.join("snapshot")?;
        url.query_pairs_mut().append_pair("t", &millis.to_string());
        Ok(url)
    }
}

#[async_trait]
impl FrameSource for HttpFrameSource {
    async fn fetch(&self) -> Result<Bytes, VideoError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let mut req = self.client.get(self.snapshot_url(millis)?).timeout(self.timeout);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(VideoError::Status(resp.status()));
        }
        Ok(resp.bytes().await?)
    }
}

/// Polls a [`FrameSource`] at a fixed cadence and hands frames to a sink.
pub struct FallbackStream {
    source: Arc<dyn FrameSource>,
    interval: Duration,
    task: Option<JoinHandle<()>>,
}

impl FallbackStream {
    pub fn new(source: Arc<dyn FrameSource>, config: &FallbackConfig) -> Self {
        Self {
            source,
            interval: config.interval,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start polling into `sink`. No-op if already running.
    pub fn start(&mut self, sink: Arc<dyn VideoSink>) {
        if self.is_running() {
            return;
        }
        let source = self.source.clone();
        let period = self.interval;
        tracing::info!(interval_ms = period.as_millis() as u64, "fallback stream started");
        self.task = Some(tokio::spawn(poll_frames(source, sink, period)));
    }

    /// Stop polling. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::info!("fallback stream stopped");
        }
    }
}

impl Drop for FallbackStream {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_frames(source: Arc<dyn FrameSource>, sink: Arc<dyn VideoSink>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut failing = false;
    loop {
        ticker.tick().await;
        match source.fetch().await {
            Ok(frame) => {
                if failing {
                    tracing::info!("fallback frames recovered");
                    failing = false;
                }
                sink.fallback_frame(&frame);
            }
            Err(err) if !failing => {
                tracing::warn!(error = %err, "fallback frame fetch failed");
                failing = true;
            }
            Err(err) => tracing::debug!(error = %err, "fallback frame fetch failed"),
        }
    }
}
