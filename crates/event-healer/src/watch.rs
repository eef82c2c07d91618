//! Resumable watch over an [`EventSource`].
//!
//! A single server-side watch only lives for its timeout window and can drop
//! at any time. The [`WatchManager`] hides that: it reconnects from the last
//! bookmark it handed downstream, backs off on failures, re-syncs from a
//! fresh baseline when the bookmark has expired, and exposes one continuous
//! sequence of events. Redeliveries after a reconnect are passed through
//! untouched; the classifier folds them.

use crate::error::{Error, Result};
use crate::source::{EventSource, EventStream, SourceError};
use crate::types::{RawEvent, WatchEventKind};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A session that lived at least this long ended cleanly, even if it was quiet
const MIN_HEALTHY_SESSION: Duration = Duration::from_secs(1);

/// Item handed to the classifier
#[derive(Debug, Clone, PartialEq)]
pub enum WatchItem {
    Event(RawEvent),
    /// The resume point was reset to a fresh baseline; events between the
    /// expired bookmark and `bookmark` were not observed
    Resync { bookmark: String },
}

/// Resumable position in the event stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchCursor {
    bookmark: Option<String>,
    last_connected: Option<DateTime<Utc>>,
}

impl WatchCursor {
    pub fn new(start: Option<String>) -> Self {
        Self {
            bookmark: start.filter(|b| !b.is_empty()),
            last_connected: None,
        }
    }

    pub fn bookmark(&self) -> Option<&str> {
        self.bookmark.as_deref()
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.last_connected
    }

    fn advance(&mut self, bookmark: String) {
        if !bookmark.is_empty() {
            self.bookmark = Some(bookmark);
        }
    }

    fn reset(&mut self) {
        self.bookmark = None;
    }

    fn connected(&mut self, at: DateTime<Utc>) {
        self.last_connected = Some(at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of each delay that is randomized away (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

/// Exponential backoff with jitter, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; never exceeds the cap
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2_u32.saturating_pow(self.attempt.min(31));
        let capped = self.config.base.saturating_mul(factor).min(self.config.cap);
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter <= 0.0 {
            return capped;
        }
        let spread = capped.mul_f64(self.config.jitter.min(1.0) * rand::random::<f64>());
        capped.saturating_sub(spread)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchSettings {
    /// Server-side lifetime of a single subscription
    pub timeout: Duration,
    /// Extra time allowed past `timeout` before a silent connection is dropped
    pub idle_grace: Duration,
    pub backoff: BackoffConfig,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            idle_grace: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
        }
    }
}

enum Opened {
    Ready,
    Resynced(String),
    Retry,
}

pub struct WatchManager {
    source: Arc<dyn EventSource>,
    namespace: String,
    settings: WatchSettings,
    cursor: WatchCursor,
    backoff: Backoff,
    stream: Option<EventStream>,
    session_started: Option<Instant>,
    session_delivered: bool,
    /// Silence deadline for the open stream; kept across dropped `next()` calls
    idle_deadline: Option<Instant>,
    resync_pending: bool,
    retry_at: Option<Instant>,
    cancel: CancellationToken,
}

impl WatchManager {
    pub fn new(
        source: Arc<dyn EventSource>,
        namespace: impl Into<String>,
        start_bookmark: Option<String>,
        settings: WatchSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            namespace: namespace.into(),
            settings,
            cursor: WatchCursor::new(start_bookmark),
            backoff: Backoff::new(settings.backoff),
            stream: None,
            session_started: None,
            session_delivered: false,
            idle_deadline: None,
            resync_pending: false,
            retry_at: None,
            cancel,
        }
    }

    pub fn cursor(&self) -> &WatchCursor {
        &self.cursor
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Next item of the unified stream.
    ///
    /// `Ok(None)` means the watch was cancelled; `Err` only for unrecoverable
    /// source errors. Safe to drop mid-await: a pending reconnect delay is
    /// remembered and resumed on the next call.
    pub async fn next(&mut self) -> Result<Option<WatchItem>> {
        loop {
            if self.cancel.is_cancelled() || !self.wait_for_retry().await {
                return Ok(None);
            }

            if self.stream.is_none() {
                match self.open().await? {
                    Opened::Ready => {}
                    Opened::Resynced(bookmark) => return Ok(Some(WatchItem::Resync { bookmark })),
                    Opened::Retry => {
                        self.schedule_retry();
                        continue;
                    }
                }
            }

            let guard = self.idle_guard();
            let deadline = *self.idle_deadline.get_or_insert_with(|| Instant::now() + guard);
            let Some(stream) = self.stream.as_mut() else {
                continue;
            };
            let received = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(None),
                received = tokio::time::timeout_at(deadline, stream.next()) => received,
            };
            if matches!(received, Ok(Some(_))) {
                self.idle_deadline = Some(Instant::now() + guard);
            }

            match received {
                Err(_) => {
                    warn!(
                        namespace = %self.namespace,
                        idle_secs = guard.as_secs(),
                        "No data from event stream within the idle guard; reconnecting"
                    );
                    self.end_session(false);
                }
                Ok(None) => {
                    let healthy = self.session_delivered
                        || self
                            .session_started
                            .is_some_and(|started| started.elapsed() >= MIN_HEALTHY_SESSION);
                    debug!(
                        namespace = %self.namespace,
                        bookmark = ?self.cursor.bookmark(),
                        healthy,
                        "Event stream closed; resuming from last bookmark"
                    );
                    self.end_session(healthy);
                }
                Ok(Some(Ok(event))) => {
                    self.session_delivered = true;
                    self.backoff.reset();
                    if event.kind == WatchEventKind::Bookmark {
                        if let Some(bookmark) = event.bookmark {
                            self.cursor.advance(bookmark);
                        }
                        continue;
                    }
                    if let Some(bookmark) = &event.bookmark {
                        self.cursor.advance(bookmark.clone());
                    }
                    return Ok(Some(WatchItem::Event(event)));
                }
                Ok(Some(Err(SourceError::Malformed(detail)))) => {
                    warn!(namespace = %self.namespace, detail = %detail, "Malformed event payload; forwarding as Unknown");
                    self.session_delivered = true;
                    return Ok(Some(WatchItem::Event(RawEvent::malformed(detail))));
                }
                Ok(Some(Err(SourceError::Expired(reason)))) => {
                    warn!(
                        namespace = %self.namespace,
                        bookmark = ?self.cursor.bookmark(),
                        reason = %reason,
                        "Resume bookmark expired; re-syncing from a fresh baseline"
                    );
                    self.stream = None;
                    self.idle_deadline = None;
                    self.cursor.reset();
                    self.resync_pending = true;
                }
                Ok(Some(Err(err @ SourceError::Fatal(_)))) => {
                    error!(namespace = %self.namespace, error = %err, "Event stream failed permanently");
                    self.stream = None;
                    self.idle_deadline = None;
                    return Err(Error::Watch(err));
                }
                Ok(Some(Err(err @ SourceError::Transport(_)))) => {
                    warn!(namespace = %self.namespace, error = %err, "Event stream interrupted; reconnecting");
                    self.end_session(false);
                }
            }
        }
    }

    async fn open(&mut self) -> Result<Opened> {
        if self.cursor.bookmark().is_none() {
            match self.source.baseline(&self.namespace).await {
                Ok(bookmark) => {
                    info!(namespace = %self.namespace, bookmark = %bookmark, "Established fresh watch baseline");
                    self.cursor.advance(bookmark.clone());
                    if std::mem::take(&mut self.resync_pending) {
                        return Ok(Opened::Resynced(bookmark));
                    }
                }
                Err(err) if err.is_fatal() => return Err(Error::Watch(err)),
                Err(err) => {
                    warn!(namespace = %self.namespace, error = %err, "Failed to establish watch baseline");
                    return Ok(Opened::Retry);
                }
            }
        }

        let bookmark = self.cursor.bookmark().unwrap_or_default().to_string();
        match self
            .source
            .subscribe(&self.namespace, &bookmark, self.settings.timeout)
            .await
        {
            Ok(stream) => {
                debug!(namespace = %self.namespace, bookmark = %bookmark, "Watch connected");
                self.stream = Some(stream);
                self.session_started = Some(Instant::now());
                self.session_delivered = false;
                self.idle_deadline = Some(Instant::now() + self.idle_guard());
                self.cursor.connected(Utc::now());
                Ok(Opened::Ready)
            }
            Err(SourceError::Expired(reason)) => {
                warn!(
                    namespace = %self.namespace,
                    bookmark = %bookmark,
                    reason = %reason,
                    "Resume bookmark rejected as expired; re-syncing"
                );
                self.cursor.reset();
                self.resync_pending = true;
                Ok(Opened::Retry)
            }
            Err(err) if err.is_fatal() => Err(Error::Watch(err)),
            Err(err) => {
                warn!(namespace = %self.namespace, error = %err, "Failed to open event watch");
                Ok(Opened::Retry)
            }
        }
    }

    fn idle_guard(&self) -> Duration {
        self.settings.timeout + self.settings.idle_grace
    }

    fn end_session(&mut self, healthy: bool) {
        self.stream = None;
        self.idle_deadline = None;
        self.session_started = None;
        self.session_delivered = false;
        if healthy {
            self.backoff.reset();
        } else {
            self.schedule_retry();
        }
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        debug!(
            namespace = %self.namespace,
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempt(),
            "Scheduling watch reconnect"
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Sleep out a scheduled reconnect delay; false if cancelled meanwhile
    async fn wait_for_retry(&mut self) -> bool {
        let Some(deadline) = self.retry_at else {
            return true;
        };
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep_until(deadline) => {
                self.retry_at = None;
                true
            }
        }
    }
}
