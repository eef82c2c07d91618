//! Event source abstraction.
//!
//! The watch manager only needs two things from the cluster: a stream of
//! events starting at a bookmark, and a fresh bookmark when the old one has
//! expired. The Kubernetes implementation lives in [`crate::k8s`].

use crate::types::RawEvent;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while subscribing to or reading an event stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Resume bookmark is too old for the server (HTTP 410)
    #[error("Resume bookmark expired: {0}")]
    Expired(String),

    /// Connection-level failure; retry with backoff
    #[error("Transport error: {0}")]
    Transport(String),

    /// Payload could not be decoded
    #[error("Malformed event payload: {0}")]
    Malformed(String),

    /// Retrying cannot help (authorization, invalid request)
    #[error("Unrecoverable source error: {0}")]
    Fatal(String),
}

impl SourceError {
    /// Map an HTTP status returned by the event API to an error class
    #[must_use]
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            410 => SourceError::Expired(message),
            400 | 401 | 403 | 405 | 422 => SourceError::Fatal(format!("{code}: {message}")),
            _ => SourceError::Transport(format!("{code}: {message}")),
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Fatal(_))
    }
}

/// Stream of events for one subscription
pub type EventStream = BoxStream<'static, Result<RawEvent, SourceError>>;

/// Subscribe to typed cluster events for a namespace
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Open a subscription resuming after `bookmark`.
    ///
    /// The server ends the stream after `timeout`; events arrive in order and
    /// may be redelivered after a reconnect.
    async fn subscribe(
        &self,
        namespace: &str,
        bookmark: &str,
        timeout: Duration,
    ) -> Result<EventStream, SourceError>;

    /// Current position of the namespace's event log, used as a fresh baseline
    async fn baseline(&self, namespace: &str) -> Result<String, SourceError>;
}
