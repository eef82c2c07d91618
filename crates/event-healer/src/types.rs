//! Event and object types shared by the watch pipeline.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event type reported by the cluster for routine lifecycle events
pub const EVENT_TYPE_NORMAL: &str = "Normal";

/// Event type reported by the cluster for failures
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Identity of the workload object an event describes
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Stable unique id (changes when the object is recreated)
    pub uid: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl ObjectRef {
    pub fn new(
        uid: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Placeholder identity for payloads that could not be attributed to an object
    pub fn unidentified() -> Self {
        Self::default()
    }

    pub fn is_identified(&self) -> bool {
        !self.uid.is_empty()
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_identified() {
            write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
        } else {
            write!(f, "<unidentified>")
        }
    }
}

/// Kind of notification delivered by the watch stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventKind {
    #[default]
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => write!(f, "ADDED"),
            Self::Modified => write!(f, "MODIFIED"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Bookmark => write!(f, "BOOKMARK"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// An event exactly as the event source delivered it
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawEvent {
    pub kind: WatchEventKind,
    /// Uid of the Event object itself, used to fold redeliveries
    pub event_uid: Option<String>,
    /// Object the event is about; `None` when the payload could not be attributed
    pub involved: Option<ObjectRef>,
    pub reason: Option<String>,
    pub message: Option<String>,
    /// `Normal` or `Warning`
    pub event_type: Option<String>,
    /// How many times the cluster has aggregated this occurrence
    pub count: Option<i32>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
    /// Opaque resume token for the stream position of this event
    pub bookmark: Option<String>,
}

impl RawEvent {
    /// A stream position marker without any object payload
    pub fn bookmark(resume: impl Into<String>) -> Self {
        Self {
            kind: WatchEventKind::Bookmark,
            bookmark: Some(resume.into()),
            ..Self::default()
        }
    }

    /// A payload that could not be decoded
    pub fn malformed(detail: impl Into<String>) -> Self {
        Self {
            kind: WatchEventKind::Error,
            message: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn reason_or_empty(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Category assigned to an event by the classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Expected to clear on its own (e.g. network not ready yet)
    Transient,
    /// Repeating crash/restart pattern
    Flapping,
    /// Failure that will not resolve without intervention
    TerminalFailure,
    /// Routine event, never acted upon
    Informational,
    /// Unmapped reason or undecodable payload
    Unknown,
}

impl EventCategory {
    /// Categories that count as failure evidence
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Flapping | Self::TerminalFailure)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "Transient"),
            Self::Flapping => write!(f, "Flapping"),
            Self::TerminalFailure => write!(f, "TerminalFailure"),
            Self::Informational => write!(f, "Informational"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Classifier output for a single raw event
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub object: ObjectRef,
    pub category: EventCategory,
    pub reason: String,
    pub message: String,
    pub event_type: String,
    /// Occurrence count reported by the cluster
    pub count: i32,
    /// Time between event creation and observation
    pub age: Duration,
    pub observed_at: DateTime<Utc>,
    /// New occurrences this record contributed to the failure counter
    pub occurrences: u32,
    /// Redelivery of an occurrence that was already folded into the history
    pub duplicate: bool,
}
