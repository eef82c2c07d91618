//! Event classification.
//!
//! Turns raw cluster events into [`NormalizedEvent`] records, assigns each a
//! category from the reason table and keeps the per-object failure counters
//! up to date. Classification never fails: anything that cannot be attributed
//! or understood degrades to an `Unknown` record so one bad payload never
//! stops the stream.

use crate::history::HistoryStore;
use crate::types::{
    EventCategory, NormalizedEvent, ObjectRef, RawEvent, WatchEventKind, EVENT_TYPE_NORMAL,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Maps event reasons to categories.
///
/// Loaded from configuration so operators can teach the healer new failure
/// reasons without a rebuild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonTable {
    entries: BTreeMap<String, EventCategory>,
}

impl Default for ReasonTable {
    fn default() -> Self {
        let entries = [
            // Pod failed to start or a container failed
            ("Failed", EventCategory::TerminalFailure),
            // Pod keeps restarting
            ("BackOff", EventCategory::Flapping),
            // Container runtime could not create the pod sandbox
            ("FailedCreatePodSandBox", EventCategory::TerminalFailure),
            // CNI not ready yet, usually precedes FailedCreatePodSandBox
            ("NetworkNotReady", EventCategory::Transient),
        ]
        .into_iter()
        .map(|(reason, category)| (reason.to_string(), category))
        .collect();

        Self { entries }
    }
}

impl ReasonTable {
    /// Default table extended (or overridden) by configured entries
    pub fn with_overrides(overrides: &BTreeMap<String, EventCategory>) -> Self {
        let mut table = Self::default();
        table
            .entries
            .extend(overrides.iter().map(|(reason, category)| (reason.clone(), *category)));
        table
    }

    pub fn lookup(&self, reason: &str) -> EventCategory {
        self.entries
            .get(reason)
            .copied()
            .unwrap_or(EventCategory::Unknown)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why an event was dropped before classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// `Added` event created before the freshness window
    Stale,
    /// The Event object expired from the API; not a new occurrence
    EventExpired,
    /// Stream position marker without payload
    Bookmark,
}

/// Result of classifying one raw event
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Skipped(SkipReason),
    Record(NormalizedEvent),
}

/// Windows that govern freshness and failure coalescing
#[derive(Debug, Clone, Copy)]
pub struct ClassifierSettings {
    pub freshness: Duration,
    pub coalescing: Duration,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            freshness: Duration::minutes(5),
            coalescing: Duration::minutes(5),
        }
    }
}

#[derive(Debug)]
pub struct Classifier {
    reasons: ReasonTable,
    settings: ClassifierSettings,
    resyncs: u64,
}

impl Classifier {
    pub fn new(reasons: ReasonTable, settings: ClassifierSettings) -> Self {
        Self {
            reasons,
            settings,
            resyncs: 0,
        }
    }

    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    /// Record a watch re-sync boundary. Histories survive; only the resume
    /// point was reset upstream.
    pub fn note_resync(&mut self, bookmark: &str, store: &HistoryStore) {
        self.resyncs += 1;
        info!(
            bookmark = %bookmark,
            tracked_objects = store.len(),
            resyncs = self.resyncs,
            "Watch re-synced from a fresh baseline; keeping object histories"
        );
    }

    /// Classify a raw event and fold it into the object's history
    pub fn classify(
        &self,
        raw: &RawEvent,
        store: &mut HistoryStore,
        now: DateTime<Utc>,
    ) -> Classification {
        match raw.kind {
            WatchEventKind::Bookmark => return Classification::Skipped(SkipReason::Bookmark),
            WatchEventKind::Deleted => return Classification::Skipped(SkipReason::EventExpired),
            WatchEventKind::Added if self.is_stale(raw, now) => {
                return Classification::Skipped(SkipReason::Stale)
            }
            _ => {}
        }

        let category = self.categorize(raw);
        let object = raw
            .involved
            .clone()
            .filter(ObjectRef::is_identified)
            .unwrap_or_else(ObjectRef::unidentified);

        let mut record = NormalizedEvent {
            object,
            category,
            reason: raw.reason_or_empty().to_string(),
            message: raw.message.clone().unwrap_or_default(),
            event_type: raw.event_type.clone().unwrap_or_default(),
            count: raw.count.unwrap_or(1),
            age: raw
                .created
                .or(raw.first_seen)
                .map_or_else(Duration::zero, |created| now - created),
            observed_at: now,
            occurrences: 0,
            duplicate: false,
        };

        if !record.object.is_identified() {
            debug!(kind = %raw.kind, "Event has no involved object identity; recording as Unknown");
            record.category = EventCategory::Unknown;
            return Classification::Record(record);
        }

        let history = store.entry(&record.object, now);
        let (occurrences, duplicate) =
            history.fold_occurrence(raw.event_uid.as_deref(), raw.count);
        record.occurrences = occurrences;
        record.duplicate = duplicate;

        if duplicate {
            // Redelivered after a reconnect; nothing new to count
            history.touch(now);
            return Classification::Record(record);
        }

        let recent_evidence = history.last_record().is_some_and(|previous| {
            previous.category != EventCategory::Informational
                && now - previous.observed_at <= self.settings.coalescing
        });

        match category {
            EventCategory::Informational => history.reset_failures(),
            failure if failure.is_failure() => {
                if recent_evidence && history.consecutive_failures() > 0 {
                    history.continue_episode(occurrences);
                } else {
                    history.start_episode(occurrences, now);
                }
            }
            _ => {
                if !recent_evidence {
                    history.reset_failures();
                }
            }
        }

        history.push(record.clone());
        Classification::Record(record)
    }

    fn is_stale(&self, raw: &RawEvent, now: DateTime<Utc>) -> bool {
        raw.created
            .is_some_and(|created| created < now - self.settings.freshness)
    }

    fn categorize(&self, raw: &RawEvent) -> EventCategory {
        if raw.kind == WatchEventKind::Error {
            return EventCategory::Unknown;
        }
        if raw.event_type.as_deref() == Some(EVENT_TYPE_NORMAL) {
            return EventCategory::Informational;
        }
        let category = self.reasons.lookup(raw.reason_or_empty());
        if category == EventCategory::Unknown {
            warn!(reason = %raw.reason_or_empty(), "Unmapped event reason; classifying as Unknown");
        }
        category
    }
}
