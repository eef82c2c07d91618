//! Bounded per-object event history.
//!
//! Each involved object gets a rolling window of its most recent normalized
//! events plus the counters the decision engine needs. Entries are created on
//! the first event for an object and evicted once the object has been idle
//! for the configured period, so memory stays proportional to the number of
//! recently active objects rather than total event volume.

use crate::types::{NormalizedEvent, ObjectRef};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Rolling state for one involved object
#[derive(Debug, Clone)]
pub struct ObjectHistory {
    object: ObjectRef,
    records: VecDeque<NormalizedEvent>,
    capacity: usize,
    /// Last occurrence count seen per Event uid
    seen_counts: VecDeque<(String, i32)>,
    first_failure: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    episode: u64,
    last_remediation: Option<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

impl ObjectHistory {
    pub fn new(object: ObjectRef, capacity: usize, now: DateTime<Utc>) -> Self {
        let capacity = capacity.max(1);
        Self {
            object,
            records: VecDeque::with_capacity(capacity),
            capacity,
            seen_counts: VecDeque::new(),
            first_failure: None,
            consecutive_failures: 0,
            episode: 0,
            last_remediation: None,
            last_seen: now,
        }
    }

    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn records(&self) -> impl Iterator<Item = &NormalizedEvent> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_record(&self) -> Option<&NormalizedEvent> {
        self.records.back()
    }

    pub fn first_failure(&self) -> Option<DateTime<Utc>> {
        self.first_failure
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Number of the current failure episode (0 before the first failure)
    pub fn episode(&self) -> u64 {
        self.episode
    }

    pub fn last_remediation(&self) -> Option<DateTime<Utc>> {
        self.last_remediation
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Fold an occurrence of an Event object into the history.
    ///
    /// Returns how many new occurrences it represents and whether it is a
    /// pure redelivery. The first sighting of an Event counts as one
    /// occurrence regardless of its aggregated count; later sightings
    /// contribute the count delta.
    pub fn fold_occurrence(&mut self, event_uid: Option<&str>, count: Option<i32>) -> (u32, bool) {
        let Some(uid) = event_uid else {
            return (1, false);
        };
        let count = count.unwrap_or(1).max(1);

        if let Some(entry) = self.seen_counts.iter_mut().find(|(seen, _)| seen == uid) {
            if count <= entry.1 {
                return (0, true);
            }
            let delta = count.abs_diff(entry.1);
            entry.1 = count;
            return (delta, false);
        }

        if self.seen_counts.len() >= self.capacity {
            self.seen_counts.pop_front();
        }
        self.seen_counts.push_back((uid.to_string(), count));
        (1, false)
    }

    /// Append a record, evicting the oldest once the ring is full
    pub fn push(&mut self, record: NormalizedEvent) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.last_seen = self.last_seen.max(record.observed_at);
        self.records.push_back(record);
    }

    /// Start a new failure episode with the given number of occurrences
    pub fn start_episode(&mut self, occurrences: u32, now: DateTime<Utc>) {
        self.episode += 1;
        self.consecutive_failures = occurrences;
        self.first_failure = Some(now);
    }

    /// Add occurrences to the current failure episode
    pub fn continue_episode(&mut self, occurrences: u32) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(occurrences);
    }

    /// Clear failure counters; the next failure opens a new episode
    pub fn reset_failures(&mut self) {
        if self.consecutive_failures > 0 {
            debug!(object = %self.object, episode = self.episode, "Resetting failure counters");
        }
        self.consecutive_failures = 0;
        self.first_failure = None;
    }

    pub fn mark_remediated(&mut self, now: DateTime<Utc>) {
        self.last_remediation = Some(now);
    }

    pub fn clear_remediation(&mut self) {
        self.last_remediation = None;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = self.last_seen.max(now);
    }
}

/// All object histories owned by one namespace pipeline
#[derive(Debug)]
pub struct HistoryStore {
    entries: HashMap<String, ObjectHistory>,
    capacity: usize,
    idle: Duration,
}

impl HistoryStore {
    pub fn new(capacity: usize, idle: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            idle,
        }
    }

    /// Get the history for an object, creating it on first sight
    pub fn entry(&mut self, object: &ObjectRef, now: DateTime<Utc>) -> &mut ObjectHistory {
        self.entries
            .entry(object.uid.clone())
            .or_insert_with(|| ObjectHistory::new(object.clone(), self.capacity, now))
    }

    pub fn get(&self, uid: &str) -> Option<&ObjectHistory> {
        self.entries.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut ObjectHistory> {
        self.entries.get_mut(uid)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut ObjectHistory)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop histories that saw no events for the idle period; returns their uids
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let idle = self.idle;
        let evicted: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, history)| now - history.last_seen >= idle)
            .map(|(uid, _)| uid.clone())
            .collect();

        for uid in &evicted {
            self.entries.remove(uid);
        }

        if !evicted.is_empty() {
            debug!(
                evicted = evicted.len(),
                remaining = self.entries.len(),
                "Evicted idle object histories"
            );
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventCategory;

    fn pod() -> ObjectRef {
        ObjectRef::new("uid-1", "Pod", "pod-a", "default")
    }

    fn record(at: DateTime<Utc>, reason: &str) -> NormalizedEvent {
        NormalizedEvent {
            object: pod(),
            category: EventCategory::TerminalFailure,
            reason: reason.to_string(),
            message: String::new(),
            event_type: "Warning".to_string(),
            count: 1,
            age: Duration::zero(),
            observed_at: at,
            occurrences: 1,
            duplicate: false,
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let now = Utc::now();
        let mut history = ObjectHistory::new(pod(), 3, now);
        for i in 0..5 {
            history.push(record(now + Duration::seconds(i), &format!("r{i}")));
        }
        let reasons: Vec<_> = history.records().map(|r| r.reason.as_str()).collect();
        assert_eq!(reasons, vec!["r2", "r3", "r4"]);
        assert_eq!(history.last_seen(), now + Duration::seconds(4));
    }

    #[test]
    fn test_fold_occurrence_counts_deltas_and_duplicates() {
        let mut history = ObjectHistory::new(pod(), 5, Utc::now());
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(4)), (1, false));
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(4)), (0, true));
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(6)), (2, false));
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(5)), (0, true));
        assert_eq!(history.fold_occurrence(None, None), (1, false));
    }

    #[test]
    fn test_fold_occurrence_clamps_bogus_counts() {
        let mut history = ObjectHistory::new(pod(), 5, Utc::now());
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(-5)), (1, false));
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(0)), (0, true));
        let jump = u32::try_from(i32::MAX - 1).unwrap();
        assert_eq!(history.fold_occurrence(Some("ev-1"), Some(i32::MAX)), (jump, false));

        assert_eq!(history.fold_occurrence(Some("ev-2"), Some(i32::MIN)), (1, false));
        assert_eq!(history.fold_occurrence(Some("ev-2"), Some(i32::MAX)), (jump, false));
    }

    #[test]
    fn test_episode_counters() {
        let now = Utc::now();
        let mut history = ObjectHistory::new(pod(), 5, now);
        history.start_episode(1, now);
        history.continue_episode(2);
        assert_eq!(history.consecutive_failures(), 3);
        assert_eq!(history.episode(), 1);
        assert_eq!(history.first_failure(), Some(now));

        history.reset_failures();
        assert_eq!(history.consecutive_failures(), 0);
        assert!(history.first_failure().is_none());

        history.start_episode(1, now);
        assert_eq!(history.episode(), 2);
    }

    #[test]
    fn test_store_evicts_idle_entries() {
        let now = Utc::now();
        let mut store = HistoryStore::new(5, Duration::minutes(10));
        store.entry(&pod(), now);
        let other = ObjectRef::new("uid-2", "Pod", "pod-b", "default");
        store.entry(&other, now + Duration::minutes(8)).touch(now + Duration::minutes(8));

        let evicted = store.evict_idle(now + Duration::minutes(11));
        assert_eq!(evicted, vec!["uid-1".to_string()]);
        assert!(store.get("uid-1").is_none());
        assert!(store.get("uid-2").is_some());
    }
}
