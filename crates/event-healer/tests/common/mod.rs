//! In-memory fakes of the event source and the cluster shared by the
//! integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use event_healer::executor::{ActionError, DeleteResult};
use event_healer::{
    ClusterActions, EventSource, EventStream, ObjectRef, PodSnapshot, RawEvent, SourceError,
    WatchEventKind,
};
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

// =============================================================================
// Fake Event Source
// =============================================================================

/// One scripted subscription attempt
pub enum Session {
    /// Subscription succeeds; the stream yields these items and then closes
    Stream(Vec<Result<RawEvent, SourceError>>),
    /// Subscription is refused
    Refuse(SourceError),
}

/// Replays scripted sessions; once they run out, subscriptions stay open
/// without delivering anything.
#[derive(Default)]
pub struct FakeSource {
    sessions: Mutex<VecDeque<Session>>,
    baselines: Mutex<VecDeque<Result<String, SourceError>>>,
    /// Bookmark passed to each subscribe call, in order
    subscriptions: Mutex<Vec<String>>,
    baseline_calls: Mutex<u32>,
}

impl FakeSource {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            ..Self::default()
        }
    }

    pub fn with_baselines(self, baselines: Vec<Result<String, SourceError>>) -> Self {
        *self.baselines.lock().unwrap() = baselines.into();
        self
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn baseline_calls(&self) -> u32 {
        *self.baseline_calls.lock().unwrap()
    }
}

#[async_trait]
impl EventSource for FakeSource {
    async fn subscribe(
        &self,
        _namespace: &str,
        bookmark: &str,
        _timeout: Duration,
    ) -> Result<EventStream, SourceError> {
        self.subscriptions.lock().unwrap().push(bookmark.to_string());
        let next = self.sessions.lock().unwrap().pop_front();
        match next {
            Some(Session::Stream(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(Session::Refuse(err)) => Err(err),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn baseline(&self, _namespace: &str) -> Result<String, SourceError> {
        let calls = {
            let mut calls = self.baseline_calls.lock().unwrap();
            *calls += 1;
            *calls
        };
        let next = self.baselines.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("baseline-{calls}")))
    }
}

// =============================================================================
// Fake Cluster
// =============================================================================

/// Pods keyed by name, plus a log of every call made against them
#[derive(Default)]
pub struct FakeCluster {
    pods: Mutex<HashMap<String, PodSnapshot>>,
    deletes: Mutex<Vec<String>>,
    inspections: Mutex<u32>,
    delete_error: Mutex<Option<ActionError>>,
}

impl FakeCluster {
    pub fn with_pod(self, name: &str, pod: PodSnapshot) -> Self {
        self.pods.lock().unwrap().insert(name.to_string(), pod);
        self
    }

    pub fn failing_deletes(self, err: ActionError) -> Self {
        *self.delete_error.lock().unwrap() = Some(err);
        self
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn inspections(&self) -> u32 {
        *self.inspections.lock().unwrap()
    }
}

#[async_trait]
impl ClusterActions for FakeCluster {
    async fn inspect(&self, object: &ObjectRef) -> Result<Option<PodSnapshot>, ActionError> {
        *self.inspections.lock().unwrap() += 1;
        Ok(self.pods.lock().unwrap().get(&object.name).cloned())
    }

    async fn delete(&self, object: &ObjectRef) -> Result<DeleteResult, ActionError> {
        self.deletes.lock().unwrap().push(object.name.clone());
        if let Some(err) = self.delete_error.lock().unwrap().clone() {
            return Err(err);
        }
        let mut pods = self.pods.lock().unwrap();
        match pods.get(&object.name) {
            Some(pod) if pod.uid == object.uid => {
                pods.remove(&object.name);
                Ok(DeleteResult::Deleted)
            }
            Some(_) => Err(ActionError::Conflict("uid precondition failed".to_string())),
            None => Ok(DeleteResult::NotFound),
        }
    }
}

// =============================================================================
// Builders
// =============================================================================

pub const POD_UID: &str = "pod-a-uid";

pub fn pod_ref() -> ObjectRef {
    ObjectRef::new(POD_UID, "Pod", "pod-a", "default")
}

/// A pending pod owned by a ReplicaSet
pub fn pending_pod() -> PodSnapshot {
    PodSnapshot {
        uid: POD_UID.to_string(),
        phase: Some("Pending".to_string()),
        ready: false,
        has_controller: true,
        failed_containers: 0,
        labels: BTreeMap::new(),
    }
}

/// A Warning event about `object`, created at `at`
pub fn warning_for(
    object: &ObjectRef,
    event_uid: &str,
    reason: &str,
    count: i32,
    at: DateTime<Utc>,
) -> RawEvent {
    RawEvent {
        kind: WatchEventKind::Added,
        event_uid: Some(event_uid.to_string()),
        involved: Some(object.clone()),
        reason: Some(reason.to_string()),
        message: Some(format!("{reason} for {}", object.name)),
        event_type: Some("Warning".to_string()),
        count: Some(count),
        first_seen: Some(at),
        last_seen: Some(at),
        created: Some(at),
        bookmark: None,
    }
}

pub fn warning(event_uid: &str, reason: &str, count: i32, at: DateTime<Utc>) -> RawEvent {
    warning_for(&pod_ref(), event_uid, reason, count, at)
}

/// An event positioned at `bookmark` in the stream
pub fn at_bookmark(mut event: RawEvent, bookmark: &str) -> RawEvent {
    event.bookmark = Some(bookmark.to_string());
    event
}
