//! Safety gates that must all pass before a pod is deleted.

use crate::executor::PodSnapshot;
use crate::history::ObjectHistory;
use crate::types::ObjectRef;
use chrono::{DateTime, Duration, Utc};
use std::fmt;

/// Label used to exclude pods from remediation
pub const EXCLUDE_LABEL: &str = "event-healer.io/exclude";

/// The only object kind the healer knows how to remediate
pub const REMEDIABLE_KIND: &str = "Pod";

/// Why a pending remediation was not carried out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Suppression {
    /// Involved object is not a pod
    UnsupportedKind(String),
    /// Pod carries the exclude label
    OptedOut,
    /// No controller would recreate the pod after deletion
    NoControllerOwner,
    /// Pod already succeeded or is running and ready
    HealthyPhase(String),
    /// Pod was remediated within the cooldown window
    RecentlyRemediated,
    /// Process-wide remediation budget exhausted
    RateLimited,
    /// Pod state could not be read
    InspectionFailed(String),
    /// Shutdown began before the evaluation finished
    Cancelled,
}

impl fmt::Display for Suppression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedKind(kind) => write!(f, "unsupported object kind '{kind}'"),
            Self::OptedOut => write!(f, "pod is labelled {EXCLUDE_LABEL}=true"),
            Self::NoControllerOwner => write!(f, "pod has no controller owner reference"),
            Self::HealthyPhase(phase) => write!(f, "pod is healthy (phase {phase})"),
            Self::RecentlyRemediated => write!(f, "pod was remediated within the cooldown window"),
            Self::RateLimited => write!(f, "remediation rate limit reached"),
            Self::InspectionFailed(reason) => write!(f, "could not inspect pod: {reason}"),
            Self::Cancelled => write!(f, "shutdown in progress"),
        }
    }
}

/// Outcome of running the safety gates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyVerdict {
    Pass,
    Suppress(Suppression),
    /// The object no longer exists; its generation is over
    Gone,
}

/// Check whether a pod may be deleted.
///
/// `snapshot` is the pod's current state, `None` when the pod was not found.
pub fn evaluate(
    object: &ObjectRef,
    snapshot: Option<&PodSnapshot>,
    history: &ObjectHistory,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> SafetyVerdict {
    if object.kind != REMEDIABLE_KIND {
        return SafetyVerdict::Suppress(Suppression::UnsupportedKind(object.kind.clone()));
    }

    // A pod with the same name but a different uid is a newer generation
    let Some(pod) = snapshot.filter(|pod| pod.uid == object.uid) else {
        return SafetyVerdict::Gone;
    };

    if pod.labels.get(EXCLUDE_LABEL).is_some_and(|v| v == "true") {
        return SafetyVerdict::Suppress(Suppression::OptedOut);
    }

    if !pod.has_controller {
        return SafetyVerdict::Suppress(Suppression::NoControllerOwner);
    }

    if pod.is_healthy() {
        let phase = pod.phase.clone().unwrap_or_else(|| "Unknown".to_string());
        return SafetyVerdict::Suppress(Suppression::HealthyPhase(phase));
    }

    if history
        .last_remediation()
        .is_some_and(|at| now - at < cooldown)
    {
        return SafetyVerdict::Suppress(Suppression::RecentlyRemediated);
    }

    SafetyVerdict::Pass
}
