//! Remediation actions against the cluster.

use crate::types::ObjectRef;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Errors returned by the cluster action API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// The object does not exist (any more)
    #[error("Object not found: {0}")]
    NotFound(String),

    /// A precondition (uid) did not match; the object was replaced
    #[error("Precondition conflict: {0}")]
    Conflict(String),

    /// Caller is not allowed to act on the object
    #[error("Permission denied: {0}")]
    Forbidden(String),

    /// API returned an error response
    #[error("API error: {code} - {message}")]
    Api { code: u16, message: String },

    /// Request never reached the API
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ActionError {
    /// Errors meaning the target is already gone, which counts as success
    #[must_use]
    pub fn is_vanished(&self) -> bool {
        matches!(self, ActionError::NotFound(_) | ActionError::Conflict(_))
    }
}

/// Result of a delete call that the API accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Deleted,
    NotFound,
}

/// The parts of a pod's state the safety gates look at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSnapshot {
    pub uid: String,
    pub phase: Option<String>,
    /// `Ready` condition is `True`
    pub ready: bool,
    /// Some owner reference is marked as controller
    pub has_controller: bool,
    /// Containers terminated with a non-zero exit code
    pub failed_containers: usize,
    pub labels: BTreeMap<String, String>,
}

impl PodSnapshot {
    /// Succeeded, or running with every condition green
    pub fn is_healthy(&self) -> bool {
        match self.phase.as_deref() {
            Some("Succeeded") => true,
            Some("Running") => self.ready && self.failed_containers == 0,
            _ => false,
        }
    }
}

/// Cluster operations the healer needs
#[async_trait]
pub trait ClusterActions: Send + Sync {
    /// Current state of the pod, `None` if it does not exist
    async fn inspect(&self, object: &ObjectRef) -> Result<Option<PodSnapshot>, ActionError>;

    /// Delete exactly this generation of the pod
    async fn delete(&self, object: &ObjectRef) -> Result<DeleteResult, ActionError>;
}

/// What the executor did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Delete accepted, or the object was already gone
    Applied,
    /// Dry-run: nothing was changed
    Simulated,
    Failed(String),
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "Applied"),
            Self::Simulated => write!(f, "Simulated"),
            Self::Failed(reason) => write!(f, "Failed({reason})"),
        }
    }
}

/// Carries out approved remediations, or only logs them in dry-run mode
#[derive(Clone)]
pub struct ActionExecutor {
    actions: Arc<dyn ClusterActions>,
    dry_run: bool,
}

impl ActionExecutor {
    pub fn new(actions: Arc<dyn ClusterActions>, dry_run: bool) -> Self {
        Self { actions, dry_run }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Read the pod state for safety checks (performed in dry-run too)
    pub async fn inspect(&self, object: &ObjectRef) -> Result<Option<PodSnapshot>, ActionError> {
        self.actions.inspect(object).await
    }

    /// Delete the object so its controller recreates it
    pub async fn execute(&self, object: &ObjectRef) -> ActionOutcome {
        if self.dry_run {
            info!(object = %object, uid = %object.uid, "[DRY-RUN] Would have deleted pod");
            return ActionOutcome::Simulated;
        }

        match self.actions.delete(object).await {
            Ok(DeleteResult::Deleted) => {
                info!(object = %object, uid = %object.uid, "Deleted pod");
                ActionOutcome::Applied
            }
            Ok(DeleteResult::NotFound) => {
                info!(object = %object, "Pod already gone; nothing to delete");
                ActionOutcome::Applied
            }
            Err(e) if e.is_vanished() => {
                info!(object = %object, reason = %e, "Pod vanished before deletion");
                ActionOutcome::Applied
            }
            Err(e) => {
                error!(object = %object, error = %e, "Failed to delete pod");
                ActionOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedActions {
        delete_result: Result<DeleteResult, ActionError>,
        deletes: Mutex<u32>,
    }

    #[async_trait]
    impl ClusterActions for ScriptedActions {
        async fn inspect(&self, _object: &ObjectRef) -> Result<Option<PodSnapshot>, ActionError> {
            Ok(None)
        }

        async fn delete(&self, _object: &ObjectRef) -> Result<DeleteResult, ActionError> {
            *self.deletes.lock().unwrap() += 1;
            self.delete_result.clone()
        }
    }

    fn executor(result: Result<DeleteResult, ActionError>, dry_run: bool) -> (ActionExecutor, Arc<ScriptedActions>) {
        let actions = Arc::new(ScriptedActions {
            delete_result: result,
            deletes: Mutex::new(0),
        });
        (ActionExecutor::new(actions.clone(), dry_run), actions)
    }

    fn pod() -> ObjectRef {
        ObjectRef::new("uid-1", "Pod", "pod-a", "default")
    }

    #[tokio::test]
    async fn test_dry_run_never_deletes() {
        let (executor, actions) = executor(Ok(DeleteResult::Deleted), true);
        assert_eq!(executor.execute(&pod()).await, ActionOutcome::Simulated);
        assert_eq!(*actions.deletes.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_applied() {
        let (executor, actions) = executor(Ok(DeleteResult::Deleted), false);
        assert_eq!(executor.execute(&pod()).await, ActionOutcome::Applied);
        assert_eq!(*actions.deletes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_vanished_object_is_success() {
        for result in [
            Ok(DeleteResult::NotFound),
            Err(ActionError::NotFound("pods \"pod-a\" not found".to_string())),
            Err(ActionError::Conflict("uid mismatch".to_string())),
        ] {
            let (executor, _) = executor(result, false);
            assert_eq!(executor.execute(&pod()).await, ActionOutcome::Applied);
        }
    }

    #[tokio::test]
    async fn test_permission_error_fails() {
        let (executor, _) = executor(
            Err(ActionError::Forbidden("cannot delete pods".to_string())),
            false,
        );
        assert!(matches!(
            executor.execute(&pod()).await,
            ActionOutcome::Failed(reason) if reason.contains("cannot delete pods")
        ));
    }

    #[test]
    fn test_pod_health() {
        let mut pod = PodSnapshot {
            phase: Some("Running".to_string()),
            ready: true,
            ..PodSnapshot::default()
        };
        assert!(pod.is_healthy());
        pod.failed_containers = 1;
        assert!(!pod.is_healthy());
        pod.phase = Some("Pending".to_string());
        assert!(!pod.is_healthy());
    }
}
