//! Kubernetes implementations of the event source and cluster actions.

use crate::executor::{ActionError, ClusterActions, DeleteResult, PodSnapshot};
use crate::source::{EventSource, EventStream, SourceError};
use crate::types::{ObjectRef, RawEvent, WatchEventKind};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, DeleteParams, ListParams, Preconditions, WatchEvent, WatchParams};
use kube::Client;
use std::time::Duration;
use tracing::debug;

/// Watches `core/v1` Events through the API server
#[derive(Clone)]
pub struct KubeEventSource {
    client: Client,
}

impl KubeEventSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSource for KubeEventSource {
    async fn subscribe(
        &self,
        namespace: &str,
        bookmark: &str,
        timeout: Duration,
    ) -> Result<EventStream, SourceError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let params = WatchParams::default().timeout(timeout.as_secs() as u32);
        let stream = api
            .watch(&params, bookmark)
            .await
            .map_err(source_error)?;

        Ok(stream
            .map(|item| match item {
                Ok(event) => raw_event(event),
                Err(err) => Err(source_error(err)),
            })
            .boxed())
    }

    async fn baseline(&self, namespace: &str) -> Result<String, SourceError> {
        let api: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list_metadata(&ListParams::default().limit(1))
            .await
            .map_err(source_error)?;
        list.metadata
            .resource_version
            .filter(|version| !version.is_empty())
            .ok_or_else(|| SourceError::Transport("event list returned no resource version".to_string()))
    }
}

/// Reads and deletes pods
#[derive(Clone)]
pub struct KubePodActions {
    client: Client,
}

impl KubePodActions {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterActions for KubePodActions {
    async fn inspect(&self, object: &ObjectRef) -> Result<Option<PodSnapshot>, ActionError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &object.namespace);
        let pod = pods.get_opt(&object.name).await.map_err(action_error)?;
        Ok(pod.as_ref().map(pod_snapshot))
    }

    async fn delete(&self, object: &ObjectRef) -> Result<DeleteResult, ActionError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &object.namespace);
        // Only this generation; a recreated pod with the same name has a new uid
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: Some(object.uid.clone()),
                resource_version: None,
            }),
            ..DeleteParams::default()
        };

        match pods.delete(&object.name, &params).await {
            Ok(_) => Ok(DeleteResult::Deleted),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(object = %object, "Pod not found at delete time");
                Ok(DeleteResult::NotFound)
            }
            Err(err) => Err(action_error(err)),
        }
    }
}

/// Convert one watch notification into the source-neutral form
pub fn raw_event(event: WatchEvent<Event>) -> Result<RawEvent, SourceError> {
    match event {
        WatchEvent::Added(event) => Ok(from_event(WatchEventKind::Added, event)),
        WatchEvent::Modified(event) => Ok(from_event(WatchEventKind::Modified, event)),
        WatchEvent::Deleted(event) => Ok(from_event(WatchEventKind::Deleted, event)),
        WatchEvent::Bookmark(bookmark) => Ok(RawEvent::bookmark(bookmark.metadata.resource_version)),
        WatchEvent::Error(response) => Err(SourceError::from_status(response.code, response.message)),
    }
}

fn from_event(kind: WatchEventKind, event: Event) -> RawEvent {
    let involved = event.involved_object;
    let object = ObjectRef::new(
        involved.uid.unwrap_or_default(),
        involved.kind.unwrap_or_default(),
        involved.name.unwrap_or_default(),
        involved.namespace.unwrap_or_default(),
    );

    RawEvent {
        kind,
        event_uid: event.metadata.uid,
        involved: Some(object).filter(ObjectRef::is_identified),
        reason: event.reason,
        message: event.message,
        event_type: event.type_,
        count: event.count,
        first_seen: event
            .first_timestamp
            .map(|t| t.0)
            .or_else(|| event.event_time.map(|t| t.0)),
        last_seen: event.last_timestamp.map(|t| t.0),
        created: event.metadata.creation_timestamp.map(|t| t.0),
        bookmark: event.metadata.resource_version,
    }
}

/// Reduce a pod to the fields the safety gates read
pub fn pod_snapshot(pod: &Pod) -> PodSnapshot {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        });
    let failed_containers = status
        .and_then(|s| s.container_statuses.as_ref())
        .map_or(0, |statuses| {
            statuses
                .iter()
                .filter(|cs| {
                    cs.state
                        .as_ref()
                        .and_then(|state| state.terminated.as_ref())
                        .is_some_and(|terminated| terminated.exit_code != 0)
                })
                .count()
        });
    let has_controller = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|owners| owners.iter().any(|o| o.controller == Some(true)));

    PodSnapshot {
        uid: pod.metadata.uid.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        ready,
        has_controller,
        failed_containers,
        labels: pod.metadata.labels.clone().unwrap_or_default(),
    }
}

fn source_error(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(response) => SourceError::from_status(response.code, response.message),
        kube::Error::SerdeError(err) => SourceError::Malformed(err.to_string()),
        other => SourceError::Transport(other.to_string()),
    }
}

fn action_error(err: kube::Error) -> ActionError {
    match err {
        kube::Error::Api(response) => match response.code {
            404 => ActionError::NotFound(response.message),
            409 => ActionError::Conflict(response.message),
            401 | 403 => ActionError::Forbidden(response.message),
            code => ActionError::Api {
                code,
                message: response.message,
            },
        },
        other => ActionError::Transport(other.to_string()),
    }
}
