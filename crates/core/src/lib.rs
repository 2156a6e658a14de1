//! KTM core types: tracked resources, history records and cluster snapshots.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Kind of change observed for a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "Added",
            ChangeKind::Updated => "Updated",
            ChangeKind::Deleted => "Deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change annotation attached to a history record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub time: DateTime<Utc>,
}

/// A Kubernetes object kind whose history is recorded.
///
/// Each kind lives in its own collection; names are unique only within it.
pub trait Resource: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection (bucket) holding this kind's history.
    const COLLECTION: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn name(&self) -> Option<&str> {
        self.meta().name.as_deref()
    }

    fn created_at(&self) -> Option<DateTime<Utc>> {
        self.meta().creation_timestamp.as_ref().map(|t| t.0)
    }

    fn resource_version(&self) -> Option<&str> {
        self.meta().resource_version.as_deref()
    }
}

impl Resource for Pod {
    const COLLECTION: &'static str = "pods";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}

impl Resource for Node {
    const COLLECTION: &'static str = "nodes";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Full state of a resource at the time of an event, plus the optional event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record<R> {
    pub resource: R,
    #[serde(default)]
    pub event: Option<ChangeEvent>,
}

pub type PodRecord = Record<Pod>;
pub type NodeRecord = Record<Node>;

impl<R: Resource> Record<R> {
    /// Record without a change event (an initial observation).
    pub fn observed(resource: R) -> Self {
        Self { resource, event: None }
    }

    pub fn changed(resource: R, kind: ChangeKind, time: DateTime<Utc>) -> Self {
        Self { resource, event: Some(ChangeEvent { kind, time }) }
    }

    pub fn name(&self) -> Option<&str> {
        self.resource.name()
    }

    pub fn kind(&self) -> Option<ChangeKind> {
        self.event.map(|e| e.kind)
    }

    /// Instant this record is filed under: the event time, else the resource's creation time.
    pub fn resolve_timestamp(&self) -> Option<DateTime<Utc>> {
        match self.event {
            Some(ev) => Some(ev.time),
            None => self.resource.created_at(),
        }
    }
}

/// Full capture of a cluster's nodes and pods at one instant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster_id: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    pub taken_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    pub fn empty(cluster_id: impl Into<String>, taken_at: DateTime<Utc>) -> Self {
        Self { cluster_id: cluster_id.into(), nodes: Vec::new(), pods: Vec::new(), taken_at }
    }
}

pub mod prelude {
    pub use super::{ChangeEvent, ChangeKind, ClusterSnapshot, NodeRecord, PodRecord, Record, Resource};
}
