//! KTM query engine: relative-time lookups over the history store and
//! point-in-time cluster reconstruction.

#![forbid(unsafe_code)]

pub mod duration;
pub mod reconcile;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use ktm_core::{ClusterSnapshot, NodeRecord, PodRecord, Record, Resource};
use ktm_persist::{HistoryStore, StoreError};
use metrics::{counter, histogram};
use tracing::debug;

pub use duration::parse_duration;
pub use reconcile::{replay, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid duration {0:?} (expected e.g. \"30s\", \"2h45m\", \"500ms\")")]
    InvalidDuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Cutoff instant for a window ending at `now`.
pub fn cutoff_at(now: DateTime<Utc>, window: &str) -> QueryResult<DateTime<Utc>> {
    let d = parse_duration(window)?;
    now.checked_sub_signed(d).ok_or_else(|| QueryError::InvalidDuration(window.to_string()))
}

/// Cutoff instant for a window ending now.
pub fn cutoff(window: &str) -> QueryResult<DateTime<Utc>> {
    cutoff_at(Utc::now(), window)
}

/// Relative-time queries and reconciliation over a shared history store.
#[derive(Clone)]
pub struct TimeMachine {
    store: Arc<HistoryStore>,
    reconciler: Reconciler,
}

impl TimeMachine {
    pub fn new(store: Arc<HistoryStore>) -> Self {
        Self { store, reconciler: Reconciler::default() }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Newest record per entity newer than `cutoff`, newest first.
    pub fn latest_since<R: Resource>(&self, cutoff: DateTime<Utc>) -> QueryResult<Vec<Record<R>>> {
        counter!("query_total", 1u64, "op" => "latest_since");
        Ok(self.store.get_all_since(cutoff)?)
    }

    /// One entity's records newer than `cutoff`, oldest first.
    pub fn history_of<R: Resource>(&self, name: &str, cutoff: DateTime<Utc>) -> QueryResult<Vec<Record<R>>> {
        counter!("query_total", 1u64, "op" => "history_of");
        Ok(self.store.get_by_name_since(name, cutoff)?)
    }

    pub fn pods_since(&self, cutoff: DateTime<Utc>) -> QueryResult<Vec<PodRecord>> {
        self.latest_since::<Pod>(cutoff)
    }

    pub fn nodes_since(&self, cutoff: DateTime<Utc>) -> QueryResult<Vec<NodeRecord>> {
        self.latest_since::<Node>(cutoff)
    }

    pub fn pod_history(&self, name: &str, cutoff: DateTime<Utc>) -> QueryResult<Vec<PodRecord>> {
        self.history_of::<Pod>(name, cutoff)
    }

    pub fn node_history(&self, name: &str, cutoff: DateTime<Utc>) -> QueryResult<Vec<NodeRecord>> {
        self.history_of::<Node>(name, cutoff)
    }

    pub fn latest_pod(&self, name: &str, cutoff: DateTime<Utc>) -> QueryResult<Option<PodRecord>> {
        Ok(self.store.latest_by_name(name, cutoff)?)
    }

    /// Reconstruct `cluster_id` from the newest snapshot in the window plus
    /// every pod event (and node event, when enabled) newer than `cutoff`.
    pub fn reconcile(&self, cluster_id: &str, cutoff: DateTime<Utc>) -> QueryResult<ClusterSnapshot> {
        let started = Instant::now();
        let baseline = self.store.latest_snapshot_since(cluster_id, cutoff)?;
        let pod_events = self.store.events_since::<Pod>(cutoff)?;
        let node_events = if self.reconciler.replays_nodes() {
            self.store.events_since::<Node>(cutoff)?
        } else {
            Vec::new()
        };
        debug!(
            cluster = %cluster_id,
            %cutoff,
            baseline_at = ?baseline.as_ref().map(|b| b.taken_at),
            pod_events = pod_events.len(),
            node_events = node_events.len(),
            "reconciling"
        );
        let snap = self.reconciler.reconcile(cluster_id, cutoff, baseline, &pod_events, &node_events);
        histogram!("reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(snap)
    }

    // ---- window forms: the duration is parsed before any storage access ----

    pub fn pods_within(&self, window: &str) -> QueryResult<Vec<PodRecord>> {
        self.pods_since(cutoff(window)?)
    }

    pub fn nodes_within(&self, window: &str) -> QueryResult<Vec<NodeRecord>> {
        self.nodes_since(cutoff(window)?)
    }

    pub fn history_within<R: Resource>(&self, name: &str, window: &str) -> QueryResult<Vec<Record<R>>> {
        self.history_of(name, cutoff(window)?)
    }

    pub fn reconcile_within(&self, cluster_id: &str, window: &str) -> QueryResult<ClusterSnapshot> {
        self.reconcile(cluster_id, cutoff(window)?)
    }
}
