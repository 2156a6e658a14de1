//! Point-in-time reconstruction: replay change events onto a baseline snapshot.

use chrono::{DateTime, Utc};
use ktm_core::{ChangeKind, ClusterSnapshot, NodeRecord, PodRecord, Record, Resource};
use tracing::debug;

/// Replay `newest_first` events onto `working` in chronological order.
///
/// Per event kind, matching by name:
/// - `Added`: replace in place, else append
/// - `Updated`: replace in place, never append
/// - `Deleted`: remove every match
///
/// Records without a change event are initial observations and change nothing.
/// Returns how many events were applied.
pub fn replay<R: Resource>(working: &mut Vec<R>, newest_first: &[Record<R>]) -> usize {
    let mut applied = 0usize;
    for record in newest_first.iter().rev() {
        let (Some(kind), Some(name)) = (record.kind(), record.name()) else {
            continue;
        };
        match kind {
            ChangeKind::Added => {
                if !replace_named(working, name, &record.resource) {
                    working.push(record.resource.clone());
                }
            }
            ChangeKind::Updated => {
                replace_named(working, name, &record.resource);
            }
            ChangeKind::Deleted => {
                working.retain(|r| r.name() != Some(name));
            }
        }
        applied += 1;
    }
    applied
}

fn replace_named<R: Resource>(working: &mut [R], name: &str, with: &R) -> bool {
    let mut found = false;
    for slot in working.iter_mut().filter(|r| r.name() == Some(name)) {
        *slot = with.clone();
        found = true;
    }
    found
}

/// Folds event logs into a baseline snapshot.
///
/// Only pod events are replayed by default; node lists come from the baseline
/// verbatim unless node replay is switched on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler {
    replay_nodes: bool,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replay_nodes(mut self, on: bool) -> Self {
        self.replay_nodes = on;
        self
    }

    pub fn replays_nodes(&self) -> bool {
        self.replay_nodes
    }

    /// Reconstruct the cluster view from a baseline and newest-first event logs.
    ///
    /// Without a baseline the view starts empty and is stamped with `cutoff`.
    /// `node_events` is ignored unless node replay is on.
    pub fn reconcile(
        &self,
        cluster_id: &str,
        cutoff: DateTime<Utc>,
        baseline: Option<ClusterSnapshot>,
        pod_events: &[PodRecord],
        node_events: &[NodeRecord],
    ) -> ClusterSnapshot {
        let had_baseline = baseline.is_some();
        let mut snap = baseline.unwrap_or_else(|| ClusterSnapshot::empty(cluster_id, cutoff));
        let pods_applied = replay(&mut snap.pods, pod_events);
        let nodes_applied = if self.replay_nodes { replay(&mut snap.nodes, node_events) } else { 0 };
        debug!(
            cluster = %cluster_id,
            had_baseline,
            pods_applied,
            nodes_applied,
            pods = snap.pods.len(),
            nodes = snap.nodes.len(),
            "snapshot reconciled"
        );
        snap
    }
}
