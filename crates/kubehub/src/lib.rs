//! KTM kubehub: watches live pods and nodes and records their history.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{
    api::Api,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use ktm_core::{ChangeKind, ClusterSnapshot, Record, Resource};
use ktm_persist::HistoryStore;
use metrics::counter;
use tracing::{debug, info, warn};

pub async fn connect() -> Result<Client> {
    Client::try_default().await.context("building kube client from current context")
}

/// Live objects of one kind keyed by name, used to classify watch events.
#[derive(Debug, Clone)]
pub struct Tracker<R> {
    live: BTreeMap<String, R>,
    synced: bool,
}

impl<R: Resource> Default for Tracker<R> {
    fn default() -> Self {
        Self { live: BTreeMap::new(), synced: false }
    }
}

impl<R: Resource> Tracker<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// True once a full listing has been seen.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn items(&self) -> Vec<R> {
        self.live.values().cloned().collect()
    }

    /// Turn one watch event into the history records it implies.
    ///
    /// A relist is diffed against the live view: names missing from it were
    /// deleted while the watch was down.
    pub fn observe(&mut self, event: Event<R>, now: DateTime<Utc>) -> Vec<Record<R>> {
        match event {
            Event::Applied(obj) => self.apply(obj, now).into_iter().collect(),
            Event::Deleted(obj) => self.delete(obj, now).into_iter().collect(),
            Event::Restarted(list) => {
                let listed: BTreeSet<&str> = list.iter().filter_map(|o| o.name()).collect();
                let gone: Vec<String> = self.live.keys().filter(|n| !listed.contains(n.as_str())).cloned().collect();
                let mut out = Vec::with_capacity(list.len());
                for name in gone {
                    if let Some(obj) = self.live.remove(&name) {
                        out.push(Record::changed(obj, ChangeKind::Deleted, now));
                    }
                }
                for obj in list {
                    out.extend(self.apply(obj, now));
                }
                debug!(collection = R::COLLECTION, live = self.live.len(), records = out.len(), "relist");
                self.synced = true;
                out
            }
        }
    }

    fn apply(&mut self, obj: R, now: DateTime<Utc>) -> Option<Record<R>> {
        let name = obj.name()?.to_string();
        let kind = match self.live.get(&name) {
            None => ChangeKind::Added,
            // same resourceVersion: duplicate delivery
            Some(prev) if prev.resource_version() == obj.resource_version() => return None,
            Some(_) => ChangeKind::Updated,
        };
        self.live.insert(name, obj.clone());
        Some(Record::changed(obj, kind, now))
    }

    fn delete(&mut self, obj: R, now: DateTime<Utc>) -> Option<Record<R>> {
        let name = obj.name()?;
        self.live.remove(name);
        Some(Record::changed(obj, ChangeKind::Deleted, now))
    }
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub cluster_id: String,
    pub snapshot_every: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { cluster_id: "default".to_string(), snapshot_every: Duration::from_secs(300) }
    }
}

/// Producer side of the history store: pod/node watch events in, records and
/// periodic cluster snapshots out.
pub struct Recorder {
    store: Arc<HistoryStore>,
    cfg: RecorderConfig,
    pods: Tracker<Pod>,
    nodes: Tracker<Node>,
}

impl Recorder {
    pub fn new(store: Arc<HistoryStore>, cfg: RecorderConfig) -> Self {
        Self { store, cfg, pods: Tracker::new(), nodes: Tracker::new() }
    }

    /// Current live view as a cluster snapshot.
    pub fn snapshot(&self, now: DateTime<Utc>) -> ClusterSnapshot {
        ClusterSnapshot {
            cluster_id: self.cfg.cluster_id.clone(),
            nodes: self.nodes.items(),
            pods: self.pods.items(),
            taken_at: now,
        }
    }

    pub async fn on_pod_event(&mut self, event: Event<Pod>) -> Result<usize> {
        let records = self.pods.observe(event, Utc::now());
        self.persist(records).await
    }

    pub async fn on_node_event(&mut self, event: Event<Node>) -> Result<usize> {
        let records = self.nodes.observe(event, Utc::now());
        self.persist(records).await
    }

    /// Store a snapshot once both kinds have been listed; returns whether one was written.
    pub async fn take_snapshot(&self) -> Result<bool> {
        if !(self.pods.is_synced() && self.nodes.is_synced()) {
            debug!("skipping snapshot until pods and nodes are listed");
            return Ok(false);
        }
        let snap = self.snapshot(Utc::now());
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.put_snapshot(&snap))
            .await
            .context("snapshot writer task failed")?
            .context("storing cluster snapshot")?;
        counter!("recorder_snapshots_total", 1u64);
        Ok(true)
    }

    async fn persist<R: Resource>(&self, records: Vec<Record<R>>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let n = records.len();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || -> Result<()> {
            for r in &records {
                store
                    .put(r)
                    .with_context(|| format!("recording {} {:?}", R::COLLECTION, r.name()))?;
            }
            Ok(())
        })
        .await
        .context("history writer task failed")??;
        counter!("recorder_events_total", n as u64, "collection" => R::COLLECTION);
        Ok(n)
    }

    /// Watch pods and nodes cluster-wide until `shutdown` resolves or a watch
    /// stream ends. Writes a final snapshot before returning.
    pub async fn run(mut self, client: Client, shutdown: impl Future<Output = ()>) -> Result<()> {
        let pods = watcher::watcher(Api::<Pod>::all(client.clone()), watcher::Config::default()).default_backoff();
        let nodes = watcher::watcher(Api::<Node>::all(client), watcher::Config::default()).default_backoff();
        futures::pin_mut!(pods, nodes, shutdown);

        let mut ticker = tokio::time::interval(self.cfg.snapshot_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(cluster = %self.cfg.cluster_id, every = ?self.cfg.snapshot_every, "recorder started");

        loop {
            tokio::select! {
                ev = pods.next() => match ev {
                    Some(Ok(ev)) => { self.on_pod_event(ev).await?; }
                    Some(Err(e)) => {
                        counter!("recorder_watch_errors_total", 1u64, "collection" => "pods");
                        warn!(error = %e, "pod watch error; retrying");
                    }
                    None => { warn!("pod watch stream ended"); break; }
                },
                ev = nodes.next() => match ev {
                    Some(Ok(ev)) => { self.on_node_event(ev).await?; }
                    Some(Err(e)) => {
                        counter!("recorder_watch_errors_total", 1u64, "collection" => "nodes");
                        warn!(error = %e, "node watch error; retrying");
                    }
                    None => { warn!("node watch stream ended"); break; }
                },
                _ = ticker.tick() => { self.take_snapshot().await?; }
                _ = &mut shutdown => {
                    info!("shutdown requested; stopping recorder");
                    break;
                }
            }
        }

        self.take_snapshot().await?;
        info!(pods = self.pods.len(), nodes = self.nodes.len(), "recorder stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn t(s: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + s, 0).unwrap()
    }

    fn pod(name: &str, rv: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(rv.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn kinds(records: &[Record<Pod>]) -> Vec<(String, ChangeKind)> {
        records.iter().map(|r| (r.name().unwrap_or("").to_string(), r.kind().unwrap())).collect()
    }

    #[test]
    fn applied_is_added_then_updated_and_dedups() {
        let mut tr = Tracker::<Pod>::new();
        let out = tr.observe(Event::Applied(pod("a", "1")), t(0));
        assert_eq!(kinds(&out), vec![("a".into(), ChangeKind::Added)]);
        assert_eq!(out[0].resolve_timestamp(), Some(t(0)));

        assert!(tr.observe(Event::Applied(pod("a", "1")), t(1)).is_empty());

        let out = tr.observe(Event::Applied(pod("a", "2")), t(2));
        assert_eq!(kinds(&out), vec![("a".into(), ChangeKind::Updated)]);
        assert_eq!(tr.len(), 1);
    }

    #[test]
    fn deleted_leaves_view() {
        let mut tr = Tracker::<Pod>::new();
        tr.observe(Event::Applied(pod("a", "1")), t(0));
        let out = tr.observe(Event::Deleted(pod("a", "2")), t(5));
        assert_eq!(kinds(&out), vec![("a".into(), ChangeKind::Deleted)]);
        assert!(tr.is_empty());
    }

    #[test]
    fn relist_diffs_against_view() {
        let mut tr = Tracker::<Pod>::new();
        assert!(!tr.is_synced());
        tr.observe(Event::Restarted(vec![pod("a", "1"), pod("b", "1")]), t(0));
        assert!(tr.is_synced());

        let out = tr.observe(Event::Restarted(vec![pod("b", "2"), pod("c", "1")]), t(10));
        assert_eq!(
            kinds(&out),
            vec![
                ("a".into(), ChangeKind::Deleted),
                ("b".into(), ChangeKind::Updated),
                ("c".into(), ChangeKind::Added),
            ]
        );
        let names: Vec<_> = tr.items().iter().filter_map(|p| p.metadata.name.clone()).collect();
        assert_eq!(names, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn nameless_objects_are_ignored() {
        let mut tr = Tracker::<Pod>::new();
        let mut p = pod("x", "1");
        p.metadata.name = None;
        assert!(tr.observe(Event::Applied(p), t(0)).is_empty());
    }

    #[tokio::test]
    async fn recorder_writes_events_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::open(dir.path().join("history.db")).unwrap());
        let cfg = RecorderConfig { cluster_id: "test".into(), ..Default::default() };
        let mut rec = Recorder::new(Arc::clone(&store), cfg);

        assert_eq!(rec.on_pod_event(Event::Restarted(vec![pod("a", "1")])).await.unwrap(), 1);
        // nodes not listed yet
        assert!(!rec.take_snapshot().await.unwrap());
        rec.on_node_event(Event::Restarted(Vec::new())).await.unwrap();
        rec.on_pod_event(Event::Applied(pod("a", "2"))).await.unwrap();
        rec.on_pod_event(Event::Applied(pod("b", "1"))).await.unwrap();
        assert!(rec.take_snapshot().await.unwrap());

        let hist = store.get_by_name::<Pod>("a").unwrap();
        let seq: Vec<_> = hist.iter().map(|r| r.kind().unwrap()).collect();
        assert_eq!(seq, vec![ChangeKind::Added, ChangeKind::Updated]);

        let snap = store.latest_snapshot_since("test", Utc::now() - chrono::Duration::minutes(1)).unwrap().unwrap();
        assert_eq!(snap.pods.len(), 2);
        assert!(snap.nodes.is_empty());
        assert_eq!(store.clusters().unwrap(), vec!["test".to_string()]);
    }
}
