#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use ktm_core::{ChangeKind, ClusterSnapshot, NodeRecord, PodRecord, Record};
use ktm_persist::{HistoryStore, StoreError};

fn now() -> DateTime<Utc> {
    // creation timestamps only survive JSON at whole seconds
    Utc::now().duration_trunc(Duration::seconds(1)).unwrap()
}

fn pod(name: &str, created: DateTime<Utc>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn node(name: &str, created: DateTime<Utc>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            creation_timestamp: Some(Time(created)),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn open() -> (tempfile::TempDir, HistoryStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = HistoryStore::open(dir.path().join("history.db")).unwrap();
    (dir, store)
}

fn names(records: &[PodRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name().unwrap()).collect()
}

#[test]
fn empty_store_means_no_history() {
    let (_dir, s) = open();
    let cutoff = now() - Duration::hours(1);
    assert!(s.get_by_name::<Pod>("web").unwrap().is_empty());
    assert!(s.get_by_name_since::<Pod>("web", cutoff).unwrap().is_empty());
    assert!(s.get_all_since::<Pod>(cutoff).unwrap().is_empty());
    assert!(s.events_since::<Node>(cutoff).unwrap().is_empty());
    assert!(s.latest_by_name::<Pod>("web", cutoff).unwrap().is_none());
    assert!(s.latest_snapshot_since("prod", cutoff).unwrap().is_none());
    assert!(s.clusters().unwrap().is_empty());
}

#[test]
fn prefix_scan_does_not_leak_into_longer_names() {
    let (_dir, s) = open();
    let t = now() - Duration::hours(1);
    for (i, name) in ["web", "web2", "web-1", "we", "web"].iter().enumerate() {
        let at = t + Duration::minutes(i as i64);
        s.put(&Record::changed(pod(name, t), ChangeKind::Updated, at)).unwrap();
    }
    let hist = s.get_by_name::<Pod>("web").unwrap();
    assert_eq!(hist.len(), 2);
    assert!(hist.iter().all(|r| r.name() == Some("web")));
    assert!(hist[0].resolve_timestamp() < hist[1].resolve_timestamp());
    assert_eq!(s.get_by_name::<Pod>("we").unwrap().len(), 1);
}

#[test]
fn history_since_is_ascending_and_strictly_after_cutoff() {
    let (_dir, s) = open();
    let n = now();
    let created = n - Duration::hours(5);
    s.put(&Record::observed(pod("api", created))).unwrap();
    for h in [3, 2, 1] {
        s.put(&Record::changed(pod("api", created), ChangeKind::Updated, n - Duration::hours(h))).unwrap();
    }
    let hist = s.get_by_name_since::<Pod>("api", n - Duration::minutes(150)).unwrap();
    let times: Vec<_> = hist.iter().map(|r| r.resolve_timestamp().unwrap()).collect();
    assert_eq!(times, vec![n - Duration::hours(2), n - Duration::hours(1)]);

    // the cutoff itself is excluded
    let hist = s.get_by_name_since::<Pod>("api", n - Duration::hours(2)).unwrap();
    assert_eq!(hist.len(), 1);

    assert_eq!(s.get_by_name::<Pod>("api").unwrap().len(), 4);
}

#[test]
fn all_since_keeps_newest_record_per_name() {
    let (_dir, s) = open();
    let n = now();
    let created = n - Duration::hours(12);
    s.put(&Record::changed(pod("a", created), ChangeKind::Added, n - Duration::hours(5))).unwrap();
    s.put(&Record::changed(pod("a", created), ChangeKind::Updated, n - Duration::hours(3))).unwrap();
    s.put(&Record::changed(pod("b", created), ChangeKind::Added, n - Duration::hours(4))).unwrap();
    s.put(&Record::changed(pod("c", created), ChangeKind::Added, n - Duration::hours(10))).unwrap();

    let latest = s.get_all_since::<Pod>(n - Duration::hours(6)).unwrap();
    assert_eq!(names(&latest), vec!["a", "b"]);
    assert_eq!(latest[0].kind(), Some(ChangeKind::Updated));

    let latest = s.get_all_since::<Pod>(n - Duration::minutes(210)).unwrap();
    assert_eq!(names(&latest), vec!["a"]);

    let latest = s.get_all_since::<Pod>(n - Duration::hours(11)).unwrap();
    assert_eq!(names(&latest), vec!["a", "b", "c"]);
}

#[test]
fn relative_window_counts_by_creation_time() {
    let (_dir, s) = open();
    let n = now();
    for (name, h) in [("pod1", 8), ("pod2", 6), ("pod3", 2), ("pod4", 1)] {
        s.put(&Record::observed(pod(name, n - Duration::hours(h)))).unwrap();
    }
    let count = |d: Duration| s.get_all_since::<Pod>(n - d).unwrap().len();
    assert_eq!(count(Duration::hours(9)), 4);
    assert_eq!(count(Duration::hours(7)), 3);
    assert_eq!(count(Duration::minutes(200)), 2);
    assert_eq!(count(Duration::minutes(50)), 0);
}

#[test]
fn events_since_returns_full_log_newest_first() {
    let (_dir, s) = open();
    let n = now();
    let created = n - Duration::hours(2);
    // key order (a < b) differs from time order here
    s.put(&Record::changed(pod("b", created), ChangeKind::Added, n - Duration::minutes(50))).unwrap();
    s.put(&Record::changed(pod("a", created), ChangeKind::Added, n - Duration::minutes(40))).unwrap();
    s.put(&Record::changed(pod("b", created), ChangeKind::Deleted, n - Duration::minutes(30))).unwrap();
    s.put(&Record::changed(pod("a", created), ChangeKind::Updated, n - Duration::minutes(20))).unwrap();
    s.put(&Record::changed(pod("z", created), ChangeKind::Added, n - Duration::hours(3))).unwrap();

    let events = s.events_since::<Pod>(n - Duration::hours(1)).unwrap();
    let seq: Vec<_> = events.iter().map(|r| (r.name().unwrap(), r.kind().unwrap())).collect();
    assert_eq!(
        seq,
        vec![
            ("a", ChangeKind::Updated),
            ("b", ChangeKind::Deleted),
            ("a", ChangeKind::Added),
            ("b", ChangeKind::Added),
        ]
    );
}

#[test]
fn latest_by_name_reads_newest_key_only() {
    let (_dir, s) = open();
    let n = now();
    let created = n - Duration::hours(4);
    s.put(&Record::changed(pod("db", created), ChangeKind::Added, n - Duration::hours(3))).unwrap();
    s.put(&Record::changed(pod("db", created), ChangeKind::Updated, n - Duration::hours(2))).unwrap();
    s.put(&Record::changed(pod("db-replica", created), ChangeKind::Added, n - Duration::minutes(1))).unwrap();

    let latest = s.latest_by_name::<Pod>("db", n - Duration::hours(5)).unwrap().unwrap();
    assert_eq!(latest.kind(), Some(ChangeKind::Updated));
    assert!(s.latest_by_name::<Pod>("db", n - Duration::hours(1)).unwrap().is_none());
}

#[test]
fn sub_second_events_keep_their_order() {
    let (_dir, s) = open();
    let base = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 59).unwrap();
    for (i, kind) in [ChangeKind::Added, ChangeKind::Updated, ChangeKind::Deleted].into_iter().enumerate() {
        let at = base + Duration::nanoseconds(1 + 3 * i as i64);
        s.put(&Record::changed(pod("fast", base), kind, at)).unwrap();
    }
    let kinds: Vec<_> = s.get_by_name::<Pod>("fast").unwrap().iter().map(|r| r.kind().unwrap()).collect();
    assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Updated, ChangeKind::Deleted]);
}

#[test]
fn same_nanosecond_write_replaces_previous() {
    let (_dir, s) = open();
    let at = now() - Duration::minutes(5);
    s.put(&Record::changed(pod("dup", at), ChangeKind::Added, at)).unwrap();
    s.put(&Record::changed(pod("dup", at), ChangeKind::Updated, at)).unwrap();
    let hist = s.get_by_name::<Pod>("dup").unwrap();
    assert_eq!(hist.len(), 1);
    assert_eq!(hist[0].kind(), Some(ChangeKind::Updated));
}

#[test]
fn pods_and_nodes_are_separate_collections() {
    let (_dir, s) = open();
    let n = now();
    s.put(&Record::observed(pod("worker-1", n - Duration::hours(1)))).unwrap();
    let rec: NodeRecord = Record::changed(node("worker-1", n - Duration::days(3)), ChangeKind::Updated, n);
    s.put(&rec).unwrap();
    assert_eq!(s.get_by_name::<Pod>("worker-1").unwrap().len(), 1);
    let nodes = s.get_by_name::<Node>("worker-1").unwrap();
    assert_eq!(nodes, vec![rec]);
}

#[test]
fn put_rejects_unkeyable_records() {
    let (_dir, s) = open();
    let mut nameless = pod("x", now());
    nameless.metadata.name = None;
    assert!(matches!(s.put(&Record::observed(nameless)), Err(StoreError::InvalidName(_))));

    assert!(matches!(s.put(&Record::observed(pod("a#b", now()))), Err(StoreError::InvalidName(_))));

    let mut undated = pod("undated", now());
    undated.metadata.creation_timestamp = None;
    assert!(matches!(s.put(&Record::observed(undated)), Err(StoreError::MissingTimestamp(_))));
}

#[test]
fn malformed_key_aborts_scan() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.db");
    let s = HistoryStore::open(&path).unwrap();
    s.put(&Record::observed(pod("ok", now()))).unwrap();

    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute(
        "INSERT INTO history(bucket, key, value) VALUES ('pods', ?1, ?2)",
        (&b"broken-without-separator"[..], &b"{}"[..]),
    )
    .unwrap();

    let err = s.get_all_since::<Pod>(now() - Duration::days(1)).unwrap_err();
    assert!(matches!(err, StoreError::MalformedKey(_)), "{err}");
    // the prefix scan for another name never touches the bad key
    assert_eq!(s.get_by_name::<Pod>("ok").unwrap().len(), 1);
}

#[test]
fn snapshot_lookup_returns_newest_inside_window() {
    let (_dir, s) = open();
    let n = now();
    for h in [5, 3, 1] {
        let mut snap = ClusterSnapshot::empty("prod", n - Duration::hours(h));
        snap.pods.push(pod(&format!("p{h}"), n - Duration::hours(h)));
        s.put_snapshot(&snap).unwrap();
    }
    s.put_snapshot(&ClusterSnapshot::empty("staging", n - Duration::hours(2))).unwrap();

    let snap = s.latest_snapshot_since("prod", n - Duration::hours(4)).unwrap().unwrap();
    assert_eq!(snap.taken_at, n - Duration::hours(1));
    assert_eq!(snap.pods[0].metadata.name.as_deref(), Some("p1"));

    assert!(s.latest_snapshot_since("prod", n - Duration::minutes(30)).unwrap().is_none());
    assert!(s.latest_snapshot_since("dev", n - Duration::days(1)).unwrap().is_none());
    assert_eq!(s.clusters().unwrap(), vec!["prod".to_string(), "staging".to_string()]);
}

#[test]
fn readers_run_alongside_writer() {
    let (_dir, s) = open();
    let s = Arc::new(s);
    let base = now() - Duration::hours(1);
    let writer = {
        let s = Arc::clone(&s);
        std::thread::spawn(move || {
            for i in 0..50 {
                let at = base + Duration::seconds(i);
                s.put(&Record::changed(pod("busy", base), ChangeKind::Updated, at)).unwrap();
            }
        })
    };
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let s = Arc::clone(&s);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let hist = s.get_by_name::<Pod>("busy").unwrap();
                    assert!(hist.windows(2).all(|w| w[0].resolve_timestamp() < w[1].resolve_timestamp()));
                }
            })
        })
        .collect();
    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
    assert_eq!(s.get_by_name::<Pod>("busy").unwrap().len(), 50);
}

#[test]
fn history_survives_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("history.db");
    let s = HistoryStore::open(&path).unwrap();
    let at = now();
    s.put(&Record::observed(pod("keep", at))).unwrap();
    assert_eq!(s.get_by_name::<Pod>("keep").unwrap().len(), 1);
    s.close().unwrap();

    let s = HistoryStore::open(&path).unwrap();
    let hist = s.get_by_name::<Pod>("keep").unwrap();
    assert_eq!(hist.len(), 1);
    assert_eq!(hist[0].resolve_timestamp(), Some(at));
}
