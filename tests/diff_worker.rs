use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;

use QuiverNotify::{
    compute_notification, ChangeNotification, DatabaseConfig, DatabaseHandle, DeliveryDispatcher, DiffWorker,
    LogEngine, Row, RowKey, StorageEngine, VersionToken, WorkItem, WorkQueue,
};

fn row(v: i64) -> Row {
    let mut r = Row::new();
    r.insert("v".to_string(), json!(v));
    r
}

fn set<const N: usize>(xs: [usize; N]) -> BTreeSet<usize> {
    xs.into_iter().collect()
}

struct Pipeline {
    queue: Arc<WorkQueue>,
    dispatcher: Arc<DeliveryDispatcher>,
    delivered: Arc<Mutex<Vec<ChangeNotification>>>,
    worker: DiffWorker,
}

impl Pipeline {
    fn start(report_empty: bool) -> Result<Self> {
        let queue = Arc::new(WorkQueue::new());
        let delivered: Arc<Mutex<Vec<ChangeNotification>>> = Arc::new(Mutex::new(Vec::new()));
        let d = delivered.clone();
        let dispatcher = Arc::new(DeliveryDispatcher::new(Arc::new(move |c: ChangeNotification| {
            d.lock().unwrap().push(c);
        })));
        let worker = DiffWorker::spawn("qn-test-worker", queue.clone(), dispatcher.clone(), report_empty)?;
        Ok(Self {
            queue,
            dispatcher,
            delivered,
            worker,
        })
    }

    /// Drain on this thread until `n` notifications arrived (or 5s passed).
    fn wait_for(&self, n: usize) -> Vec<ChangeNotification> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.delivered.lock().unwrap().len() < n && Instant::now() < deadline {
            self.dispatcher.signal().wait(Some(Duration::from_millis(50)));
            self.dispatcher.drain();
        }
        self.delivered.lock().unwrap().clone()
    }

    fn stop(mut self) {
        self.queue.shutdown();
        self.worker.join();
    }
}

/// Подписка на коммиты: old -> pinned snapshot -> WorkItem.
fn subscribe(engine: &LogEngine, name: &str, queue: Arc<WorkQueue>) -> Result<DatabaseHandle> {
    let session = engine.open(&DatabaseConfig::in_memory(name))?;
    let handle = DatabaseHandle::new(name, name, session.clone());
    let h = handle.clone();
    session.set_commit_callback(Some(Arc::new(move |old: VersionToken, new: VersionToken| {
        let pinned = h.session().reopen().and_then(|s| s.read_at(old)).unwrap();
        queue.push(WorkItem::incremental(h.clone(), pinned, new));
    })));
    Ok(handle)
}

/// Пустая база A, коммит добавляет 2 строки в T -> {old: v0, new: v1, T: insertions [0,1]}.
#[test]
fn two_inserts_into_empty_database() -> Result<()> {
    let engine = LogEngine::new();
    let p = Pipeline::start(false)?;
    let a = subscribe(&engine, "A", p.queue.clone())?;

    a.session().write(&mut |tx| {
        tx.insert("class_T", row(1))?;
        tx.insert("class_T", row(2))?;
        Ok(())
    })?;

    let got = p.wait_for(1);
    assert_eq!(got.len(), 1);
    let n = &got[0];
    assert!(!n.is_initial());
    assert_eq!(n.old_version(), Some(VersionToken::new(0)));
    assert_eq!(n.new_version(), VersionToken::new(1));
    assert_eq!(n.changes().keys().collect::<Vec<_>>(), vec!["T"]);
    let cs = &n.changes()["T"];
    assert_eq!(cs.insertions, set([0, 1]));
    assert!(cs.deletions.is_empty());
    assert!(cs.modifications.is_empty());

    assert_eq!(n.old_snapshot()?.map(|s| s.row_count()), Some(0));
    assert_eq!(n.new_snapshot()?.row_count(), 2);
    p.stop();
    Ok(())
}

#[test]
fn internal_only_commit_is_dropped_and_order_is_kept() -> Result<()> {
    let engine = LogEngine::new();
    let p = Pipeline::start(false)?;
    let a = subscribe(&engine, "A2", p.queue.clone())?;
    let db = a.session();

    db.write(&mut |tx| {
        tx.insert("class_T", row(1))?;
        tx.insert("class_T", row(2))?;
        tx.insert("class_T", row(3))?;
        Ok(())
    })?; // v1
    db.write(&mut |tx| {
        tx.insert("metadata", row(0))?;
        Ok(())
    })?; // v2: internal only
    db.write(&mut |tx| tx.set("class_T", RowKey(1), "v", json!(20)))?; // v3
    db.write(&mut |tx| tx.delete("class_T", RowKey(0)))?; // v4

    let got = p.wait_for(3);
    assert_eq!(got.len(), 3);
    let versions: Vec<(Option<u64>, u64)> = got
        .iter()
        .map(|n| (n.old_version().map(|v| v.get()), n.new_version().get()))
        .collect();
    assert_eq!(versions, vec![(Some(0), 1), (Some(2), 3), (Some(3), 4)]);

    let modified = &got[1].changes()["T"];
    assert_eq!(modified.modifications, set([1]));
    assert_eq!(modified.columns["v"], set([1]));
    assert!(modified.insertions.is_empty());

    let deleted = &got[2].changes()["T"];
    assert_eq!(deleted.deletions, set([0]));
    assert!(deleted.insertions.is_empty());

    // nothing else shows up later
    std::thread::sleep(Duration::from_millis(50));
    p.dispatcher.drain();
    assert_eq!(p.delivered.lock().unwrap().len(), 3);
    p.stop();
    Ok(())
}

#[test]
fn empty_diff_rules() -> Result<()> {
    let engine = LogEngine::new();
    let db = engine.open(&DatabaseConfig::in_memory("rules"))?;
    let handle = DatabaseHandle::new("rules", "rules", db.clone());

    // empty database: schema-only commit is still reported
    let v1 = db.write(&mut |tx| tx.add_table("class_T"))?;
    let item = WorkItem::incremental(handle.clone(), db.read_at(VersionToken::new(0))?, v1);
    let n = compute_notification(&item, false)?.expect("empty database reports empty diffs");
    assert!(n.changes().is_empty());

    // non-empty database: internal-only commit is dropped unless configured otherwise
    let v2 = db.write(&mut |tx| {
        tx.insert("class_T", row(1))?;
        Ok(())
    })?;
    let v3 = db.write(&mut |tx| {
        tx.insert("internal", row(9))?;
        Ok(())
    })?;
    let item = WorkItem::incremental(handle.clone(), db.read_at(v2)?, v3);
    assert!(compute_notification(&item, false)?.is_none());
    let n = compute_notification(&item, true)?.expect("reported when report_empty is on");
    assert_eq!(n.old_version(), Some(v2));
    assert_eq!(n.new_version(), v3);
    assert!(n.changes().is_empty());
    Ok(())
}

#[test]
fn failed_item_does_not_stop_the_worker() -> Result<()> {
    let engine = LogEngine::new();
    let p = Pipeline::start(false)?;
    let db = engine.open(&DatabaseConfig::in_memory("poison"))?;
    let handle = DatabaseHandle::new("poison", "poison", db.clone());

    // target beyond the latest version: advance fails, item is dropped
    p.queue.push(WorkItem::incremental(
        handle.clone(),
        db.read_at(VersionToken::new(0))?,
        VersionToken::new(99),
    ));

    let v1 = db.write(&mut |tx| {
        tx.insert("class_T", row(1))?;
        Ok(())
    })?;
    p.queue.push(WorkItem::incremental(handle, db.read_at(VersionToken::new(0))?, v1));

    let got = p.wait_for(1);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].new_version(), v1);
    p.stop();
    Ok(())
}

#[test]
fn shutdown_drops_queued_items() -> Result<()> {
    let engine = LogEngine::new();
    let db = engine.open(&DatabaseConfig::in_memory("queued"))?;
    let handle = DatabaseHandle::new("queued", "queued", db.clone());
    let v1 = db.write(&mut |tx| {
        tx.insert("class_T", row(1))?;
        Ok(())
    })?;
    let v2 = db.write(&mut |tx| {
        tx.insert("class_T", row(2))?;
        Ok(())
    })?;

    let queue = Arc::new(WorkQueue::new());
    assert!(queue.push(WorkItem::incremental(handle.clone(), db.read_at(VersionToken::new(0))?, v1)));
    assert!(queue.push(WorkItem::incremental(handle.clone(), db.read_at(v1)?, v2)));
    assert_eq!(queue.len(), 2);

    assert_eq!(queue.shutdown(), 2);
    assert!(queue.is_shutdown());
    assert!(!queue.push(WorkItem::incremental(handle, db.read_at(v1)?, v2)));

    let delivered: Arc<Mutex<Vec<ChangeNotification>>> = Arc::new(Mutex::new(Vec::new()));
    let d = delivered.clone();
    let dispatcher = Arc::new(DeliveryDispatcher::new(Arc::new(move |c: ChangeNotification| {
        d.lock().unwrap().push(c);
    })));

    let started = Instant::now();
    let mut worker = DiffWorker::spawn("qn-test-shutdown", queue.clone(), dispatcher.clone(), false)?;
    worker.join();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(dispatcher.is_empty());
    dispatcher.drain();
    assert!(delivered.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn idle_worker_exits_on_shutdown() -> Result<()> {
    let p = Pipeline::start(false)?;
    std::thread::sleep(Duration::from_millis(20));
    let started = Instant::now();
    p.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}
