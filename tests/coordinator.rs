use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde_json::json;

use QuiverNotify::coordinator::AdmissionFilter;
use QuiverNotify::{
    ChangeNotification, Coordinator, DeliveryDispatcher, DiffWorker, LogEngine, NotifierConfig, RegisterOutcome,
    RegistryWatcher, Row, SharedDatabase, StorageEngine, VersionToken, WorkQueue,
};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("qntest-coord-{prefix}-{pid}-{t}-{id}"))
}

struct Fixture {
    engine: Arc<dyn StorageEngine>,
    watcher: Arc<RegistryWatcher>,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<DeliveryDispatcher>,
    delivered: Arc<Mutex<Vec<ChangeNotification>>>,
    coordinator: Coordinator,
}

impl Fixture {
    fn new(cfg: &NotifierConfig, filter: AdmissionFilter) -> Result<Self> {
        let engine: Arc<dyn StorageEngine> = Arc::new(LogEngine::new());
        let watcher = Arc::new(RegistryWatcher::open(engine.as_ref(), cfg)?);
        let queue = Arc::new(WorkQueue::new());
        let delivered: Arc<Mutex<Vec<ChangeNotification>>> = Arc::new(Mutex::new(Vec::new()));
        let d = delivered.clone();
        let dispatcher = Arc::new(DeliveryDispatcher::new(Arc::new(move |c: ChangeNotification| {
            d.lock().unwrap().push(c);
        })));
        let coordinator = Coordinator::new(
            engine.clone(),
            watcher.clone(),
            filter,
            queue.clone(),
            dispatcher.clone(),
        );
        Ok(Self {
            engine,
            watcher,
            queue,
            dispatcher,
            delivered,
            coordinator,
        })
    }

    fn open(&self, id: &str) -> Result<SharedDatabase> {
        let cfg = self.watcher.get_session_config(id, id)?;
        self.engine.open(&cfg)
    }
}

fn accept_all() -> AdmissionFilter {
    Arc::new(|_: &str| true)
}

fn person(name: &str) -> Row {
    let mut r = Row::new();
    r.insert("name".to_string(), json!(name));
    r
}

#[test]
fn register_is_idempotent() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("idem"))
        .with_in_memory(true);
    let fx = Fixture::new(&cfg, accept_all())?;

    assert_eq!(fx.coordinator.register("a", "a")?, RegisterOutcome::Watched { seeded: false });
    assert_eq!(fx.coordinator.register("a", "a")?, RegisterOutcome::AlreadyWatched);
    assert_eq!(fx.coordinator.register("a", "other-name")?, RegisterOutcome::AlreadyWatched);
    assert_eq!(fx.coordinator.watched_ids(), vec!["a".to_string()]);

    let db = fx.open("a")?;
    assert!(db.has_commit_callback());

    // one subscription: one commit -> exactly one work item
    db.write(&mut |tx| {
        tx.insert("class_Person", person("ann"))?;
        Ok(())
    })?;
    assert_eq!(fx.queue.len(), 1);
    assert!(fx.dispatcher.is_empty(), "empty database must not be seeded");
    Ok(())
}

#[test]
fn admission_filter_rejects_by_name() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("filter"))
        .with_in_memory(true);
    let filter: AdmissionFilter = Arc::new(|name: &str| name.starts_with("keep/"));
    let fx = Fixture::new(&cfg, filter)?;

    assert_eq!(fx.coordinator.register("x", "drop/x")?, RegisterOutcome::Rejected);
    assert!(!fx.coordinator.is_watched("x"));

    // a rejected database may be reconsidered under another name
    assert_eq!(
        fx.coordinator.register("x", "keep/x")?,
        RegisterOutcome::Watched { seeded: false }
    );
    assert!(fx.coordinator.is_watched("x"));
    Ok(())
}

/// База с 3 строками на момент регистрации -> одно Initial-уведомление.
#[test]
fn non_empty_database_is_seeded_once() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("seed"))
        .with_in_memory(true);
    let fx = Fixture::new(&cfg, accept_all())?;

    let db = fx.open("people")?;
    let v = db.write(&mut |tx| {
        tx.insert("class_Person", person("ann"))?;
        tx.insert("class_Person", person("bob"))?;
        tx.insert("class_Person", person("cid"))?;
        tx.insert("pk", person("internal"))?;
        tx.add_table("class_Empty")?;
        Ok(())
    })?;
    assert_eq!(v, VersionToken::new(1));

    assert_eq!(
        fx.coordinator.register("people", "people")?,
        RegisterOutcome::Watched { seeded: true }
    );
    assert_eq!(fx.queue.len(), 0, "seed bypasses the diff worker");
    assert!(fx.dispatcher.has_pending());
    assert!(fx.dispatcher.signal().is_pending());

    assert_eq!(fx.dispatcher.drain(), 1);
    let got = fx.delivered.lock().unwrap().clone();
    assert_eq!(got.len(), 1);
    let n = &got[0];
    assert!(n.is_initial());
    assert_eq!(n.old_version(), None);
    assert_eq!(n.new_version(), VersionToken::new(1));
    assert_eq!(n.database_id(), "people");
    assert_eq!(n.changes().len(), 1, "internal and empty tables are not reported");
    let cs = &n.changes()["Person"];
    assert_eq!(cs.insertions, (0..3).collect::<BTreeSet<usize>>());
    assert!(cs.deletions.is_empty() && cs.modifications.is_empty());
    assert!(n.old_snapshot()?.is_none());
    assert_eq!(n.new_snapshot()?.row_count(), 4);

    // commits before registration are covered by the seed; later ones are queued
    db.write(&mut |tx| {
        tx.insert("class_Person", person("dan"))?;
        Ok(())
    })?;
    assert_eq!(fx.queue.len(), 1);
    Ok(())
}

#[test]
fn open_failure_drops_only_that_database() -> Result<()> {
    let root = unique_root("bad");
    let cfg = NotifierConfig::default().with_root_dir(&root);
    let fx = Fixture::new(&cfg, accept_all())?;

    fs::create_dir_all(cfg.databases_dir())?;
    fs::write(cfg.databases_dir().join("broken.qlog"), b"this is not a commit log at all")?;

    assert!(fx.coordinator.register("broken", "broken").is_err());
    assert!(!fx.coordinator.is_watched("broken"));
    // not left reserved: a retry fails again instead of reporting AlreadyWatched
    assert!(fx.coordinator.register("broken", "broken").is_err());

    assert_eq!(
        fx.coordinator.register("fine", "fine")?,
        RegisterOutcome::Watched { seeded: false }
    );
    assert_eq!(fx.coordinator.watched_ids(), vec!["fine".to_string()]);

    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn shutdown_removes_subscriptions() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("shutdown"))
        .with_in_memory(true);
    let fx = Fixture::new(&cfg, accept_all())?;

    fx.coordinator.register("a", "a")?;
    fx.coordinator.register("b", "b")?;
    assert_eq!(fx.coordinator.watched_ids(), vec!["a".to_string(), "b".to_string()]);

    fx.coordinator.shutdown();
    assert!(fx.coordinator.watched_ids().is_empty());

    let a = fx.open("a")?;
    assert!(!a.has_commit_callback());
    a.write(&mut |tx| {
        tx.insert("class_Person", person("late"))?;
        Ok(())
    })?;
    assert_eq!(fx.queue.len(), 0);
    Ok(())
}

#[test]
fn registering_after_shutdown_installs_nothing() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("late"))
        .with_in_memory(true);
    let fx = Fixture::new(&cfg, accept_all())?;

    fx.coordinator.shutdown();
    assert!(fx.coordinator.register("c", "c").is_err());
    assert!(!fx.coordinator.is_watched("c"));
    assert!(fx.coordinator.watched_ids().is_empty());
    assert!(!fx.open("c")?.has_commit_callback());
    Ok(())
}

/// Регистрация идёт, пока другой поток коммитит в ту же базу: первым приходит
/// Initial, дальше версии подряд, без пропусков и повторов.
#[test]
fn registration_during_commits_delivers_initial_first_without_gaps() -> Result<()> {
    const TABLES: usize = 40;
    const ROWS: usize = 250;
    const WRITES: usize = 150;

    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("race"))
        .with_in_memory(true);
    let fx = Fixture::new(&cfg, accept_all())?;
    let mut worker = DiffWorker::spawn("qn-test-race", fx.queue.clone(), fx.dispatcher.clone(), false)?;

    for round in 0..4 {
        let id = format!("big{}", round);
        let db = fx.open(&id)?;
        db.write(&mut |tx| {
            for t in 0..TABLES {
                let table = format!("class_Bulk{}", t);
                for r in 0..ROWS {
                    tx.insert(&table, person(&format!("{}-{}", t, r)))?;
                }
            }
            Ok(())
        })?;

        let started = Arc::new(AtomicBool::new(false));
        let writer = {
            let db = db.clone();
            let started = started.clone();
            thread::spawn(move || -> Result<VersionToken> {
                let mut last = VersionToken::new(0);
                for n in 0..WRITES {
                    last = db.write(&mut |tx| {
                        tx.insert("class_Small", person(&n.to_string()))?;
                        Ok(())
                    })?;
                    started.store(true, Ordering::Release);
                }
                Ok(last)
            })
        };
        while !started.load(Ordering::Acquire) {
            thread::yield_now();
        }
        assert!(matches!(
            fx.coordinator.register(&id, &id)?,
            RegisterOutcome::Watched { seeded: true }
        ));
        let last = writer.join().expect("writer panicked")?;

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            fx.dispatcher.drain();
            let reached = fx
                .delivered
                .lock()
                .unwrap()
                .iter()
                .any(|n| n.database_id() == id && n.new_version() == last);
            if reached || Instant::now() > deadline {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let got: Vec<ChangeNotification> = fx
            .delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.database_id() == id)
            .cloned()
            .collect();
        assert!(!got.is_empty(), "round {}: nothing delivered", round);
        assert!(got[0].is_initial(), "round {}: first was {:?} -> {}", round, got[0].old_version(), got[0].new_version());
        let mut prev = got[0].new_version();
        for n in &got[1..] {
            assert!(!n.is_initial(), "round {}: second Initial", round);
            assert_eq!(n.old_version(), Some(prev), "round {}", round);
            assert_eq!(n.new_version(), prev.next(), "round {}", round);
            prev = n.new_version();
        }
        assert_eq!(prev, last, "round {}", round);
    }

    fx.queue.shutdown();
    worker.join();
    Ok(())
}
