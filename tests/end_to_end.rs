use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use serde_json::json;

use QuiverNotify::{
    ChangeNotification, GlobalNotifier, LogEngine, NotifierConfig, NotifierTarget, Row, SharedDatabase,
    StorageEngine, VersionToken,
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
    base.join(format!("qntest-e2e-{prefix}-{pid}-{t}-{id}"))
}

#[derive(Default)]
struct Collect {
    got: Mutex<Vec<ChangeNotification>>,
}

impl NotifierTarget for Collect {
    fn filter(&self, name: &str) -> bool {
        !name.starts_with("skip")
    }

    fn database_changed(&self, change: ChangeNotification) {
        self.got.lock().unwrap().push(change);
    }
}

impl Collect {
    fn len(&self) -> usize {
        self.got.lock().unwrap().len()
    }

    fn all(&self) -> Vec<ChangeNotification> {
        self.got.lock().unwrap().clone()
    }
}

fn wait_for(notifier: &GlobalNotifier, target: &Collect, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while target.len() < n && Instant::now() < deadline {
        notifier.process_pending(Some(Duration::from_millis(50)));
    }
}

fn row(v: &str) -> Row {
    let mut r = Row::new();
    r.insert("title".to_string(), json!(v));
    r
}

fn open(engine: &LogEngine, notifier: &GlobalNotifier, id: &str) -> Result<SharedDatabase> {
    let entry = notifier.watcher().find(id)?;
    let cfg = notifier.watcher().get_session_config(&entry.id, &entry.name)?;
    engine.open(&cfg)
}

#[test]
fn full_pipeline_on_disk() -> Result<()> {
    let root = unique_root("full");
    let cfg = NotifierConfig::default().with_root_dir(&root);
    let engine = Arc::new(LogEngine::new());
    let target = Arc::new(Collect::default());
    let notifier = GlobalNotifier::new(engine.clone(), cfg, target.clone())?;

    // database with data before start -> initial notification
    notifier.create_entry("pre", "pre")?;
    let pre = open(&engine, &notifier, "pre")?;
    pre.write(&mut |tx| {
        for t in ["a", "b", "c"] {
            tx.insert("class_Task", row(t))?;
        }
        Ok(())
    })?;

    notifier.start()?;
    assert_eq!(notifier.watched_ids(), vec!["pre".to_string()]);
    wait_for(&notifier, &target, 1);
    let got = target.all();
    assert_eq!(got.len(), 1);
    assert!(got[0].is_initial());
    assert_eq!(got[0].changes()["Task"].insertions, (0..3).collect::<BTreeSet<usize>>());
    assert!(got[0].old_snapshot()?.is_none());
    assert_eq!(got[0].new_snapshot()?.row_count(), 3);

    // discovered while running
    notifier.create_entry("late", "late")?;
    assert!(notifier.is_watched("late"));
    let late = open(&engine, &notifier, "late")?;
    late.write(&mut |tx| {
        tx.insert("class_Task", row("x"))?;
        Ok(())
    })?;
    wait_for(&notifier, &target, 2);
    let got = target.all();
    assert_eq!(got.len(), 2);
    let n = &got[1];
    assert_eq!(n.database_id(), "late");
    assert_eq!(n.old_version(), Some(VersionToken::new(0)));
    assert_eq!(n.new_version(), VersionToken::new(1));
    assert_eq!(n.old_snapshot()?.map(|s| s.row_count()), Some(0));
    assert_eq!(n.new_snapshot()?.row_count(), 1);

    // admission filter
    notifier.create_entry("s1", "skip-me")?;
    assert!(!notifier.is_watched("s1"));

    notifier.stop();
    fs::remove_dir_all(&root).ok();
    Ok(())
}

#[test]
fn pause_resume_through_notifier() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("pause"))
        .with_in_memory(true);
    let engine = Arc::new(LogEngine::new());
    let target = Arc::new(Collect::default());
    let notifier = GlobalNotifier::new(engine.clone(), cfg, target.clone())?;
    notifier.start()?;

    notifier.create_entry("db", "db")?;
    let db = open(&engine, &notifier, "db")?;

    notifier.pause();
    for t in ["one", "two", "three"] {
        db.write(&mut |tx| {
            tx.insert("class_Task", row(t))?;
            Ok(())
        })?;
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while notifier.pending_len() < 3 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(notifier.has_pending());
    assert_eq!(notifier.process_pending(Some(Duration::from_millis(10))), 0);
    assert_eq!(target.len(), 0);

    assert_eq!(notifier.resume(), 3);
    let versions: Vec<u64> = target.all().iter().map(|n| n.new_version().get()).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn stop_joins_and_silences() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("stop"))
        .with_in_memory(true);
    let engine = Arc::new(LogEngine::new());
    let target = Arc::new(Collect::default());
    let notifier = GlobalNotifier::new(engine.clone(), cfg, target.clone())?;
    notifier.start()?;
    notifier.create_entry("db", "db")?;
    let db = open(&engine, &notifier, "db")?;

    notifier.stop();
    notifier.stop();
    assert!(!db.has_commit_callback());
    assert!(notifier.watched_ids().is_empty());

    db.write(&mut |tx| {
        tx.insert("class_Task", row("after"))?;
        Ok(())
    })?;
    assert_eq!(notifier.drain(), 0);
    assert_eq!(target.len(), 0);
    assert!(notifier.start().is_err());
    Ok(())
}

#[test]
fn wake_hook_and_drop() -> Result<()> {
    let cfg = NotifierConfig::default()
        .with_root_dir(unique_root("hook"))
        .with_in_memory(true);
    let engine = Arc::new(LogEngine::new());
    let target = Arc::new(Collect::default());
    let wakes = Arc::new(AtomicUsize::new(0));
    {
        let notifier = GlobalNotifier::new(engine.clone(), cfg, target.clone())?;
        let w = wakes.clone();
        notifier.set_wake_hook(Some(Arc::new(move || {
            w.fetch_add(1, Ordering::SeqCst);
        })));
        notifier.start()?;
        notifier.create_entry("db", "db")?;
        let db = open(&engine, &notifier, "db")?;
        db.write(&mut |tx| {
            tx.insert("class_Task", row("hello"))?;
            Ok(())
        })?;
        wait_for(&notifier, &target, 1);
        assert_eq!(target.len(), 1);
        assert!(wakes.load(Ordering::SeqCst) >= 1);
        // dropped here: stop() joins the worker
    }
    assert_eq!(target.len(), 1);
    Ok(())
}

/// Коммиты другого процесса подхватываются refresh-потоком.
#[test]
fn refresh_thread_picks_up_foreign_commits() -> Result<()> {
    let root = unique_root("refresh");
    let cfg = NotifierConfig::default()
        .with_root_dir(&root)
        .with_refresh_interval_ms(20);

    // "other process": its own engine instance on the same files
    let other = LogEngine::new();
    let other_watcher = QuiverNotify::RegistryWatcher::open(&other, &cfg)?;
    other_watcher.create_entry("ext", "ext")?;

    let engine = Arc::new(LogEngine::new());
    let target = Arc::new(Collect::default());
    let notifier = GlobalNotifier::new(engine, cfg, target.clone())?;
    notifier.start()?;
    assert!(notifier.is_watched("ext"));

    let db_cfg = other_watcher.get_session_config("ext", "ext")?;
    let db = other.open(&db_cfg)?;
    db.write(&mut |tx| {
        tx.insert("class_Task", row("remote"))?;
        Ok(())
    })?;

    // a catalog entry added remotely is discovered too
    other_watcher.create_entry("ext2", "ext2")?;

    wait_for(&notifier, &target, 1);
    let got = target.all();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].database_id(), "ext");
    assert_eq!(got[0].new_version(), VersionToken::new(1));

    let deadline = Instant::now() + Duration::from_secs(5);
    while !notifier.is_watched("ext2") && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(notifier.is_watched("ext2"));

    notifier.stop();
    fs::remove_dir_all(&root).ok();
    Ok(())
}
