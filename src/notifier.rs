//! GlobalNotifier: registry watcher + coordinator + diff worker + delivery.
//!
//! Usage:
//!   let notifier = GlobalNotifier::new(engine, config, target)?;
//!   notifier.start()?;
//!   loop { notifier.process_pending(Some(timeout)); }   // consumer thread
//!   notifier.stop();                                     // also on drop
//!
//! The target is called only from the thread that runs process_pending()/drain()/resume().

use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::catalog::{CatalogEntry, DiscoveryCallback, RegistryWatcher};
use crate::config::NotifierConfig;
use crate::coordinator::{AdmissionFilter, Coordinator, RegisterOutcome};
use crate::dispatch::{DeliverFn, DeliveryDispatcher};
use crate::engine::StorageEngine;
use crate::notification::ChangeNotification;
use crate::signal::{EventLoopSignal, WakeHook};
use crate::version::VersionToken;
use crate::worker::{DiffWorker, WorkQueue};

/// Consumer of the aggregated change feed.
pub trait NotifierTarget: Send + Sync {
    /// Should the database with this name be watched? Default: all.
    fn filter(&self, _name: &str) -> bool {
        true
    }

    fn database_changed(&self, change: ChangeNotification);
}

struct RefreshThread {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

pub struct GlobalNotifier {
    config: NotifierConfig,
    engine: Arc<dyn StorageEngine>,
    watcher: Arc<RegistryWatcher>,
    coordinator: Arc<Coordinator>,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<DeliveryDispatcher>,
    worker: Mutex<Option<DiffWorker>>,
    refresher: Mutex<Option<RefreshThread>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl GlobalNotifier {
    /// Open the catalog and wire the pipeline. Nothing runs until start().
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        config: NotifierConfig,
        target: Arc<dyn NotifierTarget>,
    ) -> Result<Self> {
        let watcher = Arc::new(RegistryWatcher::open(engine.as_ref(), &config)?);

        let t = target.clone();
        let deliver: DeliverFn = Arc::new(move |change: ChangeNotification| t.database_changed(change));
        let dispatcher = Arc::new(DeliveryDispatcher::with_signal(
            deliver,
            Arc::new(EventLoopSignal::new()),
        ));

        let filter: AdmissionFilter = Arc::new(move |name: &str| target.filter(name));
        let queue = Arc::new(WorkQueue::new());
        let coordinator = Arc::new(Coordinator::new(
            engine.clone(),
            watcher.clone(),
            filter,
            queue.clone(),
            dispatcher.clone(),
        ));

        Ok(Self {
            config,
            engine,
            watcher,
            coordinator,
            queue,
            dispatcher,
            worker: Mutex::new(None),
            refresher: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Spawn the diff worker, then start discovery (initial load registers every
    /// catalog entry before this returns).
    pub fn start(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            anyhow::bail!("notifier already stopped");
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("starting notifier: {}", self.config);

        let worker = DiffWorker::spawn(
            &self.config.worker_thread_name,
            self.queue.clone(),
            self.dispatcher.clone(),
            self.config.report_empty_diffs,
        )?;
        *self.worker.lock().unwrap() = Some(worker);

        let weak: Weak<Coordinator> = Arc::downgrade(&self.coordinator);
        let on_discovered: DiscoveryCallback = Arc::new(move |id: &str, name: &str| {
            let Some(coordinator) = weak.upgrade() else { return };
            if let Err(e) = coordinator.register(id, name) {
                error!("database '{}' dropped: {:#}", id, e);
            }
        });
        self.watcher.start(on_discovered)?;

        if self.config.refresh_interval_ms > 0 {
            *self.refresher.lock().unwrap() = Some(self.spawn_refresher()?);
        }
        Ok(())
    }

    fn spawn_refresher(&self) -> Result<RefreshThread> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let s = stop.clone();
        let engine = self.engine.clone();
        let interval = Duration::from_millis(self.config.refresh_interval_ms);
        let handle = thread::Builder::new()
            .name("qn-refresh".to_string())
            .spawn(move || {
                let (lock, cv) = &*s;
                let mut stopped = lock.lock().unwrap();
                while !*stopped {
                    stopped = cv.wait_timeout(stopped, interval).unwrap().0;
                    if *stopped {
                        break;
                    }
                    drop(stopped);
                    if let Err(e) = engine.refresh() {
                        warn!("refresh failed: {:#}", e);
                    }
                    stopped = lock.lock().unwrap();
                }
            })
            .context("spawn refresh thread")?;
        Ok(RefreshThread { stop, handle })
    }

    /// Tear down. Joins every background thread; no target call happens after
    /// this returns. Undelivered notifications and queued work are discarded.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // refresh thread first: it may still deliver catalog commits
        if let Some(r) = self.refresher.lock().unwrap().take() {
            {
                let (lock, cv) = &*r.stop;
                *lock.lock().unwrap() = true;
                cv.notify_all();
            }
            if r.handle.join().is_err() {
                warn!("refresh thread panicked");
            }
        }

        self.watcher.stop();
        self.coordinator.shutdown();

        let dropped = self.queue.shutdown();
        if let Some(mut w) = self.worker.lock().unwrap().take() {
            w.join();
        }
        let discarded = self.dispatcher.close();
        info!(
            "notifier stopped ({} work item(s) dropped, {} notification(s) discarded)",
            dropped, discarded
        );
    }

    pub fn config(&self) -> &NotifierConfig {
        &self.config
    }

    pub fn watcher(&self) -> &RegistryWatcher {
        &self.watcher
    }

    /// Register a database directly (bypassing catalog discovery).
    pub fn register(&self, id: &str, name: &str) -> Result<RegisterOutcome> {
        self.coordinator.register(id, name)
    }

    /// Append a catalog entry. A running notifier discovers it on commit.
    pub fn create_entry(&self, id: &str, name: &str) -> Result<VersionToken> {
        self.watcher.create_entry(id, name)
    }

    pub fn entries(&self) -> Result<Vec<CatalogEntry>> {
        self.watcher.entries()
    }

    pub fn watched_ids(&self) -> Vec<String> {
        self.coordinator.watched_ids()
    }

    pub fn is_watched(&self, id: &str) -> bool {
        self.coordinator.is_watched(id)
    }

    pub fn pause(&self) {
        self.dispatcher.pause();
    }

    /// Unpause and deliver everything queued, on the calling thread.
    pub fn resume(&self) -> usize {
        self.dispatcher.resume()
    }

    pub fn is_paused(&self) -> bool {
        self.dispatcher.is_paused()
    }

    pub fn has_pending(&self) -> bool {
        self.dispatcher.has_pending()
    }

    /// Notifications waiting for delivery.
    pub fn pending_len(&self) -> usize {
        self.dispatcher.len()
    }

    /// Deliver queued notifications now (no waiting).
    pub fn drain(&self) -> usize {
        self.dispatcher.drain()
    }

    /// One consumer cycle: wait for a wake (or the timeout), then drain.
    pub fn process_pending(&self, timeout: Option<Duration>) -> usize {
        self.dispatcher.signal().wait(timeout);
        self.dispatcher.drain()
    }

    /// Hook invoked on the first wake of each batch, for foreign event loops.
    pub fn set_wake_hook(&self, hook: Option<WakeHook>) {
        self.dispatcher.signal().set_hook(hook);
    }
}

impl Drop for GlobalNotifier {
    fn drop(&mut self) {
        self.stop();
    }
}
