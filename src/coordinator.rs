//! Coordinator: the set of watched databases and their commit subscriptions.
//!
//! register(id, name):
//! 1) admission filter on `name`; duplicates (pending or active) are a no-op;
//! 2) reserve `id` (Pending), open a shared session, mark Active;
//! 3) under the handle's seed lock: install the commit callback, read current
//!    contents, remember the seed version. Non-empty contents become an Initial
//!    notification pushed straight to the delivery queue before the lock is
//!    released, so no incremental notification can overtake it;
//! 4) commit callback: ignore events already covered by the seed, pin a snapshot
//!    at the old version on a private session, enqueue a WorkItem.
//!
//! A failed registration removes the id again; nothing else is affected.
//! After shutdown() every registration fails and no callback is installed.

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::catalog::RegistryWatcher;
use crate::changeset::TableChangeSet;
use crate::dispatch::DeliveryDispatcher;
use crate::engine::{object_type_for_table_name, CommitCallback, StorageEngine};
use crate::metrics::{record_database_failed, record_database_registered, record_database_rejected};
use crate::notification::{ChangeMap, ChangeNotification, DatabaseHandle};
use crate::version::VersionToken;
use crate::worker::{WorkItem, WorkQueue};

/// Admission filter: should the database with this name be watched?
pub type AdmissionFilter = Arc<dyn Fn(&str) -> bool + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegisterOutcome {
    AlreadyWatched,
    Rejected,
    Watched { seeded: bool },
}

enum WatchSlot {
    Pending,
    Active(DatabaseHandle),
}

struct CoordinatorInner {
    engine: Arc<dyn StorageEngine>,
    watcher: Arc<RegistryWatcher>,
    filter: AdmissionFilter,
    watched: Mutex<HashMap<String, WatchSlot>>,
    // written and read under the `watched` lock
    shut_down: AtomicBool,
    queue: Arc<WorkQueue>,
    dispatcher: Arc<DeliveryDispatcher>,
}

pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl Coordinator {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        watcher: Arc<RegistryWatcher>,
        filter: AdmissionFilter,
        queue: Arc<WorkQueue>,
        dispatcher: Arc<DeliveryDispatcher>,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                watcher,
                filter,
                watched: Mutex::new(HashMap::new()),
                shut_down: AtomicBool::new(false),
                queue,
                dispatcher,
            }),
        }
    }

    /// Start watching database `id`. Idempotent.
    pub fn register(&self, id: &str, name: &str) -> Result<RegisterOutcome> {
        let inner = &self.inner;
        if inner.watched.lock().unwrap().contains_key(id) {
            return Ok(RegisterOutcome::AlreadyWatched);
        }
        if !(inner.filter)(name) {
            debug!("database '{}' ({}) rejected by filter", id, name);
            record_database_rejected();
            return Ok(RegisterOutcome::Rejected);
        }

        {
            let mut watched = inner.watched.lock().unwrap();
            if inner.shut_down.load(Ordering::Acquire) {
                bail!("database '{}': coordinator is shut down", id);
            }
            if watched.contains_key(id) {
                return Ok(RegisterOutcome::AlreadyWatched);
            }
            watched.insert(id.to_string(), WatchSlot::Pending);
        }

        match self.activate(id, name) {
            Ok(seeded) => {
                record_database_registered();
                info!("watching database '{}' ({}), seeded={}", id, name, seeded);
                Ok(RegisterOutcome::Watched { seeded })
            }
            Err(e) => {
                if let Some(WatchSlot::Active(h)) = inner.watched.lock().unwrap().remove(id) {
                    h.session().set_commit_callback(None);
                }
                record_database_failed();
                Err(e)
            }
        }
    }

    fn activate(&self, id: &str, name: &str) -> Result<bool> {
        let inner = &self.inner;
        let cfg = inner.watcher.get_session_config(id, name)?;
        let session = inner
            .engine
            .open(&cfg)
            .with_context(|| format!("open database '{}' at {}", id, cfg.path.display()))?;
        let handle = DatabaseHandle::new(id, name, session);

        let mut seed = handle.seed_lock();
        {
            let mut watched = inner.watched.lock().unwrap();
            if inner.shut_down.load(Ordering::Acquire) {
                bail!("database '{}': coordinator is shut down", id);
            }
            watched.insert(id.to_string(), WatchSlot::Active(handle.clone()));
            handle
                .session()
                .set_commit_callback(Some(commit_callback(Arc::downgrade(inner), id.to_string())));
        }

        let current = handle
            .session()
            .read_current()
            .with_context(|| format!("read initial contents of '{}'", id))?;
        *seed = Some(current.version());

        if current.is_empty() {
            return Ok(false);
        }
        let mut changes = ChangeMap::new();
        for table in current.table_names() {
            let Some(object_type) = object_type_for_table_name(table) else {
                continue;
            };
            if let Some(t) = current.table(table).filter(|t| !t.is_empty()) {
                changes.insert(object_type.to_string(), TableChangeSet::all_inserted(t));
            }
        }
        // still under the seed lock: commits after the seed wait in on_commit
        inner
            .dispatcher
            .push_and_notify(ChangeNotification::initial(handle.clone(), current.version(), changes));
        drop(seed);
        Ok(true)
    }

    pub fn is_watched(&self, id: &str) -> bool {
        matches!(
            self.inner.watched.lock().unwrap().get(id),
            Some(WatchSlot::Active(_))
        )
    }

    /// Ids of active databases, sorted.
    pub fn watched_ids(&self) -> Vec<String> {
        let watched = self.inner.watched.lock().unwrap();
        let mut ids: Vec<String> = watched
            .iter()
            .filter(|(_, slot)| matches!(slot, WatchSlot::Active(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn handle(&self, id: &str) -> Option<DatabaseHandle> {
        match self.inner.watched.lock().unwrap().get(id) {
            Some(WatchSlot::Active(h)) => Some(h.clone()),
            _ => None,
        }
    }

    /// Forget every database and remove their subscriptions.
    pub fn shutdown(&self) {
        let drained: Vec<(String, WatchSlot)> = {
            let mut watched = self.inner.watched.lock().unwrap();
            self.inner.shut_down.store(true, Ordering::Release);
            watched.drain().collect()
        };
        for (_, slot) in &drained {
            if let WatchSlot::Active(h) = slot {
                h.session().set_commit_callback(None);
            }
        }
        if !drained.is_empty() {
            debug!("coordinator stopped, {} database(s) unwatched", drained.len());
        }
    }
}

fn commit_callback(inner: Weak<CoordinatorInner>, id: String) -> CommitCallback {
    Arc::new(move |old: VersionToken, new: VersionToken| {
        let Some(inner) = inner.upgrade() else { return };
        inner.on_commit(&id, old, new);
    })
}

impl CoordinatorInner {
    fn on_commit(&self, id: &str, old: VersionToken, new: VersionToken) {
        let handle = match self.watched.lock().unwrap().get(id) {
            Some(WatchSlot::Active(h)) => h.clone(),
            _ => return,
        };
        // blocks while registration is still reading the initial contents
        if let Some(seeded) = handle.seeded_at() {
            if new <= seeded {
                return;
            }
        }
        let pinned = handle
            .session()
            .reopen()
            .and_then(|s| s.read_at(old));
        match pinned {
            Ok(snapshot) => {
                if !self.queue.push(WorkItem::incremental(handle, snapshot, new)) {
                    debug!("'{}': commit {} -> {} after shutdown, ignored", id, old, new);
                }
            }
            Err(e) => warn!("'{}': cannot pin {} for commit -> {}: {:#}", id, old, new, e),
        }
    }
}
