//! Diff worker: one background thread turning commit events into notifications.
//!
//! Work queue: FIFO of WorkItems under one mutex + condvar. Producers (commit
//! callbacks) only hold the lock long enough to push. The worker waits on the
//! condvar, pops one item, releases the lock and computes the diff:
//!
//! 1) fresh private session on the item's database;
//! 2) snapshot at the baseline version (oldest retained version for Initial);
//! 3) replay up to the target version, tracking all tables;
//! 4) keep non-empty change sets of tables that map to an object type;
//! 5) empty result on a non-empty database -> dropped (unless configured otherwise);
//! 6) otherwise -> delivery queue + wake.
//!
//! Shutdown: flag under the queue lock + broadcast. The worker exits as soon as it
//! observes the flag; queued items are dropped, not processed.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::changeset::TransactionChangeInfo;
use crate::dispatch::DeliveryDispatcher;
use crate::engine::{object_type_for_table_name, Snapshot};
use crate::metrics::{
    record_diff_computed, record_diff_empty_dropped, record_diff_failure, record_work_item_enqueued,
    record_work_items_dropped,
};
use crate::notification::{ChangeMap, ChangeNotification, DatabaseHandle};
use crate::version::VersionToken;

/// Baseline of a work item.
pub enum WorkBase {
    /// No baseline: diff from the oldest retained version.
    Initial,
    /// Snapshot pinned at the commit's old version, owned by the item.
    Incremental(Snapshot),
}

pub struct WorkItem {
    pub database: DatabaseHandle,
    pub base: WorkBase,
    pub target: VersionToken,
}

impl WorkItem {
    pub fn incremental(database: DatabaseHandle, pinned: Snapshot, target: VersionToken) -> Self {
        Self {
            database,
            base: WorkBase::Incremental(pinned),
            target,
        }
    }

    pub fn baseline_version(&self) -> Option<VersionToken> {
        match &self.base {
            WorkBase::Initial => None,
            WorkBase::Incremental(s) => Some(s.version()),
        }
    }
}

struct QueueState {
    items: VecDeque<WorkItem>,
    shutdown: bool,
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Enqueue and wake the worker. Returns false (item dropped) after shutdown.
    pub fn push(&self, item: WorkItem) -> bool {
        let mut st = self.state.lock().unwrap();
        if st.shutdown {
            return false;
        }
        st.items.push_back(item);
        record_work_item_enqueued();
        self.cv.notify_one();
        true
    }

    /// Block until an item is available; None once shutdown is requested.
    pub fn pop_blocking(&self) -> Option<WorkItem> {
        let mut st = self.state.lock().unwrap();
        while !st.shutdown && st.items.is_empty() {
            st = self.cv.wait(st).unwrap();
        }
        if st.shutdown {
            return None;
        }
        st.items.pop_front()
    }

    /// Request shutdown. Returns the number of queued items that will never run.
    pub fn shutdown(&self) -> usize {
        let mut st = self.state.lock().unwrap();
        st.shutdown = true;
        let dropped = st.items.len();
        st.items.clear();
        self.cv.notify_all();
        if dropped > 0 {
            record_work_items_dropped(dropped);
        }
        dropped
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().shutdown
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Compute the notification for one work item. Ok(None) = nothing to report.
pub fn compute_notification(item: &WorkItem, report_empty: bool) -> Result<Option<ChangeNotification>> {
    let db = &item.database;
    let session = db
        .session()
        .reopen()
        .with_context(|| format!("reopen database '{}'", db.id()))?;

    let baseline = match &item.base {
        WorkBase::Incremental(pinned) => pinned.version(),
        WorkBase::Initial => session.oldest_version()?,
    };
    let before = session
        .read_at(baseline)
        .with_context(|| format!("read '{}' at {}", db.id(), baseline))?;

    let mut info = TransactionChangeInfo::track_all();
    let after = session
        .advance(&before, item.target, &mut info)
        .with_context(|| format!("advance '{}' {} -> {}", db.id(), baseline, item.target))?;

    let mut changes = ChangeMap::new();
    for (table, cs) in info.finalize(&before, &after) {
        match object_type_for_table_name(&table) {
            Some(object_type) => {
                changes.insert(object_type.to_string(), cs);
            }
            None => debug!("'{}': skip changes of internal table {}", db.id(), table),
        }
    }
    record_diff_computed();

    if changes.is_empty() && !report_empty && !db.session().is_empty()? {
        record_diff_empty_dropped();
        return Ok(None);
    }

    let change = match item.base {
        WorkBase::Initial => ChangeNotification::initial(db.clone(), item.target, changes),
        WorkBase::Incremental(_) => {
            ChangeNotification::incremental(db.clone(), baseline, item.target, changes)
        }
    };
    Ok(Some(change))
}

/// Handle to the running worker thread.
pub struct DiffWorker {
    handle: Option<JoinHandle<()>>,
}

impl DiffWorker {
    pub fn spawn(
        name: &str,
        queue: Arc<WorkQueue>,
        dispatcher: Arc<DeliveryDispatcher>,
        report_empty: bool,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(&queue, &dispatcher, report_empty))
            .with_context(|| format!("spawn worker thread {}", name))?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the thread to exit. The queue must already be shut down.
    pub fn join(&mut self) {
        if let Some(h) = self.handle.take() {
            if h.join().is_err() {
                warn!("diff worker thread panicked");
            }
        }
    }
}

fn run(queue: &WorkQueue, dispatcher: &DeliveryDispatcher, report_empty: bool) {
    info!("diff worker started");
    while let Some(item) = queue.pop_blocking() {
        let id = item.database.id().to_string();
        let outcome = catch_unwind(AssertUnwindSafe(|| compute_notification(&item, report_empty)));
        match outcome {
            Ok(Ok(Some(change))) => {
                debug!(
                    "'{}': {:?} -> {} ({} table(s) changed)",
                    id,
                    change.old_version(),
                    change.new_version(),
                    change.changes().len()
                );
                dispatcher.push_and_notify(change);
            }
            Ok(Ok(None)) => debug!("'{}': no visible changes at {}, dropped", id, item.target),
            Ok(Err(e)) => {
                record_diff_failure();
                warn!("'{}': diff to {} failed, work item dropped: {:#}", id, item.target, e);
            }
            Err(_) => {
                record_diff_failure();
                warn!("'{}': diff to {} panicked, work item dropped", id, item.target);
            }
        }
    }
    info!("diff worker stopped");
}
