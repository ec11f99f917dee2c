//! Lightweight global metrics for QuiverNotify.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - catalog / registry watcher
//! - coordinator (registration, admission filter)
//! - diff worker
//! - delivery dispatcher
//! - commit log (LogEngine)

use std::sync::atomic::{AtomicU64, Ordering};

// ----- Catalog -----
static CATALOG_ENTRIES_DISCOVERED: AtomicU64 = AtomicU64::new(0);
static CATALOG_ENTRIES_CREATED: AtomicU64 = AtomicU64::new(0);

// ----- Coordinator -----
static DATABASES_REGISTERED: AtomicU64 = AtomicU64::new(0);
static DATABASES_REJECTED: AtomicU64 = AtomicU64::new(0);
static DATABASES_FAILED: AtomicU64 = AtomicU64::new(0);

// ----- Diff worker -----
static WORK_ITEMS_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static WORK_ITEMS_DROPPED: AtomicU64 = AtomicU64::new(0);
static DIFFS_COMPUTED: AtomicU64 = AtomicU64::new(0);
static DIFFS_EMPTY_DROPPED: AtomicU64 = AtomicU64::new(0);
static DIFF_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Delivery -----
static NOTIFICATIONS_ENQUEUED: AtomicU64 = AtomicU64::new(0);
static NOTIFICATIONS_INITIAL: AtomicU64 = AtomicU64::new(0);
static NOTIFICATIONS_DELIVERED: AtomicU64 = AtomicU64::new(0);
static NOTIFICATIONS_DISCARDED: AtomicU64 = AtomicU64::new(0);

// ----- Commit log -----
static LOG_FRAMES_APPENDED: AtomicU64 = AtomicU64::new(0);
static LOG_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static EXTERNAL_COMMITS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    // Catalog
    pub catalog_entries_discovered: u64,
    pub catalog_entries_created: u64,

    // Coordinator
    pub databases_registered: u64,
    pub databases_rejected: u64,
    pub databases_failed: u64,

    // Diff worker
    pub work_items_enqueued: u64,
    pub work_items_dropped: u64,
    pub diffs_computed: u64,
    pub diffs_empty_dropped: u64,
    pub diff_failures: u64,

    // Delivery
    pub notifications_enqueued: u64,
    pub notifications_initial: u64,
    pub notifications_delivered: u64,
    pub notifications_discarded: u64,

    // Commit log
    pub log_frames_appended: u64,
    pub log_bytes_written: u64,
    pub external_commits: u64,
}

impl MetricsSnapshot {
    /// Share of computed diffs that were dropped as empty.
    pub fn empty_diff_ratio(&self) -> f64 {
        if self.diffs_computed == 0 {
            0.0
        } else {
            self.diffs_empty_dropped as f64 / self.diffs_computed as f64
        }
    }

    /// Notifications produced but not yet handed to the consumer (approximate).
    pub fn notifications_in_flight(&self) -> u64 {
        self.notifications_enqueued
            .saturating_sub(self.notifications_delivered)
            .saturating_sub(self.notifications_discarded)
    }
}

// ----- Recorders (Catalog) -----
pub fn record_catalog_entry_discovered() {
    CATALOG_ENTRIES_DISCOVERED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_catalog_entry_created() {
    CATALOG_ENTRIES_CREATED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Coordinator) -----
pub fn record_database_registered() {
    DATABASES_REGISTERED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_database_rejected() {
    DATABASES_REJECTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_database_failed() {
    DATABASES_FAILED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Diff worker) -----
pub fn record_work_item_enqueued() {
    WORK_ITEMS_ENQUEUED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_work_items_dropped(n: usize) {
    WORK_ITEMS_DROPPED.fetch_add(n as u64, Ordering::Relaxed);
}

pub fn record_diff_computed() {
    DIFFS_COMPUTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_diff_empty_dropped() {
    DIFFS_EMPTY_DROPPED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_diff_failure() {
    DIFF_FAILURES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Delivery) -----
pub fn record_notification_enqueued(initial: bool) {
    NOTIFICATIONS_ENQUEUED.fetch_add(1, Ordering::Relaxed);
    if initial {
        NOTIFICATIONS_INITIAL.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn record_notification_delivered() {
    NOTIFICATIONS_DELIVERED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_notifications_discarded(n: usize) {
    NOTIFICATIONS_DISCARDED.fetch_add(n as u64, Ordering::Relaxed);
}

// ----- Recorders (Commit log) -----
pub fn record_log_append(frame_len: usize) {
    LOG_FRAMES_APPENDED.fetch_add(1, Ordering::Relaxed);
    LOG_BYTES_WRITTEN.fetch_add(frame_len as u64, Ordering::Relaxed);
}

pub fn record_external_commit() {
    EXTERNAL_COMMITS.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        catalog_entries_discovered: CATALOG_ENTRIES_DISCOVERED.load(Ordering::Relaxed),
        catalog_entries_created: CATALOG_ENTRIES_CREATED.load(Ordering::Relaxed),

        databases_registered: DATABASES_REGISTERED.load(Ordering::Relaxed),
        databases_rejected: DATABASES_REJECTED.load(Ordering::Relaxed),
        databases_failed: DATABASES_FAILED.load(Ordering::Relaxed),

        work_items_enqueued: WORK_ITEMS_ENQUEUED.load(Ordering::Relaxed),
        work_items_dropped: WORK_ITEMS_DROPPED.load(Ordering::Relaxed),
        diffs_computed: DIFFS_COMPUTED.load(Ordering::Relaxed),
        diffs_empty_dropped: DIFFS_EMPTY_DROPPED.load(Ordering::Relaxed),
        diff_failures: DIFF_FAILURES.load(Ordering::Relaxed),

        notifications_enqueued: NOTIFICATIONS_ENQUEUED.load(Ordering::Relaxed),
        notifications_initial: NOTIFICATIONS_INITIAL.load(Ordering::Relaxed),
        notifications_delivered: NOTIFICATIONS_DELIVERED.load(Ordering::Relaxed),
        notifications_discarded: NOTIFICATIONS_DISCARDED.load(Ordering::Relaxed),

        log_frames_appended: LOG_FRAMES_APPENDED.load(Ordering::Relaxed),
        log_bytes_written: LOG_BYTES_WRITTEN.load(Ordering::Relaxed),
        external_commits: EXTERNAL_COMMITS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    CATALOG_ENTRIES_DISCOVERED.store(0, Ordering::Relaxed);
    CATALOG_ENTRIES_CREATED.store(0, Ordering::Relaxed);

    DATABASES_REGISTERED.store(0, Ordering::Relaxed);
    DATABASES_REJECTED.store(0, Ordering::Relaxed);
    DATABASES_FAILED.store(0, Ordering::Relaxed);

    WORK_ITEMS_ENQUEUED.store(0, Ordering::Relaxed);
    WORK_ITEMS_DROPPED.store(0, Ordering::Relaxed);
    DIFFS_COMPUTED.store(0, Ordering::Relaxed);
    DIFFS_EMPTY_DROPPED.store(0, Ordering::Relaxed);
    DIFF_FAILURES.store(0, Ordering::Relaxed);

    NOTIFICATIONS_ENQUEUED.store(0, Ordering::Relaxed);
    NOTIFICATIONS_INITIAL.store(0, Ordering::Relaxed);
    NOTIFICATIONS_DELIVERED.store(0, Ordering::Relaxed);
    NOTIFICATIONS_DISCARDED.store(0, Ordering::Relaxed);

    LOG_FRAMES_APPENDED.store(0, Ordering::Relaxed);
    LOG_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    EXTERNAL_COMMITS.store(0, Ordering::Relaxed);
}
