//! Change sets: what changed in one table between two versions.
//!
//! Replay records changes per row key (TableChangeTracker); finalize() turns
//! them into positional index sets against the before/after tables:
//! - deletions     — indices in the "before" table;
//! - insertions    — indices in the "after" table;
//! - modifications — indices in the "after" table (rows present in both);
//! - columns       — per column, the "after" indices whose field changed.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::engine::snapshot::{RowKey, Snapshot, Table};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TableChangeSet {
    pub insertions: BTreeSet<usize>,
    pub deletions: BTreeSet<usize>,
    pub modifications: BTreeSet<usize>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub columns: BTreeMap<String, BTreeSet<usize>>,
}

impl TableChangeSet {
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty() && self.deletions.is_empty() && self.modifications.is_empty()
    }

    /// Every row of `table` reported as an insertion (initial population).
    pub fn all_inserted(table: &Table) -> Self {
        Self {
            insertions: (0..table.len()).collect(),
            ..Self::default()
        }
    }
}

/// Key-level change log of one table, filled in while replaying commits.
#[derive(Clone, Debug, Default)]
pub struct TableChangeTracker {
    inserted: BTreeSet<RowKey>,
    deleted: BTreeSet<RowKey>,
    modified: BTreeMap<RowKey, BTreeSet<String>>,
}

impl TableChangeTracker {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    pub fn record_insert(&mut self, key: RowKey) {
        self.inserted.insert(key);
    }

    pub fn record_delete(&mut self, key: RowKey) {
        self.modified.remove(&key);
        // insert + delete inside the range cancels out
        if !self.inserted.remove(&key) {
            self.deleted.insert(key);
        }
    }

    pub fn record_modify(&mut self, key: RowKey, column: &str) {
        // a row inserted inside the range is reported as an insertion only
        if self.inserted.contains(&key) || self.deleted.contains(&key) {
            return;
        }
        self.modified.entry(key).or_default().insert(column.to_string());
    }

    /// Resolve key-level changes to positional indices. Missing tables count as empty.
    pub fn finalize(self, before: Option<&Table>, after: Option<&Table>) -> TableChangeSet {
        let before_pos = positions(before);
        let after_pos = positions(after);

        let mut out = TableChangeSet::default();
        for key in &self.deleted {
            if let Some(i) = before_pos.get(key) {
                out.deletions.insert(*i);
            }
        }
        for key in &self.inserted {
            if let Some(i) = after_pos.get(key) {
                out.insertions.insert(*i);
            }
        }
        for (key, cols) in &self.modified {
            if let Some(i) = after_pos.get(key) {
                out.modifications.insert(*i);
                for c in cols {
                    out.columns.entry(c.clone()).or_default().insert(*i);
                }
            }
        }
        out
    }
}

fn positions(table: Option<&Table>) -> HashMap<RowKey, usize> {
    match table {
        Some(t) => t.rows().enumerate().map(|(i, (k, _))| (k, i)).collect(),
        None => HashMap::new(),
    }
}

/// Which tables replay should track, and what it found.
#[derive(Clone, Debug, Default)]
pub struct TransactionChangeInfo {
    track_all: bool,
    tracked: BTreeSet<String>,
    tables: BTreeMap<String, TableChangeTracker>,
}

impl TransactionChangeInfo {
    /// Track every table (the set of interesting tables is not known up front).
    pub fn track_all() -> Self {
        Self {
            track_all: true,
            ..Self::default()
        }
    }

    /// Track only the named physical tables.
    pub fn tracking<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            track_all: false,
            tracked: tables.into_iter().map(Into::into).collect(),
            tables: BTreeMap::new(),
        }
    }

    #[inline]
    pub fn wants(&self, table: &str) -> bool {
        self.track_all || self.tracked.contains(table)
    }

    /// Tracker for `table`, or None if the table is not tracked.
    pub fn tracker_mut(&mut self, table: &str) -> Option<&mut TableChangeTracker> {
        if !self.wants(table) {
            return None;
        }
        Some(self.tables.entry(table.to_string()).or_default())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| t.is_empty())
    }

    /// Positional change sets per physical table; empty entries are dropped.
    pub fn finalize(self, before: &Snapshot, after: &Snapshot) -> BTreeMap<String, TableChangeSet> {
        let mut out = BTreeMap::new();
        for (name, tracker) in self.tables {
            if tracker.is_empty() {
                continue;
            }
            let cs = tracker.finalize(before.table(&name), after.table(&name));
            if !cs.is_empty() {
                out.insert(name, cs);
            }
        }
        out
    }
}
