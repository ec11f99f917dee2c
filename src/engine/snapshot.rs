//! Immutable committed states.
//!
//! A Snapshot is a cheap-to-clone view of every table at one version. Tables are
//! shared between versions via Arc and copied on write (Arc::make_mut), so a
//! commit only pays for the tables it touches.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::version::VersionToken;

/// One row: column name -> value.
pub type Row = BTreeMap<String, serde_json::Value>;

/// Stable row identity. Keys are allocated monotonically per table and never reused,
/// so a key seen in two snapshots always denotes the same row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowKey(pub u64);

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Table {
    pub(crate) next_key: u64,
    pub(crate) rows: BTreeMap<RowKey, Row>,
}

impl Table {
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: RowKey) -> Option<&Row> {
        self.rows.get(&key)
    }

    /// Rows in table order (ascending key).
    pub fn rows(&self) -> impl Iterator<Item = (RowKey, &Row)> {
        self.rows.iter().map(|(k, r)| (*k, r))
    }

    /// Row at a positional index (the index space used by change sets).
    pub fn row_at(&self, index: usize) -> Option<(RowKey, &Row)> {
        self.rows.iter().nth(index).map(|(k, r)| (*k, r))
    }

    /// Positional index of a key, if present.
    pub fn position(&self, key: RowKey) -> Option<usize> {
        if !self.rows.contains_key(&key) {
            return None;
        }
        Some(self.rows.range(..key).count())
    }

    /// Key the next insert will receive.
    #[inline]
    pub fn next_key(&self) -> RowKey {
        RowKey(self.next_key)
    }
}

pub(crate) type TableMap = BTreeMap<String, Arc<Table>>;

#[derive(Clone)]
pub struct Snapshot {
    version: VersionToken,
    tables: Arc<TableMap>,
}

impl Snapshot {
    /// Empty state (no tables) at the given version.
    pub fn empty(version: VersionToken) -> Self {
        Self {
            version,
            tables: Arc::new(TableMap::new()),
        }
    }

    pub(crate) fn from_parts(version: VersionToken, tables: TableMap) -> Self {
        Self {
            version,
            tables: Arc::new(tables),
        }
    }

    pub(crate) fn tables_cloned(&self) -> TableMap {
        (*self.tables).clone()
    }

    #[inline]
    pub fn version(&self) -> VersionToken {
        self.version
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    /// Physical table names, sorted.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(|s| s.as_str())
    }

    pub fn row_count(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// True when no table holds a row. Tables without rows do not count as contents.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(|t| t.is_empty())
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("version", &self.version)
            .field("tables", &self.tables.len())
            .field("rows", &self.row_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(keys: &[u64]) -> Table {
        let mut t = Table::default();
        for k in keys {
            t.rows.insert(RowKey(*k), Row::new());
            t.next_key = t.next_key.max(k + 1);
        }
        t
    }

    #[test]
    fn positions_follow_key_order() {
        let t = table_with(&[2, 5, 9]);
        assert_eq!(t.position(RowKey(2)), Some(0));
        assert_eq!(t.position(RowKey(9)), Some(2));
        assert_eq!(t.position(RowKey(3)), None);
        assert_eq!(t.row_at(1).map(|(k, _)| k), Some(RowKey(5)));
        assert_eq!(t.next_key(), RowKey(10));
    }

    #[test]
    fn empty_tables_are_not_contents() {
        let mut tables = TableMap::new();
        tables.insert("class_A".into(), Arc::new(Table::default()));
        let s = Snapshot::from_parts(VersionToken::new(1), tables);
        assert!(s.is_empty());
        assert_eq!(s.table_names().collect::<Vec<_>>(), vec!["class_A"]);
    }
}
