//! Logical operations and their replay.
//!
//! A commit is a list of Ops. The same apply path is used by write transactions,
//! by log loading and by advance/replay (with a change tracker attached).

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::changeset::TransactionChangeInfo;
use crate::version::VersionToken;

use super::snapshot::{Row, RowKey, Snapshot, Table, TableMap};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    AddTable {
        table: String,
    },
    Insert {
        table: String,
        key: RowKey,
        row: Row,
    },
    Set {
        table: String,
        key: RowKey,
        column: String,
        value: serde_json::Value,
    },
    Delete {
        table: String,
        key: RowKey,
    },
}

impl Op {
    pub fn table(&self) -> &str {
        match self {
            Op::AddTable { table }
            | Op::Insert { table, .. }
            | Op::Set { table, .. }
            | Op::Delete { table, .. } => table,
        }
    }
}

/// One committed transaction: the ops that turn `version - 1` into `version`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub version: VersionToken,
    pub ops: Vec<Op>,
}

fn table_mut<'a>(tables: &'a mut TableMap, name: &str) -> Result<&'a mut Table> {
    tables
        .get_mut(name)
        .map(Arc::make_mut)
        .ok_or_else(|| anyhow!("no such table '{}'", name))
}

/// Apply one op. When `info` is given, the change is recorded for tracked tables.
pub(crate) fn apply_op(
    tables: &mut TableMap,
    op: &Op,
    info: Option<&mut TransactionChangeInfo>,
) -> Result<()> {
    match op {
        Op::AddTable { table } => {
            tables
                .entry(table.clone())
                .or_insert_with(|| Arc::new(Table::default()));
        }
        Op::Insert { table, key, row } => {
            let t = table_mut(tables, table)?;
            if t.rows.contains_key(key) {
                bail!("insert into '{}': key {} already exists", table, key);
            }
            if key.0 < t.next_key {
                bail!("insert into '{}': key {} was already allocated", table, key);
            }
            t.rows.insert(*key, row.clone());
            t.next_key = key.0 + 1;
            if let Some(tr) = info.and_then(|i| i.tracker_mut(table)) {
                tr.record_insert(*key);
            }
        }
        Op::Set {
            table,
            key,
            column,
            value,
        } => {
            let t = table_mut(tables, table)?;
            let row = t
                .rows
                .get_mut(key)
                .ok_or_else(|| anyhow!("set on '{}': no row {}", table, key))?;
            row.insert(column.clone(), value.clone());
            if let Some(tr) = info.and_then(|i| i.tracker_mut(table)) {
                tr.record_modify(*key, column);
            }
        }
        Op::Delete { table, key } => {
            let t = table_mut(tables, table)?;
            if t.rows.remove(key).is_none() {
                bail!("delete from '{}': no row {}", table, key);
            }
            if let Some(tr) = info.and_then(|i| i.tracker_mut(table)) {
                tr.record_delete(*key);
            }
        }
    }
    Ok(())
}

/// Replay `commits` (consecutive, starting right after `from`) up to `target`,
/// recording every change into `info`.
pub(crate) fn replay(
    from: &Snapshot,
    commits: &[CommitRecord],
    target: VersionToken,
    info: &mut TransactionChangeInfo,
) -> Result<Snapshot> {
    replay_into(from, commits, target, Some(info))
}

/// Rebuild the state at `target` from an earlier snapshot, without tracking.
pub(crate) fn rebuild(from: &Snapshot, commits: &[CommitRecord], target: VersionToken) -> Result<Snapshot> {
    replay_into(from, commits, target, None)
}

// One working table map for the whole range: a touched table is copied once,
// not once per commit.
fn replay_into(
    from: &Snapshot,
    commits: &[CommitRecord],
    target: VersionToken,
    mut info: Option<&mut TransactionChangeInfo>,
) -> Result<Snapshot> {
    if target < from.version() {
        bail!("cannot replay backwards: {} -> {}", from.version(), target);
    }
    let mut version = from.version();
    let mut tables = from.tables_cloned();
    for record in commits {
        if version >= target {
            break;
        }
        if record.version != version.next() {
            bail!("commit {} does not follow {} (version gap)", record.version, version);
        }
        for op in &record.ops {
            apply_op(&mut tables, op, info.as_deref_mut())?;
        }
        version = record.version;
    }
    if version != target {
        bail!("replay stopped at {} before reaching {}", version, target);
    }
    Ok(Snapshot::from_parts(version, tables))
}
