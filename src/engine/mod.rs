//! Storage engine seam.
//!
//! The notifier never touches storage directly; everything it needs goes through
//! two traits:
//! - StorageEngine — opens sessions from a DatabaseConfig;
//! - Database      — one session: versions, snapshots, replay with change
//!                   tracking, commit callbacks, write transactions.
//!
//! Submodules:
//! - snapshot.rs — Snapshot/Table/Row (immutable committed state).
//! - ops.rs      — logical ops, commit records, replay.
//! - log.rs      — commit log file format (QNLOG001).
//! - store.rs    — LogEngine: the bundled engine (file-backed or in-memory).
//!
//! Table naming: object types live in physical tables named "class_<Type>".
//! Any other table is internal and never reported to consumers.

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::changeset::TransactionChangeInfo;
use crate::version::VersionToken;

pub mod log;
pub mod ops;
pub mod snapshot;
pub mod store;

pub use ops::{CommitRecord, Op};
pub use snapshot::{Row, RowKey, Snapshot, Table};
pub use store::{LogEngine, WriteTransaction};

pub const OBJECT_TABLE_PREFIX: &str = "class_";

/// Physical table name for an object type.
pub fn table_for_object_type(object_type: &str) -> String {
    format!("{}{}", OBJECT_TABLE_PREFIX, object_type)
}

/// Object type for a physical table name; None for internal tables.
pub fn object_type_for_table_name(table: &str) -> Option<&str> {
    table
        .strip_prefix(OBJECT_TABLE_PREFIX)
        .filter(|s| !s.is_empty())
}

/// Commit event: (old_version, new_version). Runs on the committing thread.
pub type CommitCallback = Arc<dyn Fn(VersionToken, VersionToken) + Send + Sync + 'static>;

pub type SharedDatabase = Arc<dyn Database>;

/// How to open one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Log file path; for in-memory databases only an identity key.
    pub path: PathBuf,
    pub in_memory: bool,
    /// Share one session per path (true) or open a private one (false).
    pub cache: bool,
    /// Sync endpoint for this database. Carried for the engine, unused by the notifier.
    pub sync_url: Option<String>,
    pub sync_token: Option<String>,
}

impl DatabaseConfig {
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            in_memory: false,
            cache: true,
            sync_url: None,
            sync_token: None,
        }
    }

    pub fn in_memory<P: AsRef<Path>>(name: P) -> Self {
        Self {
            in_memory: true,
            ..Self::file(name)
        }
    }

    /// Same database, private (cache-bypassing) session.
    pub fn uncached(&self) -> Self {
        Self {
            cache: false,
            ..self.clone()
        }
    }
}

pub trait StorageEngine: Send + Sync {
    fn open(&self, config: &DatabaseConfig) -> Result<SharedDatabase>;

    /// Import commits made outside this engine instance (other processes) and fire
    /// their commit callbacks. Returns the number of commits imported.
    fn refresh(&self) -> Result<usize> {
        Ok(0)
    }
}

pub trait Database: Send + Sync {
    fn config(&self) -> &DatabaseConfig;

    fn current_version(&self) -> Result<VersionToken>;

    /// Oldest version that can still be read.
    fn oldest_version(&self) -> Result<VersionToken>;

    /// Consistent read-only view at `version`.
    fn read_at(&self, version: VersionToken) -> Result<Snapshot>;

    fn read_current(&self) -> Result<Snapshot> {
        self.read_at(self.current_version()?)
    }

    /// Live contents are empty (no rows in any table).
    fn is_empty(&self) -> Result<bool> {
        Ok(self.read_current()?.is_empty())
    }

    /// Replay committed operations from `from` up to `target`, recording changes of
    /// the tables `info` tracks. Returns the snapshot at `target`.
    fn advance(
        &self,
        from: &Snapshot,
        target: VersionToken,
        info: &mut TransactionChangeInfo,
    ) -> Result<Snapshot>;

    /// Install (Some) or remove (None) the commit callback. Replaces any previous
    /// one: a database has at most one live callback.
    fn set_commit_callback(&self, callback: Option<CommitCallback>);

    fn has_commit_callback(&self) -> bool;

    /// Fresh private session on the same configuration.
    fn reopen(&self) -> Result<SharedDatabase>;

    /// Run `f` in a write transaction and commit. Returns the new version.
    /// Commit callbacks fire before this returns; they must not write to the same database.
    fn write(&self, f: &mut dyn FnMut(&mut WriteTransaction) -> Result<()>) -> Result<VersionToken>;
}
