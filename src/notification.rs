//! Database handles and change notifications.
//!
//! A ChangeNotification is an immutable value: which database, which versions,
//! and the per-object-type change sets. Snapshots "before"/"after" are opened
//! lazily on request from a private session.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::changeset::TableChangeSet;
use crate::engine::{SharedDatabase, Snapshot};
use crate::version::VersionToken;

struct HandleInner {
    id: String,
    name: String,
    session: SharedDatabase,
    // version covered by the initial-contents notification; commits up to it are skipped
    seeded_at: Mutex<Option<VersionToken>>,
}

/// Identifier + open session of one watched database. Cheap to clone; shared
/// read-only by the coordinator, queued work items and notifications.
#[derive(Clone)]
pub struct DatabaseHandle {
    inner: Arc<HandleInner>,
}

impl DatabaseHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>, session: SharedDatabase) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: id.into(),
                name: name.into(),
                session,
                seeded_at: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn session(&self) -> &SharedDatabase {
        &self.inner.session
    }

    pub(crate) fn seed_lock(&self) -> MutexGuard<'_, Option<VersionToken>> {
        self.inner.seeded_at.lock().unwrap()
    }

    /// Version of the initial contents read at registration, once known.
    pub fn seeded_at(&self) -> Option<VersionToken> {
        *self.seed_lock()
    }

    pub fn same_database(&self, other: &DatabaseHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("path", &self.inner.session.config().path)
            .finish()
    }
}

/// What the old side of a notification is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffKind {
    /// Full population event: there is no "before" state.
    Initial,
    /// Diff against a committed baseline version.
    Incremental { baseline: VersionToken },
}

pub type ChangeMap = BTreeMap<String, TableChangeSet>;

#[derive(Clone)]
pub struct ChangeNotification {
    kind: DiffKind,
    new_version: VersionToken,
    database: DatabaseHandle,
    changes: ChangeMap,
}

impl ChangeNotification {
    pub fn initial(database: DatabaseHandle, version: VersionToken, changes: ChangeMap) -> Self {
        Self {
            kind: DiffKind::Initial,
            new_version: version,
            database,
            changes,
        }
    }

    pub fn incremental(
        database: DatabaseHandle,
        baseline: VersionToken,
        new_version: VersionToken,
        changes: ChangeMap,
    ) -> Self {
        Self {
            kind: DiffKind::Incremental { baseline },
            new_version,
            database,
            changes,
        }
    }

    pub fn kind(&self) -> DiffKind {
        self.kind
    }

    pub fn is_initial(&self) -> bool {
        matches!(self.kind, DiffKind::Initial)
    }

    pub fn old_version(&self) -> Option<VersionToken> {
        match self.kind {
            DiffKind::Initial => None,
            DiffKind::Incremental { baseline } => Some(baseline),
        }
    }

    pub fn new_version(&self) -> VersionToken {
        self.new_version
    }

    pub fn database(&self) -> &DatabaseHandle {
        &self.database
    }

    pub fn database_id(&self) -> &str {
        self.database.id()
    }

    pub fn database_name(&self) -> &str {
        self.database.name()
    }

    /// Object type -> change set. Only tables with visible changes are present.
    pub fn changes(&self) -> &ChangeMap {
        &self.changes
    }

    /// State before the change; None for initial notifications.
    pub fn old_snapshot(&self) -> Result<Option<Snapshot>> {
        match self.kind {
            DiffKind::Initial => Ok(None),
            DiffKind::Incremental { baseline } => {
                let session = self.database.session().reopen()?;
                Ok(Some(session.read_at(baseline)?))
            }
        }
    }

    /// State after the change.
    pub fn new_snapshot(&self) -> Result<Snapshot> {
        let session = self.database.session().reopen()?;
        session.read_at(self.new_version)
    }

    /// Serializable view (used by the CLI for JSON lines).
    pub fn summary(&self) -> NotificationSummary<'_> {
        NotificationSummary {
            id: self.database.id(),
            name: self.database.name(),
            old_version: self.old_version(),
            new_version: self.new_version,
            initial: self.is_initial(),
            changes: &self.changes,
        }
    }
}

impl fmt::Debug for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotification")
            .field("database", &self.database.id())
            .field("kind", &self.kind)
            .field("new_version", &self.new_version)
            .field("changes", &self.changes)
            .finish()
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationSummary<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub old_version: Option<VersionToken>,
    pub new_version: VersionToken,
    pub initial: bool,
    pub changes: &'a ChangeMap,
}
