//! engine/store — LogEngine, the bundled storage engine.
//!
//! Model:
//! - one LogStore per database path (shared by all sessions of one engine instance);
//! - version n = state after n commits; every version stays readable. Only the
//!   newest versions and a few checkpoints are kept as snapshots, older ones are
//!   rebuilt by replaying the commit records;
//! - file-backed stores append one frame per commit (see log.rs), in-memory stores
//!   keep everything in RAM;
//! - commit callbacks fire on the committing thread right after the commit, in
//!   version order (a ticket on the last published version serializes publishers).
//!
//! Multi-process: appends are serialized with an fs2 exclusive lock on the log
//! file; before appending, a writer imports frames appended by others. Readers in
//! other processes pick commits up with refresh().

use anyhow::{anyhow, bail, Context, Result};
use fs2::FileExt;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

use crate::changeset::TransactionChangeInfo;
use crate::metrics::{record_external_commit, record_log_append};
use crate::version::VersionToken;

use super::log::{check_log_header, encode_frame, read_next_frame, write_log_header, LOG_HDR_SIZE};
use super::ops::{apply_op, rebuild, replay, CommitRecord, Op};
use super::snapshot::{Row, RowKey, Snapshot, Table, TableMap};
use super::{CommitCallback, Database, DatabaseConfig, SharedDatabase, StorageEngine};

type CommitEvent = (VersionToken, VersionToken);

// ---------------- write transaction ----------------

/// Pending changes on top of one committed snapshot.
pub struct WriteTransaction {
    base_version: VersionToken,
    tables: TableMap,
    ops: Vec<Op>,
}

impl WriteTransaction {
    pub(crate) fn new(base: &Snapshot) -> Self {
        Self {
            base_version: base.version(),
            tables: base.tables_cloned(),
            ops: Vec::new(),
        }
    }

    pub fn base_version(&self) -> VersionToken {
        self.base_version
    }

    fn apply(&mut self, op: Op) -> Result<()> {
        apply_op(&mut self.tables, &op, None)?;
        self.ops.push(op);
        Ok(())
    }

    /// Create the table if it does not exist yet (additive schema).
    pub fn add_table(&mut self, table: &str) -> Result<()> {
        if self.tables.contains_key(table) {
            return Ok(());
        }
        self.apply(Op::AddTable {
            table: table.to_string(),
        })
    }

    /// Append a row; the table is created on demand.
    pub fn insert(&mut self, table: &str, row: Row) -> Result<RowKey> {
        self.add_table(table)?;
        let key = self
            .tables
            .get(table)
            .map(|t| t.next_key())
            .ok_or_else(|| anyhow!("no such table '{}'", table))?;
        self.apply(Op::Insert {
            table: table.to_string(),
            key,
            row,
        })?;
        Ok(key)
    }

    pub fn set(&mut self, table: &str, key: RowKey, column: &str, value: serde_json::Value) -> Result<()> {
        self.apply(Op::Set {
            table: table.to_string(),
            key,
            column: column.to_string(),
            value,
        })
    }

    pub fn delete(&mut self, table: &str, key: RowKey) -> Result<()> {
        self.apply(Op::Delete {
            table: table.to_string(),
            key,
        })
    }

    /// Table as seen inside the transaction (pending changes included).
    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name).map(|t| t.as_ref())
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub(crate) fn into_parts(self) -> (TableMap, Vec<Op>) {
        (self.tables, self.ops)
    }
}

// ---------------- commit publication ----------------

/// Publishes commit events in version order, whichever thread produced them.
struct Publisher {
    fired: Mutex<VersionToken>,
    cv: Condvar,
    callback: Mutex<Option<CommitCallback>>,
}

struct PublishTicket<'a> {
    publisher: &'a Publisher,
    upto: VersionToken,
}

impl Drop for PublishTicket<'_> {
    fn drop(&mut self) {
        // advance even if a callback panicked, otherwise later commits would wait forever
        if let Ok(mut fired) = self.publisher.fired.lock() {
            if *fired < self.upto {
                *fired = self.upto;
            }
        }
        self.publisher.cv.notify_all();
    }
}

impl Publisher {
    fn new(start: VersionToken) -> Self {
        Self {
            fired: Mutex::new(start),
            cv: Condvar::new(),
            callback: Mutex::new(None),
        }
    }

    /// `events` must be consecutive and start where the previous batch ended.
    fn publish(&self, events: &[CommitEvent]) {
        let (first, last) = match (events.first(), events.last()) {
            (Some(f), Some(l)) => (f.0, l.1),
            _ => return,
        };
        {
            let mut fired = self.fired.lock().unwrap();
            while *fired < first {
                fired = self.cv.wait(fired).unwrap();
            }
        }
        let _ticket = PublishTicket {
            publisher: self,
            upto: last,
        };
        // Clone outside the call: callbacks may replace themselves.
        let cb = self.callback.lock().unwrap().clone();
        if let Some(cb) = cb {
            for (old, new) in events {
                cb(*old, *new);
            }
        }
    }
}

// ---------------- store ----------------

/// Snapshots kept for the newest versions (readers pin the tip).
const RECENT_VERSIONS: usize = 32;
/// Older versions are rebuilt from the nearest checkpoint. When the list grows
/// past MAX_CHECKPOINTS the stride doubles and every other checkpoint goes.
const MAX_CHECKPOINTS: usize = 16;
const FIRST_CHECKPOINT_STRIDE: u64 = 64;

struct StoreState {
    // consecutive versions, back() is the latest
    recent: VecDeque<Snapshot>,
    // ascending; [0] is the oldest version (0)
    checkpoints: Vec<Snapshot>,
    stride: u64,
    // commits[i].version == i + 1
    commits: Vec<CommitRecord>,
    file: Option<File>,
    // end of the last imported frame
    file_pos: u64,
}

impl StoreState {
    fn new() -> Self {
        let base = Snapshot::empty(VersionToken::new(0));
        Self {
            recent: VecDeque::from(vec![base.clone()]),
            checkpoints: vec![base],
            stride: FIRST_CHECKPOINT_STRIDE,
            commits: Vec::new(),
            file: None,
            file_pos: 0,
        }
    }

    fn latest(&self) -> &Snapshot {
        // never empty: push_snapshot always leaves the new tip
        &self.recent[self.recent.len() - 1]
    }

    fn oldest(&self) -> VersionToken {
        self.checkpoints[0].version()
    }

    fn is_checkpoint(&self, version: VersionToken) -> bool {
        version.get() % self.stride == 0
    }

    fn push_snapshot(&mut self, snap: Snapshot) {
        let newer = self.checkpoints.last().map_or(true, |c| c.version() < snap.version());
        if newer && self.is_checkpoint(snap.version()) {
            self.checkpoints.push(snap.clone());
            if self.checkpoints.len() > MAX_CHECKPOINTS {
                self.stride *= 2;
                let stride = self.stride;
                self.checkpoints.retain(|c| c.version().get() % stride == 0);
            }
        }
        if self.latest().version().next() != snap.version() {
            self.recent.clear();
        }
        self.recent.push_back(snap);
        while self.recent.len() > RECENT_VERSIONS {
            self.recent.pop_front();
        }
    }

    /// Retained snapshot at exactly `version`, or the nearest retained one below it.
    fn nearest(&self, version: VersionToken) -> Snapshot {
        if let Some(front) = self.recent.front() {
            if version >= front.version() {
                let i = (version.get() - front.version().get()) as usize;
                if let Some(s) = self.recent.get(i) {
                    return s.clone();
                }
            }
        }
        let i = self.checkpoints.partition_point(|c| c.version() <= version);
        self.checkpoints[i.saturating_sub(1)].clone()
    }

    fn commits_between(&self, from: VersionToken, to: VersionToken) -> Vec<CommitRecord> {
        self.commits[from.get() as usize..to.get() as usize].to_vec()
    }

    /// Apply records in one working map, materializing only the versions kept.
    fn import(&mut self, records: Vec<(CommitRecord, u64)>) -> Result<Vec<CommitEvent>> {
        let keep_from = records.len().saturating_sub(RECENT_VERSIONS);
        let mut version = self.latest().version();
        let mut tables = self.latest().tables_cloned();
        let mut events = Vec::with_capacity(records.len());
        for (i, (record, end)) in records.into_iter().enumerate() {
            if record.version != version.next() {
                self.settle(version);
                bail!("commit {} does not follow {} (version gap)", record.version, version);
            }
            for op in &record.ops {
                if let Err(e) = apply_op(&mut tables, op, None) {
                    self.settle(version);
                    return Err(e.context(format!("replay commit {}", record.version)));
                }
            }
            events.push((version, record.version));
            version = record.version;
            self.commits.push(record);
            self.file_pos = end;
            if i >= keep_from || self.is_checkpoint(version) {
                self.push_snapshot(Snapshot::from_parts(version, tables.clone()));
            }
        }
        Ok(events)
    }

    // After a failed import: make the last good commit the retained tip again.
    fn settle(&mut self, version: VersionToken) {
        if self.latest().version() == version {
            return;
        }
        let base = self.nearest(version);
        let commits = self.commits_between(base.version(), version);
        match rebuild(&base, &commits, version) {
            Ok(snap) => self.push_snapshot(snap),
            Err(e) => warn!("cannot rebuild version {}: {:#}", version, e),
        }
    }

    /// Import frames appended since file_pos (by another process, or left by ourselves on open).
    fn catch_up(&mut self) -> Result<Vec<CommitEvent>> {
        let records = match self.file.as_mut() {
            Some(f) => read_frames_from(f, self.file_pos)?,
            None => return Ok(Vec::new()),
        };
        self.import(records)
    }

    #[cfg(test)]
    fn retained_snapshots(&self) -> usize {
        self.recent.len() + self.checkpoints.len()
    }
}

fn read_frames_from(f: &mut File, mut pos: u64) -> Result<Vec<(CommitRecord, u64)>> {
    let len = f.metadata()?.len();
    let mut out = Vec::new();
    while let Some((record, next)) = read_next_frame(f, pos, len)? {
        out.push((record, next));
        pos = next;
    }
    Ok(out)
}

/// Exclusive advisory lock on the log file; released on Drop.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(file: &File, path: &Path) -> Result<Self> {
        let file = file
            .try_clone()
            .with_context(|| format!("dup log handle {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock_exclusive {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub(crate) struct LogStore {
    path: PathBuf,
    in_memory: bool,
    durable: bool,
    state: Mutex<StoreState>,
    publisher: Publisher,
}

impl LogStore {
    fn open(config: &DatabaseConfig, durable: bool) -> Result<Self> {
        let mut state = StoreState::new();

        if !config.in_memory {
            let file = open_log_file(&config.path)?;
            state.file = Some(file);
            state.file_pos = LOG_HDR_SIZE as u64;
            let loaded = state
                .catch_up()
                .with_context(|| format!("load commit log {}", config.path.display()))?;
            debug!(
                "log store {}: loaded {} commit(s)",
                config.path.display(),
                loaded.len()
            );
        }

        let start = state.latest().version();
        Ok(Self {
            path: config.path.clone(),
            in_memory: config.in_memory,
            durable,
            state: Mutex::new(state),
            publisher: Publisher::new(start),
        })
    }

    fn current_version(&self) -> VersionToken {
        self.state.lock().unwrap().latest().version()
    }

    fn oldest_version(&self) -> VersionToken {
        self.state.lock().unwrap().oldest()
    }

    fn read_at(&self, version: VersionToken) -> Result<Snapshot> {
        let (base, commits) = {
            let st = self.state.lock().unwrap();
            let latest = st.latest().version();
            if version > latest || version < st.oldest() {
                bail!(
                    "{}: version {} is not committed (latest {})",
                    self.path.display(),
                    version,
                    latest
                );
            }
            let base = st.nearest(version);
            if base.version() == version {
                return Ok(base);
            }
            let commits = st.commits_between(base.version(), version);
            (base, commits)
        };
        rebuild(&base, &commits, version)
    }

    fn advance(
        &self,
        from: &Snapshot,
        target: VersionToken,
        info: &mut TransactionChangeInfo,
    ) -> Result<Snapshot> {
        let commits: Vec<CommitRecord> = {
            let st = self.state.lock().unwrap();
            let latest = st.latest().version();
            if target > latest {
                bail!(
                    "{}: cannot advance to {} (latest {})",
                    self.path.display(),
                    target,
                    latest
                );
            }
            if from.version() > target {
                bail!("cannot advance backwards: {} -> {}", from.version(), target);
            }
            st.commits_between(from.version(), target)
        };
        replay(from, &commits, target, info)
    }

    fn set_callback(&self, callback: Option<CommitCallback>) {
        *self.publisher.callback.lock().unwrap() = callback;
    }

    fn has_callback(&self) -> bool {
        self.publisher.callback.lock().unwrap().is_some()
    }

    fn commit(&self, f: &mut dyn FnMut(&mut WriteTransaction) -> Result<()>) -> Result<VersionToken> {
        let mut events = Vec::new();
        let result = self.commit_locked(f, &mut events);
        // imported commits are published even if our own transaction failed
        self.publisher.publish(&events);
        result
    }

    fn commit_locked(
        &self,
        f: &mut dyn FnMut(&mut WriteTransaction) -> Result<()>,
        events: &mut Vec<CommitEvent>,
    ) -> Result<VersionToken> {
        let mut guard = self.state.lock().unwrap();
        let st = &mut *guard;

        let _flock = match st.file.as_ref() {
            Some(file) => Some(FileLock::exclusive(file, &self.path)?),
            None => None,
        };
        let imported = st.catch_up()?;
        for _ in &imported {
            record_external_commit();
        }
        events.extend(imported);

        let base = st.latest().clone();
        let mut tx = WriteTransaction::new(&base);
        f(&mut tx)?;
        let (tables, ops) = tx.into_parts();
        let version = base.version().next();
        let record = CommitRecord { version, ops };

        if let Some(file) = st.file.as_mut() {
            let frame = encode_frame(&record)?;
            // drop a torn tail left by a crashed writer
            file.set_len(st.file_pos)?;
            file.seek(SeekFrom::Start(st.file_pos))?;
            file.write_all(&frame)
                .with_context(|| format!("append commit {} to {}", version, self.path.display()))?;
            if self.durable {
                file.sync_data()?;
            }
            st.file_pos += frame.len() as u64;
            record_log_append(frame.len());
        }

        st.commits.push(record);
        st.push_snapshot(Snapshot::from_parts(version, tables));
        events.push((base.version(), version));
        Ok(version)
    }

    fn refresh(&self) -> Result<usize> {
        if self.in_memory {
            return Ok(0);
        }
        let events = {
            let mut st = self.state.lock().unwrap();
            st.catch_up()
                .with_context(|| format!("refresh {}", self.path.display()))?
        };
        for _ in &events {
            record_external_commit();
        }
        self.publisher.publish(&events);
        Ok(events.len())
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
    }
    let mut f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("open commit log {}", path.display()))?;
    {
        let _flock = FileLock::exclusive(&f, path)?;
        if f.metadata()?.len() == 0 {
            write_log_header(&mut f)?;
            f.sync_all().ok();
        }
    }
    check_log_header(&mut f).with_context(|| format!("check header of {}", path.display()))?;
    Ok(f)
}

// ---------------- sessions ----------------

pub struct LogDatabase {
    config: DatabaseConfig,
    store: Arc<LogStore>,
}

impl Database for LogDatabase {
    fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn current_version(&self) -> Result<VersionToken> {
        Ok(self.store.current_version())
    }

    fn oldest_version(&self) -> Result<VersionToken> {
        Ok(self.store.oldest_version())
    }

    fn read_at(&self, version: VersionToken) -> Result<Snapshot> {
        self.store.read_at(version)
    }

    fn advance(
        &self,
        from: &Snapshot,
        target: VersionToken,
        info: &mut TransactionChangeInfo,
    ) -> Result<Snapshot> {
        self.store.advance(from, target, info)
    }

    fn set_commit_callback(&self, callback: Option<CommitCallback>) {
        self.store.set_callback(callback)
    }

    fn has_commit_callback(&self) -> bool {
        self.store.has_callback()
    }

    fn reopen(&self) -> Result<SharedDatabase> {
        Ok(Arc::new(LogDatabase {
            config: self.config.uncached(),
            store: self.store.clone(),
        }))
    }

    fn write(&self, f: &mut dyn FnMut(&mut WriteTransaction) -> Result<()>) -> Result<VersionToken> {
        self.store.commit(f)
    }
}

// ---------------- engine ----------------

/// Engine instance: registry path -> store, plus cached sessions.
pub struct LogEngine {
    durable: bool,
    stores: Mutex<HashMap<PathBuf, Arc<LogStore>>>,
    sessions: Mutex<HashMap<PathBuf, Arc<LogDatabase>>>,
}

impl Default for LogEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LogEngine {
    pub fn new() -> Self {
        Self::with_durability(false)
    }

    /// durable = fsync every appended frame.
    pub fn with_durability(durable: bool) -> Self {
        Self {
            durable,
            stores: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn store_for(&self, config: &DatabaseConfig) -> Result<Arc<LogStore>> {
        let mut stores = self.stores.lock().unwrap();
        if let Some(s) = stores.get(&config.path) {
            if s.in_memory != config.in_memory {
                bail!(
                    "{} is already open as {}",
                    config.path.display(),
                    if s.in_memory { "in-memory" } else { "file-backed" }
                );
            }
            return Ok(s.clone());
        }
        let store = Arc::new(LogStore::open(config, self.durable)?);
        stores.insert(config.path.clone(), store.clone());
        Ok(store)
    }
}

impl StorageEngine for LogEngine {
    fn open(&self, config: &DatabaseConfig) -> Result<SharedDatabase> {
        if config.cache {
            if let Some(db) = self.sessions.lock().unwrap().get(&config.path) {
                return Ok(db.clone());
            }
        }
        let store = self.store_for(config)?;
        let db = Arc::new(LogDatabase {
            config: config.clone(),
            store,
        });
        if config.cache {
            let mut sessions = self.sessions.lock().unwrap();
            let db = sessions.entry(config.path.clone()).or_insert(db).clone();
            return Ok(db);
        }
        Ok(db)
    }

    fn refresh(&self) -> Result<usize> {
        let stores: Vec<Arc<LogStore>> = self.stores.lock().unwrap().values().cloned().collect();
        let mut total = 0usize;
        for s in stores {
            match s.refresh() {
                Ok(n) => total += n,
                Err(e) => warn!("refresh {}: {:#}", s.path.display(), e),
            }
        }
        Ok(total)
    }
}
