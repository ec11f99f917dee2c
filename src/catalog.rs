//! Catalog database and registry watcher.
//!
//! The catalog is a regular database with one object type, `DatabaseFile`
//! (columns `id`, `name`): one row per database that should be watched. Rows are
//! only ever appended.
//!
//! RegistryWatcher turns catalog commits into discovery callbacks:
//! - AwaitingInitialLoad: the first delivery reports every existing row, in table order;
//! - Steady{version}: later deliveries report rows inserted after `version` only.
//!   Modifications and deletions are ignored.
//! It does not remember ids; the coordinator is idempotent against duplicates.

use anyhow::{anyhow, bail, Context, Result};
use log::{debug, info, warn};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::changeset::TransactionChangeInfo;
use crate::config::{NotifierConfig, DATABASE_FILE_EXT};
use crate::engine::{
    table_for_object_type, CommitCallback, DatabaseConfig, Row, SharedDatabase, Snapshot, StorageEngine, Table,
};
use crate::metrics::{record_catalog_entry_created, record_catalog_entry_discovered};
use crate::version::VersionToken;

pub const CATALOG_OBJECT_TYPE: &str = "DatabaseFile";
pub const COL_ID: &str = "id";
pub const COL_NAME: &str = "name";

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub name: String,
}

/// Discovery callback: (id, name).
pub type DiscoveryCallback = Arc<dyn Fn(&str, &str) + Send + Sync + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatchState {
    AwaitingInitialLoad,
    Steady { version: VersionToken },
}

/// Ids become file names: keep them to a safe alphabet.
pub fn validate_database_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("database id must not be empty");
    }
    if id == "." || id == ".." {
        bail!("invalid database id '{}'", id);
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_' || *c == '.'))
    {
        bail!("invalid character {:?} in database id '{}'", c, id);
    }
    Ok(())
}

fn catalog_table() -> String {
    table_for_object_type(CATALOG_OBJECT_TYPE)
}

fn entry_from_row(row: &Row) -> Option<CatalogEntry> {
    let id = row.get(COL_ID)?.as_str()?;
    let name = row.get(COL_NAME)?.as_str()?;
    Some(CatalogEntry {
        id: id.to_string(),
        name: name.to_string(),
    })
}

/// Every catalog row of `snapshot`, in table order. Malformed rows are skipped.
pub fn entries_of(snapshot: &Snapshot) -> Vec<CatalogEntry> {
    let Some(table) = snapshot.table(&catalog_table()) else {
        return Vec::new();
    };
    table.rows().filter_map(|(_, row)| entry_from_row(row)).collect()
}

struct WatcherInner {
    catalog: SharedDatabase,
    state: Mutex<WatchState>,
}

impl WatcherInner {
    /// Report what is new in the catalog up to `target`.
    fn deliver(&self, target: VersionToken, on_discovered: &DiscoveryCallback) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        match *st {
            WatchState::AwaitingInitialLoad => {
                let snap = self.catalog.read_at(target)?;
                let entries = entries_of(&snap);
                debug!("catalog initial load at {}: {} entr(ies)", target, entries.len());
                for e in &entries {
                    record_catalog_entry_discovered();
                    on_discovered(&e.id, &e.name);
                }
                *st = WatchState::Steady { version: target };
            }
            WatchState::Steady { version } if target <= version => {
                // already covered (initial load raced with this commit)
            }
            WatchState::Steady { version } => {
                let before = self.catalog.read_at(version)?;
                let table = catalog_table();
                let mut info = TransactionChangeInfo::tracking([table.clone()]);
                let after = self.catalog.advance(&before, target, &mut info)?;
                let changes = info.finalize(&before, &after);
                if let Some(cs) = changes.get(&table) {
                    if !cs.deletions.is_empty() || !cs.modifications.is_empty() {
                        warn!(
                            "catalog {} -> {}: updates/removals are not supported, ignored",
                            version, target
                        );
                    }
                    let rows = after.table(&table);
                    for i in &cs.insertions {
                        match rows.and_then(|t: &Table| t.row_at(*i)).and_then(|(_, r)| entry_from_row(r)) {
                            Some(e) => {
                                record_catalog_entry_discovered();
                                on_discovered(&e.id, &e.name);
                            }
                            None => warn!("catalog row {} at {} is malformed, skipped", i, target),
                        }
                    }
                }
                *st = WatchState::Steady { version: target };
            }
        }
        Ok(())
    }
}

pub struct RegistryWatcher {
    config: NotifierConfig,
    inner: Arc<WatcherInner>,
}

impl RegistryWatcher {
    /// Open (and if needed create) the catalog database.
    pub fn open(engine: &dyn StorageEngine, config: &NotifierConfig) -> Result<Self> {
        let catalog_cfg = config.catalog_config();
        let catalog = engine
            .open(&catalog_cfg)
            .with_context(|| format!("open catalog {}", catalog_cfg.path.display()))?;

        // additive schema: make sure the object type exists
        let table = catalog_table();
        if catalog.read_current()?.table(&table).is_none() {
            catalog.write(&mut |tx| tx.add_table(&table))?;
        }

        Ok(Self {
            config: config.clone(),
            inner: Arc::new(WatcherInner {
                catalog,
                state: Mutex::new(WatchState::AwaitingInitialLoad),
            }),
        })
    }

    pub fn catalog(&self) -> &SharedDatabase {
        &self.inner.catalog
    }

    /// Subscribe to the catalog and run the initial load.
    /// `on_discovered` runs on this thread for the initial load and on committing
    /// threads afterwards.
    pub fn start(&self, on_discovered: DiscoveryCallback) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let cb = on_discovered.clone();
        let callback: CommitCallback = Arc::new(move |_old: VersionToken, new: VersionToken| {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.deliver(new, &cb) {
                    warn!("catalog change at {} not processed: {:#}", new, e);
                }
            }
        });
        self.inner.catalog.set_commit_callback(Some(callback));

        let current = self.inner.catalog.current_version()?;
        self.inner.deliver(current, &on_discovered)?;
        info!("registry watcher started at catalog {}", current);
        Ok(())
    }

    /// Remove the catalog subscription.
    pub fn stop(&self) {
        self.inner.catalog.set_commit_callback(None);
    }

    /// Session config of one watched database.
    pub fn get_session_config(&self, id: &str, name: &str) -> Result<DatabaseConfig> {
        validate_database_id(id)?;
        let path: PathBuf = self
            .config
            .databases_dir()
            .join(format!("{}.{}", id, DATABASE_FILE_EXT));
        let mut cfg = if self.config.in_memory {
            DatabaseConfig::in_memory(path)
        } else {
            DatabaseConfig::file(path)
        };
        if !self.config.server_base_url.is_empty() {
            cfg.sync_url = Some(format!(
                "{}/{}",
                self.config.server_base_url,
                name.trim_start_matches('/')
            ));
        }
        cfg.sync_token = self.config.access_token.clone();
        Ok(cfg)
    }

    /// Append a catalog row and commit. Errors go straight back to the caller.
    pub fn create_entry(&self, id: &str, name: &str) -> Result<VersionToken> {
        validate_database_id(id)?;
        let table = catalog_table();
        let version = self
            .inner
            .catalog
            .write(&mut |tx| {
                let mut row = Row::new();
                row.insert(COL_ID.to_string(), Value::String(id.to_string()));
                row.insert(COL_NAME.to_string(), Value::String(name.to_string()));
                tx.insert(&table, row)?;
                Ok(())
            })
            .with_context(|| format!("create catalog entry '{}'", id))?;
        record_catalog_entry_created();
        Ok(version)
    }

    /// Current catalog rows.
    pub fn entries(&self) -> Result<Vec<CatalogEntry>> {
        Ok(entries_of(&self.inner.catalog.read_current()?))
    }

    pub fn find(&self, id: &str) -> Result<CatalogEntry> {
        self.entries()?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| anyhow!("database '{}' is not in the catalog", id))
    }
}
