//! Centralized configuration and builder for QuiverNotify.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - NotifierConfig::from_env() reads QN_* variables; NotifierBuilder starts from env
//!   and allows overrides.
//!
//! Layout under root_dir:
//! - <root>/catalog.qlog             — catalog database (one row per watched database)
//! - <root>/databases/<id>.qlog      — watched databases
//!
//! Defaults:
//! - in_memory = false, durable = false (no fsync per commit)
//! - refresh_interval_ms = 0 (do not poll for commits made by other processes)
//! - report_empty_diffs = false (empty diffs on non-empty databases are dropped)

use std::fmt;
use std::path::PathBuf;

use crate::engine::DatabaseConfig;

pub const CATALOG_FILE: &str = "catalog.qlog";
pub const DATABASES_DIR: &str = "databases";
pub const DATABASE_FILE_EXT: &str = "qlog";

fn env_flag(v: &str) -> bool {
    let s = v.trim().to_ascii_lowercase();
    s == "1" || s == "true" || s == "on" || s == "yes"
}

/// Top-level configuration for the notifier.
#[derive(Clone, Debug)]
pub struct NotifierConfig {
    /// Local root directory.
    /// Env: QN_ROOT (default "./quivernotify")
    pub root_dir: PathBuf,

    /// Base URL of the sync server; database `name` is appended as a path segment.
    /// Env: QN_SERVER_URL (default empty: no sync URL is attached)
    pub server_base_url: String,

    /// Access token handed to every database session.
    /// Env: QN_ACCESS_TOKEN
    pub access_token: Option<String>,

    /// Keep catalog and databases in memory (no files under root_dir).
    /// Env: QN_IN_MEMORY = 0|1 (default 0)
    pub in_memory: bool,

    /// fsync every commit frame.
    /// Env: QN_DURABLE = 0|1 (default 0)
    pub durable: bool,

    /// Poll interval for commits written by other processes; 0 disables polling.
    /// Env: QN_REFRESH_MS (default 0)
    pub refresh_interval_ms: u64,

    /// Report every commit, including diffs without visible changes on non-empty databases.
    /// Env: QN_REPORT_EMPTY_DIFFS = 0|1 (default 0)
    pub report_empty_diffs: bool,

    /// Name of the diff worker thread.
    pub worker_thread_name: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./quivernotify"),
            server_base_url: String::new(),
            access_token: None,
            in_memory: false,
            durable: false,
            refresh_interval_ms: 0,
            report_empty_diffs: false,
            worker_thread_name: "qn-diff-worker".to_string(),
        }
    }
}

impl NotifierConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("QN_ROOT") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.root_dir = PathBuf::from(s);
            }
        }

        if let Ok(v) = std::env::var("QN_SERVER_URL") {
            cfg.server_base_url = v.trim().trim_end_matches('/').to_string();
        }

        if let Ok(v) = std::env::var("QN_ACCESS_TOKEN") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.access_token = Some(s.to_string());
            }
        }

        if let Ok(v) = std::env::var("QN_IN_MEMORY") {
            cfg.in_memory = env_flag(&v);
        }

        if let Ok(v) = std::env::var("QN_DURABLE") {
            cfg.durable = env_flag(&v);
        }

        if let Ok(v) = std::env::var("QN_REFRESH_MS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.refresh_interval_ms = n;
            }
        }

        if let Ok(v) = std::env::var("QN_REPORT_EMPTY_DIFFS") {
            cfg.report_empty_diffs = env_flag(&v);
        }

        cfg
    }

    // Fluent setters (builder-style) to override specific fields.

    pub fn with_root_dir<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.root_dir = root.into();
        self
    }

    pub fn with_server_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.server_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_access_token<S: Into<String>>(mut self, token: Option<S>) -> Self {
        self.access_token = token.map(Into::into);
        self
    }

    pub fn with_in_memory(mut self, on: bool) -> Self {
        self.in_memory = on;
        self
    }

    pub fn with_durable(mut self, on: bool) -> Self {
        self.durable = on;
        self
    }

    pub fn with_refresh_interval_ms(mut self, ms: u64) -> Self {
        self.refresh_interval_ms = ms;
        self
    }

    pub fn with_report_empty_diffs(mut self, on: bool) -> Self {
        self.report_empty_diffs = on;
        self
    }

    pub fn with_worker_thread_name<S: Into<String>>(mut self, name: S) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root_dir.join(CATALOG_FILE)
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.root_dir.join(DATABASES_DIR)
    }

    /// Session config of the catalog database.
    pub fn catalog_config(&self) -> DatabaseConfig {
        let mut cfg = if self.in_memory {
            DatabaseConfig::in_memory(self.catalog_path())
        } else {
            DatabaseConfig::file(self.catalog_path())
        };
        if !self.server_base_url.is_empty() {
            cfg.sync_url = Some(format!("{}/catalog", self.server_base_url));
        }
        cfg.sync_token = self.access_token.clone();
        cfg
    }
}

impl fmt::Display for NotifierConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NotifierConfig {{ \
             root_dir: {}, \
             server_base_url: {}, \
             access_token: {}, \
             in_memory: {}, \
             durable: {}, \
             refresh_interval_ms: {}, \
             report_empty_diffs: {}, \
             worker_thread_name: {} \
             }}",
            self.root_dir.display(),
            if self.server_base_url.is_empty() {
                "none"
            } else {
                self.server_base_url.as_str()
            },
            // никогда не печатаем сам токен
            if self.access_token.is_some() { "set" } else { "none" },
            self.in_memory,
            self.durable,
            self.refresh_interval_ms,
            self.report_empty_diffs,
            self.worker_thread_name,
        )
    }
}

/// Lightweight builder that produces a NotifierConfig.
#[derive(Clone, Debug)]
pub struct NotifierBuilder {
    cfg: NotifierConfig,
}

impl Default for NotifierBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: NotifierConfig::from_env(),
        }
    }
}

impl NotifierBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: NotifierConfig::default(),
        }
    }

    pub fn root_dir<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.cfg.root_dir = root.into();
        self
    }

    pub fn server_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.cfg = self.cfg.with_server_base_url(url);
        self
    }

    pub fn access_token<S: Into<String>>(mut self, token: Option<S>) -> Self {
        self.cfg.access_token = token.map(Into::into);
        self
    }

    pub fn in_memory(mut self, on: bool) -> Self {
        self.cfg.in_memory = on;
        self
    }

    pub fn durable(mut self, on: bool) -> Self {
        self.cfg.durable = on;
        self
    }

    pub fn refresh_interval_ms(mut self, ms: u64) -> Self {
        self.cfg.refresh_interval_ms = ms;
        self
    }

    pub fn report_empty_diffs(mut self, on: bool) -> Self {
        self.cfg.report_empty_diffs = on;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> NotifierConfig {
        self.cfg
    }
}
