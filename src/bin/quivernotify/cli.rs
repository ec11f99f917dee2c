use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI для QuiverNotify: каталог баз, коммиты и поток изменений
#[derive(Parser, Debug)]
#[command(name = "quivernotify", version, about = "QuiverNotify CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Cmd,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Add a database to the catalog (one committed row)
    Register {
        /// Root directory (defaults to QN_ROOT)
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        id: String,
        /// Logical name (sync path); defaults to the id
        #[arg(long)]
        name: Option<String>,
    },
    /// List catalog entries
    Entries {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Commit one change to a cataloged database
    ///
    /// Примеры:
    ///   put --id users --table Person --row '{"name":"ann","age":31}'
    ///   put --id users --table Person --set 0:age=32
    ///   put --id users --table Person --delete 0
    Put {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        id: String,
        /// Object type (physical table class_<table>), or a raw table name with --internal
        #[arg(long)]
        table: String,
        /// Insert a row given as a JSON object
        #[arg(long)]
        row: Option<String>,
        /// Update one field: <key>:<column>=<json value>
        #[arg(long)]
        set: Option<String>,
        /// Delete the row with this key
        #[arg(long)]
        delete: Option<u64>,
        /// Write to an internal (non object type) table
        #[arg(long, default_value_t = false)]
        internal: bool,
    },
    /// Change sets between two committed versions of a database
    Diff {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        id: String,
        #[arg(long)]
        from: u64,
        /// Target version (defaults to the latest)
        #[arg(long)]
        to: Option<u64>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Run the notifier and print every notification as a JSON line
    Watch {
        #[arg(long)]
        root: Option<PathBuf>,
        /// Only watch databases whose name starts with this prefix
        #[arg(long)]
        prefix: Option<String>,
        /// Poll for commits made by other processes every N ms (0 = off)
        #[arg(long, default_value_t = 200)]
        refresh_ms: u64,
        /// Exit after N notifications
        #[arg(long)]
        max: Option<usize>,
        /// Also report commits without visible changes
        #[arg(long, default_value_t = false)]
        report_empty: bool,
        /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9899)
        #[arg(long)]
        metrics_addr: Option<String>,
    },
}
