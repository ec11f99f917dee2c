use anyhow::{anyhow, bail, Context, Result};
use std::fs::OpenOptions;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use QuiverNotify::{LogEngine, NotifierConfig, RegistryWatcher, Row, RowKey, SharedDatabase, StorageEngine};

/// Config from env (QN_*), with --root taking precedence.
pub fn config_for(root: Option<PathBuf>) -> NotifierConfig {
    let cfg = NotifierConfig::from_env();
    match root {
        Some(r) => cfg.with_root_dir(r),
        None => cfg,
    }
}

pub fn engine_for(cfg: &NotifierConfig) -> Arc<dyn StorageEngine> {
    Arc::new(LogEngine::with_durability(cfg.durable))
}

/// Open a cataloged database by id.
pub fn open_database(cfg: &NotifierConfig, id: &str) -> Result<SharedDatabase> {
    let engine = engine_for(cfg);
    let watcher = RegistryWatcher::open(engine.as_ref(), cfg)?;
    let entry = watcher.find(id)?;
    let db_cfg = watcher.get_session_config(&entry.id, &entry.name)?;
    engine
        .open(&db_cfg)
        .with_context(|| format!("open database '{}'", id))
}

/// JSON argument: literal, "@file" or "-" (stdin).
pub fn read_json_arg(arg: &str) -> Result<Value> {
    let text = if arg == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s)?;
        s
    } else if let Some(p) = arg.strip_prefix('@') {
        let path = PathBuf::from(p);
        let mut f = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|e| anyhow!("open json file {}: {}", path.display(), e))?;
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        s
    } else {
        arg.to_string()
    };
    serde_json::from_str(&text).with_context(|| format!("parse json '{}'", text.trim()))
}

pub fn parse_row(arg: &str) -> Result<Row> {
    match read_json_arg(arg)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => bail!("row must be a JSON object, got {}", other),
    }
}

/// "<key>:<column>=<json>"; a value that is not valid JSON is taken as a string.
pub fn parse_set(arg: &str) -> Result<(RowKey, String, Value)> {
    let (key, rest) = arg
        .split_once(':')
        .ok_or_else(|| anyhow!("--set expects <key>:<column>=<value>"))?;
    let (column, value) = rest
        .split_once('=')
        .ok_or_else(|| anyhow!("--set expects <key>:<column>=<value>"))?;
    let key: u64 = key
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid row key '{}'", key))?;
    if column.is_empty() {
        bail!("--set: empty column name");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((RowKey(key), column.to_string(), value))
}
