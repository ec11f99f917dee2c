use anyhow::Result;
use std::path::PathBuf;

use QuiverNotify::RegistryWatcher;

use super::util::{config_for, engine_for};

pub fn exec(root: Option<PathBuf>, id: String, name: Option<String>) -> Result<()> {
    let cfg = config_for(root);
    let engine = engine_for(&cfg);
    let watcher = RegistryWatcher::open(engine.as_ref(), &cfg)?;

    if let Some(e) = watcher.entries()?.into_iter().find(|e| e.id == id) {
        println!("EXISTS '{}' (name '{}')", e.id, e.name);
        return Ok(());
    }
    let name = name.unwrap_or_else(|| id.clone());
    let version = watcher.create_entry(&id, &name)?;
    println!("REGISTERED '{}' (name '{}') at catalog {}", id, name, version);
    Ok(())
}
