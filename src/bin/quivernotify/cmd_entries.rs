use anyhow::Result;
use std::path::PathBuf;

use QuiverNotify::RegistryWatcher;

use super::util::{config_for, engine_for};

pub fn exec(root: Option<PathBuf>, json: bool) -> Result<()> {
    let cfg = config_for(root);
    let engine = engine_for(&cfg);
    let watcher = RegistryWatcher::open(engine.as_ref(), &cfg)?;
    let entries = watcher.entries()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("(catalog is empty)");
    }
    for e in &entries {
        let cfg = watcher.get_session_config(&e.id, &e.name)?;
        println!("{}\t{}\t{}", e.id, e.name, cfg.path.display());
    }
    Ok(())
}
