use anyhow::{Context, Result};
use std::path::PathBuf;

use QuiverNotify::{object_type_for_table_name, ChangeMap, TransactionChangeInfo, VersionToken};

use super::util::{config_for, open_database};

pub fn exec(root: Option<PathBuf>, id: String, from: u64, to: Option<u64>, json: bool) -> Result<()> {
    let cfg = config_for(root);
    let db = open_database(&cfg, &id)?;

    let from = VersionToken::new(from);
    let to = match to {
        Some(v) => VersionToken::new(v),
        None => db.current_version()?,
    };
    let before = db
        .read_at(from)
        .with_context(|| format!("read '{}' at {}", id, from))?;
    let mut info = TransactionChangeInfo::track_all();
    let after = db.advance(&before, to, &mut info)?;

    let mut changes = ChangeMap::new();
    let mut internal = Vec::new();
    for (table, cs) in info.finalize(&before, &after) {
        match object_type_for_table_name(&table) {
            Some(t) => {
                changes.insert(t.to_string(), cs);
            }
            None => internal.push(table),
        }
    }

    if json {
        let out = serde_json::json!({
            "id": id,
            "old_version": from,
            "new_version": to,
            "changes": changes,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("'{}' {} -> {}", id, from, to);
    if changes.is_empty() {
        println!("  (no visible changes)");
    }
    for (object_type, cs) in &changes {
        println!(
            "  {}: insertions={:?} deletions={:?} modifications={:?}",
            object_type, cs.insertions, cs.deletions, cs.modifications
        );
        for (column, rows) in &cs.columns {
            println!("    {}: {:?}", column, rows);
        }
    }
    for t in &internal {
        println!("  (internal table {} changed)", t);
    }
    Ok(())
}
