use anyhow::{bail, Result};
use std::path::PathBuf;

use QuiverNotify::{table_for_object_type, RowKey};

use super::util::{config_for, open_database, parse_row, parse_set};

pub fn exec(
    root: Option<PathBuf>,
    id: String,
    table: String,
    row: Option<String>,
    set: Option<String>,
    delete: Option<u64>,
    internal: bool,
) -> Result<()> {
    let given = row.is_some() as u8 + set.is_some() as u8 + delete.is_some() as u8;
    if given != 1 {
        bail!("exactly one of --row, --set or --delete is required");
    }
    let cfg = config_for(root);
    let db = open_database(&cfg, &id)?;
    let physical = if internal {
        table.clone()
    } else {
        table_for_object_type(&table)
    };

    let row = row.as_deref().map(parse_row).transpose()?;
    let set = set.as_deref().map(parse_set).transpose()?;

    let mut inserted = None;
    let version = db.write(&mut |tx| {
        if let Some(r) = &row {
            inserted = Some(tx.insert(&physical, r.clone())?);
        }
        if let Some((key, column, value)) = &set {
            tx.set(&physical, *key, column, value.clone())?;
        }
        if let Some(k) = delete {
            tx.delete(&physical, RowKey(k))?;
        }
        Ok(())
    })?;

    match inserted {
        Some(key) => println!("OK '{}' {}: inserted {} -> {}", id, physical, key, version),
        None => println!("OK '{}' {} -> {}", id, physical, version),
    }
    Ok(())
}
