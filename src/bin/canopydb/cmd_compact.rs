use anyhow::{Context, Result};
use std::path::PathBuf;

use CanopyDB::{Compact, CompactReport};

use super::util::open_store;

pub fn exec(
    path: PathBuf,
    min_fill: Option<f64>,
    floor: Option<u64>,
    force: bool,
    shift: bool,
    json: bool,
) -> Result<()> {
    let (store, db) = open_store(&path)?;
    let floor = floor.unwrap_or_else(|| db.pending_version());
    let fill = min_fill.unwrap_or(store.config().min_tree_fill);
    let mut req = if force {
        Compact::forced(floor)
    } else {
        Compact::new(fill, floor)
    };
    if shift {
        req = req.with_shift();
    }
    let rep = store
        .compact(req)
        .with_context(|| format!("compact store at {}", path.display()))?;
    store.close()?;
    print_report(&rep, json)
}

fn print_report(rep: &CompactReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(rep)?);
        return Ok(());
    }
    if rep.skipped {
        println!("Compaction skipped (fill {:.3})", rep.fill);
        return Ok(());
    }
    println!("Compaction:");
    println!("  fill            = {:.3}", rep.fill);
    println!("  version_floor   = {}", rep.version_floor);
    println!("  pages_rewritten = {}", rep.pages_rewritten);
    match &rep.chunk {
        Some(c) => println!("  chunk           = v{} zone {} @{} ({} B)", c.version, c.zone, c.offset, c.size),
        None => println!("  chunk           = (none)"),
    }
    println!("  zones_retired   = {:?}", rep.zones_retired);
    Ok(())
}

pub fn exec_shift(path: PathBuf) -> Result<()> {
    let (store, _db) = open_store(&path)?;
    let zone = store.shift_zone()?;
    store.close()?;
    println!("OK active zone is now {:06} ({})", zone.id(), zone.path().display());
    Ok(())
}
