use anyhow::Result;
use std::path::PathBuf;

use super::util::open_store;

pub fn exec(path: PathBuf, json: bool) -> Result<()> {
    let (store, _db) = open_store(&path)?;
    let st = store.status()?;
    let germ = store.germ()?;
    store.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&st)?);
        return Ok(());
    }

    println!("CanopyDB store at {}", st.dir.display());
    println!("  store_id      = {}", st.store_id);
    println!("  version       = {}", st.version);
    println!("  germ.updated  = {} ms", germ.updated_ms);
    println!("  next_stem     = {}", germ.next_stem);
    println!("  zones         = {}", st.zones.len());
    for z in &st.zones {
        println!(
            "    zone {:06}  {:>12} B{}",
            z.id,
            z.size,
            if z.active { "  (active)" } else { "" }
        );
    }
    println!("  zone_bytes    = {}", st.zone_bytes);
    println!("  tree_size     = {}", st.tree_size);
    println!("  fill          = {:.3}", st.fill);
    println!("  trees         = {}", st.trees.len());
    println!("metrics:");
    let m = &st.metrics;
    println!("  commits             = {}", m.commits);
    println!("  commit_failures     = {}", m.commit_failures);
    println!("  pages_written       = {}", m.pages_written);
    println!("  bytes_written       = {}", m.bytes_written);
    println!("  avg_chunk_pages     = {:.2}", m.avg_chunk_pages());
    println!("  compactions         = {}", m.compactions);
    println!("  compactions_skipped = {}", m.compactions_skipped);
    println!("  pages_rewritten     = {}", m.pages_rewritten);
    println!("  zone_shifts         = {}", m.zone_shifts);
    println!("  zones_retired       = {}", m.zones_retired);
    println!(
        "  page_cache          = {} hits / {} misses ({:.1}% hit)",
        m.page_cache_hits,
        m.page_cache_misses,
        m.cache_hit_ratio() * 100.0
    );
    println!("config: {}", st.config);
    Ok(())
}

pub fn exec_trees(path: PathBuf, json: bool) -> Result<()> {
    let (store, db) = open_store(&path)?;
    let trees = db.trees()?;
    store.close()?;

    if json {
        println!("{}", serde_json::to_string(&trees)?);
        return Ok(());
    }
    if trees.is_empty() {
        println!("(no trees)");
        return Ok(());
    }
    println!("{:<24} {:<6} {:>6} {:>10} {:>8} {:>12}", "name", "kind", "stem", "len", "version", "tree_size");
    for t in trees {
        println!(
            "{:<24} {:<6} {:>6} {:>10} {:>8} {:>12}",
            t.name, t.kind, t.stem, t.len, t.version, t.tree_size
        );
    }
    Ok(())
}
