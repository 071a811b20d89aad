use anyhow::Result;
use std::path::PathBuf;

use CanopyDB::store::zone::zone_file_name;
use CanopyDB::{Commit, Compact, Store, StoreConfig};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("canopy-{}-{}-{}", prefix, pid, t))
}

fn cfg() -> StoreConfig {
    StoreConfig::default()
        .with_data_fsync(false)
        .with_split_arity(16, 8)
}

fn fill_map(db: &CanopyDB::Database, name: &str, n: u32, tag: &str) -> Result<()> {
    let map = db.open_btree_map(name)?;
    for i in 0..n {
        map.put(format!("k{:05}", i).as_bytes(), format!("{}-{}", tag, i).as_bytes())?;
    }
    Ok(())
}

/// Shifted compaction moves every live page into the new zone and deletes
/// the old zone file; the data survives a reopen.
#[test]
fn shifted_compaction_retires_old_zone() -> Result<()> {
    let root = unique_root("compact-shift");
    let (store, db) = Store::open_at(&root, cfg())?;
    fill_map(&db, "m", 500, "a")?;
    db.open_stree_list("l")?.append(b"x", b"y")?;
    store.commit(Commit::best_effort())?;
    // Overwrite half so zone 0 carries garbage.
    fill_map(&db, "m", 250, "b")?;
    store.commit(Commit::best_effort())?;

    let zone0 = root.join(zone_file_name(0));
    assert!(zone0.exists());

    let floor = db.pending_version();
    let report = store.compact(Compact::forced(floor).with_shift())?;
    assert!(!report.skipped);
    assert!(report.pages_rewritten > 0);
    let chunk = report.chunk.expect("rewritten pages are committed");
    assert_eq!(chunk.zone, 1);
    assert_eq!(report.zones_retired, vec![0]);
    assert!(!zone0.exists());
    assert_eq!(store.zones()?.len(), 1);

    let m = store.metrics()?;
    assert_eq!(m.compactions, 1);
    assert_eq!(m.zones_retired, 1);
    assert_eq!(m.pages_rewritten, report.pages_rewritten as u64);

    let map = db.open_btree_map("m")?;
    assert_eq!(map.get(b"k00010")?.as_deref(), Some(&b"b-10"[..]));
    assert_eq!(map.get(b"k00400")?.as_deref(), Some(&b"a-400"[..]));
    store.close()?;

    let (store, db) = Store::open_at(&root, cfg())?;
    let map = db.open_btree_map("m")?;
    assert_eq!(map.len()?, 500);
    assert_eq!(map.get(b"k00249")?.as_deref(), Some(&b"b-249"[..]));
    assert_eq!(db.open_stree_list("l")?.len()?, 1);
    assert!(store.zone_by_id(0)?.is_none());
    store.close()?;
    store.delete()?;
    Ok(())
}

#[test]
fn compacting_twice_with_same_floor_changes_nothing() -> Result<()> {
    let root = unique_root("compact-idem");
    let (store, db) = Store::open_at(&root, cfg())?;
    fill_map(&db, "m", 300, "a")?;
    store.commit(Commit::best_effort())?;
    fill_map(&db, "m", 100, "b")?;
    store.commit(Commit::best_effort())?;

    let floor = db.pending_version();
    let first = store.compact(Compact::forced(floor))?;
    assert!(first.pages_rewritten > 0);
    let version = db.version();
    let size = store.zone()?.size();
    let germ_version = store.germ()?.version;

    let second = store.compact(Compact::forced(floor))?;
    assert!(!second.skipped);
    assert_eq!(second.pages_rewritten, 0);
    assert!(second.chunk.is_none());
    assert!(second.zones_retired.is_empty());
    assert_eq!(db.version(), version);
    assert_eq!(store.zone()?.size(), size);
    assert_eq!(store.germ()?.version, germ_version);

    store.close()?;
    store.delete()?;
    Ok(())
}

#[test]
fn fill_threshold_skips_compaction() -> Result<()> {
    let root = unique_root("compact-skip");
    let (store, db) = Store::open_at(&root, cfg())?;
    fill_map(&db, "m", 200, "a")?;
    store.commit(Commit::best_effort())?;

    let fill = db.fill()?;
    assert!(fill > 0.0 && fill <= 1.0);

    let report = store.compact(Compact::new(0.0, db.pending_version()))?;
    assert!(report.skipped);
    assert_eq!(report.pages_rewritten, 0);
    assert_eq!(store.metrics()?.compactions_skipped, 1);

    // Rewrite most of the map: live bytes drop well below the zone bytes.
    for _ in 0..3 {
        fill_map(&db, "m", 200, "b")?;
        fill_map(&db, "m", 200, "c")?;
        store.commit(Commit::best_effort())?;
    }
    let fill = db.fill()?;
    assert!(fill < 0.5, "fill {}", fill);
    let report = store.compact(Compact::new(0.5, db.pending_version()))?;
    assert!(!report.skipped);
    assert!(report.pages_rewritten > 0);
    store.close()?;
    store.delete()?;
    Ok(())
}

/// Zones still reachable from a live root are kept.
#[test]
fn referenced_zones_survive() -> Result<()> {
    let root = unique_root("compact-keep");
    let (store, db) = Store::open_at(&root, cfg())?;
    fill_map(&db, "old", 100, "a")?;
    store.commit(Commit::best_effort())?;
    store.shift_zone()?;
    fill_map(&db, "new", 100, "b")?;
    store.commit(Commit::best_effort())?;

    // Nothing below version 1 exists, so nothing moves and zone 0 stays.
    let report = store.compact(Compact::forced(1))?;
    assert_eq!(report.pages_rewritten, 0);
    assert!(report.zones_retired.is_empty());
    assert!(store.zone_by_id(0)?.is_some());

    let async_report = store.compact_async(Compact::forced(db.pending_version())).wait()?;
    assert!(async_report.pages_rewritten > 0);
    assert_eq!(async_report.zones_retired, vec![0]);
    assert_eq!(db.open_btree_map("old")?.len()?, 100);
    store.close()?;
    store.delete()?;
    Ok(())
}

/// A retired zone stays readable until the delete delay passes, so roots
/// and cursors taken before a shifted compaction keep working.
#[test]
fn snapshot_reads_retired_zone_until_delay() -> Result<()> {
    let root = unique_root("compact-snapshot");
    let (store, db) = Store::open_at(&root, cfg().with_delete_delay_ms(60_000))?;
    fill_map(&db, "m", 500, "a")?;
    store.commit(Commit::best_effort())?;

    let map = db.open_btree_map("m")?;
    let (old, cx) = map.snapshot()?;
    let mut cursor = map.cursor()?;
    assert_eq!(cursor.next().transpose()?.map(|(k, _)| k.to_vec()), Some(b"k00000".to_vec()));

    fill_map(&db, "m", 500, "b")?;
    store.commit(Commit::best_effort())?;
    let report = store.compact(Compact::forced(db.pending_version()).with_shift())?;
    assert_eq!(report.zones_retired, vec![0]);
    assert!(store.zone_by_id(0)?.is_none());
    assert_eq!(store.retiring_zones()?, vec![0]);
    assert!(root.join(zone_file_name(0)).exists());

    // Force the old pages to come from disk.
    store.clear_cache()?;
    assert_eq!(old.get(&cx, b"k00123")?.as_deref(), Some(&b"a-123"[..]));
    assert_eq!(old.len(), 500);
    let rest = cursor.collect::<Result<Vec<_>>>()?;
    assert_eq!(rest.len(), 499);
    assert!(rest.iter().all(|(_, v)| v.starts_with(b"a-")));

    assert_eq!(map.get(b"k00123")?.as_deref(), Some(&b"b-123"[..]));
    assert_eq!(store.metrics()?.zones_retired, 1);

    store.close()?;
    // Skip the delete delay.
    std::fs::remove_dir_all(&root)?;
    Ok(())
}
