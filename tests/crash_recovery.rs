use anyhow::Result;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use CanopyDB::consts::GERM_SIZE;
use CanopyDB::store::zone::zone_file_name;
use CanopyDB::{Commit, Store, StoreConfig, TreeError};

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("canopy-{}-{}-{}", prefix, pid, t))
}

fn cfg() -> StoreConfig {
    StoreConfig::default().with_data_fsync(false)
}

fn read_slot(zone: &Path, slot: u64) -> Result<Vec<u8>> {
    let mut f = OpenOptions::new().read(true).open(zone)?;
    f.seek(SeekFrom::Start(slot * GERM_SIZE))?;
    let mut buf = vec![0u8; GERM_SIZE as usize];
    f.read_exact(&mut buf)?;
    Ok(buf)
}

fn write_at(zone: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new().write(true).open(zone)?;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(bytes)?;
    f.sync_all()?;
    Ok(())
}

/// Commit A, keep its germ image, then commit B. Returns (root, germ A).
fn two_commits(prefix: &str) -> Result<(PathBuf, Vec<u8>)> {
    let root = unique_root(prefix);
    let (store, db) = Store::open_at(&root, cfg())?;
    let map = db.open_btree_map("m")?;
    map.put(b"a", b"1")?;
    store.commit(Commit::best_effort())?;
    let germ_a = read_slot(&root.join(zone_file_name(0)), 1)?;

    map.put(b"b", b"2")?;
    map.put(b"a", b"1'")?;
    store.commit(Commit::best_effort())?;
    store.close()?;
    Ok((root, germ_a))
}

/// Interrupted while writing the first germ copy: slot 0 is torn, slot 1
/// still holds the previous commit. Recovery lands on A, never a mix.
#[test]
fn torn_first_copy_recovers_previous_commit() -> Result<()> {
    let (root, germ_a) = two_commits("torn0")?;
    let zone = root.join(zone_file_name(0));
    write_at(&zone, GERM_SIZE, &germ_a)?;
    write_at(&zone, 24, &[0xEE; 64])?;

    let (store, db) = Store::open_at(&root, cfg())?;
    assert_eq!(db.version(), 1);
    let map = db.open_btree_map("m")?;
    assert_eq!(map.get(b"a")?.as_deref(), Some(&b"1"[..]));
    assert!(map.get(b"b")?.is_none());

    // The store keeps appending after the orphaned chunk of B.
    map.put(b"c", b"3")?;
    let chunk = store.commit(Commit::best_effort())?.expect("dirty map");
    assert_eq!(chunk.version, 2);
    store.close()?;

    let (store, db) = Store::open_at(&root, cfg())?;
    let map = db.open_btree_map("m")?;
    assert_eq!(map.get(b"c")?.as_deref(), Some(&b"3"[..]));
    assert!(map.get(b"b")?.is_none());
    store.close()?;
    store.delete()?;
    Ok(())
}

/// Interrupted after the first copy but before the second: slot 0 holds the
/// complete germ of B, slot 1 still A. Recovery picks B.
#[test]
fn complete_first_copy_recovers_new_commit() -> Result<()> {
    let (root, germ_a) = two_commits("torn1")?;
    let zone = root.join(zone_file_name(0));
    write_at(&zone, GERM_SIZE, &germ_a)?;

    let (store, db) = Store::open_at(&root, cfg())?;
    assert_eq!(db.version(), 2);
    let map = db.open_btree_map("m")?;
    assert_eq!(map.get(b"a")?.as_deref(), Some(&b"1'"[..]));
    assert_eq!(map.get(b"b")?.as_deref(), Some(&b"2"[..]));
    store.close()?;
    store.delete()?;
    Ok(())
}

#[test]
fn both_copies_corrupt_is_an_error() -> Result<()> {
    let (root, _) = two_commits("torn2")?;
    let zone = root.join(zone_file_name(0));
    write_at(&zone, 24, &[0xEE; 64])?;
    write_at(&zone, GERM_SIZE + 24, &[0xEE; 64])?;

    let store = Store::new(&root, cfg());
    let err = store.open().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<TreeError>(),
        Some(TreeError::CorruptGerm { zone: 0, .. })
    ));
    fs::remove_dir_all(&root)?;
    Ok(())
}

/// A torn tail chunk after the last germ does not stop the store from
/// opening; its bytes are never referenced.
#[test]
fn garbage_after_last_chunk_is_ignored() -> Result<()> {
    let (root, _) = two_commits("tail")?;
    let zone = root.join(zone_file_name(0));
    let len = fs::metadata(&zone)?.len();
    write_at(&zone, len, b"CZCK partial chunk header")?;

    let (store, db) = Store::open_at(&root, cfg())?;
    assert_eq!(db.version(), 2);
    let map = db.open_btree_map("m")?;
    map.put(b"d", b"4")?;
    store.commit(Commit::best_effort())?;
    store.close()?;

    let (store, db) = Store::open_at(&root, cfg())?;
    assert_eq!(db.open_btree_map("m")?.len()?, 3);
    store.close()?;
    store.delete()?;
    Ok(())
}
