use anyhow::Result;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use CanopyDB::consts::ZONE_HEAD_SIZE;
use CanopyDB::store::zone::zone_file_name;
use CanopyDB::{
    Bounds, Commit, I64Codec, IdentityProjection, Store, StoreConfig, StoreState, Tile, TreeError, TreeKind,
    Utf8Codec,
};

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
        .with_split_arity(8, 4)
}

fn is_state_error(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<TreeError>(), Some(TreeError::State(_)))
}

#[test]
fn reopen_returns_committed_data() -> Result<()> {
    let root = unique_root("reopen");
    {
        let (store, db) = Store::open_at(&root, cfg())?;
        let map = db.open_btree_map("users")?;
        for i in 0..300u32 {
            map.put(format!("user-{:04}", i).as_bytes(), format!("name {}", i).as_bytes())?;
        }
        map.remove(b"user-0007")?;

        let places = db.open_qtree_map("places", Arc::new(IdentityProjection))?;
        places.put_at(b"home", &Bounds::point(10.0, 20.0), b"h")?;
        places.put_at(b"park", &Bounds::new(0.0, 0.0, 63.0, 63.0), b"p")?;

        let log = db.open_stree_list("log")?;
        for i in 0..50u32 {
            log.append(format!("e{}", i).as_bytes(), &i.to_le_bytes())?;
        }
        log.drop_front(10)?;

        let counter = db.open_utree_value("counter")?;
        counter.set_with(&41i64, &I64Codec)?;

        let chunk = store.commit(Commit::best_effort())?.expect("dirty trees must be written");
        assert_eq!(chunk.version, 1);
        assert_eq!(db.version(), 1);
        assert_eq!(db.diff_size()?, 0);

        // Written after the commit; the close commits it.
        counter.set_with(&42i64, &I64Codec)?;
        store.close()?;
        assert_eq!(store.state(), StoreState::Closed);
    }

    let (store, db) = Store::open_at(&root, cfg())?;
    assert_eq!(db.version(), 2);
    assert_eq!(
        db.tree_names(),
        vec!["counter".to_string(), "log".to_string(), "places".to_string(), "users".to_string()]
    );
    assert_eq!(db.tree_kind("places"), Some(TreeKind::QTree));

    let map = db.open_btree_map("users")?;
    assert_eq!(map.len()?, 299);
    assert_eq!(map.get(b"user-0100")?.as_deref(), Some(&b"name 100"[..]));
    assert!(map.get(b"user-0007")?.is_none());
    let first: Vec<_> = map.cursor()?.take(2).collect::<Result<_>>()?;
    assert_eq!(&first[1].0[..], b"user-0001");

    let places = db.open_qtree_map("places", Arc::new(IdentityProjection))?;
    assert_eq!(places.get_at(b"home", &Bounds::point(10.0, 20.0))?.as_deref(), Some(&b"h"[..]));
    let hits = places.query(&Bounds::new(10.0, 20.0, 10.0, 20.0))?;
    assert_eq!(hits.len(), 2);
    let hits = places.get_all(100, 100, 200, 200)?;
    assert!(hits.is_empty());

    let log = db.open_stree_list("log")?;
    assert_eq!(log.len()?, 40);
    assert_eq!(log.get(0)?.as_deref(), Some(&10u32.to_le_bytes()[..]));
    assert_eq!(log.index_of(b"e49")?, Some(39));

    let counter = db.open_utree_value("counter")?;
    assert_eq!(counter.get_with(&I64Codec)?, 42);

    store.close()?;
    store.delete()?;
    assert!(!root.exists());
    Ok(())
}

#[test]
fn second_open_is_locked_out() -> Result<()> {
    let root = unique_root("locked");
    let (store, _db) = Store::open_at(&root, cfg())?;
    let other = Store::new(&root, cfg());
    assert!(other.open().is_err());
    assert_eq!(other.state(), StoreState::Closed);

    store.close()?;
    let db = other.open()?;
    assert_eq!(db.version(), 0);
    other.close()?;
    other.delete()?;
    Ok(())
}

#[test]
fn lifecycle_transitions() -> Result<()> {
    let root = unique_root("states");
    let store = Store::new(&root, cfg());
    assert_eq!(store.state(), StoreState::Closed);
    assert!(is_state_error(&store.close().unwrap_err()));
    assert!(is_state_error(&store.database().unwrap_err()));

    let db = store.open()?;
    assert_eq!(store.state(), StoreState::Open);
    assert!(is_state_error(&store.open().unwrap_err()));
    assert!(is_state_error(&store.delete().unwrap_err()));

    db.open_btree_map("t")?.put(b"k", b"v")?;
    assert!(db.open_stree_list("t").is_err());
    assert!(db.open_btree_map("").is_err());

    store.close()?;
    assert!(store.commit(Commit::best_effort()).is_err());
    assert!(is_state_error(&db.commit(Commit::forced()).unwrap_err()));

    // Reopening the same handle works.
    let db = store.open()?;
    assert_eq!(db.open_btree_map("t")?.get(b"k")?.as_deref(), Some(&b"v"[..]));
    store.close()?;
    store.delete()?;
    assert!(!root.exists());
    Ok(())
}

#[test]
fn commit_async_results_arrive_in_order() -> Result<()> {
    let root = unique_root("async");
    let (store, db) = Store::open_at(&root, cfg())?;
    let map = db.open_btree_map("m")?;

    let mut pending = Vec::new();
    for round in 0..6u32 {
        for i in 0..20u32 {
            map.put(format!("{}-{}", round, i).as_bytes(), b"x")?;
        }
        pending.push(db.commit_async(Commit::forced()));
    }
    let mut versions = Vec::new();
    for p in pending {
        let chunk = p.wait()?.expect("forced commits always write a chunk");
        versions.push(chunk.version);
    }
    assert_eq!(versions, vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(db.version(), 6);
    assert_eq!(map.len()?, 120);

    // Nothing dirty: a best-effort commit writes nothing.
    assert!(db.commit(Commit::best_effort())?.is_none());
    assert_eq!(db.version(), 6);

    let p = store.commit_async(Commit::forced());
    let chunk = loop {
        if let Some(r) = p.try_take() {
            break r?;
        }
        std::thread::sleep(std::time::Duration::from_millis(1));
    };
    assert_eq!(chunk.map(|c| c.version), Some(7));

    let m = store.metrics()?;
    assert_eq!(m.commits, 7);
    assert_eq!(m.commit_failures, 0);
    store.close()?;
    store.delete()?;
    Ok(())
}

/// A tree whose seed would not fit in the germ is refused at open; the
/// trees already registered still commit and reopen.
#[test]
fn tree_overflowing_the_germ_is_refused() -> Result<()> {
    let root = unique_root("germ-full");
    let (store, db) = Store::open_at(&root, cfg())?;
    db.open_btree_map("keep")?.put(b"a", b"1")?;

    let mut refused = None;
    for i in 0..80 {
        let name = format!("{:0>1000}", i);
        match db.open_btree_map(&name) {
            Ok(map) => map.put(b"k", b"v")?,
            Err(e) => {
                assert!(matches!(e.downcast_ref::<TreeError>(), Some(TreeError::GermFull { .. })));
                refused = Some(i);
                break;
            }
        }
    }
    let refused = refused.expect("the germ slot fills up");
    assert!(refused > 50, "refused after {} trees", refused);
    let last = format!("{:0>1000}", refused);
    assert!(db.tree_kind(&last).is_none());
    assert_eq!(db.tree_names().len(), refused + 1);
    // Refused for every kind, not just the one first asked for.
    assert!(db.open_stree_list(&last).is_err());

    store.commit(Commit::best_effort())?.expect("dirty trees");
    store.close()?;

    let db = store.open()?;
    assert_eq!(db.tree_names().len(), refused + 1);
    let first = format!("{:0>1000}", 0);
    assert_eq!(db.open_btree_map(&first)?.get(b"k")?.as_deref(), Some(&b"v"[..]));
    assert_eq!(db.open_btree_map("keep")?.get(b"a")?.as_deref(), Some(&b"1"[..]));
    store.close()?;
    store.delete()?;
    Ok(())
}

/// A commit that fails on I/O appends nothing and keeps every change dirty;
/// the same commit succeeds once the fault is gone.
#[test]
fn failed_commit_keeps_dirty_state() -> Result<()> {
    let root = unique_root("failed");
    let (store, db) = Store::open_at(&root, cfg())?;
    let map = db.open_btree_map("keep")?;
    map.put(b"a", b"1")?;
    store.commit(Commit::best_effort())?;
    let committed = store.zone()?.size();

    map.put(b"b", b"2")?;
    // A directory where the next zone's temp file goes makes the shift fail.
    let blocker = root.join(format!("{}.tmp", zone_file_name(1)));
    fs::create_dir(&blocker)?;
    let err = store.commit(Commit::best_effort().with_shift()).unwrap_err();
    assert!(format!("{:#}", err).contains("create"), "{:#}", err);
    assert_eq!(store.metrics()?.commit_failures, 1);
    assert_eq!(store.zones()?.len(), 1);
    assert_eq!(store.zone()?.size(), committed);
    assert_eq!(store.germ()?.version, 1);
    assert_eq!(db.version(), 1);
    assert!(db.diff_size()? > 0);
    assert_eq!(map.get(b"b")?.as_deref(), Some(&b"2"[..]));

    fs::remove_dir(&blocker)?;
    let chunk = store.commit(Commit::best_effort().with_shift())?.expect("change kept dirty");
    assert_eq!((chunk.zone, chunk.version), (1, 2));
    assert_eq!(db.diff_size()?, 0);
    store.close()?;

    let db = store.open()?;
    let map = db.open_btree_map("keep")?;
    assert_eq!(map.get(b"a")?.as_deref(), Some(&b"1"[..]));
    assert_eq!(map.get(b"b")?.as_deref(), Some(&b"2"[..]));
    store.close()?;
    store.delete()?;
    Ok(())
}

#[test]
fn handles_cover_every_tree_kind() -> Result<()> {
    let root = unique_root("handles");
    let (store, db) = Store::open_at(&root, cfg())?;

    let map = db.open_btree_map("m")?;
    map.put_with(b"greeting", &"hello".to_string(), &Utf8Codec)?;
    assert_eq!(map.get_with(b"greeting", &Utf8Codec)?, Some("hello".to_string()));
    assert!(map.remove(b"greeting")?);
    assert!(!map.remove(b"greeting")?);
    for i in 0..40u32 {
        map.put(&i.to_be_bytes(), b"v")?;
    }
    map.drop_front(10)?;
    map.take_front(20)?;
    assert_eq!(map.len()?, 20);
    assert_eq!(map.get_index(0)?.map(|(k, _)| k.to_vec()), Some(10u32.to_be_bytes().to_vec()));

    let list = db.open_stree_list("l")?;
    list.append(b"b", b"2")?;
    list.prepend(b"a", b"1")?;
    list.insert(2, b"c", b"3")?;
    assert!(list.update(1, b"two")?);
    assert!(!list.update(1, b"two")?);
    assert!(list.remove(0)?);
    assert!(!list.remove(9)?);
    let values: Vec<Vec<u8>> = list.values()?.iter().map(|v| v.to_vec()).collect();
    assert_eq!(values, vec![b"two".to_vec(), b"3".to_vec()]);

    let cell = db.open_utree_value("u")?;
    assert!(cell.get()?.is_empty());
    assert!(cell.set(b"x")?);
    assert!(!cell.set(b"x")?);

    let spatial = db.open_qtree_map("s", Arc::new(IdentityProjection))?;
    let (x, y) = (Tile::point(3)?, Tile::point(4)?);
    spatial.put(b"car", x, y, b"red")?;
    assert!(spatial.moved(b"car", (x, y), (Tile::point(30)?, Tile::point(40)?))?);
    assert!(!spatial.moved(b"car", (x, y), (Tile::point(1)?, Tile::point(1)?))?);
    assert!(spatial.get(b"car", x, y)?.is_none());
    assert_eq!(spatial.cursor_at(30, 40)?.count(), 1);

    let infos = db.trees()?;
    assert_eq!(infos.len(), 4);
    assert!(infos.iter().all(|t| t.diff_size > 0 && t.tree_size == 0));

    store.commit(Commit::best_effort())?;
    let infos = db.trees()?;
    assert!(infos.iter().all(|t| t.diff_size == 0 && t.tree_size > 0));
    assert!(db.tree_size()? <= store.zone()?.size() - ZONE_HEAD_SIZE);

    store.close()?;
    store.delete()?;
    Ok(())
}

#[test]
fn delete_removes_every_zone() -> Result<()> {
    let root = unique_root("delete");
    let (store, db) = Store::open_at(&root, cfg())?;
    db.open_btree_map("m")?.put(b"k", b"v")?;
    store.commit(Commit::best_effort())?;
    store.shift_zone()?;
    store.commit(Commit::forced())?;
    assert_eq!(store.zones()?.len(), 2);
    store.close()?;
    assert!(fs::read_dir(&root)?.count() >= 2);
    store.delete()?;
    assert!(!root.exists());
    Ok(())
}
