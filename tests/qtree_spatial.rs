use anyhow::Result;
use std::collections::BTreeSet;
use std::sync::Arc;

use CanopyDB::page::TreeContext;
use CanopyDB::qtree::QTree;
use CanopyDB::{bytes, ArityPolicy, QTreeEntry, Tile};

fn cx(split: usize) -> TreeContext {
    TreeContext::new(2, Arc::new(ArityPolicy::new(split)))
}

fn pt(v: u64) -> Tile {
    Tile::point(v).unwrap()
}

fn values(hits: &[QTreeEntry]) -> BTreeSet<Vec<u8>> {
    hits.iter().map(|e| e.value.to_vec()).collect()
}

fn keys(hits: &[QTreeEntry]) -> BTreeSet<Vec<u8>> {
    hits.iter().map(|e| e.key.to_vec()).collect()
}

#[test]
fn four_points_after_split() -> Result<()> {
    let cx = cx(1024);
    let mut t = QTree::empty(1);
    let points = [(2, 2), (2, 6), (6, 2), (6, 6)];
    for (i, (x, y)) in points.iter().enumerate() {
        let tag = format!("v{}", i);
        t = t.updated(&cx, tag.as_bytes(), pt(*x), pt(*y), bytes(tag.as_bytes()), 1)?;
    }
    t = t.split(&cx, 1)?;
    assert!(!t.root().is_leaf());
    assert_eq!(t.len(), 4);

    let left = t.get_all(&cx, 2, 2, 2, 6)?;
    let want: BTreeSet<Vec<u8>> = [b"v0".to_vec(), b"v1".to_vec()].into_iter().collect();
    assert_eq!(values(&left), want);

    let all = t.get_all(&cx, 1, 1, 7, 7)?;
    assert_eq!(all.len(), 4);
    Ok(())
}

struct Item {
    key: Vec<u8>,
    x: Tile,
    y: Tile,
}

fn brute(items: &[Item], x0: u64, y0: u64, x1: u64, y1: u64) -> BTreeSet<Vec<u8>> {
    items
        .iter()
        .filter(|it| it.x.overlaps(x0, x1) && it.y.overlaps(y0, y1))
        .map(|it| it.key.clone())
        .collect()
}

fn random_box(rng: &mut oorandom::Rand64, side: u64) -> (u64, u64, u64, u64) {
    let a = rng.rand_range(0..side);
    let b = rng.rand_range(0..side);
    let c = rng.rand_range(0..side);
    let d = rng.rand_range(0..side);
    (a.min(b), c.min(d), a.max(b), c.max(d))
}

fn check_queries(t: &QTree, cx: &TreeContext, items: &[Item], rng: &mut oorandom::Rand64, side: u64) -> Result<()> {
    for _ in 0..200 {
        let (x0, y0, x1, y1) = random_box(rng, side);
        let got = keys(&t.get_all(cx, x0, y0, x1, y1)?);
        assert_eq!(got, brute(items, x0, y0, x1, y1), "box ({},{})..({},{})", x0, y0, x1, y1);
    }
    let everything = keys(&t.get_all(cx, 0, 0, side - 1, side - 1)?);
    assert_eq!(everything.len(), items.len());
    Ok(())
}

/// Distinct rank-0 points only: no entry ever needs lifting.
#[test]
fn point_queries_match_brute_force() -> Result<()> {
    let side = 4096;
    let cx = cx(8);
    let mut rng = oorandom::Rand64::new(7);
    let mut t = QTree::empty(1);
    let mut items = Vec::new();
    let mut seen = BTreeSet::new();
    while items.len() < 800 {
        let (x, y) = (rng.rand_range(0..side), rng.rand_range(0..side));
        if !seen.insert((x, y)) {
            continue;
        }
        let key = format!("p{}", items.len()).into_bytes();
        let version = 1 + items.len() as u64 / 64;
        t = t.updated(&cx, &key, pt(x), pt(y), bytes(b"v"), version)?;
        t = t.balanced(&cx, version)?;
        items.push(Item { key, x: pt(x), y: pt(y) });
    }
    assert!(!t.root().is_leaf());
    check_queries(&t, &cx, &items, &mut rng, side)
}

/// Overlapping tiles of mixed ranks, so some entries are lifted above leaf
/// level; queries stay exact before and after removals.
#[test]
fn mixed_rank_queries_match_brute_force() -> Result<()> {
    let side = 1024;
    let cx = cx(6);
    let mut rng = oorandom::Rand64::new(99);
    let mut t = QTree::empty(1);
    let mut items = Vec::new();
    for i in 0..600u64 {
        let rank = match rng.rand_range(0..10) {
            0..=5 => 0,
            6 | 7 => rng.rand_range(1..4) as u32,
            _ => rng.rand_range(4..9) as u32,
        };
        let x = Tile::new(rank, rng.rand_range(0..side))?;
        let y = Tile::new(rank, rng.rand_range(0..side))?;
        let key = format!("e{}", i).into_bytes();
        let version = 1 + i / 50;
        t = t.updated(&cx, &key, x, y, bytes(&i.to_le_bytes()), version)?;
        if i % 10 == 9 {
            t = t.balanced(&cx, version)?;
        }
        items.push(Item { key, x, y });
    }
    let version = 100;
    t = t.balanced(&cx, version)?;
    assert_eq!(t.len(), items.len() as u64);
    for it in &items {
        assert!(t.get(&cx, &it.key, it.x, it.y)?.is_some());
    }
    check_queries(&t, &cx, &items, &mut rng, side)?;

    // Remove every third entry.
    let mut kept = Vec::new();
    for (i, it) in items.into_iter().enumerate() {
        if i % 3 == 0 {
            t = t.removed(&cx, &it.key, it.x, it.y, version + 1)?;
        } else {
            kept.push(it);
        }
    }
    t = t.balanced(&cx, version + 1)?;
    assert_eq!(t.len(), kept.len() as u64);
    check_queries(&t, &cx, &kept, &mut rng, side)
}

#[test]
fn same_key_at_two_places_are_two_entries() -> Result<()> {
    let cx = cx(4);
    let t = QTree::empty(1)
        .updated(&cx, b"k", pt(1), pt(1), bytes(b"a"), 1)?
        .updated(&cx, b"k", pt(9), pt(9), bytes(b"b"), 1)?;
    assert_eq!(t.len(), 2);
    assert_eq!(t.get(&cx, b"k", pt(1), pt(1))?, Some(bytes(b"a")));
    assert_eq!(t.get(&cx, b"k", pt(9), pt(9))?, Some(bytes(b"b")));
    assert!(t.get(&cx, b"k", pt(1), pt(9))?.is_none());
    Ok(())
}
