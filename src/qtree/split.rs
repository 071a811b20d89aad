//! qtree/split — partitioning and balancing of spatial pages.
//!
//! A split distributes a page's items (entries and, for nodes, children)
//! into the halves of its covering tile one rank finer: quadrants when both
//! axes can be halved, otherwise a single axis. Whichever layout lifts the
//! fewest items wins. Items that straddle a boundary stay at the splitting
//! page: entries as lifted slots, children as direct children. A bucket whose
//! cover would intersect a direct child is dissolved back into the page, so
//! child covers stay pairwise disjoint.

use anyhow::Result;
use std::sync::Arc;

use super::page::{sort_slots, QTreeEntry, QTreeHint, QTreePage};
use super::tile::Tile;
use crate::page::{PageRef, TreeContext, TreePage};
use crate::policy::{PageStats, ProjectedStats};

enum Item {
    Entry(QTreeEntry),
    Child(PageRef<QTreePage>),
}

impl Item {
    fn hint(&self) -> QTreeHint {
        match self {
            Item::Entry(e) => e.hint(),
            Item::Child(c) => c.hint(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axes {
    Both,
    X,
    Y,
}

fn half_of(outer: Tile, inner: Tile) -> Option<usize> {
    if outer.half(0)?.contains(inner) {
        Some(0)
    } else if outer.half(1)?.contains(inner) {
        Some(1)
    } else {
        None
    }
}

fn bucket_of(cover: &QTreeHint, axes: Axes, hint: &QTreeHint) -> Option<usize> {
    let qx = match axes {
        Axes::Both | Axes::X => half_of(cover.x, hint.x)?,
        Axes::Y => 0,
    };
    let qy = match axes {
        Axes::Both | Axes::Y => half_of(cover.y, hint.y)?,
        Axes::X => 0,
    };
    Some(qx + 2 * qy)
}

fn bucket_cover(items: &[Item]) -> Option<QTreeHint> {
    items.iter().map(|i| i.hint()).reduce(|a, b| a.union(&b))
}

/// Partition `items`; None when no layout makes progress.
fn split_items(
    items: Vec<Item>,
    cover: &QTreeHint,
    version: u64,
) -> Option<(Vec<PageRef<QTreePage>>, Vec<QTreeEntry>)> {
    let total = items.len();
    let mut best: Option<(Axes, usize)> = None;
    for axes in [Axes::Both, Axes::X, Axes::Y] {
        let lifted = items
            .iter()
            .filter(|i| bucket_of(cover, axes, &i.hint()).is_none())
            .count();
        if lifted < total && best.map_or(true, |(_, b)| lifted < b) {
            best = Some((axes, lifted));
        }
    }
    let (axes, _) = best?;

    let mut buckets: [Vec<Item>; 4] = Default::default();
    let mut direct: Vec<PageRef<QTreePage>> = Vec::new();
    let mut lifted: Vec<QTreeEntry> = Vec::new();
    for item in items {
        match bucket_of(cover, axes, &item.hint()) {
            Some(q) => buckets[q].push(item),
            None => match item {
                Item::Child(c) => direct.push(c),
                Item::Entry(e) => lifted.push(e),
            },
        }
    }

    // Dissolving a bucket adds direct children, which can in turn overlap
    // another bucket; repeat until stable.
    loop {
        let mut dissolved = false;
        for bucket in buckets.iter_mut() {
            let bc = match bucket_cover(bucket) {
                Some(bc) => bc,
                None => continue,
            };
            if direct.iter().any(|d| d.hint().intersects(&bc)) {
                for item in bucket.drain(..) {
                    match item {
                        Item::Child(c) => direct.push(c),
                        Item::Entry(e) => lifted.push(e),
                    }
                }
                dissolved = true;
            }
        }
        if !dissolved {
            break;
        }
    }
    if direct.len() + lifted.len() == total {
        return None;
    }

    let mut children = direct;
    for bucket in buckets.iter_mut() {
        if bucket.is_empty() {
            continue;
        }
        let mut entries = Vec::new();
        let mut kids = Vec::new();
        for item in bucket.drain(..) {
            match item {
                Item::Entry(e) => entries.push(e),
                Item::Child(c) => kids.push(c),
            }
        }
        sort_slots(&mut entries);
        let page = if kids.is_empty() {
            QTreePage::leaf(entries, version)
        } else if kids.len() == 1 && entries.is_empty() {
            children.extend(kids);
            continue;
        } else {
            QTreePage::node(kids, entries, version)
        };
        children.push(PageRef::resident(Arc::new(page)));
    }
    sort_slots(&mut lifted);
    Some((children, lifted))
}

/// One split step of `page`; None when its contents cannot be partitioned.
pub(crate) fn split_page(page: &QTreePage, version: u64) -> Option<QTreePage> {
    let cover = page.cover()?;
    let mut items: Vec<Item> = page
        .child_refs()
        .iter()
        .filter(|c| c.span() > 0)
        .cloned()
        .map(Item::Child)
        .collect();
    items.extend(page.slots().iter().cloned().map(Item::Entry));
    let (children, lifted) = split_items(items, &cover, version)?;
    Some(QTreePage::node(children, lifted, version))
}

fn collect_entries(r: &PageRef<QTreePage>, cx: &TreeContext, out: &mut Vec<QTreeEntry>) -> Result<()> {
    if r.span() == 0 {
        return Ok(());
    }
    let page = r.page(cx)?;
    out.extend_from_slice(page.slots());
    for c in page.child_refs() {
        collect_entries(c, cx, out)?;
    }
    Ok(())
}

fn balance_children(page: &Arc<QTreePage>, cx: &TreeContext, version: u64) -> Result<Option<QTreePage>> {
    let mut changed = false;
    let mut children = Vec::with_capacity(page.child_refs().len());
    for c in page.child_refs() {
        let b = balanced_ref(c, cx, version)?;
        if b.span() == 0 {
            changed = true;
            continue;
        }
        if !b.same_page(c) {
            changed = true;
        }
        children.push(b);
    }
    if !changed {
        return Ok(None);
    }
    Ok(Some(QTreePage::node(children, page.slots().to_vec(), version)))
}

/// Balance every page touched at `version` below and including `r`.
pub(crate) fn balanced_ref(
    r: &PageRef<QTreePage>,
    cx: &TreeContext,
    version: u64,
) -> Result<PageRef<QTreePage>> {
    if !r.touched_at(version) {
        return Ok(r.clone());
    }
    let original = r.page(cx)?;
    let mut page = original.clone();

    if !page.is_leaf() {
        if let Some(p) = balance_children(&page, cx, version)? {
            page = Arc::new(p);
        }
        if page.child_refs().is_empty() {
            page = Arc::new(QTreePage::leaf(page.slots().to_vec(), version));
        } else if page.child_refs().len() == 1 && page.slots().is_empty() {
            return Ok(page.child_refs()[0].clone());
        } else if cx.should_merge(&*page)
            && !cx.should_split(&ProjectedStats {
                arity: page.span() as usize,
                span: page.span(),
                is_leaf: true,
            })
        {
            let mut entries = Vec::with_capacity(page.span() as usize);
            collect_entries(&PageRef::resident(page.clone()), cx, &mut entries)?;
            sort_slots(&mut entries);
            page = Arc::new(QTreePage::leaf(entries, version));
        }
    }

    if cx.should_split(&*page) {
        if let Some(split) = split_page(&page, version) {
            let split = Arc::new(split);
            // Buckets are new pages at `version`; they may still be too big.
            let page = match balance_children(&split, cx, version)? {
                Some(p) => Arc::new(p),
                None => split,
            };
            return Ok(PageRef::resident(page));
        }
    }

    if Arc::ptr_eq(&page, &original) {
        return Ok(r.clone());
    }
    Ok(PageRef::resident(page))
}

/// Forced single split, regardless of policy.
pub(crate) fn split_ref(r: &PageRef<QTreePage>, cx: &TreeContext, version: u64) -> Result<PageRef<QTreePage>> {
    let page = r.page(cx)?;
    Ok(match split_page(&page, version) {
        Some(split) => PageRef::resident(Arc::new(split)),
        None => r.clone(),
    })
}
