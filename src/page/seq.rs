//! page/seq — positional split/merge machinery.
//!
//! Ordered-map pages and sequence pages share one shape: a leaf is a list of
//! slots, a node is a list of children with `children - 1` separators
//! between them (keys for the map, `()` for the sequence). Everything here
//! works on that shape only, so both trees get identical balancing,
//! prefix drop/take and index lookup.
//!
//! Balancing only descends into refs touched at the balancing version
//! (dirty and stamped with it); untouched subtrees are never loaded.

use anyhow::Result;
use std::borrow::Cow;
use std::sync::Arc;

use super::{PageRef, TreeContext, TreePage};
use crate::policy::ProjectedStats;

pub(crate) trait Sequenced: TreePage {
    type Slot: Clone + Send + Sync;
    type Sep: Clone + Send + Sync;

    /// Leaf slots (empty for nodes).
    fn leaf_slots(&self) -> &[Self::Slot];
    /// Node separators (empty for leaves).
    fn node_seps(&self) -> Cow<'_, [Self::Sep]>;

    fn make_leaf(slots: Vec<Self::Slot>, version: u64) -> Self;
    fn make_node(children: Vec<PageRef<Self>>, seps: Vec<Self::Sep>, version: u64) -> Self;

    /// Separator placed in front of a right half starting with `first`.
    fn leaf_sep(first: &Self::Slot) -> Self::Sep;
}

/// Result of balancing one page: consecutive siblings with separators.
pub(crate) struct Pieces<P: Sequenced> {
    pub refs: Vec<PageRef<P>>,
    pub seps: Vec<P::Sep>,
}

impl<P: Sequenced> Pieces<P> {
    fn single(r: PageRef<P>) -> Self {
        Self {
            refs: vec![r],
            seps: Vec::new(),
        }
    }

    fn append(&mut self, sep: Option<P::Sep>, other: Pieces<P>) {
        if let Some(s) = sep {
            self.seps.push(s);
        }
        self.refs.extend(other.refs);
        self.seps.extend(other.seps);
    }
}

pub(crate) fn empty_ref<P: Sequenced>(version: u64) -> PageRef<P> {
    PageRef::resident(Arc::new(P::make_leaf(Vec::new(), version)))
}

// ---------------- split / merge ----------------

fn split_half<P: Sequenced>(page: &P, version: u64) -> (P, P::Sep, P) {
    if page.is_leaf() {
        let slots = page.leaf_slots();
        let m = slots.len() / 2;
        let sep = P::leaf_sep(&slots[m]);
        (
            P::make_leaf(slots[..m].to_vec(), version),
            sep,
            P::make_leaf(slots[m..].to_vec(), version),
        )
    } else {
        let children = page.child_refs();
        let seps = page.node_seps();
        let m = children.len() / 2;
        (
            P::make_node(children[..m].to_vec(), seps[..m - 1].to_vec(), version),
            seps[m - 1].clone(),
            P::make_node(children[m..].to_vec(), seps[m..].to_vec(), version),
        )
    }
}

fn merge_pair<P: Sequenced>(left: &P, right: &P, sep: P::Sep, version: u64) -> P {
    if left.is_leaf() {
        let mut slots = Vec::with_capacity(left.leaf_slots().len() + right.leaf_slots().len());
        slots.extend_from_slice(left.leaf_slots());
        slots.extend_from_slice(right.leaf_slots());
        P::make_leaf(slots, version)
    } else {
        let mut children = left.child_refs().to_vec();
        children.extend_from_slice(right.child_refs());
        let mut seps = left.node_seps().to_vec();
        seps.push(sep);
        seps.extend_from_slice(&right.node_seps());
        P::make_node(children, seps, version)
    }
}

/// Halve `page` recursively until the policy no longer asks for a split.
/// An unsplit page comes back as the same `Arc`.
fn split_fully<P: Sequenced>(page: Arc<P>, cx: &TreeContext, version: u64) -> Pieces<P> {
    if page.arity() < 2 || !cx.should_split(&*page) {
        return Pieces::single(PageRef::resident(page));
    }
    let (left, sep, right) = split_half(&*page, version);
    let mut out = split_fully(Arc::new(left), cx, version);
    out.append(Some(sep), split_fully(Arc::new(right), cx, version));
    out
}

// ---------------- balancing ----------------

fn balance_page<P: Sequenced>(page: &Arc<P>, cx: &TreeContext, version: u64) -> Result<Pieces<P>> {
    if page.is_leaf() {
        return Ok(split_fully(page.clone(), cx, version));
    }

    let children = page.child_refs();
    let seps = page.node_seps();
    let mut changed = false;
    let mut out = Pieces {
        refs: Vec::with_capacity(children.len()),
        seps: Vec::with_capacity(seps.len()),
    };

    for (i, child) in children.iter().enumerate() {
        let sep = if i > 0 { Some(seps[i - 1].clone()) } else { None };
        if child.touched_at(version) {
            let cp = child.page(cx)?;
            let pieces = balance_page(&cp, cx, version)?;
            if pieces.refs.len() != 1 || !pieces.refs[0].same_page(child) {
                changed = true;
            }
            out.append(sep, pieces);
        } else {
            out.append(sep, Pieces::single(child.clone()));
        }
    }

    // Empty children go together with one neighbouring separator.
    let mut i = 0;
    while i < out.refs.len() {
        if out.refs[i].span() == 0 {
            out.refs.remove(i);
            if !out.seps.is_empty() {
                out.seps.remove(if i > 0 { i - 1 } else { 0 });
            }
            changed = true;
        } else {
            i += 1;
        }
    }
    if out.refs.is_empty() {
        return Ok(Pieces::single(empty_ref(version)));
    }

    // Under-full touched children merge with an adjacent sibling of the
    // same level, then re-split if the merge overshoots.
    let mut i = 0;
    while i < out.refs.len() {
        let r = &out.refs[i];
        let underfull = out.refs.len() > 1
            && r.touched_at(version)
            && cx.should_merge(&ProjectedStats {
                arity: resident_arity(r),
                span: r.span(),
                is_leaf: r.is_leaf(),
            });
        if !underfull {
            i += 1;
            continue;
        }
        let leaf = r.is_leaf();
        let j = if i + 1 < out.refs.len() && out.refs[i + 1].is_leaf() == leaf {
            i + 1
        } else if i > 0 && out.refs[i - 1].is_leaf() == leaf {
            i - 1
        } else {
            i += 1;
            continue;
        };
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        let left = out.refs[a].page(cx)?;
        let right = out.refs[b].page(cx)?;
        let merged = merge_pair(&*left, &*right, out.seps[a].clone(), version);
        let pieces = split_fully(Arc::new(merged), cx, version);
        let produced = pieces.refs.len();
        out.refs.splice(a..=b, pieces.refs);
        out.seps.splice(a..a + 1, pieces.seps);
        changed = true;
        // A single merged piece is examined again; it may still be under-full.
        i = if produced == 1 { a } else { a + produced };
    }

    if !changed {
        return Ok(split_fully(page.clone(), cx, version));
    }
    let node = P::make_node(out.refs, out.seps, version);
    Ok(split_fully(Arc::new(node), cx, version))
}

fn resident_arity<P: Sequenced>(r: &PageRef<P>) -> usize {
    r.resident_page().map(|p| p.arity()).unwrap_or(usize::MAX)
}

/// Balance a root: split/merge every page touched at `version`, grow new
/// root levels while the top is too wide, collapse single-child roots.
pub(crate) fn balanced<P: Sequenced>(
    root: &PageRef<P>,
    cx: &TreeContext,
    version: u64,
) -> Result<PageRef<P>> {
    if !root.touched_at(version) {
        return Ok(root.clone());
    }
    let page = root.page(cx)?;
    let mut pieces = balance_page(&page, cx, version)?;
    while pieces.refs.len() > 1 {
        let width = pieces.refs.len();
        let node = Arc::new(P::make_node(pieces.refs, pieces.seps, version));
        pieces = split_fully(node.clone(), cx, version);
        // A policy that splits every node would never let the root settle.
        if pieces.refs.len() >= width {
            log::debug!("policy splits a {}-wide root without progress; keeping it whole", width);
            pieces = Pieces::single(PageRef::resident(node));
        }
    }
    let mut top = match pieces.refs.pop() {
        Some(r) => r,
        None => empty_ref(version),
    };
    loop {
        let next = match top.resident_page() {
            Some(p) if !p.is_leaf() && p.child_refs().len() == 1 => p.child_refs()[0].clone(),
            Some(p) if !p.is_leaf() && p.child_refs().is_empty() => empty_ref(version),
            _ => break,
        };
        top = next;
    }
    if top.same_page(root) {
        return Ok(root.clone());
    }
    Ok(top)
}

// ---------------- positional access ----------------

/// Slot at position `index`, or None past the end.
pub(crate) fn get_index<P: Sequenced>(
    root: &PageRef<P>,
    cx: &TreeContext,
    mut index: u64,
) -> Result<Option<P::Slot>> {
    if index >= root.span() {
        return Ok(None);
    }
    let mut page = root.page(cx)?;
    loop {
        if page.is_leaf() {
            return Ok(page.leaf_slots().get(index as usize).cloned());
        }
        let mut next = None;
        for c in page.child_refs() {
            if index < c.span() {
                next = Some(c.page(cx)?);
                break;
            }
            index -= c.span();
        }
        match next {
            Some(p) => page = p,
            None => return Ok(None),
        }
    }
}

/// Child index containing position `index` and the offset inside it.
/// `index == span` resolves to the end of the last child.
pub(crate) fn locate<P: Sequenced>(page: &P, mut index: u64) -> (usize, u64) {
    let children = page.child_refs();
    for (i, c) in children.iter().enumerate() {
        if index < c.span() {
            return (i, index);
        }
        index -= c.span();
    }
    let last = children.len().saturating_sub(1);
    (last, children.get(last).map(|c| c.span()).unwrap_or(0) + index)
}

/// Remove the first `n` entries. Only the boundary path is rewritten.
pub(crate) fn drop_prefix<P: Sequenced>(
    root: &PageRef<P>,
    cx: &TreeContext,
    n: u64,
    version: u64,
) -> Result<PageRef<P>> {
    if n == 0 {
        return Ok(root.clone());
    }
    if n >= root.span() {
        return Ok(empty_ref(version));
    }
    let page = root.page(cx)?;
    if page.is_leaf() {
        let slots = page.leaf_slots()[n as usize..].to_vec();
        return Ok(PageRef::resident(Arc::new(P::make_leaf(slots, version))));
    }
    let children = page.child_refs();
    let seps = page.node_seps();
    let mut rest = n;
    let mut i = 0;
    while rest >= children[i].span() {
        rest -= children[i].span();
        i += 1;
    }
    let mut kept = Vec::with_capacity(children.len() - i);
    kept.push(drop_prefix(&children[i], cx, rest, version)?);
    kept.extend_from_slice(&children[i + 1..]);
    let kept_seps = seps[i..].to_vec();
    Ok(PageRef::resident(Arc::new(P::make_node(kept, kept_seps, version))))
}

/// Keep the first `n` entries. Only the boundary path is rewritten.
pub(crate) fn take_prefix<P: Sequenced>(
    root: &PageRef<P>,
    cx: &TreeContext,
    n: u64,
    version: u64,
) -> Result<PageRef<P>> {
    if n >= root.span() {
        return Ok(root.clone());
    }
    if n == 0 {
        return Ok(empty_ref(version));
    }
    let page = root.page(cx)?;
    if page.is_leaf() {
        let slots = page.leaf_slots()[..n as usize].to_vec();
        return Ok(PageRef::resident(Arc::new(P::make_leaf(slots, version))));
    }
    let mut rest = n;
    let mut kept = Vec::new();
    for c in page.child_refs() {
        if rest == 0 {
            break;
        }
        if rest >= c.span() {
            rest -= c.span();
            kept.push(c.clone());
        } else {
            kept.push(take_prefix(c, cx, rest, version)?);
            rest = 0;
        }
    }
    let kept_seps = page.node_seps()[..kept.len() - 1].to_vec();
    Ok(PageRef::resident(Arc::new(P::make_node(kept, kept_seps, version))))
}

/// In-order walk over every slot (loads pages on demand).
pub(crate) fn for_each_slot<P: Sequenced, F>(root: &PageRef<P>, cx: &TreeContext, f: &mut F) -> Result<()>
where
    F: FnMut(&P::Slot) -> Result<()>,
{
    if root.span() == 0 {
        return Ok(());
    }
    let page = root.page(cx)?;
    if page.is_leaf() {
        for s in page.leaf_slots() {
            f(s)?;
        }
        return Ok(());
    }
    for c in page.child_refs() {
        for_each_slot(c, cx, f)?;
    }
    Ok(())
}
