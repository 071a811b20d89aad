//! page — common node abstraction shared by every tree kind.
//!
//! Submodules:
//! - block.rs — binary page block (header + CRC32C + optional zstd body).
//! - seq.rs   — positional split/merge/drop/take machinery shared by the
//!              ordered-map and sequence trees.
//!
//! A page is an immutable value behind an `Arc`. Parents and roots point at
//! pages through `PageRef`, which carries enough summary (version, span,
//! tree size, leaf flag, per-kind hint) to make decisions without loading the
//! child. A ref is *dirty* while it has no on-disk address; dirty refs always
//! hold their page in memory, persisted refs load through the tree's
//! `PageLoader` (the store's page cache).

pub mod block;
pub(crate) mod seq;

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::btree::BTreePage;
use crate::codec::{KeyOrder, LexicographicOrder};
use crate::policy::{PagePolicy, PageStats};
use crate::qtree::QTreePage;
use crate::stree::STreePage;
use crate::utree::UTreePage;

pub use block::{BlockHeader, PageCodec};

/// Location of a persisted page block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageAddr {
    pub zone: u32,
    pub offset: u64,
    pub size: u32,
}

/// Behaviour every page kind provides to the generic commit, rebase,
/// compaction and cache code.
pub trait TreePage: PageStats + Sized + Send + Sync + 'static {
    /// Summary a parent keeps about each child (tiles for spatial pages).
    type Hint: Copy + Default + PartialEq + Debug + Send + Sync + 'static;

    fn version(&self) -> u64;
    fn hint(&self) -> Self::Hint;
    fn tag(&self) -> u8;
    fn child_refs(&self) -> &[PageRef<Self>];

    /// Same page contents with `children` substituted one-for-one, stamped
    /// with `version`. Children must cover exactly the same entries.
    fn rebuilt(&self, children: Vec<PageRef<Self>>, version: u64) -> Self;

    /// Rough encoded size, used for diff accounting before a commit.
    fn estimated_size(&self) -> usize;

    fn encode_body(&self, out: &mut Vec<u8>) -> Result<()>;
    fn decode_body(tag: u8, version: u64, body: &[u8]) -> Result<Self>;

    fn write_hint(hint: &Self::Hint, out: &mut Vec<u8>);
    fn read_hint(r: &mut &[u8]) -> Result<Self::Hint>;

    fn into_cached(page: Arc<Self>) -> CachedPage;
    fn from_cached(cached: &CachedPage) -> Option<Arc<Self>>;
}

/// Decoded page as held by the page cache.
#[derive(Clone)]
pub enum CachedPage {
    BTree(Arc<BTreePage>),
    QTree(Arc<QTreePage>),
    STree(Arc<STreePage>),
    UTree(Arc<UTreePage>),
}

impl CachedPage {
    pub fn version(&self) -> u64 {
        match self {
            CachedPage::BTree(p) => p.version(),
            CachedPage::QTree(p) => p.version(),
            CachedPage::STree(p) => p.version(),
            CachedPage::UTree(p) => p.version(),
        }
    }
}

impl Debug for CachedPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, p): (&str, &dyn PageStats) = match self {
            CachedPage::BTree(p) => ("btree", &**p),
            CachedPage::QTree(p) => ("qtree", &**p),
            CachedPage::STree(p) => ("stree", &**p),
            CachedPage::UTree(p) => ("utree", &**p),
        };
        write!(
            f,
            "CachedPage {{ kind: {}, leaf: {}, arity: {}, span: {} }}",
            kind,
            p.is_leaf(),
            p.arity(),
            p.span()
        )
    }
}

/// Source of persisted pages (implemented by the store).
pub trait PageLoader: Send + Sync {
    fn load_page(&self, addr: &PageAddr) -> Result<CachedPage>;
}

// ---------------- PageRef ----------------

pub struct PageRef<P: TreePage> {
    addr: Option<PageAddr>,
    version: u64,
    span: u64,
    tree_size: u64,
    /// Smallest page version in the subtree.
    oldest: u64,
    /// Lowest zone holding a persisted page of the subtree (`u32::MAX` if none).
    low_zone: u32,
    leaf: bool,
    hint: P::Hint,
    page: Option<Arc<P>>,
}

impl<P: TreePage> Clone for PageRef<P> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr,
            version: self.version,
            span: self.span,
            tree_size: self.tree_size,
            oldest: self.oldest,
            low_zone: self.low_zone,
            leaf: self.leaf,
            hint: self.hint,
            page: self.page.clone(),
        }
    }
}

impl<P: TreePage> Debug for PageRef<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageRef")
            .field("addr", &self.addr)
            .field("version", &self.version)
            .field("span", &self.span)
            .field("tree_size", &self.tree_size)
            .field("oldest", &self.oldest)
            .field("low_zone", &self.low_zone)
            .field("leaf", &self.leaf)
            .field("hint", &self.hint)
            .field("resident", &self.page.is_some())
            .finish()
    }
}

/// Encoded size of a page reference, hint excluded.
pub(crate) const PAGE_REF_SIZE: usize = 4 + 8 + 4 + 8 + 8 + 8 + 8 + 4 + 1;

impl<P: TreePage> PageRef<P> {
    /// Reference to a freshly built (dirty) page.
    pub fn resident(page: Arc<P>) -> Self {
        let children = page.child_refs();
        let tree_size = children.iter().map(|c| c.tree_size).sum();
        let oldest = children.iter().map(|c| c.oldest).fold(page.version(), u64::min);
        let low_zone = children.iter().map(|c| c.low_zone).min().unwrap_or(u32::MAX);
        Self {
            addr: None,
            version: page.version(),
            span: page.span(),
            tree_size,
            oldest,
            low_zone,
            leaf: page.is_leaf(),
            hint: page.hint(),
            page: Some(page),
        }
    }

    /// Reference to a persisted page. `oldest` and `low_zone` summarize the
    /// whole subtree, this page included.
    #[allow(clippy::too_many_arguments)]
    pub fn stored(
        addr: PageAddr,
        version: u64,
        span: u64,
        tree_size: u64,
        oldest: u64,
        low_zone: u32,
        leaf: bool,
        hint: P::Hint,
    ) -> Self {
        Self {
            addr: Some(addr),
            version,
            span,
            tree_size,
            oldest,
            low_zone,
            leaf,
            hint,
            page: None,
        }
    }

    #[inline]
    pub fn addr(&self) -> Option<PageAddr> {
        self.addr
    }
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }
    #[inline]
    pub fn span(&self) -> u64 {
        self.span
    }
    /// Bytes of persisted pages reachable through this ref.
    #[inline]
    pub fn tree_size(&self) -> u64 {
        self.tree_size
    }
    #[inline]
    pub fn oldest(&self) -> u64 {
        self.oldest
    }
    #[inline]
    pub fn low_zone(&self) -> u32 {
        self.low_zone
    }
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.leaf
    }
    #[inline]
    pub fn hint(&self) -> P::Hint {
        self.hint
    }
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.addr.is_none()
    }
    #[inline]
    pub fn resident_page(&self) -> Option<&Arc<P>> {
        self.page.as_ref()
    }

    /// Dirty and created at `version` (i.e. touched by the current batch).
    #[inline]
    pub fn touched_at(&self, version: u64) -> bool {
        self.is_dirty() && self.version == version
    }

    /// Resident page, or load it through the context's loader.
    pub fn page(&self, cx: &TreeContext) -> Result<Arc<P>> {
        if let Some(p) = &self.page {
            return Ok(p.clone());
        }
        match &self.addr {
            Some(addr) => cx.load::<P>(addr),
            None => Err(anyhow!("dirty page ref without resident page")),
        }
    }

    /// True when both refs designate the same page object or block.
    pub fn same_page(&self, other: &Self) -> bool {
        match (&self.page, &other.page) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => self.addr.is_some() && self.addr == other.addr,
        }
    }

    /// Identity of the resident page, used to match written pages on rebase.
    #[inline]
    pub(crate) fn page_ptr(&self) -> Option<usize> {
        self.page.as_ref().map(|p| Arc::as_ptr(p) as *const () as usize)
    }

    pub(crate) fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let addr = self
            .addr
            .ok_or_else(|| anyhow!("cannot encode a dirty child reference"))?;
        out.write_u32::<LittleEndian>(addr.zone)?;
        out.write_u64::<LittleEndian>(addr.offset)?;
        out.write_u32::<LittleEndian>(addr.size)?;
        out.write_u64::<LittleEndian>(self.version)?;
        out.write_u64::<LittleEndian>(self.span)?;
        out.write_u64::<LittleEndian>(self.tree_size)?;
        out.write_u64::<LittleEndian>(self.oldest)?;
        out.write_u32::<LittleEndian>(self.low_zone)?;
        out.write_u8(if self.leaf { 1 } else { 0 })?;
        P::write_hint(&self.hint, out);
        Ok(())
    }

    pub(crate) fn read_from(r: &mut &[u8]) -> Result<Self> {
        let zone = r.read_u32::<LittleEndian>()?;
        let offset = r.read_u64::<LittleEndian>()?;
        let size = r.read_u32::<LittleEndian>()?;
        let version = r.read_u64::<LittleEndian>()?;
        let span = r.read_u64::<LittleEndian>()?;
        let tree_size = r.read_u64::<LittleEndian>()?;
        let oldest = r.read_u64::<LittleEndian>()?;
        let low_zone = r.read_u32::<LittleEndian>()?;
        let leaf = r.read_u8()? & 1 == 1;
        let hint = P::read_hint(r)?;
        Ok(Self::stored(
            PageAddr { zone, offset, size },
            version,
            span,
            tree_size,
            oldest,
            low_zone,
            leaf,
            hint,
        ))
    }
}

// ---------------- TreeContext ----------------

/// Everything a page operation needs besides the page itself: the owning
/// stem, balancing policy, key comparator and page loader.
#[derive(Clone)]
pub struct TreeContext {
    pub stem: u32,
    pub policy: Arc<dyn PagePolicy>,
    pub order: Arc<dyn KeyOrder>,
    pub loader: Option<Arc<dyn PageLoader>>,
}

impl TreeContext {
    /// In-memory context: byte-wise keys, no loader.
    pub fn new(stem: u32, policy: Arc<dyn PagePolicy>) -> Self {
        Self {
            stem,
            policy,
            order: Arc::new(LexicographicOrder),
            loader: None,
        }
    }

    pub fn with_order(mut self, order: Arc<dyn KeyOrder>) -> Self {
        self.order = order;
        self
    }

    pub fn with_loader(mut self, loader: Arc<dyn PageLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    #[inline]
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        self.order.compare(a, b)
    }

    #[inline]
    pub fn should_split(&self, page: &dyn PageStats) -> bool {
        self.policy.should_split(page)
    }

    #[inline]
    pub fn should_merge(&self, page: &dyn PageStats) -> bool {
        self.policy.should_merge(page)
    }

    pub fn load<P: TreePage>(&self, addr: &PageAddr) -> Result<Arc<P>> {
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| anyhow!("no page loader for stored page {:?}", addr))?;
        let cached = loader.load_page(addr)?;
        P::from_cached(&cached).ok_or_else(|| {
            anyhow!(
                "page kind mismatch at zone {} offset {}: got {:?}",
                addr.zone,
                addr.offset,
                cached
            )
        })
    }
}

/// Decode a block body into the page kind named by its tag.
pub fn decode_cached(header: &BlockHeader, body: &[u8]) -> Result<CachedPage> {
    use crate::consts::*;
    let page = match header.tag {
        PAGE_TAG_BTREE_LEAF | PAGE_TAG_BTREE_NODE => CachedPage::BTree(Arc::new(
            BTreePage::decode_body(header.tag, header.version, body)?,
        )),
        PAGE_TAG_QTREE_LEAF | PAGE_TAG_QTREE_NODE => CachedPage::QTree(Arc::new(
            QTreePage::decode_body(header.tag, header.version, body)?,
        )),
        PAGE_TAG_STREE_LEAF | PAGE_TAG_STREE_NODE => CachedPage::STree(Arc::new(
            STreePage::decode_body(header.tag, header.version, body)?,
        )),
        PAGE_TAG_UTREE_LEAF => CachedPage::UTree(Arc::new(UTreePage::decode_body(
            header.tag,
            header.version,
            body,
        )?)),
        other => return Err(anyhow!("unknown page tag {}", other)),
    };
    Ok(page)
}

// ---------------- body helpers ----------------

pub(crate) fn put_bytes(out: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    out.write_u32::<LittleEndian>(data.len() as u32)?;
    out.extend_from_slice(data);
    Ok(())
}

pub(crate) fn get_bytes(r: &mut &[u8]) -> Result<crate::codec::Bytes> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    if r.len() < len {
        return Err(anyhow!("truncated byte string: need {}, have {}", len, r.len()));
    }
    let (head, tail) = r.split_at(len);
    *r = tail;
    Ok(Arc::from(head))
}

pub(crate) fn get_count(r: &mut &[u8], what: &str) -> Result<usize> {
    let n = r.read_u32::<LittleEndian>()? as usize;
    // Every element takes at least 4 bytes on disk.
    if n > r.len() / 4 + 1 {
        return Err(anyhow!("implausible {} count {} for {} remaining bytes", what, n, r.len()));
    }
    Ok(n)
}
