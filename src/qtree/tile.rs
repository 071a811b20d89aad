//! qtree/tile — 64-bit bit-interval tiles.
//!
//! A tile packs an aligned interval of one axis into a u64:
//!   bits 58..64  rank  (0..=58; interval length is 2^rank)
//!   bits 0..58   base  (low `rank` bits are zero)
//!
//! Rank 0 is a single coordinate. Rank 58 covers the whole axis.

use anyhow::Result;
use std::fmt;

use crate::error::TreeError;

pub const MAX_RANK: u32 = 58;
/// Coordinates must be strictly below this bound.
pub const COORD_LIMIT: u64 = 1 << MAX_RANK;

const BASE_MASK: u64 = COORD_LIMIT - 1;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Tile(u64);

#[inline]
fn low_mask(rank: u32) -> u64 {
    (1u64 << rank) - 1
}

impl Tile {
    /// Rank-0 tile at `coord`.
    pub fn point(coord: u64) -> Result<Tile> {
        if coord >= COORD_LIMIT {
            return Err(TreeError::dimension(format!(
                "coordinate {} is outside the tile space (limit 2^{})",
                coord, MAX_RANK
            ))
            .into());
        }
        Ok(Tile(coord))
    }

    /// Tile of `rank` containing `coord` (the base is aligned down).
    pub fn new(rank: u32, coord: u64) -> Result<Tile> {
        if rank > MAX_RANK {
            return Err(TreeError::dimension(format!("tile rank {} exceeds {}", rank, MAX_RANK)).into());
        }
        let p = Tile::point(coord)?;
        Ok(Tile(((rank as u64) << MAX_RANK) | (p.0 & !low_mask(rank))))
    }

    /// Validate a raw encoded tile.
    pub fn from_raw(raw: u64) -> Result<Tile> {
        let rank = (raw >> MAX_RANK) as u32;
        let base = raw & BASE_MASK;
        if rank > MAX_RANK {
            return Err(TreeError::dimension(format!("tile rank {} exceeds {}", rank, MAX_RANK)).into());
        }
        if base & low_mask(rank) != 0 {
            return Err(TreeError::dimension(format!(
                "tile base {:#x} is not aligned to rank {}",
                base, rank
            ))
            .into());
        }
        Ok(Tile(raw))
    }

    /// Smallest tile covering the inclusive range `lo..=hi`.
    pub fn covering(lo: u64, hi: u64) -> Result<Tile> {
        if lo > hi {
            return Err(TreeError::dimension(format!("inverted range {}..={}", lo, hi)).into());
        }
        Ok(Tile::point(lo)?.union(Tile::point(hi)?))
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn rank(self) -> u32 {
        (self.0 >> MAX_RANK) as u32
    }

    #[inline]
    pub fn base(self) -> u64 {
        self.0 & BASE_MASK
    }

    /// First coordinate covered.
    #[inline]
    pub fn lo(self) -> u64 {
        self.base()
    }

    /// Last coordinate covered (inclusive).
    #[inline]
    pub fn hi(self) -> u64 {
        self.base() | low_mask(self.rank())
    }

    /// Smallest tile containing both.
    pub fn union(self, other: Tile) -> Tile {
        let (ba, bb) = (self.base(), other.base());
        let diff = ba ^ bb;
        let diff_rank = 64 - diff.leading_zeros();
        let rank = self.rank().max(other.rank()).max(diff_rank);
        Tile(((rank as u64) << MAX_RANK) | (ba & !low_mask(rank)))
    }

    /// `inner` lies entirely within `self`.
    #[inline]
    pub fn contains(self, inner: Tile) -> bool {
        let ro = self.rank();
        ro >= inner.rank() && (self.base() >> ro) == (inner.base() >> ro)
    }

    /// Dyadic intervals either nest or are disjoint.
    #[inline]
    pub fn intersects(self, other: Tile) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Overlaps the inclusive coordinate range `lo..=hi`.
    #[inline]
    pub fn overlaps(self, lo: u64, hi: u64) -> bool {
        self.lo() <= hi && lo <= self.hi()
    }

    /// Lower (`half == 0`) or upper half, one rank finer. Rank 0 has no halves.
    pub fn half(self, half: u64) -> Option<Tile> {
        let rank = self.rank();
        if rank == 0 {
            return None;
        }
        let r = rank - 1;
        Some(Tile(((r as u64) << MAX_RANK) | (self.base() + ((half & 1) << r))))
    }
}

impl fmt::Debug for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tile({}..={} r{})", self.lo(), self.hi(), self.rank())
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.rank() == 0 {
            write!(f, "{}", self.base())
        } else {
            write!(f, "{}..={}", self.lo(), self.hi())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_is_smallest_aligned_cover() -> Result<()> {
        let a = Tile::point(2)?;
        let b = Tile::point(6)?;
        let u = a.union(b);
        assert_eq!((u.rank(), u.lo(), u.hi()), (3, 0, 7));

        let c = Tile::new(2, 4)?;
        let d = Tile::point(5)?;
        assert_eq!(c.union(d), c);
        assert!(c.contains(d));
        assert!(!d.contains(c));
        Ok(())
    }

    #[test]
    fn halves_partition_the_tile() -> Result<()> {
        let t = Tile::new(3, 8)?;
        let lo = t.half(0).unwrap();
        let hi = t.half(1).unwrap();
        assert_eq!((lo.lo(), lo.hi()), (8, 11));
        assert_eq!((hi.lo(), hi.hi()), (12, 15));
        assert!(t.contains(lo) && t.contains(hi));
        assert!(!lo.intersects(hi));
        assert!(Tile::point(9)?.half(0).is_none());
        Ok(())
    }

    #[test]
    fn invalid_tiles_are_dimension_errors() {
        for err in [
            Tile::point(COORD_LIMIT).unwrap_err(),
            Tile::new(59, 0).unwrap_err(),
            Tile::from_raw((3u64 << MAX_RANK) | 5).unwrap_err(),
            Tile::covering(9, 3).unwrap_err(),
        ] {
            assert!(matches!(
                err.downcast_ref::<TreeError>(),
                Some(TreeError::DimensionMismatch(_))
            ));
        }
    }

    #[test]
    fn formatting_names_the_range() -> Result<()> {
        let t = Tile::new(2, 8)?;
        assert_eq!(format!("{:?}", t), "Tile(8..=11 r2)");
        assert_eq!(t.to_string(), "8..=11");
        assert_eq!(Tile::point(5)?.to_string(), "5");
        assert_eq!(format!("{:?}", &t), "Tile(8..=11 r2)");
        Ok(())
    }

    #[test]
    fn full_axis_tile() -> Result<()> {
        let all = Tile::new(MAX_RANK, 12345)?;
        assert_eq!(all.lo(), 0);
        assert_eq!(all.hi(), COORD_LIMIT - 1);
        assert!(all.contains(Tile::point(COORD_LIMIT - 1)?));
        Ok(())
    }
}
