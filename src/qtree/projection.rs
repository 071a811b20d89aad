//! qtree/projection — caller coordinates to tile space.

use anyhow::Result;
use std::fmt::Debug;

use super::tile::{Tile, COORD_LIMIT};
use crate::error::TreeError;

/// Axis-aligned box in caller coordinates (inclusive).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Bounds {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    pub fn point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }
}

pub trait Projection: Send + Sync + Debug {
    /// Integer tile-space coordinate of `v` on the x axis.
    fn project_x(&self, v: f64) -> Result<u64>;
    fn project_y(&self, v: f64) -> Result<u64>;

    /// Inclusive tile-space box.
    fn project(&self, b: &Bounds) -> Result<(u64, u64, u64, u64)> {
        let (x0, x1) = (self.project_x(b.x0)?, self.project_x(b.x1)?);
        let (y0, y1) = (self.project_y(b.y0)?, self.project_y(b.y1)?);
        if x0 > x1 || y0 > y1 {
            return Err(TreeError::dimension(format!("inverted bounds {:?}", b)).into());
        }
        Ok((x0, y0, x1, y1))
    }

    /// Smallest tiles covering `b`.
    fn tiles(&self, b: &Bounds) -> Result<(Tile, Tile)> {
        let (x0, y0, x1, y1) = self.project(b)?;
        Ok((Tile::covering(x0, x1)?, Tile::covering(y0, y1)?))
    }
}

fn to_coord(v: f64) -> Result<u64> {
    if !v.is_finite() || v < 0.0 || v >= COORD_LIMIT as f64 {
        return Err(TreeError::dimension(format!("coordinate {} outside tile space", v)).into());
    }
    Ok(v.floor() as u64)
}

/// Coordinates are already non-negative tile-space integers.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityProjection;

impl Projection for IdentityProjection {
    fn project_x(&self, v: f64) -> Result<u64> {
        to_coord(v)
    }
    fn project_y(&self, v: f64) -> Result<u64> {
        to_coord(v)
    }
}

/// Linear grid: `(v - origin) * scale`, floored.
#[derive(Debug, Clone, Copy)]
pub struct GridProjection {
    pub origin_x: f64,
    pub origin_y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl GridProjection {
    pub fn new(origin_x: f64, origin_y: f64, scale_x: f64, scale_y: f64) -> Self {
        Self {
            origin_x,
            origin_y,
            scale_x,
            scale_y,
        }
    }

    /// Longitude/latitude degrees onto a 2^32 grid per axis.
    pub fn geographic() -> Self {
        let cells = (1u64 << 32) as f64;
        Self::new(-180.0, -90.0, cells / 360.0, cells / 180.0)
    }
}

impl Projection for GridProjection {
    fn project_x(&self, v: f64) -> Result<u64> {
        to_coord((v - self.origin_x) * self.scale_x)
    }
    fn project_y(&self, v: f64) -> Result<u64> {
        to_coord((v - self.origin_y) * self.scale_y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_projection_maps_corners() -> Result<()> {
        let p = GridProjection::geographic();
        assert_eq!(p.project_x(-180.0)?, 0);
        assert_eq!(p.project_y(-90.0)?, 0);
        let (x, y) = p.tiles(&Bounds::point(0.0, 0.0))?;
        assert_eq!((x.lo(), y.lo()), (1 << 31, 1 << 31));
        assert!(p.project_x(-181.0).is_err());
        Ok(())
    }

    #[test]
    fn inverted_bounds_rejected() {
        let err = IdentityProjection
            .project(&Bounds::new(5.0, 0.0, 1.0, 3.0))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeError>(),
            Some(TreeError::DimensionMismatch(_))
        ));
    }
}
