use std::{fmt, str::FromStr};

use geo::{coord, Rect};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Largest coordinate magnitude [`bin`] accepts. Beyond it cell origins no
/// longer fit exactly in the lattice's integer arithmetic.
pub const MAX_COORD: f64 = 1.0e15;

/// Square cell size of a grid lattice, in projection units (metres for
/// British National Grid).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Resolution {
    Km1,
    Km5,
    Km10,
    Km25,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [Self::Km1, Self::Km5, Self::Km10, Self::Km25];

    pub fn meters(&self) -> u32 {
        match self {
            Self::Km1 => 1_000,
            Self::Km5 => 5_000,
            Self::Km10 => 10_000,
            Self::Km25 => 25_000,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Km1 => "1km",
            Self::Km5 => "5km",
            Self::Km10 => "10km",
            Self::Km25 => "25km",
        }
    }
}

impl TryFrom<u32> for Resolution {
    type Error = ConfigError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|r| r.meters() == value)
            .ok_or(ConfigError::UnknownResolution(value))
    }
}

impl From<Resolution> for u32 {
    fn from(value: Resolution) -> Self {
        value.meters()
    }
}

impl FromStr for Resolution {
    type Err = ConfigError;

    /// Accepts either the label (`25km`) or the size in metres (`25000`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(r) = Self::ALL.into_iter().find(|r| r.label().eq_ignore_ascii_case(s)) {
            return Ok(r);
        }
        let meters = s
            .parse::<u32>()
            .map_err(|_| ConfigError::UnknownResolutionLabel(s.to_owned()))?;
        Self::try_from(meters)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A square `[gx, gx + size) x [gy, gy + size)` at one resolution, identified
/// by its lower-left corner.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub resolution: Resolution,
    pub gx: i64,
    pub gy: i64,
}

impl Cell {
    /// `{gx}_{gy}`; unique within a resolution.
    pub fn key(&self) -> String {
        format!("{}_{}", self.gx, self.gy)
    }

    pub fn from_key(resolution: Resolution, key: &str) -> Option<Cell> {
        let (gx, gy) = key.trim().split_once('_')?;
        let gx = gx.parse::<i64>().ok()?;
        let gy = gy.parse::<i64>().ok()?;
        let size = resolution.meters() as i64;
        if gx.rem_euclid(size) != 0 || gy.rem_euclid(size) != 0 {
            return None;
        }
        Some(Cell { resolution, gx, gy })
    }

    pub fn bounds(&self) -> Rect<f64> {
        let size = self.resolution.meters() as f64;
        let (x0, y0) = (self.gx as f64, self.gy as f64);
        Rect::new(coord! { x: x0, y: y0 }, coord! { x: x0 + size, y: y0 + size })
    }

    /// Half-open containment, matching [`bin`].
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let size = self.resolution.meters() as f64;
        let (x0, y0) = (self.gx as f64, self.gy as f64);
        x >= x0 && x < x0 + size && y >= y0 && y < y0 + size
    }
}

/// Floor-divides one axis. The float quotient can round across a lattice line
/// near multiples of `size`, so the result is nudged until `lo <= v < lo + size`.
fn floor_axis(v: f64, size: i64) -> i64 {
    let s = size as f64;
    let mut q = (v / s).floor() as i64;
    if (q * size) as f64 > v {
        q -= 1;
    } else if ((q + 1) * size) as f64 <= v {
        q += 1;
    }
    q * size
}

/// Maps a planar coordinate onto the lattice at `resolution`. Non-finite input
/// is unbinned (`None`), never cell (0, 0).
///
/// The domain is `|x|, |y| <= MAX_COORD`, far outside any British National
/// Grid extent. Finite coordinates beyond it are also unbinned.
pub fn bin(x: f64, y: f64, resolution: Resolution) -> Option<Cell> {
    if !x.is_finite() || !y.is_finite() || x.abs() > MAX_COORD || y.abs() > MAX_COORD {
        return None;
    }
    let size = resolution.meters() as i64;
    Some(Cell {
        resolution,
        gx: floor_axis(x, size),
        gy: floor_axis(y, size),
    })
}

/// The cells one coordinate falls in, one per configured resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellSet(Vec<Cell>);

impl CellSet {
    /// Bins `(x, y)` at every resolution, each from the original coordinate.
    pub fn bin_all(x: f64, y: f64, resolutions: &[Resolution]) -> Option<CellSet> {
        let mut cells = resolutions
            .iter()
            .map(|r| bin(x, y, *r))
            .collect::<Option<Vec<Cell>>>()?;
        cells.sort();
        cells.dedup();
        Some(CellSet(cells))
    }

    pub fn get(&self, resolution: Resolution) -> Option<Cell> {
        self.0.iter().copied().find(|c| c.resolution == resolution)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floors_negative_coordinates() {
        let c = bin(-1.0, -999.5, Resolution::Km1).unwrap();
        assert_eq!((c.gx, c.gy), (-1000, -1000));
        let c = bin(-1000.0, 0.0, Resolution::Km1).unwrap();
        assert_eq!((c.gx, c.gy), (-1000, 0));
    }

    #[test]
    fn lower_edge_is_inclusive() {
        let c = bin(25_000.0, 49_999.999, Resolution::Km25).unwrap();
        assert_eq!((c.gx, c.gy), (25_000, 25_000));
    }

    #[test]
    fn non_finite_is_unbinned() {
        assert!(bin(f64::NAN, 1.0, Resolution::Km5).is_none());
        assert!(bin(1.0, f64::INFINITY, Resolution::Km5).is_none());
        assert!(CellSet::bin_all(f64::NAN, 0.0, &Resolution::ALL).is_none());
    }

    #[test]
    fn bins_up_to_the_coordinate_limit() {
        let c = bin(MAX_COORD, -MAX_COORD, Resolution::Km1).unwrap();
        assert_eq!((c.gx, c.gy), (1_000_000_000_000_000, -1_000_000_000_000_000));
        assert!(bin(2.0e15, 0.0, Resolution::Km1).is_none());
        assert!(bin(0.0, -2.0e15, Resolution::Km25).is_none());
    }

    #[test]
    fn cell_key_round_trips() {
        let c = bin(530_123.0, 181_456.0, Resolution::Km10).unwrap();
        assert_eq!(c.key(), "530000_180000");
        assert_eq!(Cell::from_key(Resolution::Km10, "530000_180000"), Some(c));
        assert_eq!(Cell::from_key(Resolution::Km10, "530001_180000"), None);
    }

    #[test]
    fn bounds_match_lattice() {
        let c = bin(12.0, 7_500.0, Resolution::Km5).unwrap();
        let r = c.bounds();
        assert_eq!(r.min(), coord! { x: 0.0, y: 5_000.0 });
        assert_eq!(r.max(), coord! { x: 5_000.0, y: 10_000.0 });
        assert!(c.contains(12.0, 7_500.0));
        assert!(!c.contains(5_000.0, 7_500.0));
    }

    #[test]
    fn resolution_parsing() {
        assert_eq!("25km".parse::<Resolution>().unwrap(), Resolution::Km25);
        assert_eq!("5000".parse::<Resolution>().unwrap(), Resolution::Km5);
        assert!(matches!(
            Resolution::try_from(2000),
            Err(ConfigError::UnknownResolution(2000))
        ));
    }
}
