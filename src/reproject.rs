use geo::Coord;

use crate::grid::Cell;

/// Maps a planar coordinate to display (lon, lat). `None` when the point
/// cannot be converted.
pub trait Reproject {
    fn to_display(&self, x: f64, y: f64) -> Option<(f64, f64)>;
}

/// Leaves coordinates untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl Reproject for Identity {
    fn to_display(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        Some((x, y))
    }
}

impl<F> Reproject for F
where
    F: Fn(f64, f64) -> Option<(f64, f64)>,
{
    fn to_display(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        self(x, y)
    }
}

pub fn cell_centre(cell: Cell) -> Coord<f64> {
    cell.bounds().center()
}

/// British National Grid to WGS84.
#[cfg(feature = "proj")]
pub struct BritishNationalGrid {
    proj: proj::Proj,
}

#[cfg(feature = "proj")]
impl BritishNationalGrid {
    pub fn new() -> Result<Self, proj::ProjCreateError> {
        Ok(Self {
            proj: proj::Proj::new_known_crs("EPSG:27700", "EPSG:4326", None)?,
        })
    }
}

#[cfg(feature = "proj")]
impl Reproject for BritishNationalGrid {
    fn to_display(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        self.proj.convert((x, y)).ok()
    }
}
