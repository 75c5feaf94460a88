//! Total grid and land mask.
//!
//! The grid is a fixed regular lat/lon raster identified by
//! `(domain, resolution)`. Ocean cells are addressed by flat index into the
//! raster and each carries a precomputed small-circle search polygon at the
//! configured grid search radius, so per-cell radial selection reduces to a
//! polygon containment test.

use crate::error::{ProcError, Result};
use is_close::is_close;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// WGS84 semi-major axis, kilometers.
pub const WGS84_SEMI_MAJOR_KM: f64 = 6378.137;

/// Points per small-circle polygon.
pub const SCIRCLE_NPTS: usize = 360;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    pub domain: String,
    pub resolution: String,
    pub resolution_km: f64,
    pub projection: String,
    /// `[west, east]` longitude bounds, degrees E.
    pub x_range: [f64; 2],
    /// `[south, north]` latitude bounds, degrees N.
    pub y_range: [f64; 2],
    pub dx: f64,
    pub dy: f64,
    /// Raster size `(rows, cols)`; row 0 is the southern edge.
    pub size: [usize; 2],
    /// Flat (row-major) indices of wet cells.
    pub ocean_indices: Vec<usize>,
    pub ocean_lon: Vec<f64>,
    pub ocean_lat: Vec<f64>,
    /// Radius the search polygons below were generated at, kilometers.
    pub scircle_radius_km: f64,
    /// Per-ocean-cell search polygon longitudes, `SCIRCLE_NPTS` points each.
    pub ocean_x_scircle: Vec<Vec<f64>>,
    /// Per-ocean-cell search polygon latitudes.
    pub ocean_y_scircle: Vec<Vec<f64>>,
}

/// Grid attributes carried inside persisted total fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSummary {
    pub resolution_km: f64,
    pub projection: String,
    pub x_range: [f64; 2],
    pub y_range: [f64; 2],
    pub dx: f64,
    pub dy: f64,
    pub size: [usize; 2],
    pub ocean_indices: Vec<usize>,
}

impl Grid {
    /// Reads the grid for a `(domain, resolution)` pair from a binary grid
    /// file.
    ///
    /// # Errors
    /// `Config` if the file cannot be read or does not hold the requested
    /// grid; `Invariant` if the search polygon count does not match the
    /// ocean cell count.
    pub fn load(path: &Path, domain: &str, resolution: &str) -> Result<Grid> {
        let file = std::fs::File::open(path).map_err(|e| {
            ProcError::Config(format!("error loading grid from {}: {e}", path.display()))
        })?;
        let grid: Grid = bincode::deserialize_from(std::io::BufReader::new(file))
            .map_err(|e| ProcError::Config(format!("error parsing {}: {e}", path.display())))?;
        if grid.domain != domain || grid.resolution != resolution {
            return Err(ProcError::Config(format!(
                "grid file {} holds {}{}, not {domain}{resolution}",
                path.display(),
                grid.domain,
                grid.resolution
            )));
        }
        if grid.ocean_x_scircle.len() != grid.ocean_indices.len()
            || grid.ocean_y_scircle.len() != grid.ocean_indices.len()
            || grid.ocean_lat.len() != grid.ocean_indices.len()
            || grid.ocean_lon.len() != grid.ocean_indices.len()
        {
            return Err(ProcError::Invariant(format!(
                "grid {}{} search polygon count does not match its {} ocean cells",
                grid.domain,
                grid.resolution,
                grid.ocean_indices.len()
            )));
        }
        Ok(grid)
    }

    pub fn n_ocean(&self) -> usize {
        self.ocean_indices.len()
    }

    pub fn summary(&self) -> GridSummary {
        GridSummary {
            resolution_km: self.resolution_km,
            projection: self.projection.clone(),
            x_range: self.x_range,
            y_range: self.y_range,
            dx: self.dx,
            dy: self.dy,
            size: self.size,
            ocean_indices: self.ocean_indices.clone(),
        }
    }

    /// Verifies the configured search radius is usable against this grid:
    /// the radius must be a whole number of meters and must equal the radius
    /// the grid's search polygons were generated at.
    pub fn check_search_radius(&self, radius_km: f64) -> Result<()> {
        let label = scircle_label(radius_km)?;
        if !is_close!(self.scircle_radius_km, radius_km) {
            return Err(ProcError::Config(format!(
                "grid small circle fields ocean_x_{label} and/or ocean_y_{label} not found \
                 (grid was generated at {} km)",
                self.scircle_radius_km
            )));
        }
        Ok(())
    }
}

/// Field-name label for a search radius: whole kilometers render as
/// `scircle{K}km`, otherwise whole meters as `scircle{M}m`.
///
/// # Errors
/// `Config` if the radius is not a whole number of meters.
pub fn scircle_label(radius_km: f64) -> Result<String> {
    let meters = radius_km * 1000.0;
    if !is_close!(meters, meters.round()) || meters <= 0.0 {
        return Err(ProcError::Config(format!(
            "invalid grid search radius of {radius_km} km; value must be a whole number when \
             represented in meters"
        )));
    }
    if is_close!(radius_km, radius_km.round()) {
        Ok(format!("scircle{}km", radius_km.round() as i64))
    } else {
        Ok(format!("scircle{}m", meters.round() as i64))
    }
}

/// A land polygon with its bounding box `(lat_max, lat_min, lon_max,
/// lon_min)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LandPolygon {
    pub region: [f64; 4],
    pub lon: Vec<f64>,
    pub lat: Vec<f64>,
}

impl LandPolygon {
    /// True when the polygon's bounding box overlaps the given data bounds.
    pub fn bbox_overlaps(&self, lat_max: f64, lat_min: f64, lon_max: f64, lon_min: f64) -> bool {
        lat_max >= self.region[1]
            && lat_min <= self.region[0]
            && lon_max >= self.region[3]
            && lon_min <= self.region[2]
    }

    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        point_in_polygon(lon, lat, &self.lon, &self.lat)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Landmask {
    pub domain: String,
    pub polygons: Vec<LandPolygon>,
}

impl Landmask {
    pub fn load(path: &Path, domain: &str) -> Result<Landmask> {
        let file = std::fs::File::open(path).map_err(|e| {
            ProcError::Config(format!(
                "error loading land mask from {}: {e}",
                path.display()
            ))
        })?;
        let land: Landmask = bincode::deserialize_from(std::io::BufReader::new(file))
            .map_err(|e| ProcError::Config(format!("error parsing {}: {e}", path.display())))?;
        if land.domain != domain {
            return Err(ProcError::Config(format!(
                "land mask file {} holds domain {}, not {domain}",
                path.display(),
                land.domain
            )));
        }
        Ok(land)
    }
}

/// Crossings-rule point-in-polygon test. The polygon is closed implicitly
/// (last vertex connects back to the first); points on an edge may land on
/// either side.
pub fn point_in_polygon(x: f64, y: f64, xv: &[f64], yv: &[f64]) -> bool {
    let n = xv.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        if (yv[i] <= y) != (yv[j] <= y) {
            let x_cross = xv[i] + (y - yv[i]) / (yv[j] - yv[i]) * (xv[j] - xv[i]);
            if x_cross > x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Generates an `npts`-point small circle of radius `radius_km` around
/// `(lat0, lon0)` on a WGS84 sphere. Returns `(lats, lons)` in degrees;
/// the polygon is open (first vertex not repeated).
pub fn small_circle(lat0: f64, lon0: f64, radius_km: f64, npts: usize) -> (Vec<f64>, Vec<f64>) {
    let lat0 = lat0.to_radians();
    let lon0 = lon0.to_radians();
    let r = radius_km / WGS84_SEMI_MAJOR_KM;
    let mut lats = Vec::with_capacity(npts);
    let mut lons = Vec::with_capacity(npts);
    for k in 0..npts {
        let az = 2.0 * std::f64::consts::PI * k as f64 / npts as f64;
        let lat = (lat0.sin() * r.cos() + lat0.cos() * r.sin() * az.cos()).asin();
        let lon = lon0
            + (az.sin() * r.sin() * lat0.cos()).atan2(r.cos() - lat0.sin() * lat.sin());
        lats.push(lat.to_degrees());
        lons.push(lon.to_degrees());
    }
    (lats, lons)
}

/// Initial bearing from point 1 to point 2 on a sphere, degrees clockwise
/// from north in `[0, 360)`.
pub fn initial_bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dlam = (lon2 - lon1).to_radians();
    let y = dlam.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlam.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Great-circle distance between two points, kilometers.
pub fn distance_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = (lat2 - lat1).to_radians();
    let dlam = (lon2 - lon1).to_radians();
    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlam / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * WGS84_SEMI_MAJOR_KM
}
