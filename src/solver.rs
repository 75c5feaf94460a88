//! Unweighted least-squares total vector solver.
//!
//! For each candidate ocean cell, the radial speeds observed inside the
//! cell's search polygon are combined into an eastward/northward velocity
//! pair by solving the overdetermined system `X b = s`, where row k of `X`
//! is `[cos(theta_k), sin(theta_k)]` for a radial bearing `theta_k` (CCW
//! from east). The covariance `C = (X'X)^-1` is a geometry-only quality
//! measure reported as dilution of precision.

use crate::config::Config;
use crate::error::Result;
use crate::grid::{point_in_polygon, small_circle, Grid, SCIRCLE_NPTS};
use crate::radial::Radial;
use crate::total::TotalField;
use nalgebra::{Matrix2, Vector2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct CellSolution {
    pub u: f64,
    pub v: f64,
    pub dopx: f64,
    pub dopy: f64,
    pub hdop: f64,
}

impl CellSolution {
    fn none() -> CellSolution {
        CellSolution {
            u: f64::NAN,
            v: f64::NAN,
            dopx: f64::NAN,
            dopy: f64::NAN,
            hdop: f64::NAN,
        }
    }
}

/// Solves one cell from radial speeds (cm/s) and headings (degrees CCW from
/// east). A degenerate geometry (singular normal matrix) yields NaN.
pub fn uwls_total(speed: &[f64], heading_deg: &[f64]) -> CellSolution {
    let mut xtx = Matrix2::<f64>::zeros();
    let mut xts = Vector2::<f64>::zeros();
    for (&s, &h) in speed.iter().zip(heading_deg) {
        let (sin, cos) = h.to_radians().sin_cos();
        xtx[(0, 0)] += cos * cos;
        xtx[(0, 1)] += cos * sin;
        xtx[(1, 1)] += sin * sin;
        xts[0] += cos * s;
        xts[1] += sin * s;
    }
    xtx[(1, 0)] = xtx[(0, 1)];

    match xtx.try_inverse() {
        Some(cov) => {
            let b = cov * xts;
            let dopx = cov[(0, 0)].sqrt();
            let dopy = cov[(1, 1)].sqrt();
            CellSolution {
                u: b[0],
                v: b[1],
                dopx,
                dopy,
                hdop: (cov[(0, 0)] + cov[(1, 1)]).sqrt(),
            }
        }
        None => CellSolution::none(),
    }
}

/// Computes the hour's total solutions from the loaded radial datasets.
/// Returns `None` when no cell produces a surviving solution.
///
/// Only cells covered by at least `min_rad_sites` site coverage discs, at
/// least one of them a new site's, are attempted. Cell solves are
/// independent and run on the rayon pool.
pub fn compute_totals(c: &Config, grid: &Grid, radials: &[Radial]) -> Result<Option<TotalField>> {
    grid.check_search_radius(c.rtv.grid_search_radius)?;

    let n_cells = grid.n_ocean();

    // Reduce the solution space to cells inside site coverage. Each site's
    // coverage disc is its maximum data range plus the grid search radius.
    let site_circles: Vec<(Vec<f64>, Vec<f64>)> = radials
        .iter()
        .map(|r| {
            small_circle(
                r.site_latitude,
                r.site_longitude,
                r.maxrange + c.rtv.grid_search_radius,
                SCIRCLE_NPTS,
            )
        })
        .collect();

    let coverage: Vec<(usize, bool)> = (0..n_cells)
        .into_par_iter()
        .map(|i| {
            let (lon, lat) = (grid.ocean_lon[i], grid.ocean_lat[i]);
            let mut count = 0;
            let mut new = false;
            for (r, (sc_lat, sc_lon)) in radials.iter().zip(&site_circles) {
                if point_in_polygon(lon, lat, sc_lon, sc_lat) {
                    count += 1;
                    new |= r.is_new;
                }
            }
            (count, new)
        })
        .collect();

    let candidates: Vec<usize> = (0..n_cells)
        .filter(|&i| coverage[i].1 && coverage[i].0 >= c.rtv.min_rad_sites)
        .collect();
    if candidates.is_empty() {
        info!("no potential total solution points found");
        return Ok(None);
    }
    info!("found {} potential total solution points", candidates.len());

    // Solve each candidate cell.
    let solved: Vec<(usize, CellSolution, u32, u32)> = candidates
        .into_par_iter()
        .filter_map(|i| {
            let sc_lon = &grid.ocean_x_scircle[i];
            let sc_lat = &grid.ocean_y_scircle[i];
            let mut speeds = Vec::new();
            let mut headings = Vec::new();
            let mut n_sites = 0u32;
            let mut has_new = false;
            for r in radials {
                let before = speeds.len();
                for k in 0..r.latitude.len() {
                    if point_in_polygon(r.longitude[k], r.latitude[k], sc_lon, sc_lat) {
                        speeds.push(r.speed[k]);
                        headings.push(r.heading[k]);
                    }
                }
                if speeds.len() > before {
                    n_sites += 1;
                    has_new |= r.is_new;
                }
            }
            if has_new
                && n_sites as usize >= c.rtv.min_rad_sites
                && speeds.len() >= c.rtv.min_radials
            {
                Some((i, uwls_total(&speeds, &headings), speeds.len() as u32, n_sites))
            } else {
                None
            }
        })
        .collect();

    if solved.is_empty() {
        info!("no new solutions computed");
        return Ok(None);
    }

    let mut u = vec![f64::NAN; n_cells];
    let mut v = vec![f64::NAN; n_cells];
    let mut dopx = vec![f64::NAN; n_cells];
    let mut dopy = vec![f64::NAN; n_cells];
    let mut hdop = vec![f64::NAN; n_cells];
    let mut n_rads = vec![0u32; n_cells];
    let mut n_rad_sites = vec![0u32; n_cells];
    for (i, sol, k, sites) in solved {
        u[i] = sol.u;
        v[i] = sol.v;
        dopx[i] = sol.dopx;
        dopy[i] = sol.dopy;
        hdop[i] = sol.hdop;
        n_rads[i] = k;
        n_rad_sites[i] = sites;
    }
    debug!(
        "computed {} new total solutions (pre-filter)",
        u.iter().filter(|x| x.is_finite()).count()
    );

    // Filter total solutions.
    let mut n_bad = 0;
    let mut n_spd = 0;
    let mut n_hdop = 0;
    for i in 0..n_cells {
        if n_rads[i] == 0 {
            continue;
        }
        let bad = !u[i].is_finite()
            || !v[i].is_finite()
            || !dopx[i].is_finite()
            || !dopy[i].is_finite();
        let spd = !bad && u[i].hypot(v[i]) > c.rtv.max_rtv_speed;
        let hdp = !bad && hdop[i] > c.rtv.uwls_max_hdop;
        if bad || spd || hdp {
            n_bad += bad as usize;
            n_spd += spd as usize;
            n_hdop += hdp as usize;
            u[i] = f64::NAN;
            v[i] = f64::NAN;
            dopx[i] = f64::NAN;
            dopy[i] = f64::NAN;
            hdop[i] = f64::NAN;
            n_rads[i] = 0;
            n_rad_sites[i] = 0;
        }
    }
    let n_masked = n_bad + n_spd + n_hdop;
    if n_masked > 0 {
        info!(
            "masked {n_masked} total solutions; {n_bad} non-finite, {n_spd} speed, \
             {n_hdop} hdop"
        );
    } else {
        debug!("no solutions eliminated by masking");
    }

    let n_finite = u.iter().filter(|x| x.is_finite()).count();
    if n_finite == 0 {
        info!("no new solutions computed");
        return Ok(None);
    }
    info!("computed {n_finite} new total solutions");

    Ok(Some(TotalField {
        lat: grid.ocean_lat.clone(),
        lon: grid.ocean_lon.clone(),
        u,
        v,
        dopx,
        dopy,
        hdop,
        n_rads,
        n_sites: n_rad_sites,
        grid: grid.summary(),
        history: Vec::new(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orthogonal_radials_solve_exactly() {
        // Two radials at headings 0 and 90 degrees: the design matrix rows
        // are [1, 0] and [0, 1], so the solution is the speeds themselves.
        let sol = uwls_total(&[10.0, 10.0], &[0.0, 90.0]);
        assert!((sol.u - 10.0).abs() < 1e-12);
        assert!((sol.v - 10.0).abs() < 1e-12);
        assert!((sol.dopx - 1.0).abs() < 1e-12);
        assert!((sol.dopy - 1.0).abs() < 1e-12);
        assert!((sol.hdop - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn solver_is_idempotent() {
        let speeds = [12.0, -3.5, 7.25, 4.0];
        let headings = [10.0, 95.0, 200.0, 310.0];
        let a = uwls_total(&speeds, &headings);
        let b = uwls_total(&speeds, &headings);
        assert_eq!(a.u.to_bits(), b.u.to_bits());
        assert_eq!(a.v.to_bits(), b.v.to_bits());
        assert_eq!(a.hdop.to_bits(), b.hdop.to_bits());
    }

    #[test]
    fn parallel_radials_are_degenerate() {
        // All radials along one bearing cannot resolve two components.
        let sol = uwls_total(&[10.0, 11.0, 9.0], &[45.0, 45.0, 45.0]);
        assert!(!sol.u.is_finite() || sol.hdop > 1e6);
    }
}
