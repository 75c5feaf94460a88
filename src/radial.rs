//! Radial data loading and filtering.
//!
//! Turns the hour's candidate catalog records into filtered in-memory
//! radial datasets: reads each LLUV file, drops velocity-flagged points,
//! points over the speed cap, and points over land, and prunes sites whose
//! coverage cannot overlap any new site's coverage.
//!
//! Radial selection must stay consistent with previous runs of the same
//! hour: sites present in a previously persisted total keep the beam
//! pattern and `useMinute` they were originally processed with.

use crate::catalog::{self, RadialRecord, StateWindow};
use crate::config::Config;
use crate::error::{ProcError, Result};
use crate::grid::{distance_km, Landmask};
use crate::lluv;
use crate::siteconfig::{BeamPattern, SiteConfig};
use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Site range slack as a fraction of the range resolution.
const RANGE_BUFFER: f64 = 0.05;

/// Coverage radius assumed when a record has no usable range metadata, km.
const DEFAULT_SITERANGE_KM: f64 = 300.0;

/// One site's radial dataset for one hour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Radial {
    /// True when this dataset arrived inside the current state window (or
    /// the run is a reprocess).
    pub is_new: bool,
    pub t: NaiveDateTime,
    pub network: String,
    pub site: String,
    pub site_latitude: f64,
    pub site_longitude: f64,
    /// `"i"` (ideal) or `"m"` (measured).
    pub patterntype: String,
    pub manufacturer: Option<String>,
    pub file: String,
    pub dir: String,
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    /// cm/s, positive away from the radar.
    pub speed: Vec<f64>,
    /// Degrees CCW from east.
    pub heading: Vec<f64>,
    pub range: Option<Vec<f64>>,
    /// Farthest observation range plus slack, km.
    pub maxrange: f64,
}

impl Radial {
    pub fn label(&self) -> String {
        format!("{}:{}({})", self.network, self.site, self.patterntype)
    }
}

/// Overrides site selections to match a previously persisted run. The prior
/// file's radial records are authoritative for the sites they cover.
///
/// # Errors
/// `Invariant` if the prior data holds duplicate records for a site;
/// `Config` if it holds an unknown beam pattern code.
pub fn apply_prior_consistency(sites: &mut [SiteConfig], prior: &[Radial]) -> Result<()> {
    let mut n_mod = 0;
    for site in sites.iter_mut() {
        let matches: Vec<&Radial> = prior
            .iter()
            .filter(|r| r.network == site.network && r.site == site.name)
            .collect();
        let last = match matches.len() {
            0 => continue,
            1 => matches[0],
            _ => {
                return Err(ProcError::Invariant(format!(
                    "found {} records of radial data from {}:{} in previous radial data",
                    matches.len(),
                    site.network,
                    site.name
                )))
            }
        };
        if site.beampattern.code() != last.patterntype {
            site.beampattern = BeamPattern::from_code(&last.patterntype)?;
            warn!(
                "modified {}:{} selection to use {} radials for consistency with previous run(s)",
                site.network, site.name, site.beampattern
            );
            n_mod += 1;
        }
        if site.use_minute != last.t.minute() {
            site.use_minute = last.t.minute();
            warn!(
                "modified {}:{} selection to use radials from minute {} for consistency with \
                 previous run(s)",
                site.network, site.name, site.use_minute
            );
            n_mod += 1;
        }
    }
    if n_mod > 0 {
        warn!("{n_mod} modification(s) made to radial site parameters based on previous runs");
    } else {
        debug!("no modification needed to current radial config based on previous runs");
    }
    Ok(())
}

/// Loads and filters the hour's radial data.
///
/// `window` is `None` when reprocessing; then every candidate is treated as
/// new. Records that fail to load or filter down to nothing are skipped
/// with a log message rather than failing the hour.
pub fn load_radials(
    c: &Config,
    t: NaiveDateTime,
    sites: &[SiteConfig],
    land: &Landmask,
    window: Option<&StateWindow>,
) -> Result<Vec<Radial>> {
    let reprocessing = window.is_none();

    let q = catalog::radial_candidates(c, t, sites, window)?;
    if q.is_empty() {
        return Ok(Vec::new());
    }
    debug!("site query returned {} record(s)", q.len());

    // Remove records with NULL where data is required.
    let q: Vec<RadialRecord> = q
        .into_iter()
        .filter(|row| {
            let complete = row.dfile.is_some()
                && row.dir.is_some()
                && row.lat.is_some()
                && row.lon.is_some()
                && (reprocessing || row.file_arrival_time.is_some());
            if !complete {
                warn!(
                    "radialfiles record {}:{}({}) {} is missing required fields, removing \
                     from processing",
                    row.network, row.site, row.patterntype, row.t
                );
            }
            complete
        })
        .collect();

    // Index new radials.
    let is_new: Vec<bool> = q
        .iter()
        .map(|row| match window {
            None => true,
            Some(w) => {
                let arrived = row.file_arrival_time.expect("filtered above");
                if arrived >= w.current_state {
                    debug!(
                        "new radial from {}:{}({}) arrived at {arrived}",
                        row.network, row.site, row.patterntype
                    );
                    true
                } else {
                    false
                }
            }
        })
        .collect();

    let n_new = is_new.iter().filter(|b| **b).count();
    if n_new == 0 {
        return Ok(Vec::new());
    }
    if reprocessing {
        info!("{n_new} radial(s) to be reprocessed");
    } else {
        info!("{n_new} new radial(s) to be processed");
    }

    // Coverage radius for each new site.
    let siterange: Vec<f64> = q
        .iter()
        .zip(&is_new)
        .map(|(row, &new)| {
            if !new {
                return f64::NAN;
            }
            match (row.range_res, row.range_bin_end) {
                (Some(rr), Some(rbe)) if rr > 0.0 && rbe > 0.0 => {
                    rr * rbe + RANGE_BUFFER * rr + c.rtv.grid_search_radius
                }
                _ => {
                    let r = DEFAULT_SITERANGE_KM + c.rtv.grid_search_radius;
                    warn!(
                        "missing radial range resolution or end from {}:{}, setting site \
                         range to {r} km",
                        row.network, row.site
                    );
                    r
                }
            }
        })
        .collect();

    // Load a record only when it can overlap a new site's coverage.
    let mut load = vec![false; q.len()];
    for i in 0..q.len() {
        if !is_new[i] {
            continue;
        }
        for j in 0..q.len() {
            if i == j || (load[i] && load[j]) {
                continue;
            }
            let d = distance_km(
                q[i].lat.expect("filtered above"),
                q[i].lon.expect("filtered above"),
                q[j].lat.expect("filtered above"),
                q[j].lon.expect("filtered above"),
            );
            if d <= siterange[i] {
                load[i] = true;
                load[j] = true;
            }
        }
        if !load[i] {
            info!("no overlap found with new data from {}:{}", q[i].network, q[i].site);
        }
    }

    let n_load = load.iter().filter(|b| **b).count();
    if n_load == 0 {
        info!("no potential data overlap with new radials");
        return Ok(Vec::new());
    }
    info!("{n_load} radial files to be loaded for processing");

    // Obtain data from sites.
    let mut radials = Vec::with_capacity(n_load);
    for (i, row) in q.iter().enumerate() {
        if !load[i] {
            continue;
        }
        match load_one(c, row, is_new[i], land) {
            Ok(Some(radial)) => radials.push(radial),
            Ok(None) => {}
            Err(ProcError::Data(msg)) => {
                warn!("skipping radial from {}:{}: {msg}", row.network, row.site);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(radials)
}

/// Reads and filters a single radial file. Returns `None` when filtering
/// leaves no data.
fn load_one(
    c: &Config,
    row: &RadialRecord,
    is_new: bool,
    land: &Landmask,
) -> Result<Option<Radial>> {
    let dir = row.dir.as_ref().expect("record validated");
    let file = row.dfile.as_ref().expect("record validated");
    let site_lat = row.lat.expect("record validated");
    let site_lon = row.lon.expect("record validated");
    let path = Path::new(dir).join(file);

    let mut d = lluv::read_lluv(&path, site_lat, site_lon)?;
    debug!("loaded {} radials from {file}", d.len());

    // Velocity flag filtering.
    if let Some(vflag) = d.vflag.clone() {
        let flagged: Vec<usize> = vflag
            .iter()
            .enumerate()
            .filter(|(_, f)| **f == 128.0)
            .map(|(i, _)| i)
            .collect();
        if !flagged.is_empty() {
            d.remove_indices(&flagged);
            debug!("removed {} velocity flagged radials", flagged.len());
            if d.is_empty() {
                info!("no radial data left from {file} after velocity flag filtering");
                return Ok(None);
            }
        }
    }

    // Speed thresholding.
    let fast: Vec<usize> = d
        .speed
        .iter()
        .enumerate()
        .filter(|(_, s)| s.abs() > c.rtv.max_rad_speed)
        .map(|(i, _)| i)
        .collect();
    if !fast.is_empty() {
        d.remove_indices(&fast);
        debug!(
            "removed {} radials with speed greater than {} cm/s",
            fast.len(),
            c.rtv.max_rad_speed
        );
        if d.is_empty() {
            info!("no radial data left from {file} after speed thresholding");
            return Ok(None);
        }
    }

    // Landmasking.
    let lat_max = d.latitude.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let lat_min = d.latitude.iter().cloned().fold(f64::INFINITY, f64::min);
    let lon_max = d.longitude.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let lon_min = d.longitude.iter().cloned().fold(f64::INFINITY, f64::min);
    let mut n_over_land = 0;
    for poly in &land.polygons {
        if !poly.bbox_overlaps(lat_max, lat_min, lon_max, lon_min) {
            continue;
        }
        let inside: Vec<usize> = (0..d.len())
            .filter(|&i| poly.contains(d.longitude[i], d.latitude[i]))
            .collect();
        n_over_land += inside.len();
        d.remove_indices(&inside);
        if d.is_empty() {
            break;
        }
    }
    if n_over_land > 0 {
        debug!("removed {n_over_land} radials falling over land");
        if d.is_empty() {
            info!("no radial data left from {file} after land masking");
            return Ok(None);
        }
    }

    let maxrange = match (&d.range, row.range_res) {
        (Some(range), Some(rr)) if rr > 0.0 => {
            range.iter().cloned().fold(f64::NEG_INFINITY, f64::max) + RANGE_BUFFER * rr
        }
        (Some(range), _) => range.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
        (None, _) => DEFAULT_SITERANGE_KM,
    };

    Ok(Some(Radial {
        is_new,
        t: row.t,
        network: row.network.clone(),
        site: row.site.clone(),
        site_latitude: site_lat,
        site_longitude: site_lon,
        patterntype: row.patterntype.clone(),
        manufacturer: row.manufacturer.clone(),
        file: file.clone(),
        dir: dir.clone(),
        latitude: d.latitude,
        longitude: d.longitude,
        speed: d.speed,
        heading: d.heading,
        range: d.range,
        maxrange,
    }))
}
