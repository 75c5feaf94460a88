//! Hourly RTV processing.
//!
//! Drives the per-hour chain: state window -> hours to process -> site
//! configurations -> radial loading -> UWLS solve -> merge with prior ->
//! persist. Data and transient failures skip the affected hour;
//! configuration and invariant failures abort the pipeline.

use crate::catalog::{self, StateWindow};
use crate::config::{now, Config, ProcessCfg, Product, RunMode};
use crate::error::{ProcError, Result};
use crate::grid::{Grid, Landmask};
use crate::merge;
use crate::persist::total_file::TotalRecord;
use crate::persist::{ascii, nc, total_file};
use crate::radial;
use crate::siteconfig;
use crate::solver;
use crate::state::State;
use chrono::{Duration, NaiveDateTime, Timelike};
use itertools::Itertools;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Runs RTV processing for every eligible hour. Returns the hours whose
/// total files were created or updated, for downstream STC/LTA use.
pub fn run_rtv(c: &Config, proc: &ProcessCfg, mode: &RunMode) -> Result<Vec<NaiveDateTime>> {
    let (process_times, window) = match mode {
        RunMode::Reprocess { times, .. } => {
            (times.iter().cloned().unique().sorted().collect(), None)
        }
        RunMode::Normal => {
            let (times, window) = get_process_times(c)?;
            (times, Some(window))
        }
    };

    if process_times.is_empty() {
        info!("no new radials found");
        return Ok(Vec::new());
    }
    info!(
        "obtained {} hour(s) to process between {} and {}",
        process_times.len(),
        process_times.first().expect("nonempty"),
        process_times.last().expect("nonempty")
    );

    let land = Landmask::load(&c.landfile, &c.domain)?;
    debug!("loaded {} land mask from {}", c.domain, c.landfile.display());
    let grid = Grid::load(&c.gridfile, &c.domain, &c.resolution)?;
    debug!(
        "loaded {}{} grid from {}",
        c.domain,
        c.resolution,
        c.gridfile.display()
    );

    let mut produced = Vec::new();
    let mut transient_failure = false;
    for &t in &process_times {
        match run_hour(c, proc, mode, &grid, &land, window.as_ref(), t) {
            Ok(true) => produced.push(t),
            Ok(false) => {}
            Err(e @ (ProcError::Config(_) | ProcError::Invariant(_))) => return Err(e),
            Err(e) => {
                error!("error processing rtv for {t}: {e}");
                transient_failure = true;
            }
        }
    }

    if let Some(window) = window {
        if transient_failure {
            warn!("not advancing rtv state past {} after failed hour(s)", window.new_state);
        } else {
            let mut state = State::new(&c.domain, &c.resolution, "rtv", &c.confdb)?;
            state.get()?;
            state.write()?;
            debug!("updated rtv state to {:?}", state.time);
        }
    }

    Ok(produced)
}

/// Processes a single hour. Returns whether a total file was written.
fn run_hour(
    c: &Config,
    proc: &ProcessCfg,
    mode: &RunMode,
    grid: &Grid,
    land: &Landmask,
    window: Option<&StateWindow>,
    t: NaiveDateTime,
) -> Result<bool> {
    let tic = Instant::now();
    if mode.is_reprocess() {
        info!("begin reprocessing rtv for {t}");
    } else {
        info!("begin processing rtv for {t}");
    }

    let files = c.paths.filenames(&c.domain, &c.resolution, Product::Rtv, t);

    let mut sites = siteconfig::site_configs_at(c, t)?;
    if sites.is_empty() {
        warn!("no sites configured for rtv processing at this time");
        return Ok(false);
    }
    info!("obtained configurations for {} sites", sites.len());
    if sites.len() < c.rtv.min_rad_sites {
        warn!(
            "the number of sites configured ({}) is less than the minimum number of sites \
             required to produce a solution ({})",
            sites.len(),
            c.rtv.min_rad_sites
        );
        return Ok(false);
    }

    if mode.is_reprocess() {
        for path in [&files.mpathfile, &files.asciipathfile, &files.ncpathfile] {
            if path.exists() {
                std::fs::remove_file(path).map_err(|e| {
                    ProcError::Transient(format!("error removing {}: {e}", path.display()))
                })?;
                debug!("deleted {}", path.display());
            }
        }
    }

    let prior = merge::load_prior(&files.mpathfile, mode)?;
    if let Some(prior) = &prior {
        radial::apply_prior_consistency(&mut sites, &prior.r)?;
    }

    let mut r = radial::load_radials(c, t, &sites, land, window)?;
    if r.is_empty() {
        info!("no radial data obtained");
        return Ok(false);
    }
    if r.len() < 2 {
        info!("only obtained data from one site");
        return Ok(false);
    }
    info!("obtained radial data from {} sites", r.len());

    let Some(mut u) = solver::compute_totals(c, grid, &r)? else {
        info!("no total solutions returned");
        return Ok(false);
    };

    merge::merge_with_prior(prior, &mut r, &mut u)?;

    let record = TotalRecord { t, u, r };
    total_file::write_total(&files.mpathfile, &record)?;
    info!("saved rtv solutions to total file");

    if proc.saves_ascii() {
        if record.u.any_below_hdop(c.rtv.uwls_max_hdop_ascii) {
            ascii::save_total(&files.asciipathfile, &record.u, c.rtv.uwls_max_hdop_ascii)?;
            info!("saved rtv solutions to ascii file");
        } else {
            info!("no total solutions below ascii hdop threshold");
        }
    }
    if proc.saves_netcdf() {
        if record.u.any_below_hdop(c.rtv.uwls_max_hdop_nc) {
            nc::save_total(c, &files.ncpathfile, t, &record.u)?;
            info!("saved rtv solutions to netcdf file");
        } else {
            info!("no total solutions below netcdf hdop threshold");
        }
    }

    info!("iteration elapsed time {:.3} s", tic.elapsed().as_secs_f64());
    Ok(true)
}

/// Determines the hours with new radial data and the state window used to
/// select them.
fn get_process_times(c: &Config) -> Result<(Vec<NaiveDateTime>, StateWindow)> {
    let time_now = now();
    let min_time = (time_now - Duration::hours(c.rtv.max_age))
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time_now);

    let mut state = State::new(&c.domain, &c.resolution, "rtv", &c.confdb)?;
    state.get()?;
    let current_state = match state.time {
        Some(t) => {
            info!("obtained rtv state time of {t}");
            t
        }
        None => {
            info!(
                "no rtv state defined; using maximum data age of {} hours to find radials \
                 since {min_time}",
                c.rtv.max_age
            );
            chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .expect("epoch date")
                .and_hms_opt(0, 0, 0)
                .expect("epoch time")
        }
    };

    // Radials still arriving this instant are left for the next run.
    let new_state = time_now - Duration::seconds(10);
    debug!("radial search window ends on {new_state}");
    let window = StateWindow {
        current_state,
        new_state,
    };

    let sites = catalog::configured_sites(c)?;
    info!(
        "found {} sites associated with {} {}",
        sites.len(),
        c.domain,
        c.resolution
    );

    let times = catalog::new_radial_hours(c, &window, min_time, &sites)?;
    Ok((times, window))
}
