//! Sub-tidal current processing.
//!
//! The sub-tidal current is a centered 25-hour boxcar mean of the hourly
//! total fields, computed for every center-hour whose window gained a new
//! total file. Hourly solutions are filtered by the sub-tidal HDOP
//! threshold before averaging, and centers without enough temporal
//! coverage are dropped.

use crate::catalog::StateWindow;
use crate::config::{now, Config, ProcessCfg, Product, RunMode};
use crate::error::Result;
use crate::persist::total_file::{self, AvgRecord};
use crate::persist::{ascii, nc};
use crate::state::State;
use crate::total::{AvgField, SumField};
use chrono::{DateTime, Duration, NaiveDateTime, Timelike};
use itertools::Itertools;
use tracing::{debug, info, warn};

/// Half-width of the averaging window, hours.
const HALF_WINDOW_H: i64 = 12;

/// Youngest eligible center-hour lag behind now, hours: the full forward
/// half-window plus the trailing hour must exist.
const MIN_CENTER_LAG_H: i64 = 13;

/// Runs sub-tidal current processing. `new_rtv_times` carries the hours the
/// RTV step produced during reprocessing; in normal mode the new totals are
/// discovered from file modification times.
pub fn run_stc(
    c: &Config,
    proc: &ProcessCfg,
    mode: &RunMode,
    new_rtv_times: &[NaiveDateTime],
) -> Result<()> {
    let (new_rtv_times, window) = match mode {
        RunMode::Reprocess { .. } => (new_rtv_times.to_vec(), None),
        RunMode::Normal => {
            let (times, window) = find_new_rtvs(c, "stc", c.stc.max_age)?;
            (times, Some(window))
        }
    };

    if new_rtv_times.is_empty() {
        info!("no new rtvs found");
        return Ok(());
    }
    info!(
        "obtained {} new rtvs between {} and {}",
        new_rtv_times.len(),
        new_rtv_times.iter().min().expect("nonempty"),
        new_rtv_times.iter().max().expect("nonempty")
    );

    // Every center-hour whose 25-hour window includes a new total.
    let latest_center = now() - Duration::hours(MIN_CENTER_LAG_H);
    let process_times: Vec<NaiveDateTime> = new_rtv_times
        .iter()
        .flat_map(|&t| (-HALF_WINDOW_H..=HALF_WINDOW_H).map(move |h| t + Duration::hours(h)))
        .unique()
        .sorted()
        .filter(|tc| *tc <= latest_center)
        .collect();

    if process_times.is_empty() {
        info!("no stcs to process");
        return Ok(());
    }
    info!(
        "found {} stcs to process between {} and {}",
        process_times.len(),
        process_times.first().expect("nonempty"),
        process_times.last().expect("nonempty")
    );

    for &tc in &process_times {
        if mode.is_reprocess() {
            info!("begin reprocessing stc for {tc}");
        } else {
            info!("begin processing stc for {tc}");
        }

        let Some(a) = compute_25hr_avg(c, tc)? else {
            info!("no average solutions returned");
            continue;
        };

        let files = c.paths.filenames(&c.domain, &c.resolution, Product::Stc, tc);
        let record = AvgRecord { tc, a };
        total_file::write_avg(&files.mpathfile, &record)?;
        info!("saved stc solutions to total file");

        if proc.saves_ascii() {
            ascii::save_avg(&files.asciipathfile, &record.a)?;
            info!("saved stc solutions to ascii file");
        }
        if proc.saves_netcdf() {
            nc::save_avg(c, &files.ncpathfile, Product::Stc, tc, &record.a)?;
            info!("saved stc solutions to netcdf file");
        }
    }

    if window.is_some() {
        let mut state = State::new(&c.domain, &c.resolution, "stc", &c.confdb)?;
        state.get()?;
        state.write()?;
        debug!("updated stc state to {:?}", state.time);
    }
    Ok(())
}

/// Computes the 25-hour average centered on `tc` from the hourly total
/// files. Returns `None` when the window has too few files or no cell
/// meets the temporal coverage minimum.
pub fn compute_25hr_avg(c: &Config, tc: NaiveDateTime) -> Result<Option<AvgField>> {
    let mut sums: Option<SumField> = None;
    let mut n_loaded = 0u32;

    for h in -HALF_WINDOW_H..=HALF_WINDOW_H {
        let ti = tc + Duration::hours(h);
        let files = c.paths.filenames(&c.domain, &c.resolution, Product::Rtv, ti);
        if !files.mpathfile.exists() {
            continue;
        }
        let record = match total_file::read_total(&files.mpathfile) {
            Ok(record) => record,
            Err(e) => {
                warn!("error loading {}: {e}", files.mpathfile.display());
                continue;
            }
        };
        n_loaded += 1;
        debug!("loaded {}", files.mpathfile.display());

        let mut u = record.u;
        for i in 0..u.n_cells() {
            if u.hdop[i] >= c.stc.max_error {
                u.u[i] = f64::NAN;
                u.v[i] = f64::NAN;
            }
        }

        let s = sums.get_or_insert_with(|| SumField::new(u.grid.clone(), u.lat.clone(), u.lon.clone()));
        s.accumulate(&u.u, &u.v);
    }

    if n_loaded < c.stc.min_temporal_coverage {
        info!(
            "Minimum temporal coverage is {} hours, only {} file(s) loaded",
            c.stc.min_temporal_coverage, n_loaded
        );
        return Ok(None);
    }
    let mut sums = sums.expect("files were loaded");

    sums.mask_below_coverage(f64::from(c.stc.min_temporal_coverage));
    if !sums.any_good() {
        debug!(
            "not enough data to meet minimum temporal coverage of {} hours",
            c.stc.min_temporal_coverage
        );
        return Ok(None);
    }

    debug!("computed average from {n_loaded} files");
    Ok(Some(sums.into_avg()))
}

/// Finds total files modified inside the state window, walking the hourly
/// path convention from `now - max_age` forward. Used by the STC and LTA
/// consumers in near real-time mode.
pub fn find_new_rtvs(
    c: &Config,
    process: &str,
    max_age: i64,
) -> Result<(Vec<NaiveDateTime>, StateWindow)> {
    let time_now = now();
    let min_time = (time_now - Duration::hours(max_age))
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time_now);

    let mut state = State::new(&c.domain, &c.resolution, process, &c.confdb)?;
    state.get()?;
    let current_state = match state.time {
        Some(t) => {
            info!("obtained {process} state time of {t}");
            t
        }
        None => {
            info!(
                "no {process} state defined; using maximum data age of {max_age} hours to \
                 find rtvs since {min_time}"
            );
            chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .expect("epoch date")
                .and_hms_opt(0, 0, 0)
                .expect("epoch time")
        }
    };
    let window = StateWindow {
        current_state,
        new_state: time_now,
    };
    debug!("rtv search window ends on {}", window.new_state);

    let mut times = Vec::new();
    let mut t = min_time;
    while t <= window.new_state {
        let files = c.paths.filenames(&c.domain, &c.resolution, Product::Rtv, t);
        if let Ok(meta) = std::fs::metadata(&files.mpathfile) {
            if let Ok(modified) = meta.modified() {
                let mtime: NaiveDateTime = DateTime::<chrono::Utc>::from(modified).naive_utc();
                if window.current_state <= mtime && mtime < window.new_state {
                    debug!("found new rtv file {}", files.mpathfile.display());
                    times.push(t);
                }
            }
        }
        t += Duration::hours(1);
    }
    Ok((times, window))
}
