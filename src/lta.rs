//! Long-term average processing.
//!
//! Monthly averages are built from one-pass sums over every hour of the
//! month; the sums are persisted separately so annual averages can be
//! rolled up from twelve monthly sum files without re-reading a year of
//! hourly totals. Quality-control masks are applied to published averages.

use crate::config::{now, Config, ProcessCfg, Product, RunMode};
use crate::error::Result;
use crate::persist::total_file::{self, AvgRecord, SumRecord};
use crate::persist::{ascii, nc};
use crate::state::State;
use crate::total::{AvgField, SumField};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use tracing::{debug, error, info, warn};

/// Hours per day of coverage; the configured minima are in days.
const HOURS_PER_DAY: f64 = 24.0;

/// Quality-control box over the Straits of Florida: `(lat_min, lat_max,
/// lon_min, lon_max)`, exclusive bounds.
const QC_STRAITS_OF_FLORIDA: (f64, f64, f64, f64) = (25.0, 26.75, -80.75, -78.75);

/// Runs monthly and annual long-term average processing. `new_rtv_times`
/// carries the totals produced upstream during reprocessing.
pub fn run_lta(
    c: &Config,
    proc: &ProcessCfg,
    mode: &RunMode,
    new_rtv_times: &[NaiveDateTime],
) -> Result<()> {
    let time_now = now();

    if mode.is_reprocess() {
        let mut max_lta_date = month_start(time_now.year(), time_now.month());
        if time_now.day() < c.lta.monthly_min_month_day {
            max_lta_date = prev_month(max_lta_date);
        }
        if !new_rtv_times.iter().any(|t| *t < max_lta_date) {
            debug!("no new rtvs processed prior to {max_lta_date}, exiting");
            return Ok(());
        }
    } else if time_now.day() < c.lta.monthly_min_month_day {
        debug!(
            "below minimum month day ({}) for lta processing, exiting",
            c.lta.monthly_min_month_day
        );
        return Ok(());
    }

    if let Err(e) = run_monthly(c, proc, mode, new_rtv_times, time_now) {
        error!("error processing {} monthly average (lta): {e}", proc.method);
    }
    if let Err(e) = run_annual(c, proc, mode, new_rtv_times, time_now) {
        error!("error processing {} annual average (lta): {e}", proc.method);
    }
    Ok(())
}

fn run_monthly(
    c: &Config,
    proc: &ProcessCfg,
    mode: &RunMode,
    new_rtv_times: &[NaiveDateTime],
    time_now: NaiveDateTime,
) -> Result<()> {
    let process_times: Vec<NaiveDateTime> = if mode.is_reprocess() {
        let mut max_lta_date = month_start(time_now.year(), time_now.month());
        if time_now.day() < c.lta.monthly_min_month_day {
            max_lta_date = prev_month(max_lta_date);
        }
        let months: Vec<NaiveDateTime> = new_rtv_times
            .iter()
            .filter(|t| **t < max_lta_date)
            .map(|t| month_start(t.year(), t.month()))
            .unique()
            .sorted()
            .collect();
        if months.is_empty() {
            debug!("no new rtvs processed prior to {max_lta_date}, exiting");
            return Ok(());
        }
        info!(
            "obtained {} month(s) to process between {} and {}",
            months.len(),
            months.first().expect("nonempty"),
            months.last().expect("nonempty")
        );
        months
    } else {
        let mut state = State::new(&c.domain, &c.resolution, "lta-monthly", &c.confdb)?;
        state.get()?;
        if let Some(t) = state.time {
            if t.year() == time_now.year() && t.month() == time_now.month() {
                debug!("monthly lta processing has already been run this month");
                return Ok(());
            }
        }
        let month = prev_month(month_start(time_now.year(), time_now.month()));
        info!("obtained 1 month to process: {month}");
        vec![month]
    };

    for &tc in &process_times {
        if mode.is_reprocess() {
            info!("begin reprocessing monthly lta for {tc}");
        } else {
            info!("begin processing monthly lta for {tc}");
        }

        let Some(sums) = monthly_sum(c, tc)? else {
            info!("no sums returned");
            continue;
        };

        let files = c
            .paths
            .filenames(&c.domain, &c.resolution, Product::LtaMonth, tc);
        total_file::write_sum(&files.msumpathfile, &SumRecord { t: tc, s: sums.clone() })?;
        info!("saved lta monthly sums to total file");

        let mut sums = sums;
        sums.mask_below_coverage(c.lta.min_month_temporal_coverage * HOURS_PER_DAY);
        if !sums.any_good() {
            debug!(
                "not enough data to meet minimum temporal coverage of {} days",
                c.lta.min_month_temporal_coverage
            );
            info!("no averaged data returned");
            continue;
        }
        let mut a = sums.into_avg();
        debug!("computed month average");

        total_file::write_avg(&files.mpathfile, &AvgRecord { tc, a: a.clone() })?;
        info!("saved lta month to total file");

        qc_mask(&mut a);
        if !a.any_finite() {
            info!("no averaged data remains after qc masking");
            continue;
        }

        if proc.saves_ascii() {
            ascii::save_avg(&files.asciipathfile, &a)?;
            info!("saved lta month to ascii file");
        }
        if proc.saves_netcdf() {
            nc::save_avg(c, &files.ncpathfile, Product::LtaMonth, tc, &a)?;
            info!("saved lta month to netcdf file");
        }
    }

    if !mode.is_reprocess() {
        let mut state = State::new(&c.domain, &c.resolution, "lta-monthly", &c.confdb)?;
        state.get()?;
        state.write()?;
        debug!("updated lta monthly state to {:?}", state.time);
    }
    Ok(())
}

fn run_annual(
    c: &Config,
    proc: &ProcessCfg,
    mode: &RunMode,
    new_rtv_times: &[NaiveDateTime],
    time_now: NaiveDateTime,
) -> Result<()> {
    let years: Vec<i32> = if mode.is_reprocess() {
        let mut max_lta_date = year_start(time_now.year());
        if time_now < c.lta.annual_min_date {
            max_lta_date = year_start(time_now.year() - 1);
        }
        let years: Vec<i32> = new_rtv_times
            .iter()
            .filter(|t| **t < max_lta_date)
            .map(|t| t.year())
            .unique()
            .sorted()
            .collect();
        if years.is_empty() {
            debug!("no new rtvs processed prior to {max_lta_date}, exiting");
            return Ok(());
        }
        info!(
            "obtained {} year(s) to process between {} and {}",
            years.len(),
            years.first().expect("nonempty"),
            years.last().expect("nonempty")
        );
        years
    } else {
        if time_now < c.lta.annual_min_date {
            debug!(
                "prior to minimum date ({}) for annual lta processing, exiting",
                c.lta.annual_min_date.format("%b %d, %Y")
            );
            return Ok(());
        }
        let mut state = State::new(&c.domain, &c.resolution, "lta-annual", &c.confdb)?;
        state.get()?;
        if let Some(t) = state.time {
            if t.year() == time_now.year() {
                debug!("annual lta processing has already been run this year");
                return Ok(());
            }
        }
        let year = time_now.year() - 1;
        info!("obtained 1 year to process: {year}");
        vec![year]
    };

    for &year in &years {
        if mode.is_reprocess() {
            info!("begin reprocessing annual lta for {year}");
        } else {
            info!("begin processing annual lta for {year}");
        }

        let Some(mut a) = annual_avg(c, year)? else {
            info!("no averaged data returned");
            continue;
        };

        let tc = year_start(year);
        let files = c
            .paths
            .filenames(&c.domain, &c.resolution, Product::LtaAnnual, tc);
        total_file::write_avg(&files.mpathfile, &AvgRecord { tc, a: a.clone() })?;
        info!("saved lta year to total file");

        qc_mask(&mut a);
        if !a.any_finite() {
            info!("no averaged data remains after qc masking");
            continue;
        }

        if proc.saves_ascii() {
            ascii::save_avg(&files.asciipathfile, &a)?;
            info!("saved lta year to ascii file");
        }
        if proc.saves_netcdf() {
            nc::save_avg(c, &files.ncpathfile, Product::LtaAnnual, tc, &a)?;
            info!("saved lta year to netcdf file");
        }
    }

    if !mode.is_reprocess() {
        let mut state = State::new(&c.domain, &c.resolution, "lta-annual", &c.confdb)?;
        state.get()?;
        state.write()?;
        debug!("updated lta annual state to {:?}", state.time);
    }
    Ok(())
}

/// One-pass sums over every hour of the month holding `tc`. Returns `None`
/// when no hourly total file could be loaded.
pub fn monthly_sum(c: &Config, tc: NaiveDateTime) -> Result<Option<SumField>> {
    let start = month_start(tc.year(), tc.month());
    let end = next_month(start);

    let mut sums: Option<SumField> = None;
    let mut n_loaded = 0u32;
    let mut t = start;
    while t < end {
        let files = c.paths.filenames(&c.domain, &c.resolution, Product::Rtv, t);
        t += Duration::hours(1);
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
            if u.hdop[i] >= c.lta.max_error {
                u.u[i] = f64::NAN;
                u.v[i] = f64::NAN;
            }
        }

        let s = sums.get_or_insert_with(|| SumField::new(u.grid.clone(), u.lat.clone(), u.lon.clone()));
        s.accumulate(&u.u, &u.v);
    }

    debug!("summed values from {n_loaded} hourly rtv files");
    Ok(sums)
}

/// Annual average from the year's monthly sum files. Returns `None` when
/// no monthly sums exist or no cell meets the coverage minimum.
pub fn annual_avg(c: &Config, year: i32) -> Result<Option<AvgField>> {
    let mut sums: Option<SumField> = None;
    let mut n_loaded = 0u32;

    for month in 1..=12 {
        let tc = month_start(year, month);
        let files = c
            .paths
            .filenames(&c.domain, &c.resolution, Product::LtaMonth, tc);
        if !files.msumpathfile.exists() {
            continue;
        }
        let record = match total_file::read_sum(&files.msumpathfile) {
            Ok(record) => record,
            Err(e) => {
                error!("error loading {}: {e}", files.msumpathfile.display());
                continue;
            }
        };
        n_loaded += 1;
        debug!("loaded {}", files.msumpathfile.display());

        match sums.as_mut() {
            None => sums = Some(record.s),
            Some(s) => s.merge(&record.s),
        }
    }

    let Some(mut sums) = sums else {
        debug!("no monthly data loaded");
        return Ok(None);
    };
    debug!("summed values from {n_loaded} monthly sum file(s)");

    sums.mask_below_coverage(c.lta.min_year_temporal_coverage * HOURS_PER_DAY);
    if !sums.any_good() {
        debug!(
            "not enough data to meet minimum temporal coverage of {} days",
            c.lta.min_year_temporal_coverage
        );
        return Ok(None);
    }

    let a = sums.into_avg();
    debug!("computed year average");
    Ok(Some(a))
}

/// Removes cells inside quality-control exclusion areas. The current rule
/// masks the Straits of Florida for all time; time-dependent masks are
/// reserved for future use.
pub fn qc_mask(a: &mut AvgField) {
    let (lat_min, lat_max, lon_min, lon_max) = QC_STRAITS_OF_FLORIDA;
    let mut n_masked = 0;
    for i in 0..a.n_cells() {
        let (lat, lon) = (a.sums.lat[i], a.sums.lon[i]);
        if lat > lat_min && lat < lat_max && lon > lon_min && lon < lon_max {
            a.clear_cell(i);
            n_masked += 1;
        }
    }
    if n_masked > 0 {
        info!("qc masked {n_masked} solutions in the Straits of Florida");
    }
}

fn month_start(year: i32, month: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, 1)
        .expect("valid month start")
        .and_hms_opt(0, 0, 0)
        .expect("midnight")
}

fn next_month(t: NaiveDateTime) -> NaiveDateTime {
    if t.month() == 12 {
        month_start(t.year() + 1, 1)
    } else {
        month_start(t.year(), t.month() + 1)
    }
}

fn prev_month(t: NaiveDateTime) -> NaiveDateTime {
    if t.month() == 1 {
        month_start(t.year() - 1, 12)
    } else {
        month_start(t.year(), t.month() - 1)
    }
}

fn year_start(year: i32) -> NaiveDateTime {
    month_start(year, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSummary;

    fn avg_with_cells(lats: Vec<f64>, lons: Vec<f64>) -> AvgField {
        let n = lats.len();
        let mut s = SumField::new(
            GridSummary {
                resolution_km: 6.0,
                projection: "equirectangular".to_string(),
                x_range: [-81.0, -78.0],
                y_range: [24.0, 28.0],
                dx: 0.1,
                dy: 0.1,
                size: [1, n],
                ocean_indices: (0..n).collect(),
            },
            lats,
            lons,
        );
        s.accumulate(&vec![1.0; n], &vec![1.0; n]);
        s.into_avg()
    }

    #[test]
    fn qc_mask_clears_straits_of_florida() {
        let mut a = avg_with_cells(vec![25.5, 27.5], vec![-80.0, -80.0]);
        qc_mask(&mut a);
        assert!(a.u_avg[0].is_nan());
        assert!(a.sums.n_good[0].is_nan());
        assert_eq!(a.u_avg[1], 1.0);
    }

    #[test]
    fn month_arithmetic_wraps_years() {
        assert_eq!(next_month(month_start(2023, 12)), month_start(2024, 1));
        assert_eq!(prev_month(month_start(2024, 1)), month_start(2023, 12));
        assert_eq!(prev_month(month_start(2024, 7)), month_start(2024, 6));
    }
}
