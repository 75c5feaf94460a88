//! Radial file catalog queries.
//!
//! The acquisition side maintains a read-only catalog of radial files
//! (`radialfiles` joined to `network` and `site`). This module translates a
//! `(domain, resolution, hour)` plus the process state window into candidate
//! radial records, and finds the hours that have new radial data.

use crate::config::Config;
use crate::error::{ProcError, Result};
use crate::siteconfig::SiteConfig;
use chrono::{Duration, NaiveDateTime, Timelike};
use itertools::Itertools;
use rusqlite::types::ToSql;

/// Arrival-time window a near real-time run selects over:
/// `current_state <= file_arrival_time < new_state`.
#[derive(Debug, Clone, Copy)]
pub struct StateWindow {
    pub current_state: NaiveDateTime,
    pub new_state: NaiveDateTime,
}

/// One candidate row from the radial catalog. Optional fields may be NULL
/// in the catalog; records missing required fields are dropped downstream.
#[derive(Debug, Clone)]
pub struct RadialRecord {
    pub t: NaiveDateTime,
    pub network: String,
    pub site: String,
    pub patterntype: String,
    pub file_arrival_time: Option<NaiveDateTime>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Range resolution, km per range bin.
    pub range_res: Option<f64>,
    pub range_bin_end: Option<f64>,
    pub manufacturer: Option<String>,
    pub dfile: Option<String>,
    pub dir: Option<String>,
}

/// The radial timestamp that is canonical for hour `t` at a site with the
/// given `useMinute`: minutes below 30 select after the hour, minutes of 30
/// and above select before it.
///
/// # Errors
/// `Config` for `use_minute > 59`.
pub fn radial_target_time(t: NaiveDateTime, use_minute: u32) -> Result<NaiveDateTime> {
    match use_minute {
        0 => Ok(t),
        1..=29 => Ok(t + Duration::minutes(i64::from(use_minute))),
        30..=59 => Ok(t - Duration::minutes(i64::from(60 - use_minute))),
        _ => Err(ProcError::Config(format!(
            "useMinute value of {use_minute} is out of range; valid range is [0-59]"
        ))),
    }
}

/// Buckets a radial timestamp into its processing hour: radials at minute 30
/// or later belong to the next hour.
pub fn bucket_hour(t: NaiveDateTime) -> NaiveDateTime {
    let hour = t
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t);
    if t.minute() >= 30 {
        hour + Duration::hours(1)
    } else {
        hour
    }
}

fn epoch(t: NaiveDateTime) -> i64 {
    t.and_utc().timestamp()
}

fn from_epoch(secs: i64) -> Result<NaiveDateTime> {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.naive_utc())
        .ok_or_else(|| ProcError::Data(format!("invalid radial epoch time {secs}")))
}

/// Finds the distinct hours with radial data arriving inside `window` from
/// the given sites, ignoring radials older than `min_time`. Hours are
/// returned ascending.
pub fn new_radial_hours(
    c: &Config,
    window: &StateWindow,
    min_time: NaiveDateTime,
    sites: &[(String, String)],
) -> Result<Vec<NaiveDateTime>> {
    if sites.is_empty() {
        return Ok(Vec::new());
    }

    let site_clause = sites
        .iter()
        .map(|_| "(n.net = ? AND s.sta = ?)")
        .join(" OR ");
    let sql = format!(
        "SELECT r.time FROM radialfiles r \
         JOIN network n ON n.network_id = r.network_id \
         JOIN site s ON s.site_id = r.site_id \
         WHERE r.file_arrival_time >= ? AND r.file_arrival_time < ? \
         AND r.time >= ? AND ({site_clause})"
    );

    let min_epoch = epoch(min_time);
    let mut params: Vec<&dyn ToSql> = vec![&window.current_state, &window.new_state, &min_epoch];
    for (network, name) in sites {
        params.push(network);
        params.push(name);
    }

    let conn = c.raddb.open_ro()?;
    let mut stmt = conn.prepare(&sql)?;
    let times: Vec<i64> = stmt
        .query_map(params.as_slice(), |row| row.get(0))?
        .collect::<std::result::Result<_, _>>()?;

    let mut hours = Vec::with_capacity(times.len());
    for secs in times {
        hours.push(bucket_hour(from_epoch(secs)?));
    }
    Ok(hours.into_iter().unique().sorted().collect())
}

/// Returns the candidate radial records for hour `t` given the active site
/// configurations. Each site's clause pins its beam pattern and its
/// `useMinute` target timestamp (truncated to the minute). Outside
/// reprocessing, only radials that arrived before the window's end are
/// candidates.
pub fn radial_candidates(
    c: &Config,
    t: NaiveDateTime,
    sites: &[SiteConfig],
    window: Option<&StateWindow>,
) -> Result<Vec<RadialRecord>> {
    if sites.is_empty() {
        return Ok(Vec::new());
    }

    let site_clause = sites
        .iter()
        .map(|_| "(n.net = ? AND s.sta = ? AND r.patterntype = ? AND (r.time / 60) * 60 = ?)")
        .join(" OR ");
    let mut sql = format!(
        "SELECT r.time, n.net, s.sta, r.patterntype, r.file_arrival_time, \
                r.lat, r.lon, r.range_res, r.range_bin_end, r.manufacturer, r.dfile, r.dir \
         FROM radialfiles r \
         JOIN network n ON n.network_id = r.network_id \
         JOIN site s ON s.site_id = r.site_id \
         WHERE r.time >= ? AND r.time < ?"
    );
    if window.is_some() {
        sql.push_str(" AND r.file_arrival_time < ?");
    }
    sql.push_str(&format!(" AND ({site_clause})"));

    let t_min = epoch(t - Duration::minutes(30));
    let t_max = epoch(t + Duration::minutes(30));
    let mut params: Vec<&dyn ToSql> = vec![&t_min, &t_max];
    if let Some(w) = window {
        params.push(&w.new_state);
    }
    let mut codes: Vec<&'static str> = Vec::with_capacity(sites.len());
    let mut targets: Vec<i64> = Vec::with_capacity(sites.len());
    for site in sites {
        codes.push(site.beampattern.code());
        targets.push(epoch(radial_target_time(t, site.use_minute)?));
    }
    for (i, site) in sites.iter().enumerate() {
        params.push(&site.network);
        params.push(&site.name);
        params.push(&codes[i]);
        params.push(&targets[i]);
    }

    let conn = c.raddb.open_ro()?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<NaiveDateTime>>(4)?,
            row.get::<_, Option<f64>>(5)?,
            row.get::<_, Option<f64>>(6)?,
            row.get::<_, Option<f64>>(7)?,
            row.get::<_, Option<f64>>(8)?,
            row.get::<_, Option<String>>(9)?,
            row.get::<_, Option<String>>(10)?,
            row.get::<_, Option<String>>(11)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (
            secs,
            network,
            site,
            patterntype,
            file_arrival_time,
            lat,
            lon,
            range_res,
            range_bin_end,
            manufacturer,
            dfile,
            dir,
        ) = row?;
        records.push(RadialRecord {
            t: from_epoch(secs)?,
            network,
            site,
            patterntype,
            file_arrival_time,
            lat,
            lon,
            range_res,
            range_bin_end,
            manufacturer,
            dfile,
            dir,
        });
    }
    Ok(records)
}

/// Lists every site ever configured for the domain and resolution,
/// independent of validity windows.
///
/// # Errors
/// `Config` if no sites are defined.
pub fn configured_sites(c: &Config) -> Result<Vec<(String, String)>> {
    let conn = c.confdb.open_ro()?;
    let mut stmt = conn.prepare(
        "SELECT s.network, s.name FROM site s \
         JOIN site_config sc ON s.id = sc.site_id \
         JOIN domain d ON sc.domain_id = d.id \
         JOIN resolution r ON sc.resolution_id = r.id \
         WHERE d.name = ?1 AND r.name = ?2 \
         GROUP BY s.network, s.name",
    )?;
    let sites: Vec<(String, String)> = stmt
        .query_map(rusqlite::params![c.domain, c.resolution], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?
        .collect::<std::result::Result<_, _>>()?;
    if sites.is_empty() {
        return Err(ProcError::Config(format!(
            "no sites defined for {} {} processing",
            c.resolution, c.domain
        )));
    }
    Ok(sites)
}
