//! Time-versioned site configuration.
//!
//! Sites contributing to a `(domain, resolution)` pair are configured in
//! the configuration database with a validity window; at most one row may
//! be active for a site at any instant.

use crate::config::Config;
use crate::error::{ProcError, Result};
use chrono::NaiveDateTime;
use rusqlite::params;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeamPattern {
    Ideal,
    Measured,
}

impl BeamPattern {
    /// Single-character code used in the radial catalog and in persisted
    /// radial records.
    pub fn code(&self) -> &'static str {
        match self {
            BeamPattern::Ideal => "i",
            BeamPattern::Measured => "m",
        }
    }

    pub fn from_code(code: &str) -> Result<BeamPattern> {
        match code {
            "i" => Ok(BeamPattern::Ideal),
            "m" => Ok(BeamPattern::Measured),
            other => Err(ProcError::Config(format!(
                "unknown beam pattern type '{other}'"
            ))),
        }
    }

    pub fn from_name(name: &str) -> Result<BeamPattern> {
        match name {
            "ideal" => Ok(BeamPattern::Ideal),
            "measured" => Ok(BeamPattern::Measured),
            other => Err(ProcError::Config(format!(
                "unknown beam pattern type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for BeamPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BeamPattern::Ideal => write!(f, "ideal"),
            BeamPattern::Measured => write!(f, "measured"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SiteConfig {
    pub network: String,
    pub name: String,
    pub beampattern: BeamPattern,
    /// Minute within the hour whose radial is canonical for this site.
    pub use_minute: u32,
}

/// Obtains the site configurations valid at time `t` for the configured
/// domain and resolution.
///
/// # Errors
/// `Invariant` if a site has overlapping configuration rows at `t`;
/// `Config` if a `use_radial_minute` is out of the `[0, 59]` range.
pub fn site_configs_at(c: &Config, t: NaiveDateTime) -> Result<Vec<SiteConfig>> {
    let conn = c.confdb.open_ro()?;
    let mut stmt = conn.prepare(
        "SELECT s.network, s.name, sc.beampattern, sc.use_radial_minute, s.id \
         FROM site s \
         JOIN site_config sc ON sc.site_id = s.id \
         JOIN domain d ON sc.domain_id = d.id \
         JOIN resolution r ON sc.resolution_id = r.id \
         WHERE d.name = ?1 AND r.name = ?2 \
         AND sc.start_time <= ?3 AND (sc.end_time > ?3 OR sc.end_time IS NULL)",
    )?;
    let rows = stmt.query_map(params![c.domain, c.resolution, t], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut sites = Vec::new();
    let mut seen_ids = Vec::new();
    for row in rows {
        let (network, name, beampattern, use_minute, site_id) = row?;
        if seen_ids.contains(&site_id) {
            return Err(ProcError::Invariant(format!(
                "site {network}:{name} has overlapping configurations at {t}"
            )));
        }
        seen_ids.push(site_id);
        if !(0..=59).contains(&use_minute) {
            return Err(ProcError::Config(format!(
                "{network}:{name} useMinute value of {use_minute} is out of range; \
                 valid range is [0-59]"
            )));
        }
        sites.push(SiteConfig {
            network,
            name,
            beampattern: BeamPattern::from_name(&beampattern)?,
            use_minute: use_minute as u32,
        });
    }
    Ok(sites)
}
