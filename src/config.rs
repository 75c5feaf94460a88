//! Processing configuration.
//!
//! Configuration is loaded once per invocation from a JSON file and carried
//! as typed sections. The run mode (near real-time vs reprocessing) is a
//! first-class value passed alongside the configuration rather than a field
//! mutated into it.

use crate::error::{ProcError, Result};
use chrono::{Datelike, NaiveDateTime, Timelike};
use rusqlite::{Connection, OpenFlags};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub resolution: String,
    pub confdb: DbCfg,
    pub raddb: DbCfg,
    pub gridfile: PathBuf,
    pub landfile: PathBuf,
    pub lockfile: PathBuf,
    /// Upper bound on computational threads for the per-cell solver.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    pub processes: Vec<ProcessCfg>,
    pub rtv: RtvCfg,
    pub stc: StcCfg,
    pub lta: LtaCfg,
    pub paths: PathsCfg,
    pub metadata: Metadata,
}

fn default_max_threads() -> usize {
    1
}

impl Config {
    /// Loads the configuration file and stamps the (lower-cased) domain and
    /// resolution being processed.
    ///
    /// # Errors
    /// Returns a `Config` error if the file cannot be read or parsed.
    pub fn load(path: &Path, domain: &str, resolution: &str) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProcError::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut c: Config = serde_json::from_str(&text)
            .map_err(|e| ProcError::Config(format!("failed to parse {}: {e}", path.display())))?;
        c.domain = domain.to_lowercase();
        c.resolution = resolution.to_lowercase();
        Ok(c)
    }
}

/// SQLite database location plus the login timeout applied to every
/// connection. Connections are opened per operation and never held across
/// unrelated work.
#[derive(Debug, Clone, Deserialize)]
pub struct DbCfg {
    pub path: PathBuf,
    pub login_timeout_s: u64,
}

impl DbCfg {
    /// Opens a read-only connection.
    pub fn open_ro(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(Duration::from_secs(self.login_timeout_s))?;
        Ok(conn)
    }

    /// Opens a read-write connection, creating the database if absent.
    pub fn open_rw(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(self.login_timeout_s))?;
        Ok(conn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessName {
    Rtv,
    Stc,
    Lta,
}

impl std::fmt::Display for ProcessName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessName::Rtv => write!(f, "rtv"),
            ProcessName::Stc => write!(f, "stc"),
            ProcessName::Lta => write!(f, "lta"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessCfg {
    pub name: ProcessName,
    pub method: String,
    pub description: String,
    /// Comma-separated list of output formats, e.g. `"mat,ascii,netcdf"`.
    /// The binary total file is always written; this field gates the
    /// published formats.
    pub save_as: String,
}

impl ProcessCfg {
    pub fn saves_ascii(&self) -> bool {
        self.save_as.to_lowercase().contains("ascii")
    }

    pub fn saves_netcdf(&self) -> bool {
        self.save_as.to_lowercase().contains("netcdf")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtvCfg {
    /// Grid search radius in kilometers. Must be a whole number of meters
    /// and must match the radius the grid's search polygons were built at.
    pub grid_search_radius: f64,
    pub min_rad_sites: usize,
    pub min_radials: usize,
    /// Radial speed cap, cm/s.
    pub max_rad_speed: f64,
    /// Total solution speed cap, cm/s.
    pub max_rtv_speed: f64,
    pub uwls_max_hdop: f64,
    pub uwls_max_hdop_ascii: f64,
    pub uwls_max_hdop_nc: f64,
    /// Oldest radial data age considered, hours.
    pub max_age: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StcCfg {
    /// HDOP threshold applied to each hourly total before averaging.
    pub max_error: f64,
    /// Minimum hours of data for a valid 25-hour average.
    pub min_temporal_coverage: u32,
    /// Oldest total file age considered, hours.
    pub max_age: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LtaCfg {
    /// HDOP threshold applied to each hourly total before summing.
    pub max_error: f64,
    /// Day of month on or after which the previous month becomes eligible.
    pub monthly_min_month_day: u32,
    /// Date on or after which the previous year becomes eligible.
    pub annual_min_date: NaiveDateTime,
    /// Minimum days of coverage for a monthly average cell.
    pub min_month_temporal_coverage: f64,
    /// Minimum days of coverage for an annual average cell.
    pub min_year_temporal_coverage: f64,
}

/// Static dataset attributes exported to NetCDF.
#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub id_prefix: String,
    pub title: String,
    pub summary: String,
    pub source: String,
    pub instrument: String,
    pub keywords: String,
    pub keywords_vocabulary: String,
    pub instrument_vocabulary: String,
    pub processing_level: String,
    #[serde(default)]
    pub references: String,
    pub institution: String,
    pub naming_authority: String,
    pub creator_type: String,
    pub creator_name: String,
    pub creator_email: String,
    pub creator_url: String,
    /// Nominal measurement depth and bottom bound, meters.
    pub depth_mean: f64,
    pub depth_bottom: f64,
}

/// Output directory roots. Hourly and averaged products are laid out under
/// these by [`PathsCfg::filenames`].
#[derive(Debug, Clone, Deserialize)]
pub struct PathsCfg {
    /// Binary total files (the merge authority).
    pub mdir: PathBuf,
    /// Monthly sum files, kept apart from published monthly averages.
    pub msumdir: PathBuf,
    pub asciidir: PathBuf,
    pub ncdir: PathBuf,
}

/// The product a set of file names belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Product {
    Rtv,
    Stc,
    LtaMonth,
    LtaAnnual,
}

/// Canonical file paths for one product at one timestamp.
#[derive(Debug, Clone)]
pub struct Filenames {
    pub mpathfile: PathBuf,
    /// Monthly sum file path; only written for [`Product::LtaMonth`].
    pub msumpathfile: PathBuf,
    pub asciipathfile: PathBuf,
    pub ncpathfile: PathBuf,
}

impl PathsCfg {
    /// Derives the canonical file paths for a product at time `t`. The
    /// derivation is deterministic so consumers can locate files produced by
    /// earlier runs from the timestamp alone.
    pub fn filenames(
        &self,
        domain: &str,
        resolution: &str,
        product: Product,
        t: NaiveDateTime,
    ) -> Filenames {
        let (stem, subdir) = match product {
            Product::Rtv => (
                format!("rtv_{domain}_{resolution}_{}", t.format("%Y%m%dT%H%M%SZ")),
                format!("rtv/{:04}/{:02}", t.year(), t.month()),
            ),
            Product::Stc => (
                format!("stc_{domain}_{resolution}_{}", t.format("%Y%m%dT%H%M%SZ")),
                format!("stc/{:04}/{:02}", t.year(), t.month()),
            ),
            Product::LtaMonth => (
                format!("lta_month_{domain}_{resolution}_{}", t.format("%Y%m")),
                format!("lta/month/{:04}", t.year()),
            ),
            Product::LtaAnnual => (
                format!("lta_annual_{domain}_{resolution}_{}", t.format("%Y")),
                "lta/annual".to_string(),
            ),
        };
        Filenames {
            mpathfile: self.mdir.join(&subdir).join(format!("{stem}.tot")),
            msumpathfile: self
                .msumdir
                .join(format!("{:04}", t.year()))
                .join(format!("{stem}_sum.tot")),
            asciipathfile: self.asciidir.join(&subdir).join(format!("{stem}.asc")),
            ncpathfile: self.ncdir.join(&subdir).join(format!("{stem}.nc")),
        }
    }
}

/// How the run was invoked. Reprocessing carries its own hour list and a
/// flag controlling whether the single-writer lock is taken.
#[derive(Debug, Clone)]
pub enum RunMode {
    Normal,
    Reprocess {
        times: Vec<NaiveDateTime>,
        lock: bool,
    },
}

impl RunMode {
    pub fn is_reprocess(&self) -> bool {
        matches!(self, RunMode::Reprocess { .. })
    }

    pub fn reprocess_lock(&self) -> bool {
        match self {
            RunMode::Normal => true,
            RunMode::Reprocess { lock, .. } => *lock,
        }
    }
}

/// Current wall-clock time, truncated to whole seconds.
pub fn now() -> NaiveDateTime {
    let t = chrono::Utc::now().naive_utc();
    t.with_nanosecond(0).unwrap_or(t)
}
