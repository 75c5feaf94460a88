//! LLUV radial file reader.
//!
//! Reads the table of radial velocity observations from an LLUV-format
//! instrument file. Speed and heading are derived from the radar origin
//! when they are not directly available in the file: heading falls back to
//! the bearing from each observation point to the origin, and speed falls
//! back to the magnitude of `(VELU, VELV)` signed by its direction relative
//! to that bearing.
//!
//! Headings are returned in polar convention (degrees counterclockwise from
//! east). Speed is positive away from the radar, cm/s.

use crate::error::{ProcError, Result};
use crate::grid::initial_bearing_deg;
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Angular disagreement (degrees) between the file's velocity direction and
/// the bearing to origin beyond which the speed sign is flipped.
const SIGN_TOLERANCE_DEG: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct LluvData {
    pub latitude: Vec<f64>,
    pub longitude: Vec<f64>,
    /// cm/s, positive away from the radar.
    pub speed: Vec<f64>,
    /// Degrees CCW from east.
    pub heading: Vec<f64>,
    /// Range from the origin, km.
    pub range: Option<Vec<f64>>,
    pub vflag: Option<Vec<f64>>,
}

impl LluvData {
    pub fn len(&self) -> usize {
        self.latitude.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latitude.is_empty()
    }

    /// Drops the observations at the given (sorted ascending) indices from
    /// every column.
    pub fn remove_indices(&mut self, indices: &[usize]) {
        for &i in indices.iter().rev() {
            self.latitude.remove(i);
            self.longitude.remove(i);
            self.speed.remove(i);
            self.heading.remove(i);
            if let Some(range) = self.range.as_mut() {
                range.remove(i);
            }
            if let Some(vflag) = self.vflag.as_mut() {
                vflag.remove(i);
            }
        }
    }
}

/// Reads an LLUV radial file.
///
/// # Errors
/// Returns a `Data` error when the file is missing, has no LLUV table,
/// lacks the required position columns, lacks both `VELO` and
/// `(VELU, VELV)`, or contains no data rows.
pub fn read_lluv(path: &Path, site_lat: f64, site_lon: f64) -> Result<LluvData> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProcError::Data(format!("{} not found: {e}", path.display())))?;
    let reader = BufReader::new(file);

    let mut columns: HashMap<String, usize> = HashMap::new();
    let mut in_lluv_table = false;
    let mut rows: Vec<Vec<f64>> = Vec::new();

    for line in reader.lines() {
        let line = line
            .map_err(|e| ProcError::Data(format!("unable to read {}: {e}", path.display())))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix('%') {
            if let Some(value) = rest.strip_prefix("TableType:") {
                in_lluv_table = value.trim_start().starts_with("LLUV");
            } else if in_lluv_table && columns.is_empty() {
                if let Some(names) = rest.strip_prefix("TableColumnTypes:") {
                    for (i, name) in names.split_whitespace().enumerate() {
                        columns.insert(name.to_string(), i);
                    }
                }
            }
            continue;
        }
        if !in_lluv_table || columns.is_empty() {
            continue;
        }
        let row: Vec<f64> = trimmed
            .split_whitespace()
            .map(|v| v.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| {
                ProcError::Data(format!("malformed data row in {}: {e}", path.display()))
            })?;
        if row.len() < columns.len() {
            return Err(ProcError::Data(format!(
                "data row in {} has {} columns, expected {}",
                path.display(),
                row.len(),
                columns.len()
            )));
        }
        rows.push(row);
    }

    if columns.is_empty() {
        return Err(ProcError::Data(format!(
            "no LLUV column names found in {}",
            path.display()
        )));
    }
    let lon_col = *columns.get("LOND").ok_or_else(|| {
        ProcError::Data(format!("longitude column (LOND) not found in {}", path.display()))
    })?;
    let lat_col = *columns.get("LATD").ok_or_else(|| {
        ProcError::Data(format!("latitude column (LATD) not found in {}", path.display()))
    })?;
    if rows.is_empty() {
        return Err(ProcError::Data(format!(
            "no data in radial file {}",
            path.display()
        )));
    }

    let column = |idx: usize| -> Vec<f64> { rows.iter().map(|r| r[idx]).collect() };

    let latitude = column(lat_col);
    let longitude = column(lon_col);

    // Heading toward the origin, converted from compass to polar convention.
    let heading: Vec<f64> = match columns.get("HEAD") {
        Some(&idx) => rows
            .iter()
            .map(|r| (90.0 - r[idx]).rem_euclid(360.0))
            .collect(),
        None => latitude
            .iter()
            .zip(&longitude)
            .map(|(&lat, &lon)| {
                let az = initial_bearing_deg(lat, lon, site_lat, site_lon);
                (90.0 - az).rem_euclid(360.0)
            })
            .collect(),
    };

    let speed: Vec<f64> = match columns.get("VELO") {
        Some(&idx) => column(idx),
        None => {
            let (u_col, v_col) = match (columns.get("VELU"), columns.get("VELV")) {
                (Some(&u), Some(&v)) => (u, v),
                _ => {
                    return Err(ProcError::Data(format!(
                        "radial velocity components (VELU & VELV) not found in {}",
                        path.display()
                    )))
                }
            };
            rows.iter()
                .zip(&heading)
                .map(|(r, &head)| {
                    let (u, v) = (r[u_col], r[v_col]);
                    let rspd = u.hypot(v);
                    let rdir = v.atan2(u).to_degrees();
                    if (head - rdir).abs() % 360.0 > SIGN_TOLERANCE_DEG {
                        -rspd
                    } else {
                        rspd
                    }
                })
                .collect()
        }
    };

    let range = columns.get("RNGE").map(|&idx| column(idx));
    let vflag = columns.get("VFLG").map(|&idx| column(idx));

    Ok(LluvData {
        latitude,
        longitude,
        speed,
        heading,
        range,
        vflag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lluv(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("temp file");
        f.write_all(content.as_bytes()).expect("write");
        f
    }

    #[test]
    fn reads_velo_table() {
        let f = write_lluv(
            "%TableType: LLUV RDL9\n\
             %TableColumnTypes: LOND LATD VELO HEAD RNGE VFLG\n\
             -119.50 33.25 12.5 45.0 10.0 0\n\
             -119.60 33.30 -8.0 50.0 12.0 128\n",
        );
        let d = read_lluv(f.path(), 33.0, -119.0).expect("read");
        assert_eq!(d.len(), 2);
        assert_eq!(d.speed, vec![12.5, -8.0]);
        // 45 deg CW from N -> 45 deg CCW from E
        assert!((d.heading[0] - 45.0).abs() < 1e-12);
        assert_eq!(d.vflag.as_ref().unwrap()[1], 128.0);
    }

    #[test]
    fn derives_signed_speed_from_components() {
        // Radar at (0, 0); observation due north at (1, 0). The velocity
        // (0, -1) points back toward the radar: direction -90 deg, bearing
        // to origin 270 deg CCW from east, difference 360 -> 0 mod 360, so
        // the speed keeps its positive sign.
        let f = write_lluv(
            "%TableType: LLUV RDL9\n\
             %TableColumnTypes: LOND LATD VELU VELV\n\
             0.0 1.0 0.0 -1.0\n",
        );
        let d = read_lluv(f.path(), 0.0, 0.0).expect("read");
        assert!((d.heading[0] - 270.0).abs() < 1e-9);
        assert!((d.speed[0] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_position_columns_fail() {
        let f = write_lluv(
            "%TableType: LLUV RDL9\n\
             %TableColumnTypes: VELO HEAD\n\
             1.0 2.0\n",
        );
        assert!(read_lluv(f.path(), 0.0, 0.0).is_err());
    }

    #[test]
    fn empty_table_fails() {
        let f = write_lluv(
            "%TableType: LLUV RDL9\n\
             %TableColumnTypes: LOND LATD VELO\n",
        );
        assert!(read_lluv(f.path(), 0.0, 0.0).is_err());
    }
}
