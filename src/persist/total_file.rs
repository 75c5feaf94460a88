//! Binary total files.
//!
//! Serialized with bincode behind a one-byte format version so schema
//! changes are detected instead of misread. Reloading a written file
//! reproduces the in-memory field exactly, including NaN positions.

use crate::error::{ProcError, Result};
use crate::radial::Radial;
use crate::total::{AvgField, SumField, TotalField};
use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const FORMAT_VERSION: u8 = 1;

/// An hourly total file: the solution field plus the radial datasets it was
/// built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalRecord {
    pub t: NaiveDateTime,
    pub u: TotalField,
    pub r: Vec<Radial>,
}

/// An averaged product (STC or LTA) at its center time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvgRecord {
    pub tc: NaiveDateTime,
    pub a: AvgField,
}

/// A monthly sum file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumRecord {
    pub t: NaiveDateTime,
    pub s: SumField,
}

fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| ProcError::Transient(format!("failed to make dir {}: {e}", dir.display())))?;
    }
    let file = std::fs::File::create(path)
        .map_err(|e| ProcError::Transient(format!("error saving {}: {e}", path.display())))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&[FORMAT_VERSION])?;
    bincode::serialize_into(&mut writer, record)?;
    writer.flush()?;
    Ok(())
}

fn read_record<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProcError::Data(format!("error loading {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut version = [0u8; 1];
    reader
        .read_exact(&mut version)
        .map_err(|e| ProcError::Data(format!("error loading {}: {e}", path.display())))?;
    if version[0] != FORMAT_VERSION {
        return Err(ProcError::Data(format!(
            "{} has format version {}, expected {FORMAT_VERSION}",
            path.display(),
            version[0]
        )));
    }
    bincode::deserialize_from(reader)
        .map_err(|e| ProcError::Data(format!("error loading {}: {e}", path.display())))
}

pub fn write_total(path: &Path, record: &TotalRecord) -> Result<()> {
    write_record(path, record)
}

pub fn read_total(path: &Path) -> Result<TotalRecord> {
    read_record(path)
}

pub fn write_avg(path: &Path, record: &AvgRecord) -> Result<()> {
    write_record(path, record)
}

pub fn read_avg(path: &Path) -> Result<AvgRecord> {
    read_record(path)
}

pub fn write_sum(path: &Path, record: &SumRecord) -> Result<()> {
    write_record(path, record)
}

pub fn read_sum(path: &Path) -> Result<SumRecord> {
    read_record(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSummary;

    fn field() -> TotalField {
        TotalField {
            lat: vec![33.0, 33.1],
            lon: vec![-119.0, -119.1],
            u: vec![12.5, f64::NAN],
            v: vec![-3.25, f64::NAN],
            dopx: vec![1.0, f64::NAN],
            dopy: vec![1.5, f64::NAN],
            hdop: vec![1.8, f64::NAN],
            n_rads: vec![9, 0],
            n_sites: vec![2, 0],
            grid: GridSummary {
                resolution_km: 6.0,
                projection: "equirectangular".to_string(),
                x_range: [-120.0, -119.0],
                y_range: [33.0, 34.0],
                dx: 0.05,
                dy: 0.05,
                size: [1, 2],
                ocean_indices: vec![0, 1],
            },
            history: Vec::new(),
        }
    }

    #[test]
    fn total_round_trip_preserves_nan_positions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("deep/rtv_test.tot");
        let record = TotalRecord {
            t: chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            u: field(),
            r: Vec::new(),
        };
        write_total(&path, &record).expect("write");
        let loaded = read_total(&path).expect("read");
        assert_eq!(loaded.t, record.t);
        assert_eq!(loaded.u.u[0].to_bits(), record.u.u[0].to_bits());
        assert!(loaded.u.u[1].is_nan());
        assert_eq!(loaded.u.n_rads, record.u.n_rads);
        assert_eq!(loaded.u.grid, record.u.grid);
    }

    #[test]
    fn sum_and_avg_round_trip() {
        use crate::total::SumField;

        let dir = tempfile::tempdir().expect("tempdir");
        let t = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();

        let mut s = SumField::new(field().grid, vec![33.0, 33.1], vec![-119.0, -119.1]);
        s.accumulate(&[4.0, 1.0], &[2.0, -1.0]);
        s.accumulate(&[6.0, 3.0], &[4.0, 1.0]);
        let sum_path = dir.path().join("month_sum.tot");
        write_sum(&sum_path, &SumRecord { t, s: s.clone() }).expect("write sum");
        assert_eq!(read_sum(&sum_path).expect("read sum").s, s);

        let a = s.into_avg();
        let avg_path = dir.path().join("month.tot");
        write_avg(&avg_path, &AvgRecord { tc: t, a: a.clone() }).expect("write avg");
        assert_eq!(read_avg(&avg_path).expect("read avg").a, a);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.tot");
        std::fs::write(&path, [9u8, 0, 0, 0]).expect("write");
        assert!(matches!(read_total(&path), Err(ProcError::Data(_))));
    }
}
