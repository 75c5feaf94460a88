//! Four-column ASCII export: `lat lon u v`.

use crate::error::{ProcError, Result};
use crate::total::{AvgField, TotalField};
use std::io::{BufWriter, Write};
use std::path::Path;

fn open(path: &Path) -> Result<BufWriter<std::fs::File>> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| ProcError::Transient(format!("failed to make dir {}: {e}", dir.display())))?;
    }
    let file = std::fs::File::create(path)
        .map_err(|e| ProcError::Transient(format!("error saving {}: {e}", path.display())))?;
    Ok(BufWriter::new(file))
}

fn write_row(w: &mut impl Write, lat: f64, lon: f64, u: f64, v: f64) -> Result<()> {
    writeln!(w, "{lat:8.4} {lon:9.4} {u:7.0} {v:7.0}")?;
    Ok(())
}

/// Exports an hourly total field, keeping cells at or below the ASCII HDOP
/// threshold.
pub fn save_total(path: &Path, u: &TotalField, max_hdop: f64) -> Result<()> {
    let mut w = open(path)?;
    for i in 0..u.n_cells() {
        if u.hdop[i] <= max_hdop {
            write_row(&mut w, u.lat[i], u.lon[i], u.u[i], u.v[i])?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Exports an averaged field, keeping cells with a defined average.
pub fn save_avg(path: &Path, a: &AvgField) -> Result<()> {
    let mut w = open(path)?;
    for i in 0..a.n_cells() {
        if a.u_avg[i].is_finite() {
            write_row(&mut w, a.sums.lat[i], a.sums.lon[i], a.u_avg[i], a.v_avg[i])?;
        }
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridSummary;

    #[test]
    fn rows_filter_on_hdop_and_format_fixed_width() {
        let u = TotalField {
            lat: vec![33.1234, 33.5],
            lon: vec![-119.5678, -119.0],
            u: vec![12.4, 99.0],
            v: vec![-3.6, 99.0],
            dopx: vec![1.0, 1.0],
            dopy: vec![1.0, 1.0],
            hdop: vec![1.2, 3.5],
            n_rads: vec![4, 4],
            n_sites: vec![2, 2],
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
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.asc");
        save_total(&path, &u, 2.0).expect("save");
        let text = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], " 33.1234 -119.5678      12      -4");
    }
}
