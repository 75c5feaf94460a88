//! Total vector fields and one-pass aggregate statistics.
//!
//! All per-cell vectors are indexed by ocean-cell position (the order of
//! `grid.ocean_indices`). NaN marks "no value" in floating-point fields.

use crate::config::now;
use crate::grid::GridSummary;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// UTC timestamp, `%Y-%m-%dT%H:%M:%SZ`.
    pub timestamp: String,
    pub program: String,
    pub user: String,
    pub message: String,
}

impl HistoryEntry {
    pub fn new(message: String) -> HistoryEntry {
        HistoryEntry {
            timestamp: now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            program: env!("CARGO_PKG_NAME").to_string(),
            user: std::env::var("USER").unwrap_or_default(),
            message,
        }
    }
}

/// An hourly total solution field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalField {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    /// Eastward velocity, cm/s.
    pub u: Vec<f64>,
    /// Northward velocity, cm/s.
    pub v: Vec<f64>,
    pub dopx: Vec<f64>,
    pub dopy: Vec<f64>,
    pub hdop: Vec<f64>,
    pub n_rads: Vec<u32>,
    pub n_sites: Vec<u32>,
    pub grid: GridSummary,
    pub history: Vec<HistoryEntry>,
}

impl TotalField {
    pub fn n_cells(&self) -> usize {
        self.u.len()
    }

    /// Number of cells holding a solution.
    pub fn n_finite(&self) -> usize {
        self.u.iter().filter(|u| u.is_finite()).count()
    }

    /// True when any cell's HDOP is at or below the threshold.
    pub fn any_below_hdop(&self, max_hdop: f64) -> bool {
        self.hdop.iter().any(|h| *h <= max_hdop)
    }

    pub fn push_history(&mut self, message: String) {
        self.history.push(HistoryEntry::new(message));
    }
}

/// One-pass sums over a sequence of total fields. `n_good` is kept as a
/// float so gated cells can be marked NaN like every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumField {
    pub lat: Vec<f64>,
    pub lon: Vec<f64>,
    pub n_good: Vec<f64>,
    pub u_sum: Vec<f64>,
    pub v_sum: Vec<f64>,
    pub u2_sum: Vec<f64>,
    pub v2_sum: Vec<f64>,
    pub u_min: Vec<f64>,
    pub v_min: Vec<f64>,
    pub u_max: Vec<f64>,
    pub v_max: Vec<f64>,
    pub grid: GridSummary,
}

impl SumField {
    pub fn new(grid: GridSummary, lat: Vec<f64>, lon: Vec<f64>) -> SumField {
        let n = lat.len();
        SumField {
            lat,
            lon,
            n_good: vec![0.0; n],
            u_sum: vec![0.0; n],
            v_sum: vec![0.0; n],
            u2_sum: vec![0.0; n],
            v2_sum: vec![0.0; n],
            u_min: vec![f64::NAN; n],
            v_min: vec![f64::NAN; n],
            u_max: vec![f64::NAN; n],
            v_max: vec![f64::NAN; n],
            grid,
        }
    }

    pub fn n_cells(&self) -> usize {
        self.n_good.len()
    }

    /// Accumulates one velocity field, skipping NaN cells.
    pub fn accumulate(&mut self, u: &[f64], v: &[f64]) {
        for i in 0..self.n_cells() {
            if u[i].is_finite() {
                self.n_good[i] += 1.0;
                self.u_sum[i] += u[i];
                self.u2_sum[i] += u[i] * u[i];
                self.u_min[i] = nan_min(self.u_min[i], u[i]);
                self.u_max[i] = nan_max(self.u_max[i], u[i]);
            }
            if v[i].is_finite() {
                self.v_sum[i] += v[i];
                self.v2_sum[i] += v[i] * v[i];
                self.v_min[i] = nan_min(self.v_min[i], v[i]);
                self.v_max[i] = nan_max(self.v_max[i], v[i]);
            }
        }
    }

    /// Merges another sum field cell-by-cell (annual rollup of monthly
    /// sums). NaN contributions are skipped.
    pub fn merge(&mut self, other: &SumField) {
        for i in 0..self.n_cells() {
            self.n_good[i] = nan_add(self.n_good[i], other.n_good[i]);
            self.u_sum[i] = nan_add(self.u_sum[i], other.u_sum[i]);
            self.v_sum[i] = nan_add(self.v_sum[i], other.v_sum[i]);
            self.u2_sum[i] = nan_add(self.u2_sum[i], other.u2_sum[i]);
            self.v2_sum[i] = nan_add(self.v2_sum[i], other.v2_sum[i]);
            self.u_min[i] = nan_min(self.u_min[i], other.u_min[i]);
            self.v_min[i] = nan_min(self.v_min[i], other.v_min[i]);
            self.u_max[i] = nan_max(self.u_max[i], other.u_max[i]);
            self.v_max[i] = nan_max(self.v_max[i], other.v_max[i]);
        }
    }

    /// Marks every cell with fewer than `min_count` good observations as
    /// having no value. Returns the number of cells masked.
    pub fn mask_below_coverage(&mut self, min_count: f64) -> usize {
        let mut masked = 0;
        for i in 0..self.n_cells() {
            if self.n_good[i] < min_count {
                self.n_good[i] = f64::NAN;
                self.u_sum[i] = f64::NAN;
                self.v_sum[i] = f64::NAN;
                self.u2_sum[i] = f64::NAN;
                self.v2_sum[i] = f64::NAN;
                self.u_min[i] = f64::NAN;
                self.v_min[i] = f64::NAN;
                self.u_max[i] = f64::NAN;
                self.v_max[i] = f64::NAN;
                masked += 1;
            }
        }
        masked
    }

    /// True when any cell still has a nonzero good-observation count.
    pub fn any_good(&self) -> bool {
        self.n_good.iter().any(|n| n.is_finite() && *n > 0.0)
    }

    /// Computes averages and Bessel-corrected sample variances. A single
    /// observation yields zero variance; cells without observations stay
    /// NaN.
    pub fn into_avg(self) -> AvgField {
        let n = self.n_cells();
        let mut u_avg = vec![f64::NAN; n];
        let mut v_avg = vec![f64::NAN; n];
        let mut u_var = vec![f64::NAN; n];
        let mut v_var = vec![f64::NAN; n];
        for i in 0..n {
            let count = self.n_good[i];
            if !count.is_finite() || count <= 0.0 {
                continue;
            }
            u_avg[i] = self.u_sum[i] / count;
            v_avg[i] = self.v_sum[i] / count;
            if count > 1.0 {
                u_var[i] =
                    (self.u2_sum[i] - self.u_sum[i] * self.u_sum[i] / count) / (count - 1.0);
                v_var[i] =
                    (self.v2_sum[i] - self.v_sum[i] * self.v_sum[i] / count) / (count - 1.0);
            } else {
                u_var[i] = 0.0;
                v_var[i] = 0.0;
            }
        }
        AvgField {
            sums: self,
            u_avg,
            v_avg,
            u_var,
            v_var,
        }
    }
}

/// Averages and variances derived from a [`SumField`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvgField {
    pub sums: SumField,
    pub u_avg: Vec<f64>,
    pub v_avg: Vec<f64>,
    pub u_var: Vec<f64>,
    pub v_var: Vec<f64>,
}

impl AvgField {
    pub fn n_cells(&self) -> usize {
        self.u_avg.len()
    }

    pub fn any_finite(&self) -> bool {
        self.u_avg.iter().any(|u| u.is_finite())
    }

    /// Marks one cell as having no value across every field.
    pub fn clear_cell(&mut self, i: usize) {
        self.sums.n_good[i] = f64::NAN;
        self.sums.u_sum[i] = f64::NAN;
        self.sums.v_sum[i] = f64::NAN;
        self.sums.u2_sum[i] = f64::NAN;
        self.sums.v2_sum[i] = f64::NAN;
        self.sums.u_min[i] = f64::NAN;
        self.sums.v_min[i] = f64::NAN;
        self.sums.u_max[i] = f64::NAN;
        self.sums.v_max[i] = f64::NAN;
        self.u_avg[i] = f64::NAN;
        self.v_avg[i] = f64::NAN;
        self.u_var[i] = f64::NAN;
        self.v_var[i] = f64::NAN;
    }
}

fn nan_min(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, _) => b,
        (_, true) => a,
        _ => a.min(b),
    }
}

fn nan_max(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, _) => b,
        (_, true) => a,
        _ => a.max(b),
    }
}

fn nan_add(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        _ => a + b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(n: usize) -> GridSummary {
        GridSummary {
            resolution_km: 6.0,
            projection: "equirectangular".to_string(),
            x_range: [-120.0, -119.0],
            y_range: [33.0, 34.0],
            dx: 0.05,
            dy: 0.05,
            size: [1, n],
            ocean_indices: (0..n).collect(),
        }
    }

    fn sums(n: usize) -> SumField {
        SumField::new(summary(n), vec![33.0; n], vec![-119.0; n])
    }

    #[test]
    fn one_pass_stats_match_direct_computation() {
        let mut s = sums(1);
        for x in [2.0, 4.0, 6.0] {
            s.accumulate(&[x], &[-x]);
        }
        let a = s.into_avg();
        assert_eq!(a.sums.n_good[0], 3.0);
        assert_eq!(a.u_avg[0], 4.0);
        assert_eq!(a.v_avg[0], -4.0);
        // sample variance of {2, 4, 6} is 4
        assert!((a.u_var[0] - 4.0).abs() < 1e-12);
        assert!((a.v_var[0] - 4.0).abs() < 1e-12);
        assert_eq!(a.sums.u_min[0], 2.0);
        assert_eq!(a.sums.u_max[0], 6.0);
    }

    #[test]
    fn single_observation_has_zero_variance() {
        let mut s = sums(1);
        s.accumulate(&[5.0], &[5.0]);
        let a = s.into_avg();
        assert_eq!(a.u_avg[0], 5.0);
        assert_eq!(a.u_var[0], 0.0);
    }

    #[test]
    fn nan_cells_are_skipped() {
        let mut s = sums(2);
        s.accumulate(&[1.0, f64::NAN], &[1.0, f64::NAN]);
        s.accumulate(&[3.0, 7.0], &[3.0, 7.0]);
        assert_eq!(s.n_good, vec![2.0, 1.0]);
        assert_eq!(s.u_sum, vec![4.0, 7.0]);
        assert_eq!(s.u_min, vec![1.0, 7.0]);
    }

    #[test]
    fn coverage_mask_clears_cells() {
        let mut s = sums(2);
        s.accumulate(&[1.0, 1.0], &[1.0, 1.0]);
        s.accumulate(&[2.0, f64::NAN], &[2.0, f64::NAN]);
        assert_eq!(s.mask_below_coverage(2.0), 1);
        assert!(s.n_good[1].is_nan());
        assert!(s.u_sum[1].is_nan());
        assert!(s.any_good());
        let a = s.into_avg();
        assert!(a.u_avg[1].is_nan());
        assert_eq!(a.u_avg[0], 1.5);
    }
}
