//! CF-1.7 / ACDD-1.3 NetCDF export.
//!
//! Per-cell data is expanded onto the full raster and rotated so the
//! northwest corner lands at index (0, 0); variables are dimensioned
//! `(lon, lat, time)` with a single time step. Velocities are stored as
//! shorts with a 0.01 scale factor in m/s (1 cm/s resolution), dilutions
//! of precision as shorts scaled by 0.01, and variances scaled by 0.0001.

use crate::config::{now, Config, Product};
use crate::error::Result;
use crate::grid::GridSummary;
use crate::total::{AvgField, TotalField};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use std::path::Path;

const FORMAT_VERSION: &str = "1.1.00";
const CONVENTIONS: &str = "CF-1.7, ACDD-1.3";
const STD_NAME_VOCABULARY: &str = "CF Standard Name Table, Version 51";
const DEFLATE_LEVEL: i32 = 2;

const FILL_I16: i16 = -32767;
const FILL_I8: i8 = -127;

/// Expands per-ocean-cell values onto the full raster (NaN elsewhere) and
/// rotates clockwise: the output is `(n_lon, n_lat)` row-major with the
/// northwest corner first.
fn expand_rotate(grid: &GridSummary, ocean: &[f64]) -> Vec<f64> {
    let (m, n) = (grid.size[0], grid.size[1]);
    let mut full = vec![f64::NAN; m * n];
    for (k, &idx) in grid.ocean_indices.iter().enumerate() {
        full[idx] = ocean[k];
    }
    let mut out = vec![f64::NAN; m * n];
    for i in 0..m {
        for j in 0..n {
            out[j * m + (m - 1 - i)] = full[i * n + j];
        }
    }
    out
}

/// Scales and rounds to short, replacing non-finite or out-of-range values
/// with the fill value.
fn quantize_i16(vals: &[f64], multiplier: f64) -> Vec<i16> {
    vals.iter()
        .map(|&v| {
            let scaled = (v * multiplier).round();
            if scaled.is_finite() && scaled >= f64::from(i16::MIN) && scaled <= f64::from(i16::MAX)
            {
                scaled as i16
            } else {
                FILL_I16
            }
        })
        .collect()
}

fn quantize_i8(vals: &[f64]) -> Vec<i8> {
    vals.iter()
        .map(|&v| {
            let rounded = v.round();
            if rounded.is_finite() && rounded >= f64::from(i8::MIN) && rounded <= f64::from(i8::MAX)
            {
                rounded as i8
            } else {
                FILL_I8
            }
        })
        .collect()
}

fn epoch_i32(t: NaiveDateTime) -> i32 {
    t.and_utc().timestamp() as i32
}

/// Creates the file with its dimensions, coordinate variables, grid mapping,
/// and global attributes shared by every product.
fn create_common(
    c: &Config,
    path: &Path,
    grid: &GridSummary,
    file_id: &str,
    t: NaiveDateTime,
    bounds: (NaiveDateTime, NaiveDateTime),
) -> Result<netcdf::FileMut> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let (m, n) = (grid.size[0], grid.size[1]);
    let mut file = netcdf::create(path)?;

    file.add_dimension("lat", m)?;
    file.add_dimension("lon", n)?;
    file.add_dimension("nv", 2)?;
    file.add_unlimited_dimension("time")?;

    let mut time = file.add_variable::<i32>("time", &["time"])?;
    time.put_attribute("standard_name", "time")?;
    time.put_attribute("units", "seconds since 1970-01-01")?;
    time.put_attribute("calendar", "gregorian")?;
    time.put_attribute("bounds", "time_bnds")?;
    time.put_values(&[epoch_i32(t)], [0..1])?;

    let mut time_bnds = file.add_variable::<i32>("time_bnds", &["nv", "time"])?;
    time_bnds.put_values(&[epoch_i32(bounds.0), epoch_i32(bounds.1)], [0..2, 0..1])?;

    let mut lat = file.add_variable::<f32>("lat", &["lat"])?;
    lat.put_attribute("standard_name", "latitude")?;
    lat.put_attribute("units", "degrees_north")?;
    let lats: Vec<f32> = (0..m)
        .map(|i| (grid.y_range[0] + i as f64 * grid.dy) as f32)
        .collect();
    lat.put_values(&lats, ..)?;

    let mut lon = file.add_variable::<f32>("lon", &["lon"])?;
    lon.put_attribute("standard_name", "longitude")?;
    lon.put_attribute("units", "degrees_east")?;
    let lons: Vec<f32> = (0..n)
        .map(|j| (grid.x_range[0] + j as f64 * grid.dx) as f32)
        .collect();
    lon.put_values(&lons, ..)?;

    let mut depth = file.add_variable::<f32>("depth", &[])?;
    depth.put_attribute("standard_name", "depth")?;
    depth.put_attribute("units", "m")?;
    depth.put_attribute("bounds", "depth_bnds")?;
    depth.put_attribute(
        "comment",
        "Nominal depth (and corresponding bounds) based on contributing radars",
    )?;
    depth.put_values(&[c.metadata.depth_mean as f32], ..)?;

    let mut depth_bnds = file.add_variable::<f32>("depth_bnds", &["nv"])?;
    depth_bnds.put_values(&[0.0f32, c.metadata.depth_bottom as f32], ..)?;

    let mut wgs84 = file.add_variable::<i8>("wgs84", &[])?;
    wgs84.put_attribute("grid_mapping_name", "latitude_longitude")?;
    wgs84.put_attribute("longitude_of_prime_meridian", 0.0f64)?;
    wgs84.put_attribute("semi_major_axis", 6378137.0f64)?;
    wgs84.put_attribute("inverse_flattening", 298.257223563f64)?;
    wgs84.put_values(&[0i8], ..)?;

    file.add_attribute("Conventions", CONVENTIONS)?;
    file.add_attribute("id", file_id)?;
    file.add_attribute(
        "date_created",
        now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    )?;
    file.add_attribute("source", c.metadata.source.as_str())?;
    file.add_attribute("title", c.metadata.title.as_str())?;
    file.add_attribute("summary", c.metadata.summary.as_str())?;
    file.add_attribute("instrument", c.metadata.instrument.as_str())?;
    file.add_attribute("keywords", c.metadata.keywords.as_str())?;
    file.add_attribute("geospatial_lat_min", grid.y_range[0])?;
    file.add_attribute("geospatial_lat_max", grid.y_range[1])?;
    file.add_attribute("geospatial_lon_min", grid.x_range[0])?;
    file.add_attribute("geospatial_lon_max", grid.x_range[1])?;
    file.add_attribute("processing_level", c.metadata.processing_level.as_str())?;
    file.add_attribute("history", "")?;
    file.add_attribute("references", c.metadata.references.as_str())?;
    file.add_attribute("institution", c.metadata.institution.as_str())?;
    file.add_attribute("creator_type", c.metadata.creator_type.as_str())?;
    file.add_attribute("creator_name", c.metadata.creator_name.as_str())?;
    file.add_attribute("creator_email", c.metadata.creator_email.as_str())?;
    file.add_attribute("creator_url", c.metadata.creator_url.as_str())?;
    file.add_attribute("naming_authority", c.metadata.naming_authority.as_str())?;
    file.add_attribute("standard_name_vocabulary", STD_NAME_VOCABULARY)?;
    file.add_attribute(
        "keywords_vocabulary",
        c.metadata.keywords_vocabulary.as_str(),
    )?;
    file.add_attribute(
        "instrument_vocabulary",
        c.metadata.instrument_vocabulary.as_str(),
    )?;
    file.add_attribute("format_version", FORMAT_VERSION)?;

    Ok(file)
}

struct ShortVar<'a> {
    name: &'a str,
    standard_name: &'a str,
    units: &'a str,
    scale_factor: f64,
    data: Vec<i16>,
}

fn add_short_var(file: &mut netcdf::FileMut, grid: &GridSummary, sv: ShortVar) -> Result<()> {
    let (m, n) = (grid.size[0], grid.size[1]);
    let mut var = file.add_variable::<i16>(sv.name, &["lon", "lat", "time"])?;
    var.set_compression(DEFLATE_LEVEL, true)?;
    var.set_fill_value(FILL_I16)?;
    var.put_attribute("standard_name", sv.standard_name)?;
    var.put_attribute("units", sv.units)?;
    var.put_attribute("scale_factor", sv.scale_factor)?;
    var.put_attribute("grid_mapping", "wgs84")?;
    var.put_attribute("coordinates", "depth")?;
    var.put_values(&sv.data, [0..n, 0..m, 0..1])?;
    Ok(())
}

/// Writes an hourly total field. Cells at or above the NetCDF HDOP
/// threshold are dropped from every exported variable.
pub fn save_total(c: &Config, path: &Path, t: NaiveDateTime, u: &TotalField) -> Result<()> {
    let grid = &u.grid;

    let keep: Vec<bool> = u.hdop.iter().map(|h| *h < c.rtv.uwls_max_hdop_nc).collect();
    let masked = |vals: &[f64]| -> Vec<f64> {
        vals.iter()
            .zip(&keep)
            .map(|(&v, &k)| if k { v } else { f64::NAN })
            .collect()
    };

    let file_id = format!(
        "{}_{}_{}_{}",
        c.metadata.id_prefix,
        c.domain,
        c.resolution,
        t.format("%Y%m%dT%H%M%SZ")
    );
    let bounds = (t - Duration::minutes(30), t + Duration::minutes(30));
    let mut file = create_common(c, path, grid, &file_id, t, bounds)?;

    for (name, standard_name, data) in [
        ("u", "surface_eastward_sea_water_velocity", masked(&u.u)),
        ("v", "surface_northward_sea_water_velocity", masked(&u.v)),
    ] {
        add_short_var(
            &mut file,
            grid,
            ShortVar {
                name,
                standard_name,
                units: "m s-1",
                scale_factor: 0.01,
                // cm/s values store directly as hundredths of m/s
                data: quantize_i16(&expand_rotate(grid, &data), 1.0),
            },
        )?;
    }
    for (name, data) in [
        ("dopx", masked(&u.dopx)),
        ("dopy", masked(&u.dopy)),
        ("hdop", masked(&u.hdop)),
    ] {
        add_short_var(
            &mut file,
            grid,
            ShortVar {
                name,
                standard_name: "dilution_of_precision",
                units: "1",
                scale_factor: 0.01,
                data: quantize_i16(&expand_rotate(grid, &data), 100.0),
            },
        )?;
    }

    let (m, n) = (grid.size[0], grid.size[1]);
    let n_sites: Vec<f64> = u
        .n_sites
        .iter()
        .zip(&keep)
        .map(|(&s, &k)| if k { f64::from(s) } else { f64::NAN })
        .collect();
    let mut sites_var = file.add_variable::<i8>("number_of_sites", &["lon", "lat", "time"])?;
    sites_var.set_compression(DEFLATE_LEVEL, true)?;
    sites_var.set_fill_value(FILL_I8)?;
    sites_var.put_attribute("long_name", "number of contributing radar sites")?;
    sites_var.put_values(&quantize_i8(&expand_rotate(grid, &n_sites)), [0..n, 0..m, 0..1])?;

    let n_rads: Vec<f64> = u
        .n_rads
        .iter()
        .zip(&keep)
        .map(|(&r, &k)| if k { f64::from(r) } else { f64::NAN })
        .collect();
    let mut rads_var = file.add_variable::<i16>("number_of_radials", &["lon", "lat", "time"])?;
    rads_var.set_compression(DEFLATE_LEVEL, true)?;
    rads_var.set_fill_value(FILL_I16)?;
    rads_var.put_attribute("long_name", "number of contributing radial velocities")?;
    rads_var.put_values(&quantize_i16(&expand_rotate(grid, &n_rads), 1.0), [0..n, 0..m, 0..1])?;

    Ok(())
}

fn product_bounds(product: Product, tc: NaiveDateTime) -> (NaiveDateTime, NaiveDateTime) {
    match product {
        Product::Stc => (
            tc - Duration::minutes(12 * 60 + 30),
            tc + Duration::minutes(12 * 60 + 30),
        ),
        Product::LtaMonth => {
            let start = NaiveDate::from_ymd_opt(tc.year(), tc.month(), 1)
                .unwrap_or(tc.date())
                .and_hms_opt(0, 0, 0)
                .unwrap_or(tc);
            let (ny, nm) = if tc.month() == 12 {
                (tc.year() + 1, 1)
            } else {
                (tc.year(), tc.month() + 1)
            };
            let end = NaiveDate::from_ymd_opt(ny, nm, 1)
                .unwrap_or(tc.date())
                .and_hms_opt(0, 0, 0)
                .unwrap_or(tc);
            (start, end)
        }
        _ => {
            let start = NaiveDate::from_ymd_opt(tc.year(), 1, 1)
                .unwrap_or(tc.date())
                .and_hms_opt(0, 0, 0)
                .unwrap_or(tc);
            let end = NaiveDate::from_ymd_opt(tc.year() + 1, 1, 1)
                .unwrap_or(tc.date())
                .and_hms_opt(0, 0, 0)
                .unwrap_or(tc);
            (start, end)
        }
    }
}

/// Writes an averaged product (STC center-hour or LTA month/year).
pub fn save_avg(
    c: &Config,
    path: &Path,
    product: Product,
    tc: NaiveDateTime,
    a: &AvgField,
) -> Result<()> {
    let grid = &a.sums.grid;
    let label = match product {
        Product::Stc => "stc",
        Product::LtaMonth => "lta_month",
        _ => "lta_annual",
    };
    let file_id = format!(
        "{}_{label}_{}_{}_{}",
        c.metadata.id_prefix,
        c.domain,
        c.resolution,
        tc.format("%Y%m%dT%H%M%SZ")
    );
    let mut file = create_common(c, path, grid, &file_id, tc, product_bounds(product, tc))?;

    for (name, standard_name, units, scale, mult, data) in [
        ("u_mean", "surface_eastward_sea_water_velocity", "m s-1", 0.01, 1.0, &a.u_avg),
        ("v_mean", "surface_northward_sea_water_velocity", "m s-1", 0.01, 1.0, &a.v_avg),
        ("u_var", "surface_eastward_sea_water_velocity_variance", "m2 s-2", 0.0001, 1.0, &a.u_var),
        ("v_var", "surface_northward_sea_water_velocity_variance", "m2 s-2", 0.0001, 1.0, &a.v_var),
        ("u_min", "surface_eastward_sea_water_velocity_minimum", "m s-1", 0.01, 1.0, &a.sums.u_min),
        ("v_min", "surface_northward_sea_water_velocity_minimum", "m s-1", 0.01, 1.0, &a.sums.v_min),
        ("u_max", "surface_eastward_sea_water_velocity_maximum", "m s-1", 0.01, 1.0, &a.sums.u_max),
        ("v_max", "surface_northward_sea_water_velocity_maximum", "m s-1", 0.01, 1.0, &a.sums.v_max),
    ] {
        add_short_var(
            &mut file,
            grid,
            ShortVar {
                name,
                standard_name,
                units,
                scale_factor: scale,
                data: quantize_i16(&expand_rotate(grid, data), mult),
            },
        )?;
    }

    let (m, n) = (grid.size[0], grid.size[1]);
    let mut obs = file.add_variable::<i16>("n_obs", &["lon", "lat", "time"])?;
    obs.set_compression(DEFLATE_LEVEL, true)?;
    obs.set_fill_value(FILL_I16)?;
    obs.put_attribute("long_name", "number of observations")?;
    obs.put_values(
        &quantize_i16(&expand_rotate(grid, &a.sums.n_good), 1.0),
        [0..n, 0..m, 0..1],
    )?;

    Ok(())
}
