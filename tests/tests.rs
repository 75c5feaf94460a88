//! End-to-end pipeline tests over synthetic grids, catalogs, and radial
//! files.

use chrono::{NaiveDate, NaiveDateTime};
use rtvproc::config::{
    Config, DbCfg, LtaCfg, Metadata, PathsCfg, ProcessCfg, ProcessName, Product, RtvCfg, RunMode,
    StcCfg,
};
use rtvproc::grid::{small_circle, Grid, GridSummary, Landmask, SCIRCLE_NPTS};
use rtvproc::merge;
use rtvproc::persist::total_file::{self, TotalRecord};
use rtvproc::process;
use rtvproc::stc;
use rtvproc::total::TotalField;
use rusqlite::{params, Connection};
use std::path::Path;

const SEARCH_RADIUS_KM: f64 = 30.0;

fn hour_t() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 15)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap()
}

/// A 3x3 all-ocean grid centered near (33.1, -119.5).
fn test_grid() -> Grid {
    let (x0, y0, d) = (-119.6, 33.0, 0.1);
    let mut ocean_lat = Vec::new();
    let mut ocean_lon = Vec::new();
    let mut sc_x = Vec::new();
    let mut sc_y = Vec::new();
    for row in 0..3 {
        for col in 0..3 {
            let lat = y0 + row as f64 * d;
            let lon = x0 + col as f64 * d;
            ocean_lat.push(lat);
            ocean_lon.push(lon);
            let (lats, lons) = small_circle(lat, lon, SEARCH_RADIUS_KM, SCIRCLE_NPTS);
            sc_y.push(lats);
            sc_x.push(lons);
        }
    }
    Grid {
        domain: "test".to_string(),
        resolution: "6km".to_string(),
        resolution_km: 6.0,
        projection: "equirectangular".to_string(),
        x_range: [x0, x0 + 2.0 * d],
        y_range: [y0, y0 + 2.0 * d],
        dx: d,
        dy: d,
        size: [3, 3],
        ocean_indices: (0..9).collect(),
        ocean_lon,
        ocean_lat,
        scircle_radius_km: SEARCH_RADIUS_KM,
        ocean_x_scircle: sc_x,
        ocean_y_scircle: sc_y,
    }
}

fn test_config(root: &Path) -> Config {
    Config {
        domain: "test".to_string(),
        resolution: "6km".to_string(),
        confdb: DbCfg {
            path: root.join("conf.db"),
            login_timeout_s: 5,
        },
        raddb: DbCfg {
            path: root.join("rad.db"),
            login_timeout_s: 5,
        },
        gridfile: root.join("grid.bin"),
        landfile: root.join("land.bin"),
        lockfile: root.join("proc.lock"),
        max_threads: 2,
        processes: vec![ProcessCfg {
            name: ProcessName::Rtv,
            method: "uwls".to_string(),
            description: "unweighted least squares".to_string(),
            save_as: "mat,ascii".to_string(),
        }],
        rtv: RtvCfg {
            grid_search_radius: SEARCH_RADIUS_KM,
            min_rad_sites: 2,
            min_radials: 2,
            max_rad_speed: 100.0,
            max_rtv_speed: 100.0,
            uwls_max_hdop: 10.0,
            uwls_max_hdop_ascii: 3.0,
            uwls_max_hdop_nc: 3.0,
            max_age: 96,
        },
        stc: StcCfg {
            max_error: 2.0,
            min_temporal_coverage: 12,
            max_age: 96,
        },
        lta: LtaCfg {
            max_error: 2.0,
            monthly_min_month_day: 5,
            annual_min_date: NaiveDate::from_ymd_opt(2024, 2, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            min_month_temporal_coverage: 10.0,
            min_year_temporal_coverage: 120.0,
        },
        paths: PathsCfg {
            mdir: root.join("m"),
            msumdir: root.join("msum"),
            asciidir: root.join("ascii"),
            ncdir: root.join("nc"),
        },
        metadata: Metadata {
            id_prefix: "test".to_string(),
            title: "test totals".to_string(),
            summary: "synthetic".to_string(),
            source: "test".to_string(),
            instrument: "radar".to_string(),
            keywords: "currents".to_string(),
            keywords_vocabulary: "none".to_string(),
            instrument_vocabulary: "none".to_string(),
            processing_level: "L3".to_string(),
            references: String::new(),
            institution: "test".to_string(),
            naming_authority: "test".to_string(),
            creator_type: "group".to_string(),
            creator_name: "test".to_string(),
            creator_email: "test@example.org".to_string(),
            creator_url: "https://example.org".to_string(),
            depth_mean: 0.5,
            depth_bottom: 1.0,
        },
    }
}

fn write_bincode<T: serde::Serialize>(path: &Path, value: &T) {
    let file = std::fs::File::create(path).expect("create");
    bincode::serialize_into(file, value).expect("serialize");
}

/// Seeds the configuration and radial catalog databases with two sites and
/// one radial file each for the test hour.
fn seed_databases(c: &Config, radial_dir: &Path) {
    let conn = Connection::open(&c.confdb.path).expect("confdb");
    conn.execute_batch(
        "CREATE TABLE domain (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE resolution (id INTEGER PRIMARY KEY, name TEXT);
         CREATE TABLE site (id INTEGER PRIMARY KEY, network TEXT, name TEXT);
         CREATE TABLE site_config (
             site_id INTEGER, domain_id INTEGER, resolution_id INTEGER,
             beampattern TEXT, use_radial_minute INTEGER,
             start_time TEXT, end_time TEXT);
         CREATE TABLE state (
             domain_id INTEGER, resolution_id INTEGER, name TEXT,
             time TEXT, csv TEXT,
             PRIMARY KEY (domain_id, resolution_id, name));
         INSERT INTO domain (id, name) VALUES (1, 'test');
         INSERT INTO resolution (id, name) VALUES (1, '6km');
         INSERT INTO site (id, network, name) VALUES (1, 'tnet', 'sth'), (2, 'tnet', 'wst');",
    )
    .expect("conf schema");
    let start = NaiveDate::from_ymd_opt(2000, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    for site_id in [1, 2] {
        conn.execute(
            "INSERT INTO site_config \
             (site_id, domain_id, resolution_id, beampattern, use_radial_minute, start_time, end_time) \
             VALUES (?1, 1, 1, 'ideal', 0, ?2, NULL)",
            params![site_id, start],
        )
        .expect("site_config");
    }

    let conn = Connection::open(&c.raddb.path).expect("raddb");
    conn.execute_batch(
        "CREATE TABLE network (network_id INTEGER PRIMARY KEY, net TEXT);
         CREATE TABLE site (site_id INTEGER PRIMARY KEY, network_id INTEGER, sta TEXT);
         CREATE TABLE radialfiles (
             time INTEGER, file_arrival_time TEXT, lat REAL, lon REAL,
             range_res REAL, range_bin_end REAL, manufacturer TEXT,
             dfile TEXT, dir TEXT, patterntype TEXT,
             site_id INTEGER, network_id INTEGER);
         INSERT INTO network (network_id, net) VALUES (1, 'tnet');
         INSERT INTO site (site_id, network_id, sta) VALUES (1, 1, 'sth'), (2, 1, 'wst');",
    )
    .expect("rad schema");

    let t = hour_t();
    let epoch = t.and_utc().timestamp();
    let arrival = t + chrono::Duration::hours(1);
    let dir_str = radial_dir.to_string_lossy().to_string();
    // Southern site looks north (heading 90 CCW from E, HEAD 0); western
    // site looks east (heading 0, HEAD 90). With a true current of
    // (u, v) = (10, 5) cm/s the radial speeds are 5 and 10.
    for (site_id, lat, lon, dfile) in [
        (1, 32.9, -119.5, "sth.ruv"),
        (2, 33.1, -119.8, "wst.ruv"),
    ] {
        conn.execute(
            "INSERT INTO radialfiles \
             (time, file_arrival_time, lat, lon, range_res, range_bin_end, manufacturer, \
              dfile, dir, patterntype, site_id, network_id) \
             VALUES (?1, ?2, ?3, ?4, 2.0, 20.0, 'codar', ?5, ?6, 'i', ?7, 1)",
            params![epoch, arrival, lat, lon, dfile, dir_str, site_id],
        )
        .expect("radialfiles");
    }

    let sth = "%TableType: LLUV RDL9\n\
               %TableColumnTypes: LOND LATD VELO HEAD RNGE\n\
               -119.50 33.09 5.0 0.0 21.0\n\
               -119.50 33.10 5.0 0.0 22.0\n\
               -119.50 33.11 5.0 0.0 23.0\n";
    std::fs::write(radial_dir.join("sth.ruv"), sth).expect("sth.ruv");
    let wst = "%TableType: LLUV RDL9\n\
               %TableColumnTypes: LOND LATD VELO HEAD RNGE\n\
               -119.51 33.10 10.0 90.0 26.0\n\
               -119.50 33.10 10.0 90.0 27.0\n\
               -119.49 33.10 10.0 90.0 28.0\n";
    std::fs::write(radial_dir.join("wst.ruv"), wst).expect("wst.ruv");
}

#[test]
fn reprocess_produces_consistent_totals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let radial_dir = dir.path().join("radials");
    std::fs::create_dir_all(&radial_dir).expect("radial dir");
    let c = test_config(dir.path());
    write_bincode(&c.gridfile, &test_grid());
    write_bincode(
        &c.landfile,
        &Landmask {
            domain: "test".to_string(),
            polygons: Vec::new(),
        },
    );
    seed_databases(&c, &radial_dir);

    let t = hour_t();
    let mode = RunMode::Reprocess {
        times: vec![t],
        lock: false,
    };
    process::process(&c, &mode).expect("process");

    let files = c.paths.filenames("test", "6km", Product::Rtv, t);
    let record = total_file::read_total(&files.mpathfile).expect("total written");
    assert_eq!(record.t, t);
    assert_eq!(record.r.len(), 2);
    assert_eq!(record.u.n_cells(), 9);

    for i in 0..9 {
        assert!(
            (record.u.u[i] - 10.0).abs() < 1e-9,
            "u at cell {i}: {}",
            record.u.u[i]
        );
        assert!((record.u.v[i] - 5.0).abs() < 1e-9);
        // three radials along each axis: C = diag(1/3, 1/3)
        assert!((record.u.hdop[i] - (2.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert_eq!(record.u.n_rads[i], 6);
        assert_eq!(record.u.n_sites[i], 2);
        // invariants every published solution honors
        assert!(record.u.hdop[i] <= c.rtv.uwls_max_hdop);
        assert!(record.u.u[i].hypot(record.u.v[i]) <= c.rtv.max_rtv_speed);
        assert!(record.u.n_rads[i] as usize >= c.rtv.min_radials);
        assert!(record.u.n_sites[i] as usize >= c.rtv.min_rad_sites);
    }
    assert_eq!(record.u.history.len(), 1);
    assert_eq!(record.u.history[0].message, "Saving 9 new solutions");

    let ascii = std::fs::read_to_string(&files.asciipathfile).expect("ascii written");
    assert_eq!(ascii.lines().count(), 9);

    // Reprocessing the same hour again deletes and rewrites the products.
    process::process(&c, &mode).expect("reprocess");
    let again = total_file::read_total(&files.mpathfile).expect("total rewritten");
    assert_eq!(again.u.u, record.u.u);
    assert_eq!(again.u.history.len(), 1);
}

fn small_field(u: Vec<f64>, v: Vec<f64>, hdop: Vec<f64>) -> TotalField {
    let n = u.len();
    TotalField {
        lat: (0..n).map(|i| 33.0 + i as f64 * 0.1).collect(),
        lon: vec![-119.5; n],
        u,
        v,
        dopx: vec![1.0; n],
        dopy: vec![1.0; n],
        hdop,
        n_rads: vec![4; n],
        n_sites: vec![2; n],
        grid: GridSummary {
            resolution_km: 6.0,
            projection: "equirectangular".to_string(),
            x_range: [-119.6, -119.4],
            y_range: [33.0, 33.2],
            dx: 0.1,
            dy: 0.1,
            size: [1, n],
            ocean_indices: (0..n).collect(),
        },
        history: Vec::new(),
    }
}

#[test]
fn merge_carries_prior_cells_and_appends_history() {
    // Prior run solved cell 0; the current run solves only cell 1.
    let mut prior_u = small_field(
        vec![0.2, f64::NAN],
        vec![0.1, f64::NAN],
        vec![1.5, f64::NAN],
    );
    prior_u.push_history("Saving 1 new solutions".to_string());
    let prior = TotalRecord {
        t: hour_t(),
        u: prior_u,
        r: Vec::new(),
    };

    let mut u = small_field(
        vec![f64::NAN, 7.0],
        vec![f64::NAN, -2.0],
        vec![f64::NAN, 1.1],
    );
    let mut r = Vec::new();
    merge::merge_with_prior(Some(prior), &mut r, &mut u).expect("merge");

    // carried-over cell keeps the prior values
    assert_eq!(u.u[0], 0.2);
    assert_eq!(u.v[0], 0.1);
    assert_eq!(u.hdop[0], 1.5);
    // updated cell keeps the current values
    assert_eq!(u.u[1], 7.0);
    assert_eq!(u.v[1], -2.0);
    assert_eq!(u.history.len(), 2);
    assert_eq!(
        u.history[1].message,
        "Saving 2 solutions; 1 new or updated, 1 unmodified from previous run(s)"
    );
}

#[test]
fn merge_without_prior_starts_history() {
    let mut u = small_field(vec![1.0], vec![2.0], vec![1.0]);
    let mut r = Vec::new();
    merge::merge_with_prior(None, &mut r, &mut u).expect("merge");
    assert_eq!(u.history.len(), 1);
    assert_eq!(u.history[0].message, "Saving 1 new solutions");
}

/// Writes hourly total files into the rtv path convention around `tc`.
fn write_hourly_totals(c: &Config, tc: NaiveDateTime, offsets: &[i64], u_value: f64, hdop: f64) {
    for &h in offsets {
        let t = tc + chrono::Duration::hours(h);
        let files = c.paths.filenames(&c.domain, &c.resolution, Product::Rtv, t);
        let record = TotalRecord {
            t,
            u: small_field(vec![u_value, u_value], vec![-u_value, 0.0], vec![hdop, hdop]),
            r: Vec::new(),
        };
        total_file::write_total(&files.mpathfile, &record).expect("write total");
    }
}

#[test]
fn stc_drops_windows_below_minimum_coverage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let c = test_config(dir.path());
    let tc = hour_t();
    // Only 4 of 25 hourly files exist; the 12-hour minimum gates them out.
    write_hourly_totals(&c, tc, &[-2, -1, 0, 1], 10.0, 1.0);
    let result = stc::compute_25hr_avg(&c, tc).expect("compute");
    assert!(result.is_none());
}

#[test]
fn stc_averages_filter_on_hdop_and_coverage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut c = test_config(dir.path());
    c.stc.min_temporal_coverage = 10;
    let tc = hour_t();
    let offsets: Vec<i64> = (-6..6).collect();
    // hdop 1.0 passes the 2.0 sub-tidal threshold
    write_hourly_totals(&c, tc, &offsets, 10.0, 1.0);

    let a = stc::compute_25hr_avg(&c, tc)
        .expect("compute")
        .expect("average returned");
    assert_eq!(a.sums.n_good[0], 12.0);
    assert!((a.u_avg[0] - 10.0).abs() < 1e-12);
    assert!((a.v_avg[0] + 10.0).abs() < 1e-12);
    // constant series has zero variance
    assert!(a.u_var[0].abs() < 1e-9);

    // A field over the HDOP threshold contributes nothing.
    let dir2 = tempfile::tempdir().expect("tempdir");
    let mut c2 = test_config(dir2.path());
    c2.stc.min_temporal_coverage = 10;
    write_hourly_totals(&c2, tc, &offsets, 10.0, 5.0);
    assert!(stc::compute_25hr_avg(&c2, tc).expect("compute").is_none());
}

#[test]
fn total_file_round_trip_is_exact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("round.tot");
    let record = TotalRecord {
        t: hour_t(),
        u: small_field(
            vec![1.25, f64::NAN, -3.5],
            vec![0.0, f64::NAN, 2.5],
            vec![1.0, f64::NAN, 1.9],
        ),
        r: Vec::new(),
    };
    total_file::write_total(&path, &record).expect("write");
    let loaded = total_file::read_total(&path).expect("read");

    // bit-for-bit on every float field, including NaN positions
    let pairs = [
        (&loaded.u.u, &record.u.u),
        (&loaded.u.v, &record.u.v),
        (&loaded.u.dopx, &record.u.dopx),
        (&loaded.u.dopy, &record.u.dopy),
        (&loaded.u.hdop, &record.u.hdop),
        (&loaded.u.lat, &record.u.lat),
        (&loaded.u.lon, &record.u.lon),
    ];
    for (got, want) in pairs {
        let got: Vec<u64> = got.iter().map(|x| x.to_bits()).collect();
        let want: Vec<u64> = want.iter().map(|x| x.to_bits()).collect();
        assert_eq!(got, want);
    }
    assert_eq!(loaded.t, record.t);
    assert_eq!(loaded.u.n_rads, record.u.n_rads);
    assert_eq!(loaded.u.n_sites, record.u.n_sites);
    assert_eq!(loaded.u.grid, record.u.grid);
}
