//! Near real-time and reprocessing pipeline for HF ocean radar data.
//!
//! Radial velocity files from multiple radar sites are fused on a common
//! geographic grid into hourly total vector fields (RTV) by unweighted
//! least squares, then aggregated into 25-hour sub-tidal currents (STC)
//! and monthly/annual long-term averages (LTA). Per-`(domain, resolution)`
//! state tracking decides what needs processing and a file lock keeps runs
//! exclusive.

pub mod catalog;
pub mod config;
pub mod error;
pub mod grid;
pub mod lluv;
pub mod lock;
pub mod lta;
pub mod merge;
pub mod persist;
pub mod process;
pub mod radial;
pub mod rtv;
pub mod siteconfig;
pub mod solver;
pub mod state;
pub mod stc;
pub mod total;
