//! Product persistence.
//!
//! Every product is written to a binary total file (the merge authority and
//! the format later pipeline stages reload), and optionally published as
//! ASCII and NetCDF.

pub mod ascii;
pub mod nc;
pub mod total_file;
