//! Merging current solutions with previous runs.
//!
//! An hour may be processed several times as late radials arrive. Cells the
//! current run could not update keep their previously persisted solution,
//! the radial set is the union of both runs, and a processing history line
//! records what happened.

use crate::config::RunMode;
use crate::error::{ProcError, Result};
use crate::persist::total_file::{self, TotalRecord};
use crate::radial::Radial;
use crate::total::TotalField;
use std::path::Path;
use tracing::{debug, info, warn};

/// Loads the previously persisted total for this hour, if any.
///
/// # Errors
/// `Invariant` when a prior file exists during reprocessing; the reprocess
/// path must have deleted it first. In normal mode an unreadable prior file
/// is logged and treated as absent (it will be overwritten).
pub fn load_prior(mpathfile: &Path, mode: &RunMode) -> Result<Option<TotalRecord>> {
    if !mpathfile.exists() {
        debug!("{} not found, no prior solutions", mpathfile.display());
        return Ok(None);
    }
    if mode.is_reprocess() {
        let mut msg = format!(
            "total file ({}) exists; should have been removed to ensure consistent results",
            mpathfile.display()
        );
        if !mode.reprocess_lock() {
            msg.push_str("; maybe a concurrent process is running? try using process locking");
        }
        return Err(ProcError::Invariant(msg));
    }
    match total_file::read_total(mpathfile) {
        Ok(prior) => {
            debug!("loaded prior solutions from {}", mpathfile.display());
            Ok(Some(prior))
        }
        Err(e) => {
            warn!("failed to load prior data from {}: {e}", mpathfile.display());
            warn!("plan to overwrite existing file, data from previous run(s) will be lost");
            Ok(None)
        }
    }
}

/// Merges the current run into the prior one and appends a history line.
///
/// Radial datasets present only in the prior run are appended to `r`;
/// cells without a current solution keep their prior solution.
///
/// # Errors
/// `Invariant` if the prior field's cell count does not match the current
/// grid.
pub fn merge_with_prior(
    prior: Option<TotalRecord>,
    r: &mut Vec<Radial>,
    u: &mut TotalField,
) -> Result<()> {
    let n_new = u.n_finite();
    let Some(prior) = prior else {
        u.push_history(format!("Saving {n_new} new solutions"));
        debug!("started history");
        return Ok(());
    };

    if prior.u.n_cells() != u.n_cells() {
        return Err(ProcError::Invariant(format!(
            "prior total has {} cells but the current grid has {}",
            prior.u.n_cells(),
            u.n_cells()
        )));
    }

    // Radial datasets from previous run(s) that this run didn't reload.
    for mut p in prior.r {
        let already_loaded = r.iter().any(|cur| {
            cur.network == p.network && cur.site == p.site && cur.patterntype == p.patterntype
        });
        if !already_loaded {
            debug!("merged radial dataset from {}", p.label());
            p.is_new = false;
            r.push(p);
        }
    }

    // Keep previous solutions that aren't being updated by this run.
    let mut n_carried = 0;
    for i in 0..u.n_cells() {
        if !u.u[i].is_finite() && prior.u.u[i].is_finite() {
            u.u[i] = prior.u.u[i];
            u.v[i] = prior.u.v[i];
            u.dopx[i] = prior.u.dopx[i];
            u.dopy[i] = prior.u.dopy[i];
            u.hdop[i] = prior.u.hdop[i];
            u.n_rads[i] = prior.u.n_rads[i];
            u.n_sites[i] = prior.u.n_sites[i];
            n_carried += 1;
        }
    }

    u.history = prior.u.history;
    u.push_history(format!(
        "Saving {} solutions; {} new or updated, {} unmodified from previous run(s)",
        u.n_finite(),
        n_new,
        n_carried
    ));
    if let Some(entry) = u.history.last() {
        info!("updated history: {}", entry.message);
    }
    Ok(())
}
