//! Top-level process orchestration.
//!
//! Acquires single-writer exclusion for the `(domain, resolution)` pair,
//! then runs the configured processes in order. A failure in one process
//! is logged and does not stop the ones after it. When the lock is held by
//! another live process the run exits cleanly without work.

use crate::config::{Config, ProcessCfg, ProcessName, RunMode};
use crate::error::{ProcError, Result};
use crate::lock::FileLock;
use crate::{lta, rtv, stc};
use chrono::NaiveDateTime;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Runs every configured process for the configuration's domain and
/// resolution. Returns `Ok` when the lock is held elsewhere ("nothing to
/// do" is a nominal outcome).
pub fn process(c: &Config, mode: &RunMode) -> Result<()> {
    let tic = Instant::now();

    let mut lock = None;
    if mode.is_reprocess() && !mode.reprocess_lock() {
        info!("reprocessing without process locking");
    } else {
        let mut l = FileLock::new(&c.lockfile)?;
        match l.lock() {
            Ok(()) => {
                info!("PID {} obtained lock", l.our_pid);
                lock = Some(l);
            }
            Err(ProcError::LockUnavailable(pid)) => {
                info!("PID {} cannot lock, PID {pid} has the lock", l.our_pid);
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }

    if c.processes.is_empty() {
        warn!("no processes obtained, exiting");
        return Ok(());
    }
    debug!("obtained {} processes", c.processes.len());

    debug!("maximum number of computational threads: {}", c.max_threads);
    // A pool may already exist when embedding; the configured width then
    // stays in effect for the life of the process.
    let _ = rayon::ThreadPoolBuilder::new()
        .num_threads(c.max_threads)
        .build_global();

    // Hours produced by the RTV step, consumed by STC/LTA when
    // reprocessing.
    let mut new_rtv_times: Vec<NaiveDateTime> = match mode {
        RunMode::Reprocess { times, .. } => times.clone(),
        RunMode::Normal => Vec::new(),
    };

    for proc in &c.processes {
        if let Err(e) = run_process(c, proc, mode, &mut new_rtv_times) {
            error!("error processing {} {}: {e}", proc.method, proc.name);
        }
    }

    if let Some(mut l) = lock {
        match l.unlock() {
            Ok(()) => info!("PID {} unlocked", l.our_pid),
            Err(e) => warn!("failed to release lock: {e}"),
        }
    }

    info!("elapsed time {:.3} s", tic.elapsed().as_secs_f64());
    Ok(())
}

fn run_process(
    c: &Config,
    proc: &ProcessCfg,
    mode: &RunMode,
    new_rtv_times: &mut Vec<NaiveDateTime>,
) -> Result<()> {
    if proc.method.to_lowercase() != "uwls" {
        return Err(ProcError::Config(format!(
            "only uwls methods are supported, got '{}'",
            proc.method
        )));
    }
    info!("starting {} {} processing", proc.method, proc.name);

    match proc.name {
        ProcessName::Rtv => {
            let produced = rtv::run_rtv(c, proc, mode)?;
            if produced.is_empty() {
                info!("no rtv files created or updated");
            } else {
                info!("created or updated {} rtv files", produced.len());
            }
            if mode.is_reprocess() {
                *new_rtv_times = produced;
            }
        }
        ProcessName::Stc => stc::run_stc(c, proc, mode, new_rtv_times)?,
        ProcessName::Lta => lta::run_lta(c, proc, mode, new_rtv_times)?,
    }
    Ok(())
}
