//! Single-writer process lock.
//!
//! Exclusion between pipeline runs for the same `(domain, resolution)` is a
//! lock file holding one line: `"<pid> <commandline>"`. A lock is live only
//! while that PID is running with exactly that command line; anything else
//! is stale and is reclaimed. Installation uses an exclusive create so two
//! reclaiming processes cannot both succeed.

use crate::error::{ProcError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

/// Command line of a live process, or `None` when the PID is not running.
fn cmdline_of(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let cmd = raw
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    if cmd.is_empty() {
        None
    } else {
        Some(cmd)
    }
}

#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    pub our_pid: u32,
    our_cmd: String,
    pub have_lock: bool,
    pub lock_pid: Option<u32>,
    lock_cmd: Option<String>,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Result<FileLock> {
        let our_pid = std::process::id();
        let our_cmd = cmdline_of(our_pid).ok_or_else(|| {
            ProcError::Config(format!("failed to find the command line of our PID ({our_pid})"))
        })?;
        Ok(FileLock {
            path: path.into(),
            our_pid,
            our_cmd,
            have_lock: false,
            lock_pid: None,
            lock_cmd: None,
        })
    }

    /// Attempts to take the lock, reclaiming a stale lock file first.
    ///
    /// # Errors
    /// `LockUnavailable` when another live process holds the lock.
    pub fn lock(&mut self) -> Result<()> {
        self.sync()?;
        if self.have_lock {
            return Ok(());
        }
        if let Some(pid) = self.lock_pid {
            return Err(ProcError::LockUnavailable(pid));
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                writeln!(file, "{} {}", self.our_pid, self.our_cmd)?;
                file.sync_all()?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // lost the install race to another process
            }
            Err(e) => {
                return Err(ProcError::Transient(format!(
                    "failed to open lock file {}: {e}",
                    self.path.display()
                )))
            }
        }

        self.sync()?;
        if self.have_lock {
            Ok(())
        } else {
            Err(ProcError::LockUnavailable(self.lock_pid.unwrap_or(0)))
        }
    }

    /// Releases the lock if we own it.
    pub fn unlock(&mut self) -> Result<()> {
        self.sync()?;
        if !self.have_lock {
            warn!("do not have lock, cannot unlock");
            return Ok(());
        }
        std::fs::remove_file(&self.path)?;
        self.sync()
    }

    /// Reads the lock file and reconciles our view of it, reclaiming stale
    /// locks along the way.
    fn sync(&mut self) -> Result<()> {
        self.lock_pid = None;
        self.lock_cmd = None;

        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.have_lock = false;
                return Ok(());
            }
            Err(e) => {
                return Err(ProcError::Transient(format!(
                    "failed to read lock file {}: {e}",
                    self.path.display()
                )))
            }
        };

        let (pid, cmd) = parse_lock_line(&text).ok_or_else(|| {
            ProcError::Data(format!(
                "failed to parse PID and command from lock file {}",
                self.path.display()
            ))
        })?;

        match cmdline_of(pid) {
            Some(live_cmd) if live_cmd == cmd => {
                self.lock_pid = Some(pid);
                self.lock_cmd = Some(cmd);
                self.have_lock = pid == self.our_pid;
            }
            live => {
                if live.is_none() {
                    info!("existing lock file is stale (no PID match), removing");
                } else {
                    info!("existing lock file is stale (PID command mis-match), removing");
                }
                std::fs::remove_file(&self.path).map_err(|e| {
                    ProcError::Transient(format!(
                        "failed to remove stale lock file {}: {e}",
                        self.path.display()
                    ))
                })?;
                self.have_lock = false;
            }
        }
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if self.have_lock {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

fn parse_lock_line(text: &str) -> Option<(u32, String)> {
    let trimmed = text.trim();
    let (pid, cmd) = trimmed.split_once(char::is_whitespace)?;
    let cmd = cmd.trim();
    if cmd.is_empty() {
        return None;
    }
    Some((pid.parse().ok()?, cmd.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proc.lock");
        // PID beyond the default pid_max cannot be running.
        std::fs::write(&path, "4194305 /usr/bin/python nonexistent.py\n").expect("seed lock");

        let mut lock = FileLock::new(&path).expect("lock handle");
        lock.lock().expect("reclaim stale lock");
        assert!(lock.have_lock);
        assert_eq!(lock.lock_pid, Some(lock.our_pid));

        // A second look at the file still shows us as the owner.
        lock.sync().expect("sync");
        assert!(lock.have_lock);

        let line = std::fs::read_to_string(&path).expect("read lock");
        assert!(line.starts_with(&format!("{} ", lock.our_pid)));

        lock.unlock().expect("unlock");
        assert!(!lock.have_lock);
        assert!(!path.exists());
    }

    #[test]
    fn live_foreign_lock_is_not_taken() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proc.lock");

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let child_pid = child.id();
        let child_cmd = cmdline_of(child_pid).expect("child cmdline");
        std::fs::write(&path, format!("{child_pid} {child_cmd}\n")).expect("seed lock");

        let mut lock = FileLock::new(&path).expect("lock handle");
        let result = lock.lock();
        child.kill().ok();
        child.wait().ok();

        assert!(matches!(result, Err(ProcError::LockUnavailable(pid)) if pid == child_pid));
        assert!(!lock.have_lock);
        assert!(path.exists());
    }

    #[test]
    fn drop_releases_owned_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proc.lock");
        {
            let mut lock = FileLock::new(&path).expect("lock handle");
            lock.lock().expect("lock");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn garbage_lock_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("proc.lock");
        std::fs::write(&path, "not a lock file").expect("seed lock");
        let mut lock = FileLock::new(&path).expect("lock handle");
        assert!(matches!(lock.lock(), Err(ProcError::Data(_))));
    }
}
