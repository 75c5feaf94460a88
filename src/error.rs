use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcError>;

/// Enum of the possible error variants that may be encountered while
/// producing total-vector products.
#[derive(Error, Debug)]
pub enum ProcError {
    /// Represents an unrecognized or inconsistent configuration value.
    /// Fatal to the affected pipeline.
    #[error("{0}")]
    Config(String),

    /// Represents a bad or missing input record. The offending record is
    /// skipped and processing continues.
    #[error("{0}")]
    Data(String),

    /// Represents a database or filesystem failure that is expected to
    /// recover by the next scheduled run.
    #[error("{0}")]
    Transient(String),

    /// Represents a broken internal invariant, such as a prior total file
    /// surviving into a reprocessing step.
    #[error("{0}")]
    Invariant(String),

    /// Another live process holds the lock. Not an error condition for the
    /// orchestrator, which exits cleanly.
    #[error("lock held by PID {0}")]
    LockUnavailable(u32),
}

impl From<rusqlite::Error> for ProcError {
    fn from(e: rusqlite::Error) -> Self {
        ProcError::Transient(format!("database error: {e}"))
    }
}

impl From<std::io::Error> for ProcError {
    fn from(e: std::io::Error) -> Self {
        ProcError::Transient(format!("i/o error: {e}"))
    }
}

impl From<netcdf::Error> for ProcError {
    fn from(e: netcdf::Error) -> Self {
        ProcError::Transient(format!("netcdf error: {e}"))
    }
}

impl From<bincode::Error> for ProcError {
    fn from(e: bincode::Error) -> Self {
        ProcError::Data(format!("binary total file error: {e}"))
    }
}
