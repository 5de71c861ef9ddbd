//! Error taxonomy for the paging engine and IPC controller.
//!
//! Mirrors the four error kinds of the original design: `Transient` failures
//! are expected to be retried by the caller, `Resource` failures surface an
//! I/O problem with no partial state change, `Programmer` failures indicate
//! caller misuse (bad address, double free), and `Fatal` failures mean an
//! internal invariant has been violated.

use std::panic::Location;

/// Why an admission attempt did not (yet) succeed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransientKind {
    #[error("no eligible peer could satisfy the admission request")]
    AdmissionUnavailable,
    #[error("syscall interrupted by a signal")]
    Interrupted,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Recovered internally by retry loops; surfaced only if a caller-supplied
    /// retry budget is exhausted.
    #[error("transient failure: {0}")]
    Transient(TransientKind),

    /// I/O error reading/writing a backing file or mapping memory. No
    /// partial state change: the page that failed is left exactly as it was.
    #[error("resource failure: {0}")]
    Resource(#[from] std::io::Error),

    /// Caller misuse: address outside any allocation, malformed range,
    /// double free. State is left unchanged.
    #[error("programmer error: {0}")]
    Programmer(&'static str),

    /// A consistency check failed: a cached counter diverged from the true
    /// tally over the page-flags array, or a cross-process invariant does
    /// not hold. Logged with process id and source location per spec.
    #[error("fatal: invariant {check} violated in pid {pid} at {location}")]
    Fatal {
        check: &'static str,
        pid: i32,
        location: &'static Location<'static>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build a `Fatal` error and log it the way spec.md §7 requires:
    /// process id, source location, and (via the caller) offending counters.
    #[track_caller]
    pub fn fatal(check: &'static str) -> Self {
        let err = Error::Fatal { check, pid: std::process::id() as i32, location: Location::caller() };
        log::error!("{err}");
        err
    }
}
