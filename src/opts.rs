//! Init-time option bitset and configuration record.
//!
//! Bit names follow spec.md §6's `sbma_init` option list verbatim so the
//! behavior each one gates (aggressive charging, lazy read, ...) is
//! traceable straight back to the spec.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Options: u32 {
        /// Aggressive charging: first touch of an uncharged allocation
        /// charges every page at once.
        const AGGCH = 1 << 0;
        /// Lazy read: defer reading file contents until first access.
        const LZYRD = 1 << 1;
        /// Charge metadata (the `Ate` struct and its flags array) against
        /// the RAM budget in addition to user pages.
        const METACH = 1 << 2;
        /// Run the deep `EXTRA` consistency pass inside `check` (full
        /// per-page flag tally, not just cached-counter cross-checks).
        const EXTRA = 1 << 3;
        /// Enable state assertions on every public entry/exit.
        const CHECK = 1 << 4;
        /// Advisory hint: prefer peers whose eviction needs no new dirty
        /// writes when selecting an admission target.
        const ADMITD = 1 << 5;
        /// Ghost swap-in: defer actual disk reads to a later write fault.
        /// Currently behaves identically to ordinary swap-in.
        const GHOST = 1 << 6;
    }
}

impl Options {
    #[inline]
    pub fn aggressive_charging(self) -> bool {
        self.contains(Options::AGGCH | Options::LZYRD)
    }
}

/// Parameters for [`crate::Vmm::init`], the Rust analogue of `sbma_init`'s
/// argument list.
#[derive(Clone, Debug)]
pub struct VmmConfig {
    /// Backing-file name stem; files are named `${fstem}${pid}-${base:x}`.
    pub fstem: String,
    /// Unique id shared by all peers, used to derive shm/semaphore names.
    pub uniq: i32,
    /// Page size in bytes; must be a power of two and a multiple of the
    /// host's native page size.
    pub page_size: usize,
    /// Number of cooperating sibling processes.
    pub n_procs: usize,
    /// Total RAM budget shared across all peers, in bytes.
    pub max_mem: usize,
    pub opts: Options,
}
