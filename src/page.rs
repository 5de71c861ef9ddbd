//! Per-page status bits and the state machine they encode.
//!
//! Bit layout matches `examples/original_source/src/mmu.h`'s `mmu_status_code`
//! plus the `CHRGD` bit used throughout `api/mstate.c` but omitted from the
//! header excerpt that was kept. Positions are preserved so the on-disk /
//! in-memory reasoning in the original carries over directly.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        /// Clear: page may be served by zero-fill. Set: must be read from
        /// the backing file.
        const ZFILL = 1 << 0;
        /// Set: page is not resident (logical "not-present").
        const RSDNT = 1 << 1;
        /// Set: page has been written since last flush. Always implies
        /// `RSDNT` is clear.
        const DIRTY = 1 << 2;
        /// Clear: page is charged against the global RAM budget. Set: page
        /// holds no admission grant.
        const CHRGD = 1 << 3;
    }
}

impl Default for PageFlags {
    /// A freshly allocated page: not yet filled from disk, not resident,
    /// clean, uncharged. This is the `Absent` state.
    fn default() -> Self {
        PageFlags::RSDNT | PageFlags::CHRGD
    }
}

/// The four reachable-at-rest points of the per-page state machine from
/// spec.md §4.3. `UnchargedResident` is only a valid observation mid-transition;
/// asserting it never appears at rest is one of the invariant checks in
/// `crate::check`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    Absent,
    LoadedClean,
    LoadedDirty,
    UnchargedResident,
}

impl PageFlags {
    pub fn state(self) -> PageState {
        let resident = !self.contains(PageFlags::RSDNT);
        let charged = !self.contains(PageFlags::CHRGD);
        match (resident, charged, self.contains(PageFlags::DIRTY)) {
            (false, _, _) => PageState::Absent,
            (true, false, _) => PageState::UnchargedResident,
            (true, true, false) => PageState::LoadedClean,
            (true, true, true) => PageState::LoadedDirty,
        }
    }

    #[inline]
    pub fn is_resident(self) -> bool {
        !self.contains(PageFlags::RSDNT)
    }

    #[inline]
    pub fn is_charged(self) -> bool {
        !self.contains(PageFlags::CHRGD)
    }

    #[inline]
    pub fn is_dirty(self) -> bool {
        self.contains(PageFlags::DIRTY)
    }

    #[inline]
    pub fn needs_fill(self) -> bool {
        self.contains(PageFlags::ZFILL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_page_is_absent() {
        assert_eq!(PageFlags::default().state(), PageState::Absent);
    }

    #[test]
    fn dirty_implies_resident_in_the_state_machine() {
        let flags = PageFlags::DIRTY;
        assert_eq!(flags.state(), PageState::LoadedDirty);
        assert!(flags.is_resident());
    }

    #[test]
    fn uncharged_resident_is_distinguishable() {
        let flags = PageFlags::CHRGD;
        assert_eq!(flags.state(), PageState::UnchargedResident);
    }
}
