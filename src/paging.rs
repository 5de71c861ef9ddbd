//! The demand-paging engine: page-index arithmetic, probe/apply for touch,
//! evict, and clear, plus the multi-range atomic touch's overlap dedup.
//!
//! Grounded in `examples/original_source/src/api/mstate.c`'s
//! `sbma_mtouch_probe`/`_int`, `sbma_mevict_probe`/`_int`,
//! `sbma_mclear_probe`/`_int`, and `sbma_mtouch_atomic`.
//!
//! This crate's Non-goals rule out transparent kernel-level paging
//! replacement, so there is no installed `SIGSEGV` handler trapping raw
//! pointer dereferences the way the original's fault path conceptually
//! does: residency changes happen only through the explicit `touch`/
//! `evict`/`clear` calls below, the same surface spec.md §6 lists. Since
//! nothing traps a write fault to flip `DIRTY` automatically, callers that
//! write through a touched region call [`Vmm::mark_dirty`] afterward —
//! the explicit, safe replacement for an invisible write-fault trap.

use std::sync::Arc;

use nix::sys::mman::{mprotect, MmapAdvise, ProtFlags};

use crate::ate::Ate;
use crate::backing::BackingFile;
use crate::error::Result;
use crate::page::PageFlags;

/// Every byte in `[addr, addr+len)` relative to `ate.base` falls in
/// `[beg, end)` pages. Used by touch: overlapping the request on either
/// edge still brings in the whole page.
pub fn touch_range(ate: &Ate, addr: usize, len: usize) -> (usize, usize) {
    let beg = (addr - ate.base) / ate.page_size;
    let end = (addr + len - ate.base).div_ceil(ate.page_size);
    (beg, end)
}

/// Only pages wholly inside `[addr, addr+len)` are eligible for clear —
/// a page straddling either edge keeps its other, still-requested bytes.
pub fn clear_range(ate: &Ate, addr: usize, len: usize) -> (usize, usize) {
    let beg = if addr == ate.base { 0 } else { (addr - ate.base).div_ceil(ate.page_size) };
    let end = (addr + len - ate.base) / ate.page_size;
    (beg, end)
}

/// Result of a touch probe. The aggressive-charging shortcut (Design Notes
/// §9) is tagged rather than folded into a bare integer, so multi-range
/// aggregation can recognize "this ATE was already fully charged in an
/// earlier range of the same batch" instead of double-counting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChargeProbe {
    Exact(usize),
    WholeAllocation(usize),
}

impl ChargeProbe {
    pub fn pages(self) -> usize {
        match self {
            ChargeProbe::Exact(n) | ChargeProbe::WholeAllocation(n) => n,
        }
    }
}

/// Count pages in `[beg, end)` with `CHRGD` set (not yet charged). Under
/// aggressive charging, an allocation with `c_pages == 0` (wholly
/// uncharged) reports `n_pages` directly without walking flags, matching
/// `sbma_mtouch_probe`'s shortcut.
pub fn probe_touch(ate: &Ate, beg: usize, end: usize, aggressive: bool) -> ChargeProbe {
    let inner = ate.inner.lock().expect("ate mutex poisoned");
    if aggressive && inner.c_pages == 0 {
        return ChargeProbe::WholeAllocation(ate.n_pages);
    }
    let n = inner.flags[beg..end].iter().filter(|f| !f.is_charged()).count();
    ChargeProbe::Exact(n)
}

/// Count pages in `[beg, end)` that are charged (evictable) and, of
/// those, how many are dirty (need a flush write), matching
/// `sbma_mevict_probe`.
pub fn probe_evict(ate: &Ate, beg: usize, end: usize) -> (usize, usize) {
    let inner = ate.inner.lock().expect("ate mutex poisoned");
    let mut charged = 0;
    let mut dirty = 0;
    for f in &inner.flags[beg..end] {
        if f.is_charged() {
            charged += 1;
        }
        if f.is_dirty() {
            dirty += 1;
        }
    }
    (charged, dirty)
}

/// `vmm_swap_in`: for each page in `[beg, end)` still `RSDNT`, grant
/// read/write protection, fill its contents (zero or from the backing
/// file per `ZFILL`), and clear `RSDNT`/`CHRGD`. Pages already resident
/// are skipped. `ghost` is accepted per spec.md's ghost-touch fallback and
/// currently behaves identically to ordinary swap-in (see SPEC_FULL §4.3).
pub fn swap_in(ate: &Arc<Ate>, backing: &BackingFile, ghost: bool) -> Result<()> {
    swap_in_range(ate, backing, 0, ate.n_pages, ghost, false)
}

/// `charge_whole` mirrors a [`ChargeProbe::WholeAllocation`] result back
/// from the probe into the apply step: aggressive charging (spec.md
/// §4.3) admits every page of the allocation on first touch, even though
/// only `[beg, end)` actually becomes resident here. When set, `CHRGD` is
/// cleared for every page in the allocation up front; the residency loop
/// below then only flips `RSDNT`/`l_pages` for the requested range and
/// must not re-touch `CHRGD`/`c_pages` itself, or pages outside the range
/// would be double-charged once they're eventually faulted in for real.
pub fn swap_in_range(ate: &Arc<Ate>, backing: &BackingFile, beg: usize, end: usize, _ghost: bool, charge_whole: bool) -> Result<()> {
    let region = ate.base as *mut u8;
    let mut inner = ate.inner.lock().expect("ate mutex poisoned");

    if charge_whole {
        for p in 0..ate.n_pages {
            if inner.flags[p].is_charged() {
                continue;
            }
            inner.flags[p].remove(PageFlags::CHRGD);
            inner.c_pages += 1;
        }
    }

    for p in beg..end {
        if inner.flags[p].is_resident() {
            continue;
        }
        let page_ptr = unsafe { region.add(p * ate.page_size) };
        // SAFETY: `page_ptr` points `page_size` bytes into this
        // allocation's own mapping, sized and aligned at `Vmm::alloc` time.
        unsafe {
            mprotect(
                std::ptr::NonNull::new(page_ptr as *mut std::ffi::c_void).expect("non-null region pointer"),
                ate.page_size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            )
        }
        .map_err(|e| crate::error::Error::Resource(e.into()))?;

        let buf = unsafe { std::slice::from_raw_parts_mut(page_ptr, ate.page_size) };
        if inner.flags[p].needs_fill() {
            backing.read_page(p, buf)?;
        } else {
            buf.fill(0);
        }

        inner.flags[p].remove(PageFlags::RSDNT);
        if !charge_whole {
            inner.flags[p].remove(PageFlags::CHRGD);
            inner.c_pages += 1;
        }
        inner.l_pages += 1;
    }
    Ok(())
}

/// `vmm_swap_out`: for each resident page in `[beg, end)`, flush it to the
/// backing file if dirty, release its RAM (`madvise(DONTNEED)`), then mark
/// it `RSDNT`/`CHRGD` and clear `DIRTY`. Returns the charged and dirty
/// page counts reclaimed, for the caller's `ipc_mevict` call.
pub fn swap_out_range(ate: &Arc<Ate>, backing: &BackingFile, beg: usize, end: usize) -> Result<(usize, usize)> {
    let region = ate.base as *mut u8;
    let mut inner = ate.inner.lock().expect("ate mutex poisoned");
    let (mut charged, mut dirty) = (0, 0);
    for p in beg..end {
        if !inner.flags[p].is_resident() {
            continue;
        }
        let page_ptr = unsafe { region.add(p * ate.page_size) };
        if inner.flags[p].is_dirty() {
            let buf = unsafe { std::slice::from_raw_parts(page_ptr, ate.page_size) };
            backing.write_page(p, buf)?;
            inner.flags[p].insert(PageFlags::ZFILL);
            dirty += 1;
        }
        // SAFETY: `page_ptr`/`page_size` describe one page of this
        // allocation's own mapping.
        unsafe {
            nix::sys::mman::madvise(
                std::ptr::NonNull::new(page_ptr as *mut std::ffi::c_void).expect("non-null region pointer"),
                ate.page_size,
                MmapAdvise::MADV_DONTNEED,
            )
        }
        .map_err(|e| crate::error::Error::Resource(e.into()))?;
        unsafe {
            mprotect(
                std::ptr::NonNull::new(page_ptr as *mut std::ffi::c_void).expect("non-null region pointer"),
                ate.page_size,
                ProtFlags::PROT_NONE,
            )
        }
        .map_err(|e| crate::error::Error::Resource(e.into()))?;

        if inner.flags[p].is_charged() {
            charged += 1;
        }
        inner.flags[p].insert(PageFlags::RSDNT);
        inner.flags[p].insert(PageFlags::CHRGD);
        inner.flags[p].remove(PageFlags::DIRTY);
        inner.l_pages -= 1;
        inner.c_pages -= 1;
    }
    Ok((charged, dirty))
}

/// `sbma_mclear`: pages wholly inside `[beg, end)` lose their file
/// contents (become zero-fill eligible again) and stop being dirty. No
/// admission is needed — clearing can only reduce residency obligations.
/// Returns the count of pages that were dirty before clearing (what the
/// caller reports to `ipc_mevict`).
pub fn clear_range_apply(ate: &Arc<Ate>, beg: usize, end: usize) -> usize {
    let mut inner = ate.inner.lock().expect("ate mutex poisoned");
    let mut cleared_dirty = 0;
    for p in beg..end {
        if inner.flags[p].is_dirty() {
            cleared_dirty += 1;
        }
        inner.flags[p].remove(PageFlags::ZFILL);
        inner.flags[p].remove(PageFlags::DIRTY);
    }
    inner.d_pages -= cleared_dirty;
    cleared_dirty
}

/// Mark pages in `[beg, end)` dirty — the explicit stand-in for a
/// write-fault trap (see module docs). Only resident pages are affected;
/// marking a non-resident page dirty would violate `DIRTY ⇒ ¬RSDNT`.
pub fn mark_dirty_range(ate: &Arc<Ate>, beg: usize, end: usize) -> Result<()> {
    let mut inner = ate.inner.lock().expect("ate mutex poisoned");
    for p in beg..end {
        if !inner.flags[p].is_resident() {
            return Err(crate::error::Error::Programmer("mark_dirty on a non-resident page"));
        }
        if !inner.flags[p].is_dirty() {
            inner.flags[p].insert(PageFlags::DIRTY);
            inner.d_pages += 1;
        }
    }
    Ok(())
}
