//! The top-level virtual-memory manager: explicit process-wide state with
//! explicit init/teardown (Design Notes §9: "model as process-wide state
//! with explicit init/teardown; inject its reference into every entry
//! point rather than relying on a hidden global").
//!
//! Ties the `Mmu`, the IPC controller, and the paging engine together
//! behind the external interface spec.md §6 specifies: `alloc`/`realloc`/
//! `free`, `touch`/`touch_atomic`/`touch_all`, `evict`/`evict_all`,
//! `clear`/`clear_all`, `exists`, `check`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::ate::{Ate, AteId};
use crate::backing::BackingFile;
use crate::error::{Error, Result};
use crate::ipc::signal::EvictionThread;
use crate::ipc::Ipc;
use crate::mmu::{Lookup, Mmu};
use crate::opts::{Options, VmmConfig};
use crate::paging;

/// A live allocation handle returned by [`Vmm::alloc`]. `addr`/`len` are
/// what the caller hands back to `touch`/`evict`/`clear`/`free`.
#[derive(Clone, Copy, Debug)]
pub struct Region {
    pub addr: usize,
    pub len: usize,
}

struct Allocation {
    ate: Arc<Ate>,
    backing: BackingFile,
}

struct VmmInner {
    config: VmmConfig,
    mmu: Mmu,
    ipc: Ipc,
    allocations: Mutex<HashMap<AteId, Allocation>>,
    /// Set once, right after construction, by [`Vmm::init`]. `None` only
    /// during the brief window before that — never observed by any other
    /// method, since `init` is the only place a `Vmm` is handed out.
    eviction: Mutex<Option<EvictionThread>>,
}

/// Up to this many ranges may be batched into one [`Vmm::touch_atomic`]
/// call, matching spec.md §6's `SBMA_ATOMIC_END`-terminated varargs list.
pub const MAX_ATOMIC_RANGES: usize = 64;

#[derive(Clone)]
pub struct Vmm(Arc<VmmInner>);

impl Vmm {
    /// `sbma_init`: bring up the IPC controller and the eviction thread,
    /// and construct an empty allocation table.
    pub fn init(config: VmmConfig) -> Result<Self> {
        if !config.page_size.is_power_of_two() {
            return Err(Error::Programmer("page_size must be a power of two"));
        }
        let ipc = Ipc::init(config.uniq, config.n_procs, config.max_mem)?;
        let mmu = Mmu::new(config.page_size);
        let trn1 = ipc.trn1();

        let vmm = Vmm(Arc::new(VmmInner {
            config,
            mmu,
            ipc,
            allocations: Mutex::new(HashMap::new()),
            eviction: Mutex::new(None),
        }));

        // A `Weak` here, not a strong clone: the background thread must
        // never be the thing keeping `VmmInner` alive, or `destroy`'s
        // `Arc::try_unwrap` would always fail while this thread runs.
        let weak: Weak<VmmInner> = Arc::downgrade(&vmm.0);
        let eviction_thread = EvictionThread::install(trn1, move || {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = Vmm(inner).evict_all() {
                    log::error!("evict-all triggered by SIGIPC failed: {e}");
                }
            }
        })?;
        *vmm.0.eviction.lock().expect("eviction mutex poisoned") = Some(eviction_thread);

        Ok(vmm)
    }

    pub fn config(&self) -> &VmmConfig {
        &self.0.config
    }

    /// `sbma_malloc`-equivalent minus the bin-allocator internals
    /// (SPEC_FULL §4.4): round up to whole pages, map an anonymous
    /// `PROT_NONE` region, register an ATE, and open its backing file.
    pub fn alloc(&self, len: usize) -> Result<Region> {
        let page_size = self.0.config.page_size;
        let n_pages = len.div_ceil(page_size).max(1);
        let map_len = n_pages * page_size;

        let map = unsafe {
            mmap_anonymous(
                None,
                std::num::NonZeroUsize::new(map_len).expect("non-empty allocation"),
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .map_err(|e| Error::Resource(e.into()))?;
        let base = map.as_ptr() as usize;

        let ate = self.0.mmu.insert(base, n_pages);
        let backing = BackingFile::open(&self.0.config.fstem, std::process::id() as i32, base, page_size)?;
        self.0.allocations.lock().expect("allocations mutex poisoned").insert(ate.id, Allocation { ate, backing });

        log::debug!("alloc: {n_pages} pages at {base:#x}");
        Ok(Region { addr: base, len: map_len })
    }

    /// `sbma_realloc`: grow or shrink in place by page count. Shrinking
    /// (S6) evicts and drops the trailing pages' ATE/flags tail while
    /// preserving the retained prefix untouched.
    pub fn realloc(&self, region: Region, new_len: usize) -> Result<Region> {
        let page_size = self.0.config.page_size;
        let new_n_pages = new_len.div_ceil(page_size).max(1);

        let ate = self.lookup_ate(region.addr)?;
        if new_n_pages * page_size >= ate.n_pages * page_size {
            // growing: allocate fresh, copy the retained prefix, free the
            // old region. A true in-place `mremap` is an optimization this
            // crate doesn't need for correctness.
            let grown = self.alloc(new_n_pages * page_size)?;
            self.touch(region)?;
            // The new mapping starts `PROT_NONE` (per `Vmm::alloc`) until
            // `touch`ed; writing into it before that would fault.
            self.touch(grown)?;
            unsafe {
                std::ptr::copy_nonoverlapping(region.addr as *const u8, grown.addr as *mut u8, region.len.min(grown.len));
            }
            self.free(region)?;
            return Ok(grown);
        }

        let keep_pages = new_n_pages;
        self.evict_range(&ate, keep_pages, ate.n_pages)?;
        {
            let mut inner = ate.inner.lock().expect("ate mutex poisoned");
            inner.flags.truncate(keep_pages);
        }
        let tail_len = (ate.n_pages - keep_pages) * page_size;
        if tail_len > 0 {
            let tail_addr = (ate.base + keep_pages * page_size) as *mut std::ffi::c_void;
            // SAFETY: the tail pages were just evicted (unmapped content
            // is irrelevant) and belong solely to this allocation's
            // mapping.
            unsafe { munmap(std::ptr::NonNull::new(tail_addr).expect("non-null tail pointer"), tail_len) }
                .map_err(|e| Error::Resource(e.into()))?;
        }

        // Ate::n_pages is immutable by design (stable slab entry); replace
        // it with a freshly sized ATE at the same base, carrying over the
        // still-resident prefix's flags.
        let mut allocations = self.0.allocations.lock().expect("allocations mutex poisoned");
        let old = allocations.remove(&ate.id).expect("ate present in allocations table");
        self.0.mmu.invalidate(ate.id);
        let shrunk = self.0.mmu.insert(ate.base, keep_pages);
        {
            let mut new_inner = shrunk.inner.lock().expect("ate mutex poisoned");
            let old_inner = ate.inner.lock().expect("ate mutex poisoned");
            new_inner.flags = old_inner.flags.clone();
            new_inner.l_pages = old_inner.l_pages;
            new_inner.c_pages = old_inner.c_pages;
            new_inner.d_pages = old_inner.d_pages;
        }
        allocations.insert(shrunk.id, Allocation { ate: shrunk, backing: old.backing });

        Ok(Region { addr: region.addr, len: keep_pages * page_size })
    }

    /// `sbma_free`: evict everything, drop the ATE, unmap, delete the
    /// backing file.
    pub fn free(&self, region: Region) -> Result<()> {
        let ate = self.lookup_ate(region.addr)?;
        self.evict_range(&ate, 0, ate.n_pages)?;
        self.0.mmu.invalidate(ate.id);
        let allocation =
            self.0.allocations.lock().expect("allocations mutex poisoned").remove(&ate.id).ok_or(Error::Programmer("free on unknown allocation"))?;
        // SAFETY: nothing else holds a reference to this mapping once its
        // ATE is invalidated above.
        unsafe { munmap(std::ptr::NonNull::new(region.addr as *mut std::ffi::c_void).expect("non-null region"), region.len) }
            .map_err(|e| Error::Resource(e.into()))?;
        allocation.backing.remove()?;
        Ok(())
    }

    pub fn exists(&self, addr: usize) -> bool {
        matches!(self.0.mmu.lookup(addr), Lookup::Found(_))
    }

    fn lookup_ate(&self, addr: usize) -> Result<Arc<Ate>> {
        match self.0.mmu.lookup(addr) {
            Lookup::Found(ate) => Ok(ate),
            Lookup::Absent => Err(Error::Programmer("address is not inside any allocation")),
            Lookup::Error => Err(Error::fatal("mmu table mutex poisoned")),
        }
    }

    fn with_backing<T>(&self, id: AteId, f: impl FnOnce(&BackingFile) -> Result<T>) -> Result<T> {
        let allocations = self.0.allocations.lock().expect("allocations mutex poisoned");
        let allocation = allocations.get(&id).ok_or(Error::Programmer("ate missing its backing file entry"))?;
        f(&allocation.backing)
    }

    /// `sbma_mtouch`: admit then swap in `[addr, addr+len)`.
    pub fn touch(&self, region: Region) -> Result<()> {
        let ate = self.lookup_ate(region.addr)?;
        let (beg, end) = paging::touch_range(&ate, region.addr, region.len);
        self.touch_pages(&ate, beg, end)
    }

    fn touch_pages(&self, ate: &Arc<Ate>, beg: usize, end: usize) -> Result<()> {
        let probe = paging::probe_touch(ate, beg, end, self.0.config.opts.aggressive_charging());
        let charge_whole = matches!(probe, paging::ChargeProbe::WholeAllocation(_));
        let pages = probe.pages();
        if pages > 0 {
            self.admit(pages)?;
        }
        self.with_backing(ate.id, |backing| {
            paging::swap_in_range(ate, backing, beg, end, self.0.config.opts.contains(Options::GHOST), charge_whole)
        })?;
        if self.0.config.opts.contains(Options::CHECK) {
            self.check()?;
        }
        Ok(())
    }

    /// `sbma_mtouchall`.
    pub fn touch_all(&self) -> Result<()> {
        for ate in self.0.mmu.all() {
            let n_pages = ate.n_pages;
            self.touch_pages(&ate, 0, n_pages)?;
        }
        Ok(())
    }

    /// `sbma_mtouch_atomic`: dedup ranges sharing an ATE whose page-spans
    /// overlap (merging into the enclosing span), admit the combined
    /// total as one request, then apply every merged range. Under
    /// aggressive charging, an already-fully-uncharged ATE that appears
    /// more than once in the batch contributes only once, since the probe
    /// shortcut would otherwise double count it (Design Notes §9).
    pub fn touch_atomic(&self, regions: &[Region]) -> Result<()> {
        if regions.len() > MAX_ATOMIC_RANGES {
            return Err(Error::Programmer("touch_atomic batch exceeds MAX_ATOMIC_RANGES"));
        }
        let mut merged: Vec<(Arc<Ate>, usize, usize)> = Vec::new();
        for r in regions {
            let ate = self.lookup_ate(r.addr)?;
            let (beg, end) = paging::touch_range(&ate, r.addr, r.len);
            if let Some(existing) = merged.iter_mut().find(|(a, b, e)| a.id == ate.id && ranges_overlap(*b, *e, beg, end)) {
                existing.1 = existing.1.min(beg);
                existing.2 = existing.2.max(end);
            } else {
                merged.push((ate, beg, end));
            }
        }

        let aggressive = self.0.config.opts.aggressive_charging();
        let mut seen_whole_alloc = std::collections::HashSet::new();
        let mut total = 0usize;
        // Per merged range, whether its probe hit the aggressive-charging
        // shortcut — threaded through to the apply loop below so it can
        // clear `CHRGD` for the whole allocation, not just this range.
        // `swap_in_range`'s whole-allocation pass only charges pages still
        // `CHRGD`, so it's safe to pass this per occurrence even when the
        // same ATE appears in more than one (non-overlapping) merged range.
        let mut charge_whole_flags = Vec::with_capacity(merged.len());
        for (ate, beg, end) in &merged {
            match paging::probe_touch(ate, *beg, *end, aggressive) {
                paging::ChargeProbe::WholeAllocation(n) => {
                    charge_whole_flags.push(true);
                    if seen_whole_alloc.insert(ate.id) {
                        total += n;
                    }
                }
                paging::ChargeProbe::Exact(n) => {
                    charge_whole_flags.push(false);
                    total += n;
                }
            }
        }

        if total > 0 {
            self.admit(total)?;
        }
        for ((ate, beg, end), charge_whole) in merged.iter().zip(charge_whole_flags) {
            self.with_backing(ate.id, |backing| {
                paging::swap_in_range(ate, backing, *beg, *end, self.0.config.opts.contains(Options::GHOST), charge_whole)
            })?;
        }
        Ok(())
    }

    fn admit(&self, pages: usize) -> Result<()> {
        let bytes = pages * self.0.config.page_size;
        let admit_dirty = self.0.config.opts.contains(Options::ADMITD);
        loop {
            match self.0.ipc.madmit(bytes, admit_dirty) {
                Ok(()) => return Ok(()),
                Err(Error::Transient(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// `__ipc_eligible`: advertise (or withdraw) this process's willingness
    /// to have its charged memory drafted by a peer's `madmit`. Callers
    /// typically set this once they're done actively using a region and
    /// would rather give up residency than block a sibling's admission.
    pub fn set_eligible(&self, eligible: bool) {
        self.0.ipc.set_eligible(eligible);
    }

    /// `sbma_mevict`.
    pub fn evict(&self, region: Region) -> Result<()> {
        let ate = self.lookup_ate(region.addr)?;
        let (beg, end) = paging::touch_range(&ate, region.addr, region.len);
        self.evict_range(&ate, beg, end)
    }

    fn evict_range(&self, ate: &Arc<Ate>, beg: usize, end: usize) -> Result<()> {
        let (probed_charged, _probed_dirty) = paging::probe_evict(ate, beg, end);
        if probed_charged == 0 {
            return Ok(());
        }
        let (charged, dirty) = self.with_backing(ate.id, |backing| paging::swap_out_range(ate, backing, beg, end))?;
        if charged > 0 || dirty > 0 {
            self.0.ipc.mevict(charged * self.0.config.page_size, dirty * self.0.config.page_size)?;
        }
        Ok(())
    }

    /// `sbma_mevictall`, and the body of the `SIGIPC` handler (must not
    /// touch the IPC mutex itself — `mevict` below is called once per ATE
    /// from outside any `mtx` hold, same as the original).
    pub fn evict_all(&self) -> Result<()> {
        for ate in self.0.mmu.all() {
            let n_pages = ate.n_pages;
            self.evict_range(&ate, 0, n_pages)?;
        }
        Ok(())
    }

    /// `sbma_mclear`.
    pub fn clear(&self, region: Region) -> Result<()> {
        let ate = self.lookup_ate(region.addr)?;
        let (beg, end) = paging::clear_range(&ate, region.addr, region.len);
        if beg >= end {
            return Ok(());
        }
        let cleared_dirty = paging::clear_range_apply(&ate, beg, end);
        if cleared_dirty > 0 {
            self.0.ipc.mevict(0, cleared_dirty * self.0.config.page_size)?;
        }
        Ok(())
    }

    /// `sbma_mclearall`.
    pub fn clear_all(&self) -> Result<()> {
        for ate in self.0.mmu.all() {
            let n_pages = ate.n_pages;
            let cleared_dirty = paging::clear_range_apply(&ate, 0, n_pages);
            if cleared_dirty > 0 {
                self.0.ipc.mevict(0, cleared_dirty * self.0.config.page_size)?;
            }
        }
        Ok(())
    }

    /// Explicit replacement for the write-fault trap this crate does not
    /// install (see `paging` module docs): call after writing through a
    /// touched region so `evict` knows to flush it.
    pub fn mark_dirty(&self, region: Region) -> Result<()> {
        let ate = self.lookup_ate(region.addr)?;
        let (beg, end) = paging::touch_range(&ate, region.addr, region.len);
        paging::mark_dirty_range(&ate, beg, end)
    }

    /// `sbma_check` / SPEC_FULL §4.3: verify every quantified invariant
    /// from spec.md §8 that can be checked from this process's own state
    /// (cross-process invariants 2 and 4 need every peer quiescent and
    /// are exercised by integration tests instead). Invariant 5
    /// (`ELIGIBLE(self)` false on entry/exit of `madmit`) is scoped to
    /// that call's own critical section, not to general quiescence — a
    /// process may legitimately sit `ELIGIBLE` at rest while advertising
    /// itself as a draft target (see [`Vmm::set_eligible`]) — so it is
    /// enforced at `madmit`'s own call site rather than here.
    pub fn check(&self) -> Result<()> {
        for ate in self.0.mmu.all() {
            ate.verify_counts()?;
            let inner = ate.inner.lock().expect("ate mutex poisoned");
            for f in &inner.flags {
                if f.is_dirty() && !f.is_resident() {
                    return Err(Error::fatal("dirty_implies_resident"));
                }
            }
        }
        Ok(())
    }

    /// Sum of charged pages (bytes) across every live ATE, folding in
    /// metadata overhead when `METACH` is set. Invariant 2: must equal
    /// `ipc.pmem[self]`.
    pub fn charged_total(&self) -> usize {
        let page_size = self.0.config.page_size;
        self.0
            .mmu
            .all()
            .iter()
            .map(|ate| {
                let inner = ate.inner.lock().expect("ate mutex poisoned");
                let metadata = if self.0.config.opts.contains(Options::METACH) { ate.metadata_pages() } else { 0 };
                (inner.c_pages + metadata) * page_size
            })
            .sum()
    }

    pub fn pmem_self(&self) -> usize {
        self.0.ipc.pmem(self.0.ipc.id())
    }

    pub fn smem(&self) -> isize {
        self.0.ipc.smem()
    }

    /// `sbma_destroy`.
    pub fn destroy(self) -> Result<()> {
        let inner = Arc::try_unwrap(self.0).map_err(|_| Error::Programmer("destroy called with outstanding Vmm clones"))?;
        if let Some(t) = inner.eviction.lock().expect("eviction mutex poisoned").take() {
            t.stop();
        }
        inner.ipc.destroy()
    }
}

fn ranges_overlap(a_beg: usize, a_end: usize, b_beg: usize, b_end: usize) -> bool {
    a_beg < b_end && b_beg < a_end
}
