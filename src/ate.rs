//! Allocation-table entry: per-allocation page flags and cached counts.
//!
//! Grounded in `examples/original_source/src/mmu.h`'s `struct ate` and the
//! counter bookkeeping in `api/mstate.c`'s probe/apply pairs. The C struct
//! co-allocates metadata, flags array, and user memory in one mapping so a
//! single `free()` tears all three down together; the Rust version gets the
//! same "one thing to drop" property from ordinary ownership instead; the
//! flags live behind the lock that also guards the cached counts, so a flag
//! flip and its counter update can never be observed out of lock-step.

use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::page::PageFlags;

/// Stable index into the `Mmu` slab. See Design Notes §9: this replaces the
/// C version's raw `prev`/`next` pointers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AteId(pub usize);

/// Page flags plus the cached counts that must always equal the true
/// tallies over them. Kept behind one lock (`Ate::inner`) so bit flips and
/// counter updates are atomic with respect to every other reader.
pub struct AteInner {
    pub flags: Vec<PageFlags>,
    /// Number of pages with `RSDNT` clear.
    pub l_pages: usize,
    /// Number of pages with `CHRGD` clear.
    pub c_pages: usize,
    /// Number of pages with `DIRTY` set.
    pub d_pages: usize,
}

pub struct Ate {
    pub id: AteId,
    pub base: usize,
    pub n_pages: usize,
    pub page_size: usize,
    pub inner: Mutex<AteInner>,
}

impl Ate {
    pub fn new(id: AteId, base: usize, n_pages: usize, page_size: usize) -> Self {
        Ate {
            id,
            base,
            n_pages,
            page_size,
            inner: Mutex::new(AteInner {
                flags: vec![PageFlags::default(); n_pages],
                l_pages: 0,
                c_pages: 0,
                d_pages: 0,
            }),
        }
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.base + self.n_pages * self.page_size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr < self.end()
    }

    /// Pages consumed by this allocation's own bookkeeping (the `Ate` struct
    /// and its flags array), used when `METACH` folds metadata into the
    /// charged total. Grounded in `api/mstate.c:sbma_check`'s `s_pages`/
    /// `f_pages` computation.
    pub fn metadata_pages(&self) -> usize {
        let struct_bytes = std::mem::size_of::<Ate>();
        let flags_bytes = self.n_pages * std::mem::size_of::<PageFlags>();
        let s_pages = 1 + (struct_bytes.saturating_sub(1)) / self.page_size;
        let f_pages = 1 + (flags_bytes.saturating_sub(1)) / self.page_size;
        s_pages + f_pages
    }

    /// Recompute `l_pages`/`c_pages`/`d_pages` by scanning `flags` and
    /// compare against the cached values, returning a `Fatal` error (per
    /// spec.md §7/§8 invariant 1) if they diverge. Only run when `EXTRA`
    /// checking is enabled, mirroring `sbma_check`'s gating.
    #[track_caller]
    pub fn verify_counts(&self) -> Result<()> {
        let inner = self.inner.lock().expect("ate mutex poisoned");
        let (mut l, mut c, mut d) = (0, 0, 0);
        for f in &inner.flags {
            if f.is_resident() {
                l += 1;
            }
            if f.is_charged() {
                c += 1;
            }
            if f.is_dirty() {
                d += 1;
            }
        }
        if l != inner.l_pages {
            return Err(Error::fatal("l_pages"));
        }
        if c != inner.c_pages {
            return Err(Error::fatal("c_pages"));
        }
        if d != inner.d_pages {
            return Err(Error::fatal("d_pages"));
        }
        Ok(())
    }
}
