//! Inter-process admission controller.
//!
//! Ties `shm`, `sem`, and `signal` together into the protocol from
//! spec.md §4.1, grounded directly in `examples/original_source/src/ipc.c`'s
//! `__ipc_init`/`__ipc_madmit`/`__ipc_mevict`: a named mutex guards the
//! shared region, a peer in need of budget signals the peer holding the
//! most of it and waits on a turnstile, and self marks itself `ELIGIBLE`
//! only while actually parked waiting for budget (never while inside the
//! admission critical section itself).

pub mod sem;
pub mod shm;
pub mod signal;

use std::sync::Arc;
use std::time::Duration;

use nix::unistd::Pid;

use crate::error::{Error, Result, TransientKind};
use sem::NamedSemaphore;
use shm::{ShmRegion, ELIGIBLE, POPULATED};

/// Names of the five named primitives sharing one `uniq` id, per spec.md
/// §6. `sid` is startup-only and unlinked right after slot assignment.
struct Names {
    shm: String,
    mtx: String,
    cnt: String,
    trn1: String,
    trn2: String,
    sid: String,
}

impl Names {
    fn new(uniq: i32) -> Self {
        Names {
            shm: format!("/ipc-shm-{uniq}"),
            mtx: format!("/ipc-mtx-{uniq}"),
            cnt: format!("/ipc-cnt-{uniq}"),
            trn1: format!("/ipc-trn1-{uniq}"),
            trn2: format!("/ipc-trn2-{uniq}"),
            sid: format!("/ipc-sid-{uniq}"),
        }
    }
}

/// One process's handle onto the shared admission-control state.
pub struct Ipc {
    uniq: i32,
    id: usize,
    n_procs: usize,
    region: Arc<ShmRegion>,
    mtx: Arc<NamedSemaphore>,
    cnt: Arc<NamedSemaphore>,
    trn1: Arc<NamedSemaphore>,
    trn2: Arc<NamedSemaphore>,
}

impl Ipc {
    /// `__ipc_init`: create-or-open every named primitive, then claim a
    /// slot id under `sid` (unlinked immediately afterward — it only
    /// serializes the slot-assignment race at startup).
    pub fn init(uniq: i32, n_procs: usize, max_mem: usize) -> Result<Self> {
        let names = Names::new(uniq);

        let mtx = Arc::new(NamedSemaphore::open(&names.mtx, 1)?);
        let cnt = Arc::new(NamedSemaphore::open(&names.cnt, 0)?);
        let trn1 = Arc::new(NamedSemaphore::open(&names.trn1, 0)?);
        let trn2 = Arc::new(NamedSemaphore::open(&names.trn2, 1)?);
        let sid = NamedSemaphore::open(&names.sid, 1)?;

        let path = std::path::PathBuf::from(format!("/dev/shm{}", names.shm));
        let (region, _created) = ShmRegion::open(&path, n_procs, max_mem)?;

        sid.wait()?;
        let id = region.claim_next_id();
        sid.post()?;
        sid.close()?;
        NamedSemaphore::unlink(&names.sid)?;

        if id as usize >= n_procs {
            return Err(Error::Programmer("more peers joined than n_procs allows"));
        }
        let id = id as usize;
        region.set_pid(id, nix::unistd::getpid().as_raw());

        log::debug!("ipc: process {} claimed slot {id} of {n_procs}", std::process::id());

        Ok(Ipc { uniq, id, n_procs, region: Arc::new(region), mtx, cnt, trn1, trn2 })
    }

    /// The turnstile the `SIGIPC` eviction thread posts on completion.
    /// Exposed so the caller can install the handler itself (per Design
    /// Notes §9's portable redesign) after this `Ipc` is in its final
    /// home, since the handler's closure needs to call back into
    /// whatever owns the paging engine.
    pub fn trn1(&self) -> Arc<NamedSemaphore> {
        self.trn1.clone()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    /// `__ipc_eligible`: flip `ELIGIBLE` in this process's own status byte.
    pub fn set_eligible(&self, eligible: bool) {
        let mut flags = self.region.flags(self.id);
        if eligible {
            flags |= ELIGIBLE;
        } else {
            flags &= !ELIGIBLE;
        }
        self.region.set_flags(self.id, flags);
    }

    pub fn is_eligible(&self) -> bool {
        self.region.flags(self.id) & ELIGIBLE != 0
    }

    /// `__ipc_madmit`: reserve `bytes` of global budget, signaling peers to
    /// evict as needed. `_admit_dirty` is the advisory hint from spec.md
    /// §4.1/§9 (Open Question: its effect on peer selection is unpinned,
    /// so it is accepted but does not currently change selection).
    pub fn madmit(&self, bytes: usize, _admit_dirty: bool) -> Result<()> {
        debug_assert!(!self.is_eligible(), "self must not be eligible while inside madmit");

        self.mtx.wait()?;
        let mut smem = self.region.smem() - bytes as isize;

        loop {
            if smem >= 0 {
                break;
            }
            let mut chosen: Option<usize> = None;
            let mut max_pmem = 0usize;
            for i in 0..self.n_procs {
                if i == self.id {
                    continue;
                }
                let flags = self.region.flags(i);
                if flags & (POPULATED | ELIGIBLE) != (POPULATED | ELIGIBLE) {
                    continue;
                }
                let pmem = self.region.pmem(i);
                if pmem > max_pmem {
                    max_pmem = pmem;
                    chosen = Some(i);
                }
            }

            let Some(peer) = chosen else {
                break;
            };

            let pid = Pid::from_raw(self.region.pid(peer));
            log::debug!("ipc: signaling peer {pid} (slot {peer}) to evict");

            // Release `mtx` before the rendezvous: the signalled peer's
            // eviction thread calls `mevict`, which itself needs `mtx`.
            // Holding it across `trn1.wait()` here would deadlock against
            // that call (spec.md §4.1: "releases mtx, waits on trn1 for
            // completion acknowledgement, reacquires mtx").
            self.mtx.post()?;
            nix::sys::signal::kill(pid, signal::sigipc()).map_err(|e| Error::Resource(e.into()))?;
            self.trn1.wait()?;
            self.mtx.wait()?;

            smem = self.region.smem() - bytes as isize;
        }

        if smem >= 0 {
            self.region.set_smem(smem);
            self.region.set_pmem(self.id, self.region.pmem(self.id) + bytes);
        }
        self.mtx.post()?;

        if smem < 0 {
            self.set_eligible(true);
            std::thread::sleep(Duration::from_millis(250));
            self.set_eligible(false);
            log::warn!("ipc: admission of {bytes} bytes unavailable, no eligible peer held enough");
            return Err(Error::Transient(TransientKind::AdmissionUnavailable));
        }

        debug_assert!(!self.is_eligible());
        let mut flags = self.region.flags(self.id);
        flags |= POPULATED;
        self.region.set_flags(self.id, flags);
        Ok(())
    }

    /// `__ipc_mevict`: return `charged` bytes to the global budget.
    /// `dirty` is accepted so a caller-maintained global dirty tally (if
    /// any) stays consistent; the shared region itself has no dirty
    /// counter to update.
    pub fn mevict(&self, charged: usize, _dirty: usize) -> Result<()> {
        // Unlike `madmit`, `mevict` has no self-eligibility precondition:
        // invariant 5 (spec.md §8) scopes `¬ELIGIBLE` to `madmit`'s own
        // critical section, and the whole point of a peer marking itself
        // `ELIGIBLE` is to be drafted — i.e. to have its own `mevict`
        // called — while still flagged as such (see S3 in spec.md §8).

        self.mtx.wait()?;
        self.region.set_smem(self.region.smem() + charged as isize);
        let pmem = self.region.pmem(self.id);
        let new_pmem = pmem.checked_sub(charged).ok_or(Error::Programmer("mevict charged more than pmem[self]"))?;
        self.region.set_pmem(self.id, new_pmem);
        if new_pmem == 0 {
            let mut flags = self.region.flags(self.id);
            flags &= !POPULATED;
            self.region.set_flags(self.id, flags);
        }
        self.mtx.post()?;

        Ok(())
    }

    /// Current free system budget, for tests and `check`.
    pub fn smem(&self) -> isize {
        self.region.smem()
    }

    pub fn pmem(&self, i: usize) -> usize {
        self.region.pmem(i)
    }

    /// `__ipc_destroy`: unmap, unlink every name. The caller is
    /// responsible for stopping its eviction thread first (it holds the
    /// handle returned from installing it, not this struct).
    pub fn destroy(self) -> Result<()> {
        let names = Names::new(self.uniq);
        let path = std::path::PathBuf::from(format!("/dev/shm{}", names.shm));
        // `self.region`'s Drop (at the end of this function) unmaps; the
        // mapping stays valid for that drop even after the name below is
        // unlinked, the same way the original's `shm_unlink` follows
        // `munmap` only in program order, not in a causal dependency.
        let _ = std::fs::remove_file(&path);

        self.mtx.close()?;
        NamedSemaphore::unlink(&names.mtx)?;
        self.cnt.close()?;
        NamedSemaphore::unlink(&names.cnt)?;
        self.trn1.close()?;
        NamedSemaphore::unlink(&names.trn1)?;
        self.trn2.close()?;
        NamedSemaphore::unlink(&names.trn2)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    /// Test-local uniq ids, distinct per call within this process so
    /// parallel `cargo test` threads don't collide on the same shm/sem
    /// names (`cargo test` runs all tests for one binary in one process).
    static COUNTER: AtomicI32 = AtomicI32::new(0);
    fn test_uniq() -> i32 {
        (std::process::id() as i32).wrapping_mul(10_000) + COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    /// S2 (admission fails gracefully), bounded form: with no peer able to
    /// cover the shortfall, a single `madmit` call must return
    /// `Transient` — not hang — and must leave `smem`/`pmem` exactly as
    /// they were (spec.md §8: "never corrupts counters; `smem >= 0`
    /// always"). `Vmm::touch`'s retry loop is intentionally unbounded per
    /// spec ("retry is the caller's responsibility"), so this is exercised
    /// at the `Ipc` level directly rather than through `Vmm`.
    #[test]
    fn madmit_without_peers_is_transient_and_leaves_counters_intact() {
        let uniq = test_uniq();
        let ipc = Ipc::init(uniq, 1, 2 * 4096).unwrap();
        let before_smem = ipc.smem();
        let before_pmem = ipc.pmem(0);

        let err = ipc.madmit(4 * 4096, false).unwrap_err();
        assert!(matches!(err, Error::Transient(TransientKind::AdmissionUnavailable)));
        assert_eq!(ipc.smem(), before_smem);
        assert_eq!(ipc.pmem(0), before_pmem);
        assert!(ipc.smem() >= 0);
        assert!(!ipc.is_eligible(), "eligible must be cleared again after the back-off window");

        ipc.destroy().unwrap();
    }

    #[test]
    fn madmit_succeeds_immediately_when_budget_suffices() {
        let uniq = test_uniq();
        let ipc = Ipc::init(uniq, 1, 4 * 4096).unwrap();

        ipc.madmit(2 * 4096, false).unwrap();
        assert_eq!(ipc.smem(), 2 * 4096);
        assert_eq!(ipc.pmem(0), 2 * 4096);
        assert!(!ipc.is_eligible());

        ipc.destroy().unwrap();
    }

    #[test]
    fn mevict_returns_budget_and_clears_populated_at_zero() {
        let uniq = test_uniq();
        let ipc = Ipc::init(uniq, 1, 4 * 4096).unwrap();
        ipc.madmit(4 * 4096, false).unwrap();
        assert_eq!(ipc.region.flags(0) & POPULATED, POPULATED);

        ipc.mevict(4 * 4096, 0).unwrap();
        assert_eq!(ipc.smem(), 4 * 4096);
        assert_eq!(ipc.pmem(0), 0);
        assert_eq!(ipc.region.flags(0) & POPULATED, 0);

        ipc.destroy().unwrap();
    }

    #[test]
    fn eligible_flag_round_trips() {
        let uniq = test_uniq();
        let ipc = Ipc::init(uniq, 1, 4096).unwrap();
        assert!(!ipc.is_eligible());
        ipc.set_eligible(true);
        assert!(ipc.is_eligible());
        ipc.set_eligible(false);
        assert!(!ipc.is_eligible());
        ipc.destroy().unwrap();
    }
}
