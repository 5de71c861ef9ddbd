//! Single-process scenarios from spec.md §8: S1, S4, S5, S6, plus the
//! process-local halves of invariants 1-4. S2 and S3 need either a bounded
//! single-call admission path or a second OS process; S2 lives in
//! `src/ipc/mod.rs`'s unit tests and S3 in `tests/peer_eviction.rs`.

use std::sync::atomic::{AtomicI32, Ordering};

use farmem::{Options, Region, Vmm, VmmConfig};
use tempfile::tempdir;

const PAGE: usize = 4096;

/// Distinct `uniq` per test so the named shm/semaphore set one test tears
/// down doesn't race another's still-live set (`cargo test` runs every
/// test for this binary in one process, often concurrently).
static COUNTER: AtomicI32 = AtomicI32::new(0);
fn test_uniq() -> i32 {
    (std::process::id() as i32).wrapping_mul(100_000) + COUNTER.fetch_add(1, Ordering::SeqCst)
}

fn init(dir: &std::path::Path, max_mem_pages: usize, opts: Options) -> Vmm {
    // Multiple tests in this binary call `init`; `try_init` so the second
    // and later calls don't panic on "logger already set". Run with
    // `RUST_LOG=farmem=debug cargo test -- --nocapture` to see it.
    let _ = env_logger::builder().is_test(true).try_init();

    let fstem = dir.join("alloc-").to_string_lossy().into_owned();
    Vmm::init(VmmConfig {
        fstem,
        uniq: test_uniq(),
        page_size: PAGE,
        n_procs: 1,
        max_mem: max_mem_pages * PAGE,
        opts,
    })
    .unwrap()
}

unsafe fn write_byte(addr: usize, v: u8) {
    unsafe { std::ptr::write((addr) as *mut u8, v) };
}

unsafe fn read_byte(addr: usize) -> u8 {
    unsafe { std::ptr::read(addr as *const u8) }
}

/// S1: single-process round-trip through evict/touch preserves written
/// bytes; `mexist` reports true for a live (even fully evicted)
/// allocation.
#[test]
fn s1_single_process_round_trip() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 16 * 1024 * 1024 / PAGE, Options::empty());

    let region = vmm.alloc(1024 * 1024).unwrap();
    vmm.touch(region).unwrap();

    let offsets = [0usize, 4096, 1024 * 1024 - 1];
    unsafe {
        for &off in &offsets {
            write_byte(region.addr + off, 0xA5);
        }
    }
    vmm.mark_dirty(region).unwrap();

    vmm.evict_all().unwrap();
    assert!(vmm.exists(region.addr));

    vmm.touch(region).unwrap();
    unsafe {
        for &off in &offsets {
            assert_eq!(read_byte(region.addr + off), 0xA5, "byte at offset {off} did not survive evict/touch");
        }
    }

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// S4: a 10-page ATE, atomic-touch over `[0, 8192)` and `[4096, 12288)`
/// (pages 0-1 and 1-2) must dedup the overlap: probe charges 3 pages, not
/// 4, in exactly one `madmit` call, and `l_pages` ends at 3.
#[test]
fn s4_multi_range_atomic_dedup() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 10, Options::empty());

    let region = vmm.alloc(10 * PAGE).unwrap();
    let r1 = Region { addr: region.addr, len: 2 * PAGE };
    let r2 = Region { addr: region.addr + PAGE, len: 2 * PAGE };

    vmm.touch_atomic(&[r1, r2]).unwrap();

    assert_eq!(vmm.smem(), (10 - 3) as isize * PAGE as isize);
    assert_eq!(vmm.charged_total(), 3 * PAGE);

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// S5: clearing `[page 1, page 3)` of a 4-page allocation discards those
/// pages' file contents (zero-fill eligible again, clean) while pages 0
/// and 3 keep their written data.
#[test]
fn s5_clear_semantics() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 4, Options::empty());

    let region = vmm.alloc(4 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    unsafe {
        for p in 0..4 {
            write_byte(region.addr + p * PAGE, 0x11 * (p as u8 + 1));
        }
    }
    vmm.mark_dirty(region).unwrap();

    let clear = Region { addr: region.addr + PAGE, len: 2 * PAGE };
    vmm.clear(clear).unwrap();

    vmm.evict_all().unwrap();
    vmm.touch(region).unwrap();
    unsafe {
        assert_eq!(read_byte(region.addr), 0x11, "page 0 must retain its data");
        assert_eq!(read_byte(region.addr + PAGE), 0, "page 1 must read back zero after clear");
        assert_eq!(read_byte(region.addr + 2 * PAGE), 0, "page 2 must read back zero after clear");
        assert_eq!(read_byte(region.addr + 3 * PAGE), 0x44, "page 3 must retain its data");
    }

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// S6: shrinking an 8-page allocation to 3 pages via `realloc` preserves
/// the retained prefix's data, and the allocation's page count drops by
/// exactly 5 pages' worth.
#[test]
fn s6_realloc_shrink_preserves_prefix() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 8, Options::empty());

    let region = vmm.alloc(8 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    unsafe {
        for p in 0..8 {
            write_byte(region.addr + p * PAGE, 0xC0 + p as u8);
        }
    }
    vmm.mark_dirty(region).unwrap();

    let shrunk = vmm.realloc(region, 3 * PAGE).unwrap();
    assert_eq!(shrunk.len, 3 * PAGE);
    assert_eq!(shrunk.addr, region.addr);

    vmm.touch(shrunk).unwrap();
    unsafe {
        for p in 0..3 {
            assert_eq!(read_byte(shrunk.addr + p * PAGE), 0xC0 + p as u8, "prefix page {p} must survive the shrink");
        }
    }

    vmm.free(shrunk).unwrap();
    vmm.destroy().unwrap();
}

/// Invariant 2 (process-local slice): charged-page accounting tracked by
/// the ATE/`Vmm` side must equal what the IPC side thinks this process
/// holds.
#[test]
fn invariant_pmem_matches_charged_total() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 4, Options::empty());

    let region = vmm.alloc(4 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    assert_eq!(vmm.charged_total(), vmm.pmem_self());

    vmm.evict(region).unwrap();
    assert_eq!(vmm.charged_total(), vmm.pmem_self());
    assert_eq!(vmm.pmem_self(), 0);

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// Invariant 4: `smem + pmem[self] == max_mem` at every quiescent point
/// (single-process, so `pmem[self]` is the whole sum).
#[test]
fn invariant_smem_plus_pmem_equals_max_mem() {
    let dir = tempdir().unwrap();
    let max_mem_pages = 6;
    let vmm = init(dir.path(), max_mem_pages, Options::empty());

    let region = vmm.alloc(4 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    assert_eq!(vmm.smem() + vmm.pmem_self() as isize, (max_mem_pages * PAGE) as isize);

    vmm.evict(region).unwrap();
    assert_eq!(vmm.smem() + vmm.pmem_self() as isize, (max_mem_pages * PAGE) as isize);

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// Round-trip law 8: a second `touch` over an already-resident range is a
/// no-op — no further admission, counters unchanged.
#[test]
fn touch_is_idempotent() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 4, Options::empty());

    let region = vmm.alloc(4 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    let smem_after_first = vmm.smem();
    let charged_after_first = vmm.charged_total();

    vmm.touch(region).unwrap();
    assert_eq!(vmm.smem(), smem_after_first);
    assert_eq!(vmm.charged_total(), charged_after_first);

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// Aggressive charging (`AGGCH|LZYRD`, spec.md §4.3): touching a single
/// page of a wholly-uncharged allocation must admit and charge every page
/// of that allocation in one shot, not just the touched page — otherwise
/// a later touch of the untouched remainder would admit it a second time
/// and violate invariant 2 (`pmem[self] == sum(c_pages)`).
#[test]
fn aggressive_charging_charges_whole_allocation_on_first_touch() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 8, Options::AGGCH | Options::LZYRD);

    let region = vmm.alloc(8 * PAGE).unwrap();
    let first_page = Region { addr: region.addr, len: PAGE };
    vmm.touch(first_page).unwrap();

    assert_eq!(vmm.charged_total(), 8 * PAGE, "first touch must charge the whole allocation");
    assert_eq!(vmm.smem(), 0, "the entire budget must be admitted on first touch");

    unsafe {
        write_byte(first_page.addr, 0x7E);
        assert_eq!(read_byte(first_page.addr), 0x7E);
    }

    // Touching the remainder must not admit anything further: it was
    // already charged by the first touch's aggressive-charging shortcut.
    vmm.touch(region).unwrap();
    assert_eq!(vmm.charged_total(), 8 * PAGE);
    assert_eq!(vmm.smem(), 0);

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// S6 (growth path): growing an allocation via `realloc` must leave the
/// new tail writable and zero-filled, and preserve the retained prefix —
/// the new mapping starts `PROT_NONE` until explicitly touched.
#[test]
fn s6_realloc_growth_preserves_prefix_and_zero_fills_tail() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 8, Options::empty());

    let region = vmm.alloc(2 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    unsafe {
        write_byte(region.addr, 0xAA);
        write_byte(region.addr + PAGE, 0xBB);
    }
    vmm.mark_dirty(region).unwrap();

    let grown = vmm.realloc(region, 5 * PAGE).unwrap();
    assert_eq!(grown.len, 5 * PAGE);

    unsafe {
        assert_eq!(read_byte(grown.addr), 0xAA, "prefix page 0 must survive growth");
        assert_eq!(read_byte(grown.addr + PAGE), 0xBB, "prefix page 1 must survive growth");
        for p in 2..5 {
            assert_eq!(read_byte(grown.addr + p * PAGE), 0, "grown tail page {p} must read back zero");
            write_byte(grown.addr + p * PAGE, 0x33);
        }
    }

    vmm.free(grown).unwrap();
    vmm.destroy().unwrap();
}

/// `check()` passes on a freshly exercised allocation and with `CHECK`
/// wired through `touch`.
#[test]
fn check_passes_with_check_option_enabled() {
    let dir = tempdir().unwrap();
    let vmm = init(dir.path(), 4, Options::CHECK);

    let region = vmm.alloc(4 * PAGE).unwrap();
    vmm.touch(region).unwrap();
    vmm.check().unwrap();

    vmm.evict(region).unwrap();
    vmm.check().unwrap();

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}

/// Fuzz invariants 2 and 4 across random sequences of touch/evict/clear on
/// sub-page-aligned ranges: whatever order these run in, `pmem[self]` must
/// stay in lockstep with `charged_total()`, and `smem + pmem[self]` must
/// stay pinned to `max_mem`.
#[test]
fn fuzz_touch_evict_clear_preserves_invariants() {
    use rand::Rng;

    let dir = tempdir().unwrap();
    let max_mem_pages = 12;
    let vmm = init(dir.path(), max_mem_pages, Options::empty());
    let region = vmm.alloc(max_mem_pages * PAGE).unwrap();

    let mut rng = rand::rng();
    for _ in 0..200 {
        let beg = rng.random_range(0..max_mem_pages);
        let span = rng.random_range(1..=(max_mem_pages - beg));
        let sub = Region { addr: region.addr + beg * PAGE, len: span * PAGE };

        match rng.random_range(0..3) {
            0 => vmm.touch(sub).unwrap(),
            1 => vmm.evict(sub).unwrap(),
            _ => vmm.clear(sub).unwrap(),
        }

        assert_eq!(vmm.charged_total(), vmm.pmem_self(), "invariant 2 broken after a random op");
        assert_eq!(
            vmm.smem() + vmm.pmem_self() as isize,
            (max_mem_pages * PAGE) as isize,
            "invariant 4 broken after a random op"
        );
    }

    vmm.free(region).unwrap();
    vmm.destroy().unwrap();
}
