//! The cross-process shared memory segment.
//!
//! Layout matches `examples/original_source/src/ipc.c`'s `IPC_LEN` macro
//! and the pointer arithmetic right after the `mmap` call in `__ipc_init`:
//! a leading `smem` scalar, then `pmem[n_procs]`, then `pid[n_procs]`, then
//! `flags[n_procs]`, then a trailing transient `next_id` slot used only
//! during slot assignment. Every read/write goes through `read_volatile`/
//! `write_volatile` since another process can change these bytes between
//! any two instructions on this side — the same reason the C version reads
//! through a `volatile uint8_t *` for `flags`.

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use crate::error::{Error, Result};

/// Per-peer status byte bits (`flags[i]`), named per spec.md §3.
pub const POPULATED: u8 = 1 << 0;
pub const ELIGIBLE: u8 = 1 << 1;

pub struct ShmRegion {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
    pub n_procs: usize,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

fn shm_len(n_procs: usize) -> usize {
    std::mem::size_of::<isize>()
        + n_procs * (std::mem::size_of::<usize>() + std::mem::size_of::<i32>() + std::mem::size_of::<u8>())
        + std::mem::size_of::<i32>()
}

impl ShmRegion {
    /// Open (creating if necessary) the shm-backed file at `path` and map
    /// it. `created` is true iff this call is the one that created (and
    /// therefore must `ftruncate` and seed) the segment.
    pub fn open(path: &Path, n_procs: usize, max_mem: usize) -> Result<(Self, bool)> {
        let len = shm_len(n_procs);
        let mut created = false;
        let file = match std::fs::OpenOptions::new().read(true).write(true).create_new(true).open(path) {
            Ok(f) => {
                created = true;
                f
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                std::fs::OpenOptions::new().read(true).write(true).open(path)?
            }
            Err(e) => return Err(Error::Resource(e)),
        };
        if created {
            ftruncate(&file, len as i64).map_err(|e| Error::Resource(e.into()))?;
        }
        // A just-created file might not yet be the right size if another
        // peer raced us past create_new; make sure before mapping.
        while (file.metadata().map_err(Error::Resource)?.size() as usize) < len {
            std::thread::yield_now();
        }

        let map = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(len).expect("non-empty shm segment"),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| Error::Resource(e.into()))?;
        // `file` is dropped (closing the fd) at the end of this function;
        // the mapping itself keeps the segment alive, same as the original
        // closing its shm fd immediately after `mmap`.

        let region = ShmRegion { ptr: map.cast(), len, n_procs };
        if created {
            unsafe { region.smem_ptr().write_volatile(max_mem as isize) };
        }
        Ok((region, created))
    }

    unsafe fn smem_ptr(&self) -> *mut isize {
        self.ptr.as_ptr().cast()
    }

    unsafe fn pmem_ptr(&self, i: usize) -> *mut usize {
        let base = self.ptr.as_ptr().add(std::mem::size_of::<isize>());
        (base as *mut usize).add(i)
    }

    unsafe fn pid_ptr(&self, i: usize) -> *mut i32 {
        let base = self.ptr.as_ptr().add(std::mem::size_of::<isize>() + self.n_procs * std::mem::size_of::<usize>());
        (base as *mut i32).add(i)
    }

    unsafe fn flags_ptr(&self, i: usize) -> *mut u8 {
        let base = self.ptr.as_ptr().add(
            std::mem::size_of::<isize>()
                + self.n_procs * std::mem::size_of::<usize>()
                + self.n_procs * std::mem::size_of::<i32>(),
        );
        base.add(i)
    }

    unsafe fn next_id_ptr(&self) -> *mut i32 {
        let base = self.ptr.as_ptr().add(self.len - std::mem::size_of::<i32>());
        base as *mut i32
    }

    pub fn smem(&self) -> isize {
        unsafe { self.smem_ptr().read_volatile() }
    }

    pub fn set_smem(&self, v: isize) {
        unsafe { self.smem_ptr().write_volatile(v) }
    }

    pub fn pmem(&self, i: usize) -> usize {
        debug_assert!(i < self.n_procs);
        unsafe { self.pmem_ptr(i).read_volatile() }
    }

    pub fn set_pmem(&self, i: usize, v: usize) {
        debug_assert!(i < self.n_procs);
        unsafe { self.pmem_ptr(i).write_volatile(v) }
    }

    pub fn pid(&self, i: usize) -> i32 {
        debug_assert!(i < self.n_procs);
        unsafe { self.pid_ptr(i).read_volatile() }
    }

    pub fn set_pid(&self, i: usize, v: i32) {
        debug_assert!(i < self.n_procs);
        unsafe { self.pid_ptr(i).write_volatile(v) }
    }

    pub fn flags(&self, i: usize) -> u8 {
        debug_assert!(i < self.n_procs);
        unsafe { self.flags_ptr(i).read_volatile() }
    }

    pub fn set_flags(&self, i: usize, v: u8) {
        debug_assert!(i < self.n_procs);
        unsafe { self.flags_ptr(i).write_volatile(v) }
    }

    /// Claim the next slot id, used only during init under the `sid`
    /// startup semaphore.
    pub fn claim_next_id(&self) -> i32 {
        unsafe {
            let p = self.next_id_ptr();
            let id = p.read_volatile();
            p.write_volatile(id + 1);
            id
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.ptr.cast(), self.len);
        }
    }
}
