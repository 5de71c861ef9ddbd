//! POSIX named semaphores.
//!
//! `nix` has no binding for `sem_open`/`sem_wait`/`sem_post` (unlike the
//! unnamed, in-process `sem_t` support some platforms expose), so this goes
//! straight to `libc`, the same way `examples/rust-lang-miri/src/shims/native_lib/trace/child.rs`
//! drops to raw `libc::mprotect`/`libc::prctl` calls for primitives `nix`
//! doesn't cover, with a `// SAFETY:` comment at each `unsafe` block
//! justifying the call.

use std::ffi::CString;

use crate::error::{Error, Result};
use crate::sys::retry_eintr;

pub struct NamedSemaphore {
    name: CString,
    sem: *mut libc::sem_t,
}

unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Open (creating if necessary) a named semaphore seeded to
    /// `initial_value` the first time it's created.
    pub fn open(name: &str, initial_value: u32) -> Result<Self> {
        let cname = CString::new(name).map_err(|_| Error::Programmer("semaphore name contains NUL"))?;
        // SAFETY: `cname` is a valid NUL-terminated C string for the
        // duration of this call; `sem_open` with O_CREAT is safe to call
        // concurrently from multiple processes racing to create the same
        // name (POSIX guarantees atomicity of the create-if-absent).
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_RDWR,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
                initial_value,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(Error::Resource(std::io::Error::last_os_error()));
        }
        Ok(NamedSemaphore { name: cname, sem })
    }

    /// Block until the semaphore's count is nonzero, then decrement it.
    /// Retries transparently on `EINTR` (a `SIGIPC` delivered mid-wait),
    /// matching `ipc.c`'s `HNDLINTR(libc_sem_wait(...))`.
    pub fn wait(&self) -> Result<()> {
        retry_eintr(|| {
            // SAFETY: `self.sem` is a valid, open semaphore handle for the
            // lifetime of `self`.
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                Ok(())
            } else {
                Err(nix::errno::Errno::last())
            }
        })
        .map_err(|e| Error::Resource(e.into()))
    }

    pub fn post(&self) -> Result<()> {
        // SAFETY: see `wait`.
        if unsafe { libc::sem_post(self.sem) } == 0 {
            Ok(())
        } else {
            Err(Error::Resource(std::io::Error::last_os_error()))
        }
    }

    pub fn close(&self) -> Result<()> {
        // SAFETY: `self.sem` is a valid handle; `sem_close` only
        // invalidates this process's handle, it does not unlink the name.
        if unsafe { libc::sem_close(self.sem) } == 0 {
            Ok(())
        } else {
            Err(Error::Resource(std::io::Error::last_os_error()))
        }
    }

    /// Remove the name from the system, tolerating `ENOENT` (already
    /// unlinked by a racing peer), matching `ipc.c`'s destroy path.
    pub fn unlink(name: &str) -> Result<()> {
        let cname = CString::new(name).map_err(|_| Error::Programmer("semaphore name contains NUL"))?;
        // SAFETY: `cname` is a valid C string for the duration of the call.
        if unsafe { libc::sem_unlink(cname.as_ptr()) } == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                Ok(())
            } else {
                Err(Error::Resource(err))
            }
        }
    }

    pub fn name(&self) -> &str {
        self.name.to_str().expect("semaphore names are constructed from &str")
    }
}
