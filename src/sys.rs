//! Thin syscall-retry helper.
//!
//! The original's `ipc.c` wraps every blocking call in a `HNDLINTR` macro
//! that loops on `EINTR` and returns any other error. `retry_eintr` is the
//! same idea as a function: call it around anything that can return
//! `nix::errno::Errno::EINTR` (semaphore waits, reads/writes that land on a
//! signal-interrupted syscall under `SIGIPC`).

use nix::errno::Errno;

pub fn retry_eintr<T>(mut f: impl FnMut() -> Result<T, Errno>) -> Result<T, Errno> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}
