//! `SIGIPC` installation and the eviction rendezvous.
//!
//! Design Notes §9 flags the original's signal handler calling blocking
//! file I/O directly as unsafe on platforms that don't tolerate it, and
//! prescribes the portable fix: "a dedicated eviction thread waiting on a
//! semaphore that the signal handler posts." This module implements that
//! with the classic self-pipe trick (the handler itself only does an
//! async-signal-safe `write()` of one byte; all the actual eviction work —
//! including the blocking backing-file I/O — happens on a background
//! thread blocked reading the other end). Global state is held in process-
//! wide atomics/statics, mirroring the pattern
//! `examples/rust-lang-miri/src/shims/native_lib/trace/parent.rs` uses for
//! its `PAGE_SIZE`/`MACHINE_PTR`/... statics, since a real-time signal
//! handler can't capture a closure.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

use crate::error::Result;
use crate::ipc::sem::NamedSemaphore;

/// `SIGRTMIN+0`, matching `examples/original_source/src/ipc.h`'s
/// `#define SIGIPC (SIGRTMIN+0)`.
pub fn sigipc() -> Signal {
    // `nix` doesn't expose SIGRTMIN as a `Signal` variant (it's a runtime
    // value on Linux, not a compile-time constant); go through libc and
    // convert.
    let raw = unsafe { libc::SIGRTMIN() };
    Signal::try_from(raw).expect("SIGRTMIN is always a valid signal number")
}

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_sigipc(_sig: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = [0u8];
        // SAFETY: `write` on a pipe fd is async-signal-safe per POSIX. We
        // ignore the result: if the pipe is full there is already a
        // pending wakeup, and if it errors there is nothing a signal
        // handler can safely do about it.
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

/// Handle to the installed `SIGIPC` plumbing: the background eviction
/// thread and the pipes that wake it and stop it. Both pipe write ends are
/// owned here for the handle's whole lifetime — closing either of them
/// early (e.g. by letting a local binding drop at the end of `install`)
/// would hand the signal handler a dangling fd number.
pub struct EvictionThread {
    _wake_write: OwnedFd,
    stop_write: OwnedFd,
    join: Option<std::thread::JoinHandle<()>>,
}

impl EvictionThread {
    /// Install the `SIGIPC` handler and spawn the background thread that
    /// runs `evict_all` each time the handler fires, then posts `trn1` so
    /// the peer that sent the signal can proceed (the rendezvous from
    /// spec.md §4.1: "one kill, one wait on trn1").
    pub fn install(trn1: Arc<NamedSemaphore>, evict_all: impl Fn() + Send + 'static) -> Result<Self> {
        let (read_fd, wake_write) = unistd::pipe().map_err(|e| crate::error::Error::Resource(e.into()))?;
        let (stop_read, stop_write) = unistd::pipe().map_err(|e| crate::error::Error::Resource(e.into()))?;
        WRITE_FD.store(wake_write.as_raw_fd(), Ordering::Relaxed);

        let action = SigAction::new(SigHandler::Handler(handle_sigipc), SaFlags::SA_RESTART, SigSet::empty());
        // SAFETY: `handle_sigipc` only performs the async-signal-safe
        // `write` syscall, per POSIX signal-safety rules.
        unsafe {
            signal::sigaction(sigipc(), &action).map_err(|e| crate::error::Error::Resource(e.into()))?;
        }

        let read_raw: RawFd = read_fd.as_raw_fd();
        let stop_raw: RawFd = stop_read.as_raw_fd();
        let join = std::thread::Builder::new()
            .name("farmem-sigipc".into())
            .spawn(move || {
                // Keep the read ends alive for as long as the thread runs.
                let _read_fd = read_fd;
                let _stop_read = stop_read;
                loop {
                    let mut fds = [
                        libc::pollfd { fd: read_raw, events: libc::POLLIN, revents: 0 },
                        libc::pollfd { fd: stop_raw, events: libc::POLLIN, revents: 0 },
                    ];
                    // SAFETY: `fds` is a valid, correctly-sized array of
                    // pollfd entries for the duration of the call.
                    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
                    if ret < 0 {
                        continue; // EINTR or similar; just re-poll.
                    }
                    if fds[1].revents & libc::POLLIN != 0 {
                        return; // stop() was called
                    }
                    if fds[0].revents & libc::POLLIN != 0 {
                        let mut buf = [0u8; 64];
                        // SAFETY: draining a pipe into a correctly-sized
                        // stack buffer.
                        unsafe {
                            libc::read(read_raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
                        }
                        evict_all();
                        let _ = trn1.post();
                    }
                }
            })
            .expect("spawning the sigipc eviction thread");

        Ok(EvictionThread { _wake_write: wake_write, stop_write, join: Some(join) })
    }

    fn signal_stop(&self) {
        let byte = [0u8];
        // SAFETY: `self.stop_write` is a valid fd for the lifetime of `self`.
        unsafe {
            libc::write(self.stop_write.as_raw_fd(), byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    /// Stop the eviction thread and join it. Equivalent to dropping, but
    /// lets the caller observe completion synchronously.
    pub fn stop(mut self) {
        self.signal_stop();
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

impl Drop for EvictionThread {
    fn drop(&mut self) {
        if let Some(j) = self.join.take() {
            self.signal_stop();
            let _ = j.join();
        }
        WRITE_FD.store(-1, Ordering::Relaxed);
    }
}
