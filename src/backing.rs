//! Per-allocation backing file.
//!
//! Named `${fstem}${pid}-${base:x}` per spec.md §6. Logical page `p` lives
//! at file offset `p * page_size`; the file grows lazily as pages are
//! written and reads past EOF (or into a sparse hole) come back zero, same
//! as the original's `pread`/`pwrite`-only approach in
//! `examples/original_source/src/api/mstate.c`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

pub struct BackingFile {
    path: PathBuf,
    file: File,
    page_size: usize,
}

impl BackingFile {
    pub fn open(fstem: &str, pid: i32, base: usize, page_size: usize) -> io::Result<Self> {
        let path = PathBuf::from(format!("{fstem}{pid}-{base:x}"));
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        Ok(BackingFile { path, file, page_size })
    }

    /// Read one page at `page_index` into `buf` (`buf.len()` must equal
    /// `page_size`). Offsets past the current end of file, or inside a
    /// sparse hole, read back as zero.
    pub fn read_page(&self, page_index: usize, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let offset = (page_index * self.page_size) as u64;
        let len = self.file.metadata()?.len();
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        let avail = (len - offset).min(buf.len() as u64) as usize;
        buf[..avail].fill(0);
        self.file.read_exact_at(&mut buf[..avail], offset)?;
        if avail < buf.len() {
            buf[avail..].fill(0);
        }
        Ok(())
    }

    /// Write one page at `page_index` from `buf`. Partial writes are
    /// retried page-by-page by the caller (`swap_out`); a failure here
    /// leaves the file's prior contents for this page untouched beyond
    /// what the kernel already flushed.
    pub fn write_page(&self, page_index: usize, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let offset = (page_index * self.page_size) as u64;
        self.file.write_all_at(buf, offset)
    }

    pub fn remove(self) -> io::Result<()> {
        drop(self.file);
        std::fs::remove_file(&self.path)
    }
}
