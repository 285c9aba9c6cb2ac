//! The memory-mapped backing file shared read/write across every client
//! handler thread and the mirror engine.
//!
//! There is no ordering guarantee between two overlapping writes landing
//! concurrently; the NBD protocol itself makes none, so this simply lets
//! the kernel's page cache serialize individual cache-line stores.

use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use memmap2::MmapRaw;
use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};

/// An open, memory-mapped export file.
pub struct BackingFile {
    file: File,
    map: MmapRaw,
    size: u64,
    path: std::path::PathBuf,
}

// SAFETY: every access goes through `read_at`/`write_into_from`, which
// bounds-check against `size` before touching the map; concurrent
// overlapping writers are an accepted, documented property of this
// export (see module docs), not a soundness hole introduced here.
unsafe impl Send for BackingFile {}
unsafe impl Sync for BackingFile {}

impl BackingFile {
    /// Open and map `path`. `size` is the file's current length.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("opening backing file {}", path.display()))?;
        let size = file.metadata()?.len();
        let map = MmapRaw::map_raw(&file).wrap_err("mmap of backing file failed")?;
        // SAFETY: madvise on a just-created mapping with a valid length.
        unsafe {
            libc::madvise(map.as_mut_ptr() as *mut libc::c_void, size as usize, libc::MADV_RANDOM);
        }
        Ok(BackingFile { file, map, size, path: path.to_path_buf() })
    }

    /// Size of the export, in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path this file was opened from (used by `mirror --unlink` on
    /// migration completion).
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn check_range(&self, off: u64, len: u64) -> Result<(), crate::wire::ErrorType> {
        if off.checked_add(len).map(|end| end > self.size).unwrap_or(true) {
            return Err(crate::wire::ErrorType::ENoSpc);
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes starting at `off` into `buf`.
    pub fn read_at(&self, off: u64, buf: &mut [u8]) -> Result<(), crate::wire::ErrorType> {
        self.check_range(off, buf.len() as u64)?;
        // SAFETY: range was just checked against `self.size`, and the
        // mapping covers exactly `self.size` bytes.
        unsafe {
            let src = self.map.as_ptr().add(off as usize);
            std::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the map at `off`.
    pub fn write_at(&self, off: u64, data: &[u8]) -> Result<(), crate::wire::ErrorType> {
        self.check_range(off, data.len() as u64)?;
        // SAFETY: see `read_at`.
        unsafe {
            let dst = self.map.as_mut_ptr().add(off as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(())
    }

    /// Read exactly `len` bytes from `stream` directly into the map at
    /// `off`, without an intermediate buffer. Used for the allocated
    /// fast path of the sparse-preserving write (§4.3.1).
    pub fn read_into_from<R: Read>(&self, stream: &mut R, off: u64, len: u64) -> Result<(), crate::wire::ErrorType> {
        self.check_range(off, len)?;
        // SAFETY: range checked; slice lifetime is bounded to this call.
        let slice = unsafe {
            std::slice::from_raw_parts_mut(self.map.as_mut_ptr().add(off as usize), len as usize)
        };
        stream.read_exact(slice).map_err(|e| crate::wire::ErrorType::from_io_kind(e.kind()))
    }

    /// Write `[off, off+len)` out to `out_fd` via `sendfile(2)`, copying
    /// straight from the backing file's page cache without a userspace
    /// round trip through the mapping.
    pub fn write_out_to(&self, out_fd: RawFd, off: u64, len: u64) -> Result<(), crate::wire::ErrorType> {
        self.check_range(off, len)?;
        let in_fd = self.file.as_raw_fd();
        let mut file_offset = off as libc::off_t;
        let mut remaining = len as usize;
        while remaining > 0 {
            // SAFETY: in_fd/out_fd are valid open fds for the duration of
            // this call; file_offset is checked in range above and is
            // advanced by the kernel on each partial transfer.
            let n = unsafe { libc::sendfile(out_fd, in_fd, &mut file_offset, remaining) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(crate::wire::ErrorType::from_io_kind(err.kind()));
            }
            if n == 0 {
                break;
            }
            remaining -= n as usize;
        }
        Ok(())
    }

    /// Flush `[off, off+len)` to stable storage, invalidating other
    /// mappings' caches of that range (`MS_SYNC | MS_INVALIDATE`), used
    /// to honor `FUA`.
    pub fn msync_range(&self, off: u64, len: u64) -> std::io::Result<()> {
        let page = page_size();
        let aligned_off = (off / page as u64) * page as u64;
        let aligned_len = (len + (off - aligned_off)) as usize;
        // SAFETY: aligned range falls within the mapping (clipped below).
        let rc = unsafe {
            let ptr = self.map.as_mut_ptr().add(aligned_off as usize) as *mut libc::c_void;
            let clipped = aligned_len.min((self.size - aligned_off) as usize);
            libc::msync(ptr, clipped, libc::MS_SYNC | libc::MS_INVALIDATE)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Flush the whole mapping, used by `FLUSH`.
    pub fn msync_all(&self) -> std::io::Result<()> {
        self.msync_range(0, self.size)
    }

}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name always returns a usable value on
    // Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(8192).unwrap();
        let backing = BackingFile::open(tmp.path()).unwrap();
        backing.write_at(100, b"hello").unwrap();
        let mut buf = [0u8; 5];
        backing.read_at(100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn out_of_range_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();
        let backing = BackingFile::open(tmp.path()).unwrap();
        let mut buf = [0u8; 10];
        assert!(backing.read_at(4090, &mut buf).is_err());
    }

    #[test]
    fn read_into_from_stream_writes_map() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();
        let backing = BackingFile::open(tmp.path()).unwrap();
        let mut src: &[u8] = b"abcd";
        backing.read_into_from(&mut src, 0, 4).unwrap();
        let mut buf = [0u8; 4];
        backing.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
