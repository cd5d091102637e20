use std::{
    fs::File,
    io,
    os::fd::AsRawFd,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::c_void;
use parking_lot::RwLock;

use super::{Error, Result};

pub trait IO {
    /// Positional read. Does not move any file cursor, safe to call from
    /// multiple threads on the same handle.
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Positional write. Same guarantees as [`IO::pread`].
    fn pwrite(&self, offset: u64, buf: &[u8]) -> io::Result<usize>;

    /// Current length of the underlying file in bytes.
    fn size(&self) -> io::Result<u64>;

    /// Makes syscall to kernel to persist written data on the device.
    fn sync(&self) -> io::Result<()>;
}

impl IO for File {
    fn pread(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let read = unsafe {
            libc::pread(
                self.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if read == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(read as usize)
        }
    }

    fn pwrite(&self, offset: u64, buf: &[u8]) -> io::Result<usize> {
        let written = unsafe {
            libc::pwrite(
                self.as_raw_fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                offset as libc::off_t,
            )
        };
        if written == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(written as usize)
        }
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    #[cfg(target_os = "linux")]
    fn sync(&self) -> io::Result<()> {
        let res = unsafe { libc::fsync(self.as_raw_fd()) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Page-aligned random access over a single file.
///
/// Pages are fixed-size regions at `page_no * page_size`. The handle is
/// guarded by one reader/writer lock: page reads and writes take it shared
/// (positional I/O needs no seek ordering), open and close take it
/// exclusively.
pub struct BlockIO<I = File> {
    io: RwLock<Option<I>>,
    page_size: usize,
    read_only: AtomicBool,
}

impl<I> BlockIO<I> {
    /// Creates a closed handle for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            io: RwLock::new(None),
            page_size,
            read_only: AtomicBool::new(false),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_open(&self) -> bool {
        self.io.read().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }
}

impl BlockIO<File> {
    /// Opens an existing file, or creates an empty one when missing and
    /// `read_only` is false. Fails on an empty path, on a missing file in
    /// read only mode, or when the OS refuses the handle.
    pub fn open(&self, path: impl AsRef<Path>, read_only: bool) -> Result<()> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::EmptyPath);
        }

        let mut guard = self.io.write();
        if guard.is_some() {
            return Ok(());
        }

        let file = File::options()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.display().to_string(),
                source,
            })?;

        self.read_only.store(read_only, Ordering::Release);
        *guard = Some(file);

        Ok(())
    }

    /// Closes the handle. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.io.write();
        let _ = guard.take();
        Ok(())
    }
}

impl<I: IO> BlockIO<I> {
    /// Reads up to one page at `page_no` into `buf`. A short read near the
    /// end of file returns fewer bytes and is not an error.
    pub fn read_page(&self, page_no: u64, buf: &mut [u8]) -> Result<usize> {
        debug_assert!(buf.len() <= self.page_size);

        let guard = self.io.read();
        let io = guard.as_ref().ok_or(Error::Closed)?;

        Ok(io.pread(page_no * self.page_size as u64, buf)?)
    }

    /// Writes one full page at `page_no`. Fails in read only mode.
    pub fn write_page(&self, page_no: u64, buf: &[u8]) -> Result<usize> {
        debug_assert_eq!(buf.len(), self.page_size);

        if self.is_read_only() {
            return Err(Error::ReadOnly);
        }

        let guard = self.io.read();
        let io = guard.as_ref().ok_or(Error::Closed)?;

        Ok(io.pwrite(page_no * self.page_size as u64, buf)?)
    }

    /// Current file length in bytes.
    pub fn size(&self) -> Result<u64> {
        let guard = self.io.read();
        let io = guard.as_ref().ok_or(Error::Closed)?;

        Ok(io.size()?)
    }

    /// Forces OS buffers down to the device.
    pub fn flush(&self) -> Result<()> {
        let guard = self.io.read();
        let io = guard.as_ref().ok_or(Error::Closed)?;

        Ok(io.sync()?)
    }
}
