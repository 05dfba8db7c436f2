//! Files facade.
//!
//! All file system calls of the storage layer go through [`FilesFacade`],
//! so tests can substitute a faulty implementation and observe how upper
//! layers react to failed allocation, mapping or truncation.
use libc::{
    c_void, close, fallocate, fstat, ftruncate, mmap, msync, munmap, open, stat, sysconf,
    EOPNOTSUPP, MAP_FAILED, MAP_SHARED, MS_ASYNC, MS_SYNC, O_CREAT, O_RDONLY, O_RDWR, PROT_READ,
    PROT_WRITE, _SC_PAGESIZE,
};
use std::ffi::CString;
use std::fmt;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

/// OS error code of a failed system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Returns errno of the last failed call on current thread.
    #[inline]
    pub fn last() -> Self {
        Errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl fmt::Display for Errno {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno={}", self.0)
    }
}

pub type FfResult<T> = std::result::Result<T, Errno>;

/// Shared handle of files facade.
pub type FilesFacadeRef = Arc<dyn FilesFacade>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    ReadWrite,
}

pub trait FilesFacade: Send + Sync {
    /// Returns whether given path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Returns whether file of given descriptor is still linked
    /// in the file system.
    fn exists_fd(&self, fd: RawFd) -> bool;

    /// Returns length of file at given path.
    fn path_length(&self, path: &Path) -> FfResult<usize>;

    /// Returns length of opened file.
    fn length(&self, fd: RawFd) -> FfResult<usize>;

    /// Open file for read and write, create it if not exists.
    fn open_rw(&self, path: &Path) -> FfResult<RawFd>;

    /// Open an existing file for read.
    fn open_ro(&self, path: &Path) -> FfResult<RawFd>;

    /// Close file descriptor.
    fn close(&self, fd: RawFd) -> FfResult<()>;

    /// Create an empty file if not exists.
    fn touch(&self, path: &Path) -> FfResult<()>;

    /// Remove file.
    fn remove(&self, path: &Path) -> FfResult<()>;

    /// Rename file.
    fn rename(&self, from: &Path, to: &Path) -> FfResult<()>;

    /// Make sure file is at least `size` bytes long, reserving
    /// disk blocks if file system supports it.
    fn allocate(&self, fd: RawFd, size: usize) -> FfResult<()>;

    /// Change file length to exactly `size` bytes.
    fn truncate(&self, fd: RawFd, size: usize) -> FfResult<()>;

    /// Map `len` bytes of file starting at `offset`.
    /// Offset must be aligned to [`FilesFacade::os_page_size`].
    fn mmap(&self, fd: RawFd, len: usize, offset: usize, mode: MapMode) -> FfResult<NonNull<u8>>;

    /// Unmap memory returned by [`FilesFacade::mmap`].
    ///
    /// # Safety
    ///
    /// Caller must guarantee the range is mapped and no reference
    /// into it is alive.
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> FfResult<()>;

    /// Flush mapped range to disk.
    fn msync(&self, ptr: NonNull<u8>, len: usize, async_: bool) -> FfResult<()>;

    /// Granularity of mapping offsets.
    fn os_page_size(&self) -> usize;
}

/// Files facade backed by libc calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsFilesFacade;

impl OsFilesFacade {
    /// Returns shared instance.
    #[inline]
    pub fn shared() -> FilesFacadeRef {
        Arc::new(OsFilesFacade)
    }
}

#[inline]
fn c_path(path: &Path) -> FfResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno(libc::EINVAL))
}

#[inline]
fn fd_stat(fd: RawFd) -> FfResult<stat> {
    unsafe {
        let mut s = MaybeUninit::<stat>::zeroed();
        if fstat(fd, s.as_mut_ptr()) == 0 {
            return Ok(s.assume_init());
        }
        Err(Errno::last())
    }
}

impl FilesFacade for OsFilesFacade {
    #[inline]
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    #[inline]
    fn exists_fd(&self, fd: RawFd) -> bool {
        fd_stat(fd).map(|s| s.st_nlink > 0).unwrap_or(false)
    }

    #[inline]
    fn path_length(&self, path: &Path) -> FfResult<usize> {
        std::fs::metadata(path)
            .map(|m| m.len() as usize)
            .map_err(|e| Errno(e.raw_os_error().unwrap_or(libc::EIO)))
    }

    #[inline]
    fn length(&self, fd: RawFd) -> FfResult<usize> {
        fd_stat(fd).map(|s| s.st_size as usize)
    }

    #[inline]
    fn open_rw(&self, path: &Path) -> FfResult<RawFd> {
        let c_string = c_path(path)?;
        let fd = unsafe { open(c_string.as_ptr(), O_CREAT | O_RDWR, 0o644) };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(fd)
    }

    #[inline]
    fn open_ro(&self, path: &Path) -> FfResult<RawFd> {
        let c_string = c_path(path)?;
        let fd = unsafe { open(c_string.as_ptr(), O_RDONLY) };
        if fd < 0 {
            return Err(Errno::last());
        }
        Ok(fd)
    }

    #[inline]
    fn close(&self, fd: RawFd) -> FfResult<()> {
        if unsafe { close(fd) } == 0 {
            return Ok(());
        }
        Err(Errno::last())
    }

    #[inline]
    fn touch(&self, path: &Path) -> FfResult<()> {
        let fd = self.open_rw(path)?;
        self.close(fd)
    }

    #[inline]
    fn remove(&self, path: &Path) -> FfResult<()> {
        std::fs::remove_file(path).map_err(|e| Errno(e.raw_os_error().unwrap_or(libc::EIO)))
    }

    #[inline]
    fn rename(&self, from: &Path, to: &Path) -> FfResult<()> {
        std::fs::rename(from, to).map_err(|e| Errno(e.raw_os_error().unwrap_or(libc::EIO)))
    }

    #[inline]
    fn allocate(&self, fd: RawFd, size: usize) -> FfResult<()> {
        let len = self.length(fd)?;
        if len >= size {
            return Ok(());
        }
        let retcode = unsafe { fallocate(fd, 0, len as i64, (size - len) as i64) };
        if retcode == 0 {
            return Ok(());
        }
        let errno = Errno::last();
        if errno.0 != EOPNOTSUPP {
            return Err(errno);
        }
        // file system cannot reserve blocks, fall back to sparse extension.
        self.truncate(fd, size)
    }

    #[inline]
    fn truncate(&self, fd: RawFd, size: usize) -> FfResult<()> {
        if unsafe { ftruncate(fd, size as i64) } == 0 {
            return Ok(());
        }
        Err(Errno::last())
    }

    #[inline]
    fn mmap(&self, fd: RawFd, len: usize, offset: usize, mode: MapMode) -> FfResult<NonNull<u8>> {
        let prot = match mode {
            MapMode::ReadOnly => PROT_READ,
            MapMode::ReadWrite => PROT_READ | PROT_WRITE,
        };
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                prot,
                MAP_SHARED,
                fd,
                offset as i64,
            )
        };
        if ptr == MAP_FAILED {
            return Err(Errno::last());
        }
        NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))
    }

    #[inline]
    unsafe fn munmap(&self, ptr: NonNull<u8>, len: usize) -> FfResult<()> {
        if munmap(ptr.as_ptr() as *mut c_void, len) == 0 {
            return Ok(());
        }
        Err(Errno::last())
    }

    #[inline]
    fn msync(&self, ptr: NonNull<u8>, len: usize, async_: bool) -> FfResult<()> {
        let flags = if async_ { MS_ASYNC } else { MS_SYNC };
        if unsafe { msync(ptr.as_ptr() as *mut c_void, len, flags) } == 0 {
            return Ok(());
        }
        Err(Errno::last())
    }

    #[inline]
    fn os_page_size(&self) -> usize {
        unsafe { sysconf(_SC_PAGESIZE) as usize }
    }
}
