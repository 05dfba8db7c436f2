use crate::error::{Error, Result};
use crate::ff::{FilesFacadeRef, MapMode};
use crate::vm::{PageAllocator, VirtualMemory};
use log::{debug, error};
use memmap2::{Mmap, MmapOptions};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Page allocator backed by a single growable file.
///
/// Each page is an individual read-write shared mapping of its byte range.
/// The file is extended before a page beyond its end is mapped.
/// Page size may be smaller than OS page size, in which case the mapping
/// starts at the aligned offset below the page and the page pointer points
/// inside it.
pub struct FilePages {
    ff: FilesFacadeRef,
    fd: RawFd,
    path: PathBuf,
    os_page_size: usize,
    // set once the memory is fully opened, so a failed open
    // never shrinks the file.
    attached: bool,
}

/// Read-write virtual memory over a file.
pub type MappedMemory = VirtualMemory<FilePages>;

impl FilePages {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns aligned start of the mapping holding given page and the
    /// distance from that start to the page.
    #[inline]
    fn mapping_of(&self, page: usize, page_size: usize) -> (usize, usize) {
        let offset = page * page_size;
        let aligned = offset / self.os_page_size * self.os_page_size;
        (aligned, offset - aligned)
    }
}

impl PageAllocator for FilePages {
    fn allocate_page(&mut self, page: usize, page_size: usize) -> Result<NonNull<u8>> {
        let need = page
            .checked_add(1)
            .and_then(|n| n.checked_mul(page_size))
            .ok_or(Error::InvalidArgument)?;
        let offset = need - page_size;
        let len = self
            .ff
            .length(self.fd)
            .map_err(|errno| Error::file_op("fstat", self.fd, errno))?;
        if len < need {
            if let Err(errno) = self.ff.allocate(self.fd, need) {
                return Err(Error::NoSpaceLeft {
                    need,
                    errno: errno.0,
                });
            }
        }
        let (aligned, delta) = self.mapping_of(page, page_size);
        match self
            .ff
            .mmap(self.fd, page_size + delta, aligned, MapMode::ReadWrite)
        {
            // SAFETY: delta is within the mapping.
            Ok(ptr) => Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(delta)) }),
            Err(errno) => Err(Error::MmapFailed {
                fd: self.fd,
                offset,
                size: page_size,
                errno: errno.0,
            }),
        }
    }

    #[inline]
    fn release_page(&mut self, page: usize, ptr: NonNull<u8>, page_size: usize) {
        let (_, delta) = self.mapping_of(page, page_size);
        unsafe {
            let base = NonNull::new_unchecked(ptr.as_ptr().sub(delta));
            if let Err(errno) = self.ff.munmap(base, page_size + delta) {
                error!("could not munmap [fd={}, page={}, {}]", self.fd, page, errno);
            }
        }
    }

    fn truncate(&mut self, page_size: usize) -> Result<()> {
        let file_size = self
            .ff
            .length(self.fd)
            .map_err(|errno| Error::file_op("fstat", self.fd, errno))?;
        if file_size <= page_size {
            return Ok(());
        }
        if self.ff.truncate(self.fd, page_size).is_ok() {
            return Ok(());
        }
        // we could not truncate the file; we have to clear it via memory mapping
        let ptr = self
            .ff
            .mmap(self.fd, file_size, 0, MapMode::ReadWrite)
            .map_err(|errno| Error::MmapFailed {
                fd: self.fd,
                offset: 0,
                size: file_size,
                errno: errno.0,
            })?;
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr().add(page_size), 0, file_size - page_size);
            let _ = self.ff.munmap(ptr, file_size);
        }
        debug!("could not truncate, zeroed [fd={}]", self.fd);
        Ok(())
    }

    fn close(&mut self, size: usize) {
        if self.fd < 0 {
            return;
        }
        // trim pre-allocated tail, unless file is already gone.
        if self.attached && self.ff.exists_fd(self.fd) {
            if let Err(errno) = self.ff.truncate(self.fd, size) {
                error!(
                    "could not truncate on close [fd={}, size={}, {}]",
                    self.fd, size, errno
                );
            }
        }
        if let Err(errno) = self.ff.close(self.fd) {
            error!("could not close [fd={}, {}]", self.fd, errno);
        }
        debug!("closed {} [fd={}]", self.path.display(), self.fd);
        self.fd = -1;
    }
}

impl MappedMemory {
    /// Open or create file, and resume appending at its end.
    #[inline]
    pub fn open(ff: FilesFacadeRef, path: impl AsRef<Path>, page_size: usize) -> Result<Self> {
        Self::open0(ff, path.as_ref(), page_size, usize::MAX, None)
    }

    /// Open or create file, and resume appending at given size.
    /// This is used to attach structures whose logical size is
    /// tracked outside of the file.
    #[inline]
    pub fn open_with_size(
        ff: FilesFacadeRef,
        path: impl AsRef<Path>,
        page_size: usize,
        size: usize,
    ) -> Result<Self> {
        Self::open0(ff, path.as_ref(), page_size, usize::MAX, Some(size))
    }

    /// Open with limit of maximum mapped pages.
    #[inline]
    pub fn open_with_max_pages(
        ff: FilesFacadeRef,
        path: impl AsRef<Path>,
        page_size: usize,
        max_pages: usize,
    ) -> Result<Self> {
        Self::open0(ff, path.as_ref(), page_size, max_pages, None)
    }

    fn open0(
        ff: FilesFacadeRef,
        path: &Path,
        page_size: usize,
        max_pages: usize,
        size: Option<usize>,
    ) -> Result<Self> {
        let fd = ff.open_rw(path).map_err(|errno| Error::OpenFileError {
            path: path.display().to_string(),
            errno: errno.0,
        })?;
        let os_page_size = ff.os_page_size();
        let alloc = FilePages {
            ff,
            fd,
            path: path.to_path_buf(),
            os_page_size,
            attached: false,
        };
        // From here on dropping mem closes the descriptor.
        let mut mem = VirtualMemory::with_allocator(alloc, page_size, max_pages);
        let size = match size {
            Some(size) => size,
            None => mem
                .alloc
                .ff
                .length(fd)
                .map_err(|errno| Error::file_op("fstat", fd, errno))?,
        };
        debug!("open {} [fd={}, size={}]", path.display(), fd, size);
        mem.jump_to(size)?;
        mem.alloc.attached = true;
        Ok(mem)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.alloc.fd
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.alloc.path
    }

    /// Returns whether backing file was removed from file system.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        !self.alloc.ff.exists_fd(self.alloc.fd)
    }

    /// Current length of backing file.
    #[inline]
    pub fn file_length(&self) -> Result<usize> {
        self.alloc
            .ff
            .length(self.alloc.fd)
            .map_err(|errno| Error::file_op("fstat", self.alloc.fd, errno))
    }

    /// Extend address space to current file length, e.g. after another
    /// process appended to the file.
    #[inline]
    pub fn grow_to_file_size(&mut self) -> Result<()> {
        let len = self.file_length()?;
        if len > self.append_offset {
            self.jump_to(len)?;
        }
        Ok(())
    }

    /// Flush one page to disk. Failure is logged.
    #[inline]
    pub fn sync(&self, page: usize, async_: bool) {
        let Some(Some(ptr)) = self.pages.get(page) else {
            return;
        };
        let (_, delta) = self.alloc.mapping_of(page, self.page_size);
        let base = unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(delta)) };
        if let Err(errno) = self.alloc.ff.msync(base, self.page_size + delta, async_) {
            error!("could not msync [fd={}, page={}, {}]", self.alloc.fd, page, errno);
        }
    }

    /// Flush all mapped pages.
    #[inline]
    pub fn sync_all(&self, async_: bool) {
        for page in 0..self.pages.len() {
            self.sync(page, async_);
        }
    }

    /// Release all mappings and the descriptor. File is truncated to
    /// the append offset unless it has been deleted.
    #[inline]
    pub fn close(self) {
        drop(self)
    }
}

/// Map whole file read-only. Empty file has nothing to map and yields
/// `None`. The descriptor is closed before return, the mapping outlives it.
pub fn map_read_only(ff: &FilesFacadeRef, path: &Path) -> Result<Option<Mmap>> {
    let fd = ff.open_ro(path).map_err(|errno| Error::OpenFileError {
        path: path.display().to_string(),
        errno: errno.0,
    })?;
    let res = map_fd_read_only(ff, fd);
    if let Err(errno) = ff.close(fd) {
        error!("could not close [fd={}, {}]", fd, errno);
    }
    res
}

#[inline]
fn map_fd_read_only(ff: &FilesFacadeRef, fd: RawFd) -> Result<Option<Mmap>> {
    let len = ff
        .length(fd)
        .map_err(|errno| Error::file_op("fstat", fd, errno))?;
    if len == 0 {
        return Ok(None);
    }
    // SAFETY: writers only append or rewrite bytes above the range
    // readers are allowed to see.
    unsafe { MmapOptions::new().len(len).map(fd) }
        .map(Some)
        .map_err(|e| Error::MmapFailed {
            fd,
            offset: 0,
            size: len,
            errno: e.raw_os_error().unwrap_or(libc::EIO),
        })
}
