use crate::error::{Error, Result};
use crate::vm::{PageAllocator, VirtualMemory};
use libc::{c_void, mmap, munmap, MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use std::ptr::NonNull;

/// Page allocator of anonymous memory.
/// Pages are zeroed by the OS on first touch.
#[derive(Debug, Default)]
pub struct HeapPages;

/// In-memory virtual memory, used as scratch space and in tests.
pub type HeapMemory = VirtualMemory<HeapPages>;

impl HeapMemory {
    /// Create in-memory virtual memory with unlimited page count.
    #[inline]
    pub fn new(page_size: usize) -> Self {
        Self::with_max_pages(page_size, usize::MAX)
    }

    #[inline]
    pub fn with_max_pages(page_size: usize, max_pages: usize) -> Self {
        VirtualMemory::with_allocator(HeapPages, page_size, max_pages)
    }
}

impl PageAllocator for HeapPages {
    #[inline]
    fn allocate_page(&mut self, _page: usize, page_size: usize) -> Result<NonNull<u8>> {
        unsafe { mmap_allocate(page_size) }
    }

    #[inline]
    fn release_page(&mut self, _page: usize, ptr: NonNull<u8>, page_size: usize) {
        unsafe { mmap_deallocate(ptr, page_size) }
    }
}

#[inline]
unsafe fn mmap_allocate(total_bytes: usize) -> Result<NonNull<u8>> {
    let memory_chunk = mmap(
        std::ptr::null_mut(),
        total_bytes,
        PROT_READ | PROT_WRITE,
        MAP_PRIVATE | MAP_ANONYMOUS,
        -1,
        0,
    );
    if memory_chunk == MAP_FAILED {
        return Err(Error::InsufficientMemory(total_bytes));
    }
    NonNull::new(memory_chunk as *mut u8).ok_or(Error::InsufficientMemory(total_bytes))
}

#[inline]
unsafe fn mmap_deallocate(ptr: NonNull<u8>, total_bytes: usize) {
    munmap(ptr.as_ptr() as *mut c_void, total_bytes);
}
