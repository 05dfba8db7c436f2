//! Paged virtual memory.
//!
//! [`VirtualMemory`] presents one logical append-only byte space over a
//! sequence of fixed-size pages. Pages are allocated lazily by a
//! [`PageAllocator`], either anonymous memory ([`HeapPages`]) or a
//! growable file mapping ([`FilePages`]).
//!
//! Page size is always a power of two, so translation from logical offset
//! to page index and intra-page offset is shift and mask only. Values are
//! never assumed to be aligned: anything that crosses a page boundary is
//! copied as a sequence of per-page byte ranges.
mod codec;
mod heap;
mod long256;
mod mapped;

pub use codec::*;
pub use heap::*;
pub use long256::*;
pub use mapped::*;

use crate::error::{Error, Result};
use std::ptr::NonNull;

/// Provides pages to virtual memory.
pub trait PageAllocator {
    /// Map page at given index and return its base address.
    /// The page must be `page_size` bytes long and stay valid until
    /// it is released.
    fn allocate_page(&mut self, page: usize, page_size: usize) -> Result<NonNull<u8>>;

    /// Release a page returned by `allocate_page`.
    fn release_page(&mut self, page: usize, ptr: NonNull<u8>, page_size: usize);

    /// Shrink backing store to a single page.
    /// Called by [`VirtualMemory::truncate`] after all pages except the
    /// first are released and the first page is zeroed.
    #[inline]
    fn truncate(&mut self, _page_size: usize) -> Result<()> {
        Ok(())
    }

    /// Called once when virtual memory is dropped, after all pages
    /// are released. `size` is the final append offset.
    #[inline]
    fn close(&mut self, _size: usize) {}
}

pub struct VirtualMemory<A: PageAllocator> {
    pages: Vec<Option<NonNull<u8>>>,
    page_size: usize,
    page_shift: u32,
    page_mask: usize,
    max_pages: usize,
    append_offset: usize,
    alloc: A,
}

// Pages are exclusively owned by the virtual memory instance.
unsafe impl<A: PageAllocator + Send> Send for VirtualMemory<A> {}

impl<A: PageAllocator> VirtualMemory<A> {
    /// Create virtual memory over given page allocator.
    /// Page size is rounded up to the next power of two.
    #[inline]
    pub fn with_allocator(alloc: A, page_size: usize, max_pages: usize) -> Self {
        let page_size = page_size.max(2).next_power_of_two();
        VirtualMemory {
            pages: Vec::new(),
            page_size,
            page_shift: page_size.trailing_zeros(),
            page_mask: page_size - 1,
            max_pages: max_pages.max(1),
            append_offset: 0,
            alloc,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Current write position.
    #[inline]
    pub fn append_offset(&self) -> usize {
        self.append_offset
    }

    /// Number of slots in page table, mapped or not.
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub fn is_page_mapped(&self, page: usize) -> bool {
        matches!(self.pages.get(page), Some(Some(_)))
    }

    #[inline]
    pub fn allocator(&self) -> &A {
        &self.alloc
    }

    #[inline]
    pub fn page_index(&self, offset: usize) -> usize {
        offset >> self.page_shift
    }

    #[inline]
    pub fn offset_in_page(&self, offset: usize) -> usize {
        offset & self.page_mask
    }

    /// Bytes from offset to the end of its page.
    #[inline]
    pub fn page_remaining(&self, offset: usize) -> usize {
        self.page_size - self.offset_in_page(offset)
    }

    /// Logical offset of the first byte of given page.
    #[inline]
    pub fn page_offset(&self, page: usize) -> usize {
        page << self.page_shift
    }

    /// Make sure the page table can hold the page of given offset.
    /// Fails without touching the table if that page is beyond `max_pages`.
    #[inline]
    pub fn ensure_pages_capacity(&mut self, offset: usize) -> Result<()> {
        self.reserve_page_slot(self.page_index(offset))
    }

    fn reserve_page_slot(&mut self, page: usize) -> Result<()> {
        if page >= self.max_pages {
            return Err(Error::MaxPagesExceeded(self.max_pages));
        }
        if page >= self.pages.len() {
            self.pages
                .try_reserve(page + 1 - self.pages.len())
                .map_err(|_| Error::InsufficientMemory(page + 1))?;
        }
        Ok(())
    }

    /// Guarantee page is mapped and return its base address.
    #[inline]
    pub fn ensure_page(&mut self, page: usize) -> Result<NonNull<u8>> {
        if let Some(Some(ptr)) = self.pages.get(page) {
            return Ok(*ptr);
        }
        self.allocate_page(page)
    }

    #[cold]
    fn allocate_page(&mut self, page: usize) -> Result<NonNull<u8>> {
        self.reserve_page_slot(page)?;
        let ptr = self.alloc.allocate_page(page, self.page_size)?;
        if page >= self.pages.len() {
            self.pages.resize(page + 1, None);
        }
        self.pages[page] = Some(ptr);
        Ok(ptr)
    }

    /// Returns mutable bytes of given page, mapping it if needed.
    #[inline]
    pub fn page_mut(&mut self, page: usize) -> Result<&mut [u8]> {
        let ptr = self.ensure_page(page)?;
        // SAFETY: page is mapped with page_size bytes and owned by self.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.page_size) })
    }

    /// Returns bytes of given page if it is already mapped.
    #[inline]
    pub fn page(&self, page: usize) -> Option<&[u8]> {
        match self.pages.get(page) {
            // SAFETY: page is mapped with page_size bytes and owned by self.
            Some(Some(ptr)) => {
                Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.page_size) })
            }
            _ => None,
        }
    }

    /// Move append pointer to given offset and map its page.
    #[inline]
    pub fn jump_to(&mut self, offset: usize) -> Result<()> {
        self.ensure_pages_capacity(offset)?;
        self.ensure_page(self.page_index(offset))?;
        self.append_offset = offset;
        Ok(())
    }

    /// Advance append pointer by given number of bytes.
    #[inline]
    pub fn skip(&mut self, len: usize) -> Result<()> {
        let offset = self
            .append_offset
            .checked_add(len)
            .ok_or(Error::InvalidArgument)?;
        self.jump_to(offset)
    }

    /// Write bytes at given offset. Append pointer is not changed.
    #[inline]
    pub fn put_bytes_at(&mut self, mut offset: usize, mut bytes: &[u8]) -> Result<()> {
        while !bytes.is_empty() {
            let page = self.page_index(offset);
            let in_page = self.offset_in_page(offset);
            let n = (self.page_size - in_page).min(bytes.len());
            let dst = self.page_mut(page)?;
            dst[in_page..in_page + n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            offset += n;
        }
        Ok(())
    }

    /// Write bytes at append pointer and advance it.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<usize> {
        let offset = self.append_offset;
        self.put_bytes_at(offset, bytes)?;
        self.append_offset = offset + bytes.len();
        Ok(offset)
    }

    /// Read bytes at given offset into `dst`.
    #[inline]
    pub fn get_bytes(&mut self, mut offset: usize, mut dst: &mut [u8]) -> Result<()> {
        while !dst.is_empty() {
            let page = self.page_index(offset);
            let in_page = self.offset_in_page(offset);
            let n = (self.page_size - in_page).min(dst.len());
            let src = self.page_mut(page)?;
            let (head, tail) = dst.split_at_mut(n);
            head.copy_from_slice(&src[in_page..in_page + n]);
            dst = tail;
            offset += n;
        }
        Ok(())
    }

    /// Zero the first page, release all others, reset append pointer
    /// and shrink the backing store to one page.
    #[inline]
    pub fn truncate(&mut self) -> Result<()> {
        self.page_mut(0)?.fill(0);
        for page in 1..self.pages.len() {
            if let Some(ptr) = self.pages[page].take() {
                self.alloc.release_page(page, ptr, self.page_size);
            }
        }
        self.pages.truncate(1);
        self.append_offset = 0;
        self.alloc.truncate(self.page_size)
    }

    #[inline]
    fn release_all(&mut self) {
        for (page, slot) in self.pages.iter_mut().enumerate() {
            if let Some(ptr) = slot.take() {
                self.alloc.release_page(page, ptr, self.page_size);
            }
        }
        self.pages.clear();
    }
}

impl<A: PageAllocator> Drop for VirtualMemory<A> {
    #[inline]
    fn drop(&mut self) {
        let size = self.append_offset;
        self.release_all();
        self.alloc.close(size);
    }
}
