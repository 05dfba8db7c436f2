use crate::error::{Error, Result};
use crate::ff::FilesFacadeRef;
use crate::index::BitmapIndexWriter;
use crate::serde::Serde;
use crate::vm::{map_read_only, MappedMemory};
use log::debug;
use memmap2::Mmap;
use std::path::Path;

/// Size of key file header.
pub const KEY_HEADER_SIZE: usize = 64;
/// Size of one key entry: head record offset and value count.
pub const KEY_ENTRY_SIZE: usize = 16;
/// Size of one value record: value and previous record offset.
pub const VALUE_RECORD_SIZE: usize = 16;
pub const KEY_FILE_SIGNATURE: u8 = 0xfa;

const SIGNATURE_OFFSET: usize = 0;
const KEY_COUNT_OFFSET: usize = 8;
const VALUE_MEM_SIZE_OFFSET: usize = 16;

#[inline]
fn key_entry_offset(key: usize) -> usize {
    KEY_HEADER_SIZE + key * KEY_ENTRY_SIZE
}

/// Write empty key file header. Any previous content is discarded.
#[inline]
pub fn init_key_file(ff: FilesFacadeRef, path: impl AsRef<Path>, page_size: usize) -> Result<()> {
    let mut mem = MappedMemory::open(ff, path.as_ref(), page_size)?;
    mem.truncate()?;
    mem.put_bytes_at(SIGNATURE_OFFSET, &[KEY_FILE_SIGNATURE])?;
    mem.put_i64_at(KEY_COUNT_OFFSET, 0)?;
    mem.put_i64_at(VALUE_MEM_SIZE_OFFSET, 0)?;
    mem.jump_to(KEY_HEADER_SIZE)?;
    mem.sync(0, false);
    debug!("initialized key file {}", path.as_ref().display());
    Ok(())
}

/// Bitmap index over a key file and a value file.
///
/// Key file holds a fixed header followed by one entry per key.
/// Value file is an append-only list of records, each record links to
/// the previous record of the same key, so a key is a backward linked
/// list starting at its head.
pub struct FileBitmapIndex {
    key_mem: MappedMemory,
    value_mem: MappedMemory,
    key_count: usize,
}

impl FileBitmapIndex {
    /// Attach to key and value files. Key file must be initialized
    /// by [`init_key_file`].
    pub fn open(
        ff: FilesFacadeRef,
        key_path: impl AsRef<Path>,
        value_path: impl AsRef<Path>,
        page_size: usize,
    ) -> Result<Self> {
        let key_path = key_path.as_ref();
        let value_path = value_path.as_ref();
        let len = ff.path_length(key_path).unwrap_or(0);
        if len < KEY_HEADER_SIZE {
            return Err(Error::IndexCorrupted(format!(
                "key file is too short: {} [len={}]",
                key_path.display(),
                len
            )));
        }
        let mut key_mem = MappedMemory::open(ff.clone(), key_path, page_size)?;
        if key_mem.get_i8(SIGNATURE_OFFSET)? as u8 != KEY_FILE_SIGNATURE {
            return Err(Error::IndexCorrupted(format!(
                "unknown key file format: {}",
                key_path.display()
            )));
        }
        let key_count = key_mem.get_i64(KEY_COUNT_OFFSET)?;
        let value_mem_size = key_mem.get_i64(VALUE_MEM_SIZE_OFFSET)?;
        if key_count < 0
            || key_count as usize > (len - KEY_HEADER_SIZE) / KEY_ENTRY_SIZE
            || value_mem_size < 0
            || value_mem_size as usize % VALUE_RECORD_SIZE != 0
        {
            return Err(Error::IndexCorrupted(format!(
                "invalid key file header: {} [key_count={}, value_mem_size={}]",
                key_path.display(),
                key_count,
                value_mem_size
            )));
        }
        let value_len = ff.path_length(value_path).unwrap_or(0);
        if value_len < value_mem_size as usize {
            return Err(Error::IndexCorrupted(format!(
                "value file is too short: {} [len={}, expected={}]",
                value_path.display(),
                value_len,
                value_mem_size
            )));
        }
        let key_count = key_count as usize;
        key_mem.jump_to(key_entry_offset(key_count))?;
        let value_mem =
            MappedMemory::open_with_size(ff, value_path, page_size, value_mem_size as usize)?;
        Ok(FileBitmapIndex {
            key_mem,
            value_mem,
            key_count,
        })
    }

    /// Number of key entries, including empty ones below the highest key.
    #[inline]
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    /// Number of values over all keys.
    #[inline]
    pub fn value_count(&self) -> usize {
        self.value_mem.append_offset() / VALUE_RECORD_SIZE
    }

    /// Number of values of given key.
    #[inline]
    pub fn count_of(&mut self, key: i32) -> Result<usize> {
        if key < 0 || key as usize >= self.key_count {
            return Ok(0);
        }
        let (_, count) = self.read_key(key as usize)?;
        Ok(count as usize)
    }

    #[inline]
    pub fn close(self) {
        drop(self)
    }

    #[inline]
    fn read_key(&mut self, key: usize) -> Result<(i64, i64)> {
        let offset = key_entry_offset(key);
        let head = self.key_mem.get_i64(offset)?;
        let count = self.key_mem.get_i64(offset + 8)?;
        Ok((head, count))
    }

    #[inline]
    fn write_key(&mut self, key: usize, head: i64, count: i64) -> Result<()> {
        let offset = key_entry_offset(key);
        self.key_mem.put_i64_at(offset, head)?;
        self.key_mem.put_i64_at(offset + 8, count)
    }

    fn ensure_key(&mut self, key: usize) -> Result<()> {
        if key < self.key_count {
            return Ok(());
        }
        // Entries past key count may hold garbage of an unclean shutdown.
        for k in self.key_count..=key {
            self.write_key(k, 0, 0)?;
        }
        self.key_count = key + 1;
        self.key_mem.jump_to(key_entry_offset(self.key_count))?;
        self.key_mem.put_i64_at(KEY_COUNT_OFFSET, self.key_count as i64)
    }

    #[inline]
    fn update_value_mem_size(&mut self) -> Result<()> {
        let size = self.value_mem.append_offset() as i64;
        self.key_mem.put_i64_at(VALUE_MEM_SIZE_OFFSET, size)
    }

    /// Returns number of records whose value is less than `max_value`.
    fn records_below(&mut self, max_value: i64) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.value_count());
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.value_mem.get_i64(mid * VALUE_RECORD_SIZE)? < max_value {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

impl BitmapIndexWriter for FileBitmapIndex {
    type Cursor<'a> = FileIndexCursor<'a>;

    fn add(&mut self, key: i32, value: i64) -> Result<()> {
        if key < 0 {
            return Err(Error::InvalidArgument);
        }
        let append = self.value_mem.append_offset();
        if append >= VALUE_RECORD_SIZE
            && self.value_mem.get_i64(append - VALUE_RECORD_SIZE)? > value
        {
            return Err(Error::InvalidArgument);
        }
        let key = key as usize;
        self.ensure_key(key)?;
        let (head, count) = self.read_key(key)?;
        let prev = if count > 0 { head } else { -1 };
        let record = self.value_mem.put_i64(value)?;
        self.value_mem.put_i64(prev)?;
        self.write_key(key, record as i64, count + 1)?;
        self.update_value_mem_size()
    }

    #[inline]
    fn cursor(&mut self, key: i32) -> Result<FileIndexCursor<'_>> {
        let (head, remaining) = if key < 0 || key as usize >= self.key_count {
            (-1, 0)
        } else {
            self.read_key(key as usize)?
        };
        Ok(FileIndexCursor {
            value_mem: &mut self.value_mem,
            next: head,
            remaining,
        })
    }

    fn rollback_values(&mut self, max_value: i64) -> Result<()> {
        let keep = self.records_below(max_value)?;
        let new_size = keep * VALUE_RECORD_SIZE;
        if new_size >= self.value_mem.append_offset() {
            return Ok(());
        }
        for key in 0..self.key_count {
            let (mut head, mut count) = self.read_key(key)?;
            let before = count;
            while count > 0 && head >= new_size as i64 {
                head = self.value_mem.get_i64(head as usize + 8)?;
                count -= 1;
            }
            if count != before {
                self.write_key(key, head.max(0), count)?;
            }
        }
        self.value_mem.jump_to(new_size)?;
        self.update_value_mem_size()?;
        debug!("index rolled back [max_value={}, values={}]", max_value, keep);
        Ok(())
    }

    #[inline]
    fn sync(&self, async_: bool) {
        self.value_mem.sync_all(async_);
        self.key_mem.sync_all(async_);
    }
}

/// Walks records of one key backwards.
pub struct FileIndexCursor<'a> {
    value_mem: &'a mut MappedMemory,
    next: i64,
    remaining: i64,
}

impl FileIndexCursor<'_> {
    #[inline]
    fn read_record(&mut self, offset: usize) -> Result<(i64, i64)> {
        let value = self.value_mem.get_i64(offset)?;
        let prev = self.value_mem.get_i64(offset + 8)?;
        Ok((value, prev))
    }
}

impl Iterator for FileIndexCursor<'_> {
    type Item = Result<i64>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining <= 0 || self.next < 0 {
            return None;
        }
        match self.read_record(self.next as usize) {
            Ok((value, prev)) => {
                self.next = prev;
                self.remaining -= 1;
                Some(Ok(value))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// Read-only view of key and value files.
///
/// Both files are mapped with their length at open. Records appended by
/// a writer afterwards may lie beyond the mapped range, the cursor stops
/// there and reports it.
pub struct MappedIndexReader {
    keys: Mmap,
    // empty file cannot be mapped.
    values: Option<Mmap>,
}

impl MappedIndexReader {
    pub fn open(
        ff: &FilesFacadeRef,
        key_path: impl AsRef<Path>,
        value_path: impl AsRef<Path>,
    ) -> Result<Self> {
        let key_path = key_path.as_ref();
        let keys = match map_read_only(ff, key_path)? {
            Some(keys) if keys.len() >= KEY_HEADER_SIZE => keys,
            _ => {
                return Err(Error::IndexCorrupted(format!(
                    "key file is too short: {}",
                    key_path.display()
                )))
            }
        };
        if keys[SIGNATURE_OFFSET] != KEY_FILE_SIGNATURE {
            return Err(Error::IndexCorrupted(format!(
                "unknown key file format: {}",
                key_path.display()
            )));
        }
        let values = map_read_only(ff, value_path.as_ref())?;
        Ok(MappedIndexReader { keys, values })
    }

    /// Returns values of given key, most recently added first.
    pub fn cursor(&self, key: i32) -> Result<MappedIndexCursor<'_>> {
        let (_, key_count) = self.keys.deser_i64(KEY_COUNT_OFFSET)?;
        let mut cursor = MappedIndexCursor {
            values: self.values.as_deref().unwrap_or(&[]),
            next: -1,
            remaining: 0,
            unmapped: false,
        };
        if key < 0 || key as i64 >= key_count {
            return Ok(cursor);
        }
        let offset = key_entry_offset(key as usize);
        if offset + KEY_ENTRY_SIZE > self.keys.len() {
            cursor.unmapped = true;
            return Ok(cursor);
        }
        let (idx, head) = self.keys.deser_i64(offset)?;
        let (_, count) = self.keys.deser_i64(idx)?;
        cursor.next = head;
        cursor.remaining = count;
        Ok(cursor)
    }
}

/// Walks mapped records of one key backwards.
pub struct MappedIndexCursor<'a> {
    values: &'a [u8],
    next: i64,
    remaining: i64,
    unmapped: bool,
}

impl MappedIndexCursor<'_> {
    /// Whether the walk stopped at a record outside of the mapped range.
    #[inline]
    pub fn reached_unmapped(&self) -> bool {
        self.unmapped
    }
}

impl Iterator for MappedIndexCursor<'_> {
    type Item = Result<i64>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining <= 0 || self.next < 0 {
            return None;
        }
        let offset = self.next as usize;
        if offset + VALUE_RECORD_SIZE > self.values.len() {
            self.unmapped = true;
            self.remaining = 0;
            return None;
        }
        let res = self.values.deser_i64(offset).and_then(|(idx, value)| {
            let (_, prev) = self.values.deser_i64(idx)?;
            Ok((value, prev))
        });
        match res {
            Ok((value, prev)) => {
                self.next = prev;
                self.remaining -= 1;
                Some(Ok(value))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
