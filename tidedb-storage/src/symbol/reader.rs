use crate::conf::StorageConfig;
use crate::error::{Error, Result};
use crate::ff::FilesFacadeRef;
use crate::index::MappedIndexReader;
use crate::serde::Serde;
use crate::symbol::{
    bounded_hash, char_file_name, check_offset_file, key_file_name, key_to_offset, max_hash,
    offset_file_name, offset_to_key, value_file_name, CACHE_FLAG_OFFSET, CAPACITY_OFFSET,
    VALUE_IS_NULL,
};
use crate::vm::map_read_only;
use log::info;
use memmap2::Mmap;
use std::path::Path;

/// Read side of a symbol map.
///
/// Reader maps offset, value and index files read-only and only sees
/// symbols below the count given at open, which is usually the count
/// committed by table. Symbols added by writer afterwards are invisible.
pub struct SymbolMapReader {
    offsets: Mmap,
    // empty file cannot be mapped.
    chars: Option<Mmap>,
    index: MappedIndexReader,
    symbol_count: i32,
    capacity: i32,
    cached: bool,
    max_hash: i32,
}

impl SymbolMapReader {
    pub fn open(
        ff: FilesFacadeRef,
        conf: &StorageConfig,
        dir: impl AsRef<Path>,
        name: &str,
        symbol_count: i32,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let offset_path = offset_file_name(dir, name);
        let len = check_offset_file(&ff, &offset_path)?;
        if symbol_count < 0 {
            return Err(Error::InvalidArgument);
        }
        if key_to_offset(symbol_count) as usize > len {
            return Err(Error::SymbolMapTooShort {
                path: offset_path.display().to_string(),
                len,
            });
        }
        let offsets = map_read_only(&ff, &offset_path)?.ok_or(Error::InvalidFormat)?;
        let (_, capacity) = offsets.deser_i32(CAPACITY_OFFSET)?;
        let (_, cached) = offsets.deser_bool(CACHE_FLAG_OFFSET)?;
        if capacity <= 0 {
            return Err(Error::InvalidFormat);
        }
        let chars = map_read_only(&ff, &char_file_name(dir, name))?;
        let index = MappedIndexReader::open(
            &ff,
            key_file_name(dir, name),
            value_file_name(dir, name),
        )?;
        info!(
            "open reader {} [capacity={}, count={}]",
            name, capacity, symbol_count
        );
        Ok(SymbolMapReader {
            offsets,
            chars,
            index,
            symbol_count,
            capacity,
            cached,
            max_hash: max_hash(capacity, conf.bucket_divisor),
        })
    }

    #[inline]
    pub fn symbol_count(&self) -> i32 {
        self.symbol_count
    }

    #[inline]
    pub fn capacity(&self) -> i32 {
        self.capacity
    }

    #[inline]
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Returns value of given id. Ids outside of visible range resolve
    /// to `None`, as does null id.
    #[inline]
    pub fn value_of(&self, id: i32) -> Result<Option<String>> {
        if id < 0 || id >= self.symbol_count {
            return Ok(None);
        }
        let offset = self.char_offset(key_to_offset(id))?;
        let (_, value) = self.chars()?.deser_utf16_str(offset)?;
        Ok(value)
    }

    /// Returns id of given value, or `None` if value is not visible.
    /// Null value is [`VALUE_IS_NULL`].
    pub fn key_of(&self, value: Option<&str>) -> Result<Option<i32>> {
        let value = match value {
            None => return Ok(Some(VALUE_IS_NULL)),
            Some(v) => v,
        };
        let limit = key_to_offset(self.symbol_count);
        let mut cursor = self.index.cursor(bounded_hash(value, self.max_hash))?;
        for offset in cursor.by_ref() {
            let offset = offset?;
            if offset < limit && self.equals_at(offset, value)? {
                return Ok(Some(offset_to_key(offset)));
            }
        }
        if cursor.reached_unmapped() {
            // bucket was extended after open, its older records are
            // out of reach.
            return self.scan(value);
        }
        Ok(None)
    }

    fn scan(&self, value: &str) -> Result<Option<i32>> {
        for id in 0..self.symbol_count {
            if self.equals_at(key_to_offset(id), value)? {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }

    #[inline]
    fn chars(&self) -> Result<&[u8]> {
        self.chars.as_deref().ok_or(Error::InvalidFormat)
    }

    #[inline]
    fn char_offset(&self, entry: i64) -> Result<usize> {
        let (_, offset) = self.offsets.deser_i64(entry as usize)?;
        if offset < 0 {
            return Err(Error::InvalidFormat);
        }
        Ok(offset as usize)
    }

    /// Compares value of the symbol at given offset entry with `value`
    /// without decoding it into a string.
    fn equals_at(&self, entry: i64, value: &str) -> Result<bool> {
        let chars = self.chars()?;
        let (idx, len) = chars.deser_i32(self.char_offset(entry)?)?;
        if len < 0 {
            return Ok(false);
        }
        let (_, units) = chars.deser_byte_slice(idx, len as usize * 2)?;
        let mut expected = value.encode_utf16();
        for unit in units.chunks_exact(2) {
            if expected.next() != Some(u16::from_le_bytes([unit[0], unit[1]])) {
                return Ok(false);
            }
        }
        Ok(expected.next().is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ff::tests::FaultyFilesFacade;
    use crate::ff::OsFilesFacade;
    use crate::symbol::{create_symbol_map_files, SymbolMapWriter};
    use byte_unit::Byte;
    use std::sync::Arc;

    fn conf() -> StorageConfig {
        StorageConfig::default()
            .map_page_size(Byte::from_u64(64))
            .index_page_size(Byte::from_u64(64))
    }

    #[test]
    fn test_key_of_through_index() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf();
        let ff = OsFilesFacade::shared();
        // capacity 4 means two buckets, long chains.
        create_symbol_map_files(ff.clone(), &conf, dir.path(), "sym", 4, false).unwrap();
        let mut w = SymbolMapWriter::open(ff.clone(), &conf, dir.path(), "sym", 0).unwrap();
        for i in 0..100 {
            w.put(Some(format!("s{}", i).as_str())).unwrap();
        }
        w.sync(false);
        let r = SymbolMapReader::open(ff, &conf, dir.path(), "sym", 60).unwrap();
        for i in 0..60 {
            assert_eq!(r.key_of(Some(format!("s{}", i).as_str())).unwrap(), Some(i));
        }
        for i in 60..100 {
            assert_eq!(r.key_of(Some(format!("s{}", i).as_str())).unwrap(), None);
        }
        assert_eq!(r.key_of(Some("s1x")).unwrap(), None);
        assert_eq!(r.key_of(Some("")).unwrap(), None);
    }

    #[test]
    fn test_key_of_after_writer_grows_bucket() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf();
        let ff = OsFilesFacade::shared();
        create_symbol_map_files(ff.clone(), &conf, dir.path(), "sym", 2, true).unwrap();
        let mut w = SymbolMapWriter::open(ff.clone(), &conf, dir.path(), "sym", 0).unwrap();
        for i in 0..10 {
            w.put(Some(format!("a{}", i).as_str())).unwrap();
        }
        w.sync(false);
        let r = SymbolMapReader::open(ff, &conf, dir.path(), "sym", 10).unwrap();
        // one bucket, new records land beyond mapped value file.
        for i in 10..200 {
            w.put(Some(format!("a{}", i).as_str())).unwrap();
        }
        w.sync(false);
        for i in 0..10 {
            assert_eq!(r.key_of(Some(format!("a{}", i).as_str())).unwrap(), Some(i));
        }
        assert_eq!(r.key_of(Some("a150")).unwrap(), None);
    }

    #[test]
    fn test_open_errors_carry_errno() {
        let dir = tempfile::tempdir().unwrap();
        let conf = conf();
        create_symbol_map_files(OsFilesFacade::shared(), &conf, dir.path(), "sym", 8, false)
            .unwrap();
        let ff = Arc::new(FaultyFilesFacade {
            fail_open_ro: true,
            ..FaultyFilesFacade::new(usize::MAX, usize::MAX)
        });
        let err = SymbolMapReader::open(ff, &conf, dir.path(), "sym", 0)
            .err()
            .unwrap();
        assert!(matches!(err, Error::OpenFileError { .. }));
        assert_eq!(err.errno(), Some(libc::EACCES));

        let ff = OsFilesFacade::shared();
        std::fs::remove_file(value_file_name(dir.path(), "sym")).unwrap();
        let err = SymbolMapReader::open(ff.clone(), &conf, dir.path(), "sym", 0)
            .err()
            .unwrap();
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert!(matches!(
            SymbolMapReader::open(ff, &conf, dir.path(), "sym", -1),
            Err(Error::InvalidArgument)
        ));
    }
}
