use crate::conf::StorageConfig;
use crate::error::{Error, Result};
use crate::ff::FilesFacadeRef;
use crate::index::{BitmapIndexWriter, FileBitmapIndex};
use crate::symbol::{
    bounded_hash, char_file_name, check_offset_file, key_file_name, key_to_offset, max_hash,
    next_symbol_id, offset_file_name, offset_to_key, value_file_name, CACHE_FLAG_OFFSET,
    CAPACITY_OFFSET, VALUE_IS_NULL,
};
use crate::vm::{str_storage_len_of, MappedMemory};
use fnv::FnvHashMap;
use log::info;
use std::path::Path;

/// Write side of a symbol map.
///
/// Only one writer may be attached to a symbol map at a time.
/// Writer is not thread-safe.
pub struct SymbolMapWriter<I: BitmapIndexWriter = FileBitmapIndex> {
    // fields are dropped in declaration order.
    index: I,
    char_mem: MappedMemory,
    offset_mem: MappedMemory,
    cache: Option<FnvHashMap<String, i32>>,
    max_hash: i32,
    capacity: i32,
    name: String,
}

impl SymbolMapWriter<FileBitmapIndex> {
    /// Attach to symbol map files in given directory.
    ///
    /// `symbol_count` is the number of symbols committed by table.
    /// Anything written above it, by a writer that was not closed or by
    /// an aborted transaction, is discarded.
    pub fn open(
        ff: FilesFacadeRef,
        conf: &StorageConfig,
        dir: impl AsRef<Path>,
        name: &str,
        symbol_count: i32,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        check_offset_file(&ff, &offset_file_name(dir, name))?;
        let index = FileBitmapIndex::open(
            ff.clone(),
            key_file_name(dir, name),
            value_file_name(dir, name),
            conf.index_page_size_bytes(),
        )?;
        Self::with_index(ff, conf, dir, name, symbol_count, index)
    }
}

impl<I: BitmapIndexWriter> SymbolMapWriter<I> {
    /// Attach to symbol map files with given index.
    pub fn with_index(
        ff: FilesFacadeRef,
        conf: &StorageConfig,
        dir: impl AsRef<Path>,
        name: &str,
        symbol_count: i32,
        mut index: I,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let offset_path = offset_file_name(dir, name);
        let len = check_offset_file(&ff, &offset_path)?;
        let page_size = conf.map_page_size_bytes();

        let mut offset_mem =
            MappedMemory::open_with_max_pages(ff.clone(), &offset_path, page_size, conf.max_pages)?;
        let capacity = offset_mem.get_i32(CAPACITY_OFFSET)?;
        let cached = offset_mem.get_bool(CACHE_FLAG_OFFSET)?;
        if capacity <= 0 {
            return Err(Error::InvalidFormat);
        }
        if symbol_count < 0 {
            return Err(Error::InvalidArgument);
        }
        let count = symbol_count;
        if key_to_offset(count) as usize > len {
            return Err(Error::SymbolMapTooShort {
                path: offset_path.display().to_string(),
                len,
            });
        }
        offset_mem.jump_to(key_to_offset(count) as usize)?;
        // index may hold symbols above committed count.
        index.rollback_values(key_to_offset(count))?;

        let mut char_mem = MappedMemory::open_with_max_pages(
            ff,
            char_file_name(dir, name),
            page_size,
            conf.max_pages,
        )?;
        let char_end = value_end(&mut offset_mem, &mut char_mem, count)?;
        char_mem.jump_to(char_end)?;

        let cache = if cached {
            Some(FnvHashMap::default())
        } else {
            None
        };
        let max_hash = max_hash(capacity, conf.bucket_divisor);
        info!(
            "open {} [fd={}, capacity={}, count={}, cached={}]",
            name,
            offset_mem.fd(),
            capacity,
            count,
            cached
        );
        Ok(SymbolMapWriter {
            index,
            char_mem,
            offset_mem,
            cache,
            max_hash,
            capacity,
            name: name.to_string(),
        })
    }

    /// Returns id of value, adding it to the map if absent.
    /// Null value always maps to [`VALUE_IS_NULL`].
    pub fn put(&mut self, value: Option<&str>) -> Result<i32> {
        let value = match value {
            None => return Ok(VALUE_IS_NULL),
            Some(v) => v,
        };
        if let Some(id) = self.cache.as_ref().and_then(|c| c.get(value)) {
            return Ok(*id);
        }
        let id = self.lookup_and_put(value)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.insert(value.to_string(), id);
        }
        Ok(id)
    }

    fn lookup_and_put(&mut self, value: &str) -> Result<i32> {
        let hash = bounded_hash(value, self.max_hash);
        for offset in self.index.cursor(hash)? {
            let offset = offset?;
            let char_offset = self.offset_mem.get_i64(offset as usize)?;
            if self.char_mem.str_equals(char_offset as usize, value)? {
                return Ok(offset_to_key(offset));
            }
        }
        self.put0(value, hash)
    }

    fn put0(&mut self, value: &str, hash: i32) -> Result<i32> {
        let id = next_symbol_id(self.symbol_count() as i64)?;
        let char_offset = self.char_mem.put_str(Some(value))?;
        let offset = self.offset_mem.put_i64(char_offset as i64)?;
        self.index.add(hash, offset as i64)?;
        Ok(id)
    }

    /// Discard all symbols with id greater than or equal to `symbol_count`.
    pub fn rollback(&mut self, symbol_count: i32) -> Result<()> {
        if symbol_count < 0 || symbol_count > self.symbol_count() {
            return Err(Error::InvalidArgument);
        }
        let offset = key_to_offset(symbol_count);
        self.index.rollback_values(offset)?;
        self.offset_mem.jump_to(offset as usize)?;
        let char_end = value_end(&mut self.offset_mem, &mut self.char_mem, symbol_count)?;
        self.char_mem.jump_to(char_end)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
        info!("rolled back {} [count={}]", self.name, symbol_count);
        Ok(())
    }

    #[inline]
    pub fn symbol_count(&self) -> i32 {
        offset_to_key(self.offset_mem.append_offset() as i64)
    }

    /// Returns value of given id. Unknown id and null id resolve to `None`.
    pub fn value_of(&mut self, id: i32) -> Result<Option<String>> {
        if id < 0 || id >= self.symbol_count() {
            return Ok(None);
        }
        let char_offset = self.offset_mem.get_i64(key_to_offset(id) as usize)?;
        self.char_mem.get_str(char_offset as usize)
    }

    #[inline]
    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    #[inline]
    pub fn capacity(&self) -> i32 {
        self.capacity
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn index(&self) -> &I {
        &self.index
    }

    /// Flush values, offsets and index to disk.
    #[inline]
    pub fn sync(&self, async_: bool) {
        self.char_mem.sync_all(async_);
        self.offset_mem.sync_all(async_);
        self.index.sync(async_);
    }

    /// Release all resources. Files are trimmed to their append offsets.
    #[inline]
    pub fn close(self) {
        drop(self)
    }
}

impl<I: BitmapIndexWriter> Drop for SymbolMapWriter<I> {
    #[inline]
    fn drop(&mut self) {
        info!("closed {} [count={}]", self.name, self.symbol_count());
    }
}

/// Returns end of value of the last symbol below `count`, 0 if none.
#[inline]
fn value_end(offset_mem: &mut MappedMemory, char_mem: &mut MappedMemory, count: i32) -> Result<usize> {
    if count == 0 {
        return Ok(0);
    }
    let last = offset_mem.get_i64(key_to_offset(count - 1) as usize)?;
    let file_len = char_mem.file_length()?;
    // the last value must be fully inside the value file.
    if last < 0 || last as usize > file_len.saturating_sub(str_storage_len_of(0)) {
        return Err(Error::InvalidFormat);
    }
    let len = char_mem.get_str_len(last as usize)?;
    let end = last as usize + str_storage_len_of(len);
    if end > file_len {
        return Err(Error::InvalidFormat);
    }
    Ok(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ff::OsFilesFacade;
    use crate::symbol::create_symbol_map_files;
    use byte_unit::Byte;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn small_conf() -> StorageConfig {
        StorageConfig::default()
            .map_page_size(Byte::from_u64(16))
            .index_page_size(Byte::from_u64(32))
    }

    fn create(dir: &Path, conf: &StorageConfig, capacity: i32, cached: bool) {
        create_symbol_map_files(OsFilesFacade::shared(), conf, dir, "sym", capacity, cached)
            .unwrap();
    }

    fn open(dir: &Path, conf: &StorageConfig, count: i32) -> SymbolMapWriter {
        SymbolMapWriter::open(OsFilesFacade::shared(), conf, dir, "sym", count).unwrap()
    }

    /// Index keeping all values in memory, used to check writer against
    /// the trait only.
    #[derive(Default)]
    struct VecIndex {
        entries: Vec<(i32, i64)>,
    }

    impl BitmapIndexWriter for VecIndex {
        type Cursor<'a> = std::vec::IntoIter<Result<i64>>;

        fn add(&mut self, key: i32, value: i64) -> Result<()> {
            self.entries.push((key, value));
            Ok(())
        }

        fn cursor(&mut self, key: i32) -> Result<Self::Cursor<'_>> {
            let values: Vec<_> = self
                .entries
                .iter()
                .rev()
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| Ok(*v))
                .collect();
            Ok(values.into_iter())
        }

        fn rollback_values(&mut self, max_value: i64) -> Result<()> {
            self.entries.retain(|(_, v)| *v < max_value);
            Ok(())
        }
    }

    #[test]
    fn test_put_dedup_and_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 4, true);
        let mut w = open(dir.path(), &conf, 0);
        assert_eq!(w.put(Some("ab")).unwrap(), 0);
        assert_eq!(w.put(Some("cd")).unwrap(), 1);
        assert_eq!(w.put(Some("ab")).unwrap(), 0);
        assert_eq!(w.symbol_count(), 2);
        w.rollback(1).unwrap();
        assert_eq!(w.symbol_count(), 1);
        assert_eq!(w.put(Some("xy")).unwrap(), 1);
        assert_eq!(w.put(Some("cd")).unwrap(), 2);
        assert_eq!(w.value_of(0).unwrap().as_deref(), Some("ab"));
        assert_eq!(w.value_of(1).unwrap().as_deref(), Some("xy"));
        assert_eq!(w.value_of(3).unwrap(), None);
        assert_eq!(w.value_of(VALUE_IS_NULL).unwrap(), None);
    }

    #[test]
    fn test_null_value() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 16, false);
        let mut w = open(dir.path(), &conf, 0);
        assert_eq!(w.put(None).unwrap(), VALUE_IS_NULL);
        assert_eq!(w.symbol_count(), 0);
        // empty string is a value, not null.
        assert_eq!(w.put(Some("")).unwrap(), 0);
        assert_eq!(w.put(None).unwrap(), VALUE_IS_NULL);
        assert_eq!(w.value_of(0).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_rollback_invalid_count() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 16, true);
        let mut w = open(dir.path(), &conf, 0);
        w.put(Some("a")).unwrap();
        assert!(matches!(w.rollback(-1), Err(Error::InvalidArgument)));
        assert!(matches!(w.rollback(2), Err(Error::InvalidArgument)));
        w.rollback(1).unwrap();
        w.rollback(0).unwrap();
        assert_eq!(w.symbol_count(), 0);
        assert_eq!(w.put(Some("b")).unwrap(), 0);
    }

    #[test]
    fn test_many_collisions_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        // capacity 2 means one bucket, every value collides.
        create(dir.path(), &conf, 2, false);
        let mut w = open(dir.path(), &conf, 0);
        assert!(!w.is_cached());
        for i in 0..200 {
            assert_eq!(w.put(Some(format!("s{}", i).as_str())).unwrap(), i);
        }
        for i in (0..200).rev() {
            assert_eq!(w.put(Some(format!("s{}", i).as_str())).unwrap(), i);
        }
        assert_eq!(w.symbol_count(), 200);
    }

    #[test]
    fn test_random_values_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 64, true);
        let mut rng = StdRng::seed_from_u64(42);
        let values: Vec<String> = (0..300)
            .map(|_| {
                let len = rng.random_range(0..40);
                (0..len)
                    .map(|_| char::from(rng.random_range(b'a'..=b'z')))
                    .collect()
            })
            .collect();
        let mut ids = Vec::with_capacity(values.len());
        let count = {
            let mut w = open(dir.path(), &conf, 0);
            for v in &values {
                ids.push(w.put(Some(v.as_str())).unwrap());
            }
            w.sync(false);
            w.symbol_count()
        };
        let mut w = open(dir.path(), &conf, count);
        for (v, id) in values.iter().zip(&ids) {
            assert_eq!(w.put(Some(v.as_str())).unwrap(), *id);
            assert_eq!(w.value_of(*id).unwrap().as_deref(), Some(v.as_str()));
        }
        let distinct: std::collections::HashSet<_> = values.iter().collect();
        assert_eq!(w.symbol_count() as usize, distinct.len());
    }

    #[test]
    fn test_writer_with_custom_index() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 8, false);
        let mut w = SymbolMapWriter::with_index(
            OsFilesFacade::shared(),
            &conf,
            dir.path(),
            "sym",
            0,
            VecIndex::default(),
        )
        .unwrap();
        assert_eq!(w.put(Some("x")).unwrap(), 0);
        assert_eq!(w.put(Some("y")).unwrap(), 1);
        assert_eq!(w.put(Some("x")).unwrap(), 0);
        assert_eq!(
            w.index().entries,
            vec![(bounded_hash("x", 3), 64), (bounded_hash("y", 3), 72)]
        );
        w.rollback(1).unwrap();
        assert_eq!(w.index().entries.len(), 1);
        assert_eq!(w.put(Some("y")).unwrap(), 1);
    }

    #[test]
    fn test_open_missing_and_short() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        let res = SymbolMapWriter::open(OsFilesFacade::shared(), &conf, dir.path(), "none", 0);
        assert!(matches!(res, Err(Error::SymbolMapNotFound(_))));

        std::fs::write(offset_file_name(dir.path(), "short"), [0u8; 10]).unwrap();
        let res = SymbolMapWriter::open(OsFilesFacade::shared(), &conf, dir.path(), "short", 0);
        assert!(matches!(res, Err(Error::SymbolMapTooShort { len: 10, .. })));
        // failed open must not touch the file.
        assert_eq!(
            std::fs::metadata(offset_file_name(dir.path(), "short")).unwrap().len(),
            10
        );
    }

    #[test]
    fn test_open_with_count_beyond_file() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 8, true);
        {
            let mut w = open(dir.path(), &conf, 0);
            w.put(Some("a")).unwrap();
            w.put(Some("b")).unwrap();
        }
        let res = SymbolMapWriter::open(OsFilesFacade::shared(), &conf, dir.path(), "sym", 3);
        assert!(matches!(res, Err(Error::SymbolMapTooShort { len: 80, .. })));
        let res = SymbolMapWriter::open(OsFilesFacade::shared(), &conf, dir.path(), "sym", -1);
        assert!(matches!(res, Err(Error::InvalidArgument)));
        // resuming at lower count drops uncommitted symbols.
        let mut w = open(dir.path(), &conf, 1);
        assert_eq!(w.symbol_count(), 1);
        assert_eq!(w.put(Some("c")).unwrap(), 1);
        assert_eq!(w.value_of(1).unwrap().as_deref(), Some("c"));
        assert_eq!(w.put(Some("b")).unwrap(), 2);
        assert_eq!(w.put(Some("a")).unwrap(), 0);
    }

    #[test]
    fn test_open_with_corrupt_last_offset() {
        let dir = tempfile::tempdir().unwrap();
        let conf = small_conf();
        create(dir.path(), &conf, 8, true);
        {
            let mut w = open(dir.path(), &conf, 0);
            w.put(Some("a")).unwrap();
            w.put(Some("b")).unwrap();
        }
        let path = offset_file_name(dir.path(), "sym");
        let mut o = std::fs::read(&path).unwrap();
        let last = key_to_offset(1) as usize;
        o[last..last + 8].copy_from_slice(&(i64::MAX / 2).to_le_bytes());
        std::fs::write(&path, &o).unwrap();
        let res = SymbolMapWriter::open(OsFilesFacade::shared(), &conf, dir.path(), "sym", 2);
        assert!(matches!(res, Err(Error::InvalidFormat)));
        // value file is not extended towards the bogus offset.
        assert!(std::fs::metadata(char_file_name(dir.path(), "sym")).unwrap().len() < 4096);
        // committed count below the damaged entry still opens.
        let mut w = open(dir.path(), &conf, 1);
        assert_eq!(w.value_of(0).unwrap().as_deref(), Some("a"));
        assert_eq!(w.put(Some("c")).unwrap(), 1);
    }
}
