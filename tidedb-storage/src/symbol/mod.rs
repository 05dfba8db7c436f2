//! Symbol map.
//!
//! Symbol map is a persistent dictionary which assigns dense integer ids
//! to distinct string values of a column. It is built from four files:
//!
//! - `<name>.c`: encoded values, appended one after another.
//! - `<name>.o`: 64-byte header, then one 8-byte offset into `.c` per id.
//! - `<name>.k` and `<name>.v`: bitmap index from bounded hash of value
//!   to offsets into `.o`.
//!
//! Header of `.o` holds symbol capacity (i32 at 0) and cache flag
//! (u8 at 4). Capacity decides the number of hash buckets and never
//! changes after creation.
mod reader;
mod writer;

pub use reader::*;
pub use writer::*;

use crate::conf::StorageConfig;
use crate::error::{Error, Result};
use crate::ff::FilesFacadeRef;
use crate::index::init_key_file;
use crate::vm::MappedMemory;
use log::{error, info};
use std::path::{Path, PathBuf};

/// Size of offset file header.
pub const HEADER_SIZE: usize = 64;
/// Id returned for null value.
pub const VALUE_IS_NULL: i32 = i32::MIN;

pub(crate) const CAPACITY_OFFSET: usize = 0;
pub(crate) const CACHE_FLAG_OFFSET: usize = 4;

#[inline]
pub fn offset_file_name(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.o", name))
}

#[inline]
pub fn char_file_name(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.c", name))
}

#[inline]
pub fn key_file_name(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.k", name))
}

#[inline]
pub fn value_file_name(dir: impl AsRef<Path>, name: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.v", name))
}

/// Offset of the entry of given id in offset file.
#[inline]
pub fn key_to_offset(key: i32) -> i64 {
    HEADER_SIZE as i64 + key as i64 * 8
}

/// Id of the entry at given offset in offset file.
#[inline]
pub fn offset_to_key(offset: i64) -> i32 {
    ((offset - HEADER_SIZE as i64) / 8) as i32
}

/// Largest bucket index of a symbol map with given capacity.
/// Bucket count is capacity divided by `bucket_divisor`, rounded up to
/// power of two, and at least one.
#[inline]
pub fn max_hash(capacity: i32, bucket_divisor: u32) -> i32 {
    let buckets = (capacity.max(0) as u32 / bucket_divisor.max(1))
        .max(1)
        .next_power_of_two();
    (buckets - 1) as i32
}

/// Hash of UTF-16 units of value, multiplier 31, masked by `max_hash`.
/// Compatible with hash codes of existing column files.
#[inline]
pub fn bounded_hash(value: &str, max_hash: i32) -> i32 {
    let mut h = 0i32;
    for unit in value.encode_utf16() {
        h = h.wrapping_mul(31).wrapping_add(unit as i32);
    }
    h & max_hash
}

/// Id to assign to the next symbol, given current symbol count.
#[inline]
pub fn next_symbol_id(count: i64) -> Result<i32> {
    if count < 0 || count >= i32::MAX as i64 {
        return Err(Error::SymbolCountOverflow);
    }
    Ok(count as i32)
}

/// Returns length of offset file, which must exist and hold the header.
pub(crate) fn check_offset_file(ff: &FilesFacadeRef, path: &Path) -> Result<usize> {
    if !ff.exists(path) {
        error!("SymbolMap does not exist: {}", path.display());
        return Err(Error::SymbolMapNotFound(path.display().to_string()));
    }
    let len = ff.path_length(path).map_err(|errno| Error::OpenFileError {
        path: path.display().to_string(),
        errno: errno.0,
    })?;
    if len < HEADER_SIZE {
        error!("SymbolMap is too short: {} [len={}]", path.display(), len);
        return Err(Error::SymbolMapTooShort {
            path: path.display().to_string(),
            len,
        });
    }
    Ok(len)
}

/// Create files of an empty symbol map.
/// Existing files of the same name are reset.
pub fn create_symbol_map_files(
    ff: FilesFacadeRef,
    conf: &StorageConfig,
    dir: impl AsRef<Path>,
    name: &str,
    capacity: i32,
    cache_flag: bool,
) -> Result<()> {
    if capacity <= 0 {
        return Err(Error::InvalidArgument);
    }
    let dir = dir.as_ref();
    {
        let mut mem = MappedMemory::open(
            ff.clone(),
            offset_file_name(dir, name),
            conf.map_page_size_bytes(),
        )?;
        mem.truncate()?;
        mem.put_i32_at(CAPACITY_OFFSET, capacity)?;
        mem.put_bool_at(CACHE_FLAG_OFFSET, cache_flag)?;
        mem.jump_to(HEADER_SIZE)?;
    }
    let char_path = char_file_name(dir, name);
    ff.touch(&char_path).map_err(|errno| Error::OpenFileError {
        path: char_path.display().to_string(),
        errno: errno.0,
    })?;
    init_key_file(ff.clone(), key_file_name(dir, name), conf.index_page_size_bytes())?;
    let value_path = value_file_name(dir, name);
    ff.touch(&value_path).map_err(|errno| Error::OpenFileError {
        path: value_path.display().to_string(),
        errno: errno.0,
    })?;
    info!(
        "created symbol map {} [capacity={}, cached={}]",
        name, capacity, cache_flag
    );
    Ok(())
}
