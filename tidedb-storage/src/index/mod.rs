//! Reverse bitmap index.
//!
//! The index maps an integer key to the list of values added under it.
//! Symbol maps use it to find candidate offsets of a hash bucket: key is
//! the bounded hash of a value, and values are offsets into the offset
//! file, so they always grow.
mod file;

pub use file::*;

use crate::error::Result;

pub trait BitmapIndexWriter {
    /// Iterator over values of one key.
    type Cursor<'a>: Iterator<Item = Result<i64>>
    where
        Self: 'a;

    /// Add value under given key.
    /// Values must be added in non-decreasing order across all keys.
    fn add(&mut self, key: i32, value: i64) -> Result<()>;

    /// Returns values of given key, most recently added first.
    /// Unknown key yields nothing.
    fn cursor(&mut self, key: i32) -> Result<Self::Cursor<'_>>;

    /// Remove all values greater than or equal to `max_value`.
    fn rollback_values(&mut self, max_value: i64) -> Result<()>;

    /// Flush index to disk.
    #[inline]
    fn sync(&self, _async: bool) {}
}
