use crate::error::{Error, Result};
use crate::vm::Long256;
use std::mem;

/// Length prefix of null string and null binary.
pub const NULL_LEN: i32 = -1;

/// Byte-level codec over flat buffers.
///
/// All values are little-endian with fixed width. The same layout is
/// produced by the paged writers in [`crate::vm`], so data written
/// through virtual memory can be decoded from a plain mapping.
pub trait Serde {
    /// Serialize a u64 value to a byte slice.
    fn ser_u64(&mut self, idx: usize, val: u64) -> usize;

    /// Serialize a i64 value to a byte slice.
    fn ser_i64(&mut self, idx: usize, val: i64) -> usize;

    /// Serialize a f64 value to a byte slice.
    fn ser_f64(&mut self, idx: usize, val: f64) -> usize;

    /// Serialize a i32 value to a byte slice.
    fn ser_i32(&mut self, idx: usize, val: i32) -> usize;

    /// Serialize a f32 value to a byte slice.
    fn ser_f32(&mut self, idx: usize, val: f32) -> usize;

    /// Serialize a u16 value to a byte slice.
    fn ser_u16(&mut self, idx: usize, val: u16) -> usize;

    /// Serialize a i16 value to a byte slice.
    fn ser_i16(&mut self, idx: usize, val: i16) -> usize;

    /// Serialize a u8 value to a byte slice.
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize;

    /// Serialize bool value.
    #[inline]
    fn ser_bool(&mut self, idx: usize, val: bool) -> usize {
        self.ser_u8(idx, if val { 1 } else { 0 })
    }

    /// Serialize byte slice.
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize;

    /// Serialize 256-bit value as four consecutive words, lowest first.
    #[inline]
    fn ser_long256(&mut self, idx: usize, val: &Long256) -> usize {
        let idx = self.ser_i64(idx, val.l0);
        let idx = self.ser_i64(idx, val.l1);
        let idx = self.ser_i64(idx, val.l2);
        self.ser_i64(idx, val.l3)
    }

    /// Deserialize a u64 value from a byte slice.
    fn deser_u64(&self, idx: usize) -> Result<(usize, u64)>;

    /// Deserialize a i64 value from a byte slice.
    fn deser_i64(&self, idx: usize) -> Result<(usize, i64)>;

    /// Deserialize a f64 value from a byte slice.
    fn deser_f64(&self, idx: usize) -> Result<(usize, f64)>;

    /// Deserialize a i32 value from a byte slice.
    fn deser_i32(&self, idx: usize) -> Result<(usize, i32)>;

    /// Deserialize a f32 value from a byte slice.
    fn deser_f32(&self, idx: usize) -> Result<(usize, f32)>;

    /// Deserialize a u16 value from a byte slice.
    fn deser_u16(&self, idx: usize) -> Result<(usize, u16)>;

    /// Deserialize a i16 value from a byte slice.
    fn deser_i16(&self, idx: usize) -> Result<(usize, i16)>;

    /// Deserialize a u8 value from a byte slice.
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)>;

    /// Deserialize bool value.
    #[inline]
    fn deser_bool(&self, idx: usize) -> Result<(usize, bool)> {
        self.deser_u8(idx).map(|(i, r)| (i, r != 0))
    }

    /// Deserialize byte slice.
    fn deser_byte_slice(&self, idx: usize, len: usize) -> Result<(usize, &[u8])>;

    /// Deserialize 256-bit value.
    #[inline]
    fn deser_long256(&self, idx: usize) -> Result<(usize, Long256)> {
        let (idx, l0) = self.deser_i64(idx)?;
        let (idx, l1) = self.deser_i64(idx)?;
        let (idx, l2) = self.deser_i64(idx)?;
        let (idx, l3) = self.deser_i64(idx)?;
        Ok((idx, Long256 { l0, l1, l2, l3 }))
    }

    /// Deserialize length-prefixed UTF-16 string. Returns None for null.
    #[inline]
    fn deser_utf16_str(&self, idx: usize) -> Result<(usize, Option<String>)> {
        let (idx, len) = self.deser_i32(idx)?;
        if len < 0 {
            return Ok((idx, None));
        }
        let (idx, bytes) = self.deser_byte_slice(idx, len as usize * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok((idx, Some(String::from_utf16(&units)?)))
    }

    /// Deserialize length-prefixed binary. Returns None for null.
    #[inline]
    fn deser_bin(&self, idx: usize) -> Result<(usize, Option<&[u8]>)> {
        let (idx, len) = self.deser_i64(idx)?;
        if len < 0 {
            return Ok((idx, None));
        }
        let (idx, bytes) = self.deser_byte_slice(idx, len as usize)?;
        Ok((idx, Some(bytes)))
    }
}

/// Returns the slice range or format error, so corrupted
/// offsets never panic on read path.
#[inline]
fn checked_range(this: &[u8], idx: usize, len: usize) -> Result<&[u8]> {
    idx.checked_add(len)
        .and_then(|end| this.get(idx..end))
        .ok_or(Error::InvalidFormat)
}

impl Serde for [u8] {
    #[inline]
    fn ser_u64(&mut self, idx: usize, val: u64) -> usize {
        debug_assert!(idx + mem::size_of::<u64>() <= self.len());
        self[idx..idx + mem::size_of::<u64>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<u64>()
    }

    #[inline]
    fn ser_i64(&mut self, idx: usize, val: i64) -> usize {
        debug_assert!(idx + mem::size_of::<i64>() <= self.len());
        self[idx..idx + mem::size_of::<i64>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<i64>()
    }

    #[inline]
    fn ser_f64(&mut self, idx: usize, val: f64) -> usize {
        debug_assert!(idx + mem::size_of::<f64>() <= self.len());
        self[idx..idx + mem::size_of::<f64>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<f64>()
    }

    #[inline]
    fn ser_i32(&mut self, idx: usize, val: i32) -> usize {
        debug_assert!(idx + mem::size_of::<i32>() <= self.len());
        self[idx..idx + mem::size_of::<i32>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<i32>()
    }

    #[inline]
    fn ser_f32(&mut self, idx: usize, val: f32) -> usize {
        debug_assert!(idx + mem::size_of::<f32>() <= self.len());
        self[idx..idx + mem::size_of::<f32>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<f32>()
    }

    #[inline]
    fn ser_u16(&mut self, idx: usize, val: u16) -> usize {
        debug_assert!(idx + mem::size_of::<u16>() <= self.len());
        self[idx..idx + mem::size_of::<u16>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<u16>()
    }

    #[inline]
    fn ser_i16(&mut self, idx: usize, val: i16) -> usize {
        debug_assert!(idx + mem::size_of::<i16>() <= self.len());
        self[idx..idx + mem::size_of::<i16>()].copy_from_slice(&val.to_le_bytes());
        idx + mem::size_of::<i16>()
    }

    #[inline]
    fn ser_u8(&mut self, idx: usize, val: u8) -> usize {
        debug_assert!(idx + mem::size_of::<u8>() <= self.len());
        self[idx] = val;
        idx + mem::size_of::<u8>()
    }

    #[inline]
    fn ser_byte_slice(&mut self, idx: usize, val: &[u8]) -> usize {
        debug_assert!(idx + val.len() <= self.len());
        self[idx..idx + val.len()].copy_from_slice(val);
        idx + val.len()
    }

    #[inline]
    fn deser_u64(&self, idx: usize) -> Result<(usize, u64)> {
        let val = u64::from_le_bytes(checked_range(self, idx, mem::size_of::<u64>())?.try_into()?);
        Ok((idx + mem::size_of::<u64>(), val))
    }

    #[inline]
    fn deser_i64(&self, idx: usize) -> Result<(usize, i64)> {
        let val = i64::from_le_bytes(checked_range(self, idx, mem::size_of::<i64>())?.try_into()?);
        Ok((idx + mem::size_of::<i64>(), val))
    }

    #[inline]
    fn deser_f64(&self, idx: usize) -> Result<(usize, f64)> {
        let val = f64::from_le_bytes(checked_range(self, idx, mem::size_of::<f64>())?.try_into()?);
        Ok((idx + mem::size_of::<f64>(), val))
    }

    #[inline]
    fn deser_i32(&self, idx: usize) -> Result<(usize, i32)> {
        let val = i32::from_le_bytes(checked_range(self, idx, mem::size_of::<i32>())?.try_into()?);
        Ok((idx + mem::size_of::<i32>(), val))
    }

    #[inline]
    fn deser_f32(&self, idx: usize) -> Result<(usize, f32)> {
        let val = f32::from_le_bytes(checked_range(self, idx, mem::size_of::<f32>())?.try_into()?);
        Ok((idx + mem::size_of::<f32>(), val))
    }

    #[inline]
    fn deser_u16(&self, idx: usize) -> Result<(usize, u16)> {
        let val = u16::from_le_bytes(checked_range(self, idx, mem::size_of::<u16>())?.try_into()?);
        Ok((idx + mem::size_of::<u16>(), val))
    }

    #[inline]
    fn deser_i16(&self, idx: usize) -> Result<(usize, i16)> {
        let val = i16::from_le_bytes(checked_range(self, idx, mem::size_of::<i16>())?.try_into()?);
        Ok((idx + mem::size_of::<i16>(), val))
    }

    #[inline]
    fn deser_u8(&self, idx: usize) -> Result<(usize, u8)> {
        let val = checked_range(self, idx, mem::size_of::<u8>())?[0];
        Ok((idx + mem::size_of::<u8>(), val))
    }

    #[inline]
    fn deser_byte_slice(&self, idx: usize, len: usize) -> Result<(usize, &[u8])> {
        let val = checked_range(self, idx, len)?;
        Ok((idx + len, val))
    }
}
