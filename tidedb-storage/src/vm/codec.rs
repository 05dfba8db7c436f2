//! Fixed-width and variable-length values over virtual memory.
//!
//! Layout, all little-endian:
//!
//! | type    | encoding                                              |
//! |---------|-------------------------------------------------------|
//! | scalar  | natural width, no alignment                           |
//! | string  | i32 UTF-16 unit count, then units as u16; null is -1  |
//! | binary  | i64 byte length, then bytes; null is -1               |
//! | long256 | four i64 words, lowest first; null is all -1          |
use crate::error::{Error, Result};
use crate::serde::{Serde, NULL_LEN};
use crate::vm::{Long256, PageAllocator, VirtualMemory};
use std::mem;

/// Chunk size used when streaming variable-length payloads.
const CHUNK_SIZE: usize = 256;

/// Bytes occupied by encoded string, including its length prefix.
#[inline]
pub fn str_storage_len(value: Option<&str>) -> usize {
    match value {
        None => mem::size_of::<i32>(),
        Some(s) => mem::size_of::<i32>() + s.encode_utf16().count() * 2,
    }
}

/// Bytes occupied by encoded string of given unit count.
/// Negative length means null.
#[inline]
pub fn str_storage_len_of(len: i32) -> usize {
    mem::size_of::<i32>() + len.max(0) as usize * 2
}

macro_rules! scalar_codec {
    ($ty:ty, $put:ident, $put_at:ident, $get:ident) => {
        #[doc = concat!("Append a `", stringify!($ty), "` value at append pointer.")]
        #[inline]
        pub fn $put(&mut self, val: $ty) -> Result<usize> {
            self.put_bytes(&val.to_le_bytes())
        }

        #[doc = concat!("Write a `", stringify!($ty), "` value at given offset.")]
        #[inline]
        pub fn $put_at(&mut self, offset: usize, val: $ty) -> Result<()> {
            self.put_bytes_at(offset, &val.to_le_bytes())
        }

        #[doc = concat!("Read a `", stringify!($ty), "` value at given offset.")]
        #[inline]
        pub fn $get(&mut self, offset: usize) -> Result<$ty> {
            let mut buf = [0u8; mem::size_of::<$ty>()];
            self.get_bytes(offset, &mut buf)?;
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

impl<A: PageAllocator> VirtualMemory<A> {
    scalar_codec!(i8, put_i8, put_i8_at, get_i8);
    scalar_codec!(i16, put_i16, put_i16_at, get_i16);
    scalar_codec!(u16, put_char, put_char_at, get_char);
    scalar_codec!(i32, put_i32, put_i32_at, get_i32);
    scalar_codec!(i64, put_i64, put_i64_at, get_i64);
    scalar_codec!(f32, put_f32, put_f32_at, get_f32);
    scalar_codec!(f64, put_f64, put_f64_at, get_f64);

    #[inline]
    pub fn put_bool(&mut self, val: bool) -> Result<usize> {
        self.put_i8(val as i8)
    }

    #[inline]
    pub fn put_bool_at(&mut self, offset: usize, val: bool) -> Result<()> {
        self.put_i8_at(offset, val as i8)
    }

    #[inline]
    pub fn get_bool(&mut self, offset: usize) -> Result<bool> {
        self.get_i8(offset).map(|v| v != 0)
    }

    /// Append string and return offset of its length prefix.
    #[inline]
    pub fn put_str(&mut self, value: Option<&str>) -> Result<usize> {
        let offset = self.append_offset();
        let len = self.put_str_at(offset, value)?;
        self.append_offset = offset + len;
        Ok(offset)
    }

    /// Append null string and return its offset.
    #[inline]
    pub fn put_null_str(&mut self) -> Result<usize> {
        self.put_i32(NULL_LEN)
    }

    /// Write string at given offset and return its storage length.
    /// Append pointer is not changed.
    pub fn put_str_at(&mut self, offset: usize, value: Option<&str>) -> Result<usize> {
        let value = match value {
            None => {
                self.put_i32_at(offset, NULL_LEN)?;
                return Ok(mem::size_of::<i32>());
            }
            Some(v) => v,
        };
        let units = value.encode_utf16().count();
        if units > i32::MAX as usize {
            return Err(Error::InvalidArgument);
        }
        self.put_i32_at(offset, units as i32)?;
        let mut pos = offset + mem::size_of::<i32>();
        let mut buf = [0u8; CHUNK_SIZE];
        let mut idx = 0;
        for unit in value.encode_utf16() {
            idx = buf.ser_u16(idx, unit);
            if idx == CHUNK_SIZE {
                self.put_bytes_at(pos, &buf)?;
                pos += idx;
                idx = 0;
            }
        }
        if idx > 0 {
            self.put_bytes_at(pos, &buf[..idx])?;
        }
        Ok(str_storage_len_of(units as i32))
    }

    /// Returns UTF-16 unit count of string at given offset, -1 for null.
    #[inline]
    pub fn get_str_len(&mut self, offset: usize) -> Result<i32> {
        self.get_i32(offset)
    }

    /// Read string at given offset.
    pub fn get_str(&mut self, offset: usize) -> Result<Option<String>> {
        let len = self.get_i32(offset)?;
        if len < 0 {
            return Ok(None);
        }
        let mut bytes = vec![0u8; len as usize * 2];
        self.get_bytes(offset + mem::size_of::<i32>(), &mut bytes)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Some(String::from_utf16(&units)?))
    }

    /// Compare string at given offset with value, without decoding
    /// stored string into an owned buffer. Null never equals.
    pub fn str_equals(&mut self, offset: usize, value: &str) -> Result<bool> {
        let len = self.get_i32(offset)?;
        if len < 0 {
            return Ok(false);
        }
        let mut units = value.encode_utf16();
        let mut remaining = len as usize * 2;
        let mut pos = offset + mem::size_of::<i32>();
        let mut buf = [0u8; CHUNK_SIZE];
        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE);
            self.get_bytes(pos, &mut buf[..n])?;
            for pair in buf[..n].chunks_exact(2) {
                match units.next() {
                    Some(u) if u == u16::from_le_bytes([pair[0], pair[1]]) => (),
                    _ => return Ok(false),
                }
            }
            pos += n;
            remaining -= n;
        }
        Ok(units.next().is_none())
    }

    /// Append binary value and return its offset.
    #[inline]
    pub fn put_bin(&mut self, value: Option<&[u8]>) -> Result<usize> {
        match value {
            None => self.put_null_bin(),
            Some(bytes) => {
                let offset = self.put_i64(bytes.len() as i64)?;
                self.put_bytes(bytes)?;
                Ok(offset)
            }
        }
    }

    #[inline]
    pub fn put_null_bin(&mut self) -> Result<usize> {
        self.put_i64(NULL_LEN as i64)
    }

    /// Returns byte length of binary value at given offset, -1 for null.
    #[inline]
    pub fn get_bin_len(&mut self, offset: usize) -> Result<i64> {
        self.get_i64(offset)
    }

    pub fn get_bin(&mut self, offset: usize) -> Result<Option<Vec<u8>>> {
        let len = self.get_i64(offset)?;
        if len < 0 {
            return Ok(None);
        }
        let mut bytes = vec![0u8; len as usize];
        self.get_bytes(offset + mem::size_of::<i64>(), &mut bytes)?;
        Ok(Some(bytes))
    }

    #[inline]
    pub fn put_long256(&mut self, value: &Long256) -> Result<usize> {
        let mut buf = [0u8; Long256::BYTES];
        buf.ser_long256(0, value);
        self.put_bytes(&buf)
    }

    #[inline]
    pub fn put_long256_at(&mut self, offset: usize, value: &Long256) -> Result<()> {
        let mut buf = [0u8; Long256::BYTES];
        buf.ser_long256(0, value);
        self.put_bytes_at(offset, &buf)
    }

    /// Parse hexadecimal text and append it as 256-bit value.
    #[inline]
    pub fn put_long256_str(&mut self, text: Option<&str>) -> Result<usize> {
        let value = Long256::from_hex_str(text)?;
        self.put_long256(&value)
    }

    #[inline]
    pub fn get_long256(&mut self, offset: usize) -> Result<Long256> {
        let mut buf = [0u8; Long256::BYTES];
        self.get_bytes(offset, &mut buf)?;
        buf.deser_long256(0).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::HeapMemory;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_storage_len() {
        assert_eq!(str_storage_len(Some("xyz")), 10);
        assert_eq!(str_storage_len(Some("")), 4);
        assert_eq!(str_storage_len(None), 4);
        // one unit for BMP char, two units for supplementary char.
        assert_eq!(str_storage_len(Some("é")), 6);
        assert_eq!(str_storage_len(Some("😀")), 8);
        assert_eq!(str_storage_len_of(-1), 4);
    }

    #[test]
    fn test_scalars_odd_offset() {
        // page size 16 with leading byte makes most values straddle pages.
        let mut mem = HeapMemory::new(11);
        mem.put_i8(1).unwrap();
        for i in 0..999i64 {
            mem.put_i64(i * 31).unwrap();
            mem.put_i32(i as i32).unwrap();
            mem.put_i16(i as i16).unwrap();
            mem.put_f64(i as f64 / 3.0).unwrap();
            mem.put_f32(i as f32).unwrap();
            mem.put_char(i as u16).unwrap();
            mem.put_bool(i % 2 == 0).unwrap();
        }
        assert_eq!(mem.get_i8(0).unwrap(), 1);
        let mut o = 1;
        for i in 0..999i64 {
            assert_eq!(mem.get_i64(o).unwrap(), i * 31);
            o += 8;
            assert_eq!(mem.get_i32(o).unwrap(), i as i32);
            o += 4;
            assert_eq!(mem.get_i16(o).unwrap(), i as i16);
            o += 2;
            assert_eq!(mem.get_f64(o).unwrap(), i as f64 / 3.0);
            o += 8;
            assert_eq!(mem.get_f32(o).unwrap(), i as f32);
            o += 4;
            assert_eq!(mem.get_char(o).unwrap(), i as u16);
            o += 2;
            assert_eq!(mem.get_bool(o).unwrap(), i % 2 == 0);
            o += 1;
        }
        assert_eq!(mem.append_offset(), o);
    }

    #[test]
    fn test_scalars_random_access() {
        let mut mem = HeapMemory::new(128);
        mem.put_i8_at(512, 3).unwrap();
        mem.put_i8_at(513, 4).unwrap();
        mem.jump_to(514).unwrap();
        mem.put_i8(5).unwrap();
        assert_eq!(mem.get_i8(512).unwrap(), 3);
        assert_eq!(mem.get_i8(513).unwrap(), 4);
        assert_eq!(mem.get_i8(514).unwrap(), 5);

        let mut o = 1;
        for i in 0..300i32 {
            mem.put_i32_at(o, i).unwrap();
            o += 4;
        }
        o = 1;
        for i in 0..300i32 {
            assert_eq!(mem.get_i32(o).unwrap(), i);
            o += 4;
        }
    }

    #[test]
    fn test_little_endian_on_page() {
        let mut mem = HeapMemory::new(64);
        mem.put_i32(0x0102_0304).unwrap();
        mem.put_char(0x0a0b).unwrap();
        assert_eq!(&mem.page(0).unwrap()[..6], &[4, 3, 2, 1, 0x0b, 0x0a]);
    }

    fn assert_strings(mem: &mut HeapMemory, leading_byte: bool) {
        if leading_byte {
            mem.put_i8(1).unwrap();
        }
        let o1 = mem.put_str(Some("123")).unwrap();
        let o2 = mem.put_str(Some("0987654321abcd")).unwrap();
        let o3 = mem.put_str(None).unwrap();
        let o4 = mem.put_str(Some("xyz123")).unwrap();
        let o5 = mem.put_null_str().unwrap();
        let o6 = mem.put_str(Some("")).unwrap();

        if leading_byte {
            assert_eq!(mem.get_i8(0).unwrap(), 1);
        }
        assert_eq!(mem.get_str(o1).unwrap().as_deref(), Some("123"));
        assert_eq!(mem.get_str_len(o1).unwrap(), 3);

        let expected = "0987654321abcd";
        assert_eq!(mem.get_str(o2).unwrap().as_deref(), Some(expected));
        for (i, c) in expected.encode_utf16().enumerate() {
            assert_eq!(mem.get_char(o2 + 4 + i * 2).unwrap(), c);
        }

        assert!(mem.get_str(o3).unwrap().is_none());
        assert_eq!(mem.get_str(o4).unwrap().as_deref(), Some("xyz123"));
        assert!(mem.get_str(o5).unwrap().is_none());
        assert_eq!(mem.get_str_len(o5).unwrap(), -1);
        assert_eq!(mem.get_str(o6).unwrap().as_deref(), Some(""));

        assert!(mem.str_equals(o4, "xyz123").unwrap());
        assert!(!mem.str_equals(o4, "xyz12").unwrap());
        assert!(!mem.str_equals(o4, "xyz1234").unwrap());
        assert!(!mem.str_equals(o3, "").unwrap());
        assert!(mem.str_equals(o6, "").unwrap());
    }

    #[test]
    fn test_strings_small_even_page() {
        let mut mem = HeapMemory::new(2);
        assert_strings(&mut mem, false);
    }

    #[test]
    fn test_strings_small_odd_offset() {
        let mut mem = HeapMemory::new(2);
        assert_strings(&mut mem, true);
    }

    #[test]
    fn test_strings_off_page_size() {
        let mut mem = HeapMemory::new(12);
        assert_strings(&mut mem, true);
    }

    #[test]
    fn test_strings_large_page() {
        let mut mem = HeapMemory::new(1024);
        assert_strings(&mut mem, false);
    }

    #[test]
    fn test_str_random() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut mem = HeapMemory::new(16);
        let mut expected = Vec::new();
        for _ in 0..1000 {
            let len = rng.random_range(0..40);
            let s: String = (0..len)
                .map(|_| char::from_u32(rng.random_range(0x20..0x3000)).unwrap_or('?'))
                .collect();
            let offset = mem.put_str(Some(&s)).unwrap();
            expected.push((offset, s));
        }
        for (offset, s) in &expected {
            assert_eq!(mem.get_str(*offset).unwrap().as_deref(), Some(s.as_str()));
            assert!(mem.str_equals(*offset, s).unwrap());
        }
    }

    #[test]
    fn test_long_str_chunked() {
        let mut mem = HeapMemory::new(64);
        let s: String = "abcdefghij".repeat(100);
        let offset = mem.put_str(Some(&s)).unwrap();
        assert_eq!(mem.append_offset(), str_storage_len(Some(&s)));
        assert_eq!(mem.get_str(offset).unwrap(), Some(s.clone()));
        assert!(mem.str_equals(offset, &s).unwrap());
        let mut other = s.clone();
        other.replace_range(999..1000, "X");
        assert!(!mem.str_equals(offset, &other).unwrap());
    }

    #[test]
    fn test_put_str_at_keeps_append_pointer() {
        let mut mem = HeapMemory::new(16);
        let len = mem.put_str_at(40, Some("ab")).unwrap();
        assert_eq!(len, 8);
        assert_eq!(mem.append_offset(), 0);
        assert_eq!(mem.get_str(40).unwrap().as_deref(), Some("ab"));
    }

    #[test]
    fn test_bin_on_edge() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut mem = HeapMemory::new(32);
        let data: Vec<u8> = (0..33).map(|_| rng.random()).collect();
        let offset = mem.put_bin(Some(&data)).unwrap();
        assert_eq!(mem.get_bin_len(offset).unwrap(), 33);
        assert_eq!(mem.get_bin(offset).unwrap(), Some(data));
    }

    #[test]
    fn test_null_bin() {
        let mut mem = HeapMemory::new(1024);
        let o1 = mem.put_bin(None).unwrap();
        let o2 = mem.put_bin(Some(&[])).unwrap();
        let o3 = mem.put_null_bin().unwrap();
        assert_eq!((o1, o2, o3), (0, 8, 16));
        assert!(mem.get_bin(o1).unwrap().is_none());
        assert_eq!(mem.get_bin(o2).unwrap(), Some(vec![]));
        assert!(mem.get_bin(o3).unwrap().is_none());
        assert_eq!(mem.get_bin_len(o3).unwrap(), -1);
    }

    #[test]
    fn test_bin_sequence_many_pages() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut mem = HeapMemory::new(600);
        let mut expected = Vec::new();
        for _ in 0..100 {
            let len = rng.random_range(0..2048);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            expected.push((mem.put_bin(Some(&data)).unwrap(), data));
        }
        for (offset, data) in expected {
            assert_eq!(mem.get_bin(offset).unwrap(), Some(data));
        }
    }

    #[test]
    fn test_long256_direct() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut mem = HeapMemory::new(64);
        let values: Vec<Long256> = (0..1000)
            .map(|_| Long256::new(rng.random(), rng.random(), rng.random(), rng.random()))
            .collect();
        for v in &values {
            mem.put_long256(v).unwrap();
        }
        let mut offset = 0;
        for v in &values {
            assert_eq!(mem.get_long256(offset).unwrap(), *v);
            offset += Long256::BYTES;
        }
    }

    #[test]
    fn test_long256_externally_sequenced() {
        let mut mem = HeapMemory::new(64);
        let mut offset = 3;
        for i in 0..100i64 {
            mem.put_long256_at(offset, &Long256::new(i, i + 1, i + 2, i + 3))
                .unwrap();
            offset += Long256::BYTES;
        }
        offset = 3;
        for i in 0..100i64 {
            assert_eq!(
                mem.get_long256(offset).unwrap(),
                Long256::new(i, i + 1, i + 2, i + 3)
            );
            offset += Long256::BYTES;
        }
    }

    #[test]
    fn test_long256_null_and_text() {
        let mut mem = HeapMemory::new(64);
        for _ in 0..10 {
            mem.put_long256_str(None).unwrap();
        }
        for i in 0..10 {
            let v = mem.get_long256(i * Long256::BYTES).unwrap();
            assert!(v.is_null());
            assert_eq!(v.to_string(), "");
        }
        let text = "0xea674fdde714fd979de3edf0f56aa9716b898ec8";
        let offset = mem.put_long256_str(Some(text)).unwrap();
        assert_eq!(mem.get_long256(offset).unwrap().to_string(), text);
    }
}
