use crate::error::{Error, Result};
use std::fmt;

/// 256-bit integer stored as four 64-bit words, `l0` is the lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Long256 {
    pub l0: i64,
    pub l1: i64,
    pub l2: i64,
    pub l3: i64,
}

impl Long256 {
    /// Null value has all words set to -1.
    pub const NULL: Long256 = Long256 {
        l0: -1,
        l1: -1,
        l2: -1,
        l3: -1,
    };

    /// Encoded width in bytes.
    pub const BYTES: usize = 32;

    #[inline]
    pub const fn new(l0: i64, l1: i64, l2: i64, l3: i64) -> Self {
        Long256 { l0, l1, l2, l3 }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Parse hexadecimal text with `0x` prefix, at most 64 digits.
    /// Absent or empty text is null.
    #[inline]
    pub fn from_hex_str(text: Option<&str>) -> Result<Self> {
        let text = match text {
            None | Some("") => return Ok(Self::NULL),
            Some(t) => t,
        };
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .ok_or(Error::InvalidFormat)?;
        if digits.is_empty()
            || digits.len() > 64
            || !digits.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(Error::InvalidFormat);
        }
        let mut words = [0i64; 4];
        let mut end = digits.len();
        for word in words.iter_mut() {
            if end == 0 {
                break;
            }
            let start = end.saturating_sub(16);
            *word = u64::from_str_radix(&digits[start..end], 16)? as i64;
            end = start;
        }
        Ok(Long256::new(words[0], words[1], words[2], words[3]))
    }
}

impl fmt::Display for Long256 {
    /// Null is printed as empty text, otherwise `0x` followed by
    /// hexadecimal digits without leading zero words.
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return Ok(());
        }
        let words = [self.l3, self.l2, self.l1, self.l0];
        let first = words.iter().position(|w| *w != 0).unwrap_or(3);
        write!(f, "0x{:x}", words[first] as u64)?;
        for w in &words[first + 1..] {
            write!(f, "{:016x}", *w as u64)?;
        }
        Ok(())
    }
}
