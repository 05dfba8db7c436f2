use crate::error::{Error, Result};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_DATA_DIR: &str = ".";
pub const DEFAULT_MAP_PAGE_SIZE: Byte = Byte::from_u64(16 * 1024 * 1024);
pub const DEFAULT_INDEX_PAGE_SIZE: Byte = Byte::from_u64(4096);
pub const DEFAULT_MAX_PAGES: usize = usize::MAX;
pub const DEFAULT_BUCKET_DIVISOR: u32 = 2;
pub const DEFAULT_SYMBOL_CAPACITY: i32 = 256;
pub const DEFAULT_SYMBOL_CACHE_FLAG: bool = true;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Directory of column files, used when symbol maps are
    // opened by name only.
    pub data_dir: String,
    // Page size of mapped memory of symbol value and offset files.
    // Rounded up to power of two.
    pub map_page_size: Byte,
    // Page size of bitmap index key and value files.
    pub index_page_size: Byte,
    // Maximum number of pages each mapped memory can hold.
    pub max_pages: usize,
    // Hash buckets of a symbol map are capacity divided by this
    // number, rounded up to power of two.
    // Smaller divisor means more buckets and fewer collisions.
    pub bucket_divisor: u32,
    pub default_symbol_capacity: i32,
    pub default_symbol_cache_flag: bool,
}

impl StorageConfig {
    #[inline]
    pub fn data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Page size of symbol value and offset files.
    #[inline]
    pub fn map_page_size<T>(mut self, map_page_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.map_page_size = Byte::from(map_page_size);
        self
    }

    /// Page size of bitmap index files.
    #[inline]
    pub fn index_page_size<T>(mut self, index_page_size: T) -> Self
    where
        Byte: From<T>,
    {
        self.index_page_size = Byte::from(index_page_size);
        self
    }

    #[inline]
    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Divisor applied to symbol capacity to get hash bucket count.
    #[inline]
    pub fn bucket_divisor(mut self, bucket_divisor: u32) -> Self {
        self.bucket_divisor = bucket_divisor;
        self
    }

    #[inline]
    pub fn default_symbol_capacity(mut self, default_symbol_capacity: i32) -> Self {
        self.default_symbol_capacity = default_symbol_capacity;
        self
    }

    #[inline]
    pub fn default_symbol_cache_flag(mut self, default_symbol_cache_flag: bool) -> Self {
        self.default_symbol_cache_flag = default_symbol_cache_flag;
        self
    }

    #[inline]
    pub fn map_page_size_bytes(&self) -> usize {
        self.map_page_size.as_u64() as usize
    }

    #[inline]
    pub fn index_page_size_bytes(&self) -> usize {
        self.index_page_size.as_u64() as usize
    }

    /// Parse configuration from TOML text. Missing keys take defaults.
    #[inline]
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let conf: StorageConfig = toml::from_str(text)?;
        conf.validate()
    }

    /// Load configuration from TOML file.
    #[inline]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::ConfigError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    #[inline]
    pub fn validate(self) -> Result<Self> {
        if self.map_page_size_bytes() == 0 || self.index_page_size_bytes() == 0 {
            return Err(Error::ConfigError("page size must be positive".to_string()));
        }
        if self.bucket_divisor == 0 {
            return Err(Error::ConfigError(
                "bucket divisor must be positive".to_string(),
            ));
        }
        if self.max_pages == 0 {
            return Err(Error::ConfigError("max pages must be positive".to_string()));
        }
        Ok(self)
    }
}

impl Default for StorageConfig {
    #[inline]
    fn default() -> Self {
        StorageConfig {
            data_dir: String::from(DEFAULT_DATA_DIR),
            map_page_size: DEFAULT_MAP_PAGE_SIZE,
            index_page_size: DEFAULT_INDEX_PAGE_SIZE,
            max_pages: DEFAULT_MAX_PAGES,
            bucket_divisor: DEFAULT_BUCKET_DIVISOR,
            default_symbol_capacity: DEFAULT_SYMBOL_CAPACITY,
            default_symbol_cache_flag: DEFAULT_SYMBOL_CACHE_FLAG,
        }
    }
}
