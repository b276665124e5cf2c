use crate::error::{Error, Result};

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_CACHE_CAPACITY: usize = 2 * 1024 * 1024;
pub const DEFAULT_KEY_SIZE: u16 = 32;

/// Environment-wide configuration, fixed at open time.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// Size of each page in bytes. Power of two, 4 KiB - 64 KiB, fixed for
    /// the lifetime of a database file.
    pub page_size: u32,
    /// Byte budget of the page cache.
    pub cache_capacity: usize,
    /// Keep everything in memory; no device I/O, no reclaim, no eviction.
    pub in_memory: bool,
    /// Enroll every page modification into the changeset and checkpoint the
    /// page-manager state on every mutating boundary.
    pub enable_recovery: bool,
    /// Reject mutating operations.
    pub read_only: bool,
    /// Never truncate trailing free pages off the file.
    pub disable_reclaim: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            in_memory: false,
            enable_recovery: false,
            read_only: false,
            disable_reclaim: false,
        }
    }
}

impl EnvConfig {
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    pub fn durable() -> Self {
        Self {
            enable_recovery: true,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < 1 << 12
            || self.page_size > 1 << 16
        {
            return Err(Error::InvalidParameter(
                "page size must be a power of two between 4 KiB and 64 KiB",
            ));
        }
        if self.cache_capacity < self.page_size as usize {
            return Err(Error::InvalidParameter(
                "cache capacity must hold at least one page",
            ));
        }
        if self.in_memory && self.read_only {
            return Err(Error::InvalidParameter(
                "an in-memory environment cannot be read-only",
            ));
        }
        Ok(())
    }
}

/// Per-database configuration, fixed when the database is created.
#[derive(Clone, Copy, Debug)]
pub struct DbConfig {
    /// Fixed size of the inline key area in a leaf slot. Longer keys spill
    /// their tail into a key blob.
    pub key_size: u16,
    /// Allow multiple records under one key.
    pub enable_duplicates: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            key_size: DEFAULT_KEY_SIZE,
            enable_duplicates: false,
        }
    }
}

impl DbConfig {
    pub fn with_duplicates() -> Self {
        Self {
            enable_duplicates: true,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.key_size < 16 {
            return Err(Error::InvalidParameter("key size must be at least 16"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EnvConfig::default().validate().unwrap();
        DbConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_unaligned_page_size() {
        let cfg = EnvConfig {
            page_size: 5000,
            ..EnvConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_tiny_cache() {
        let cfg = EnvConfig {
            cache_capacity: 100,
            ..EnvConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
