use serde::{Deserialize, Serialize};

use crate::error::{FtlError, Result};

/// Selects which placement strategy the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Default,
    Swap,
    Latency,
    Pack,
}

impl Default for TargetType {
    fn default() -> Self {
        TargetType::Default
    }
}

/// Misc flag bits controlling engine behavior. Modeled as a small newtype
/// rather than pulling in a dependency for eight bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(pub u32);

impl Flags {
    pub const ENGINE_NONE: u32 = 0;
    pub const ENGINE_SWAP: u32 = 1;
    pub const ENGINE_IOCTL: u32 = 2;
    pub const ENGINE_LATENCY: u32 = 4;
    pub const ENGINE_PACK: u32 = 8;
    pub const POOL_SERIALIZE: u32 = 1 << 15;
    pub const FAST_SLOW_PAGES: u32 = 1 << 16;
    pub const NO_WAITS: u32 = 1 << 17;

    pub fn contains(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }
}

/// Construction-time configuration record.
///
/// `default()` provides a runnable baseline rather than zeroed fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub target_type: TargetType,
    pub nr_pools: usize,
    pub nr_blks_per_pool: usize,
    pub nr_pages_per_blk: usize,
    pub nr_aps_per_pool: usize,
    /// Host pages per flash page (H); must be a power of two.
    pub host_pages_per_flash_page: usize,
    pub misc_flags: Flags,
    pub gc_time_ms: u64,
    /// Divisor used to compute the GC watermark: `need = nr_blocks / gc_limit_inverse`.
    pub gc_limit_inverse: usize,
    pub t_read_us: u64,
    pub t_write_us: u64,
    pub t_erase_us: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_type: TargetType::Default,
            nr_pools: 4,
            nr_blks_per_pool: 64,
            nr_pages_per_blk: 256,
            nr_aps_per_pool: 1,
            host_pages_per_flash_page: 1,
            // Defaults on; exposed as configuration for callers that want
            // unserialized pool access.
            misc_flags: Flags(Flags::POOL_SERIALIZE),
            gc_time_ms: 1_000,
            gc_limit_inverse: 10,
            t_read_us: 100,
            t_write_us: 200,
            t_erase_us: 1_500,
        }
    }
}

impl EngineConfig {
    pub fn load_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| FtlError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.nr_pools == 0 {
            return Err(FtlError::Config("nr_pools must be > 0".into()));
        }
        if self.nr_blks_per_pool == 0 {
            return Err(FtlError::Config("nr_blks_per_pool must be > 0".into()));
        }
        if self.nr_pages_per_blk == 0 {
            return Err(FtlError::Config("nr_pages_per_blk must be > 0".into()));
        }
        if self.nr_aps_per_pool == 0 {
            return Err(FtlError::Config("nr_aps_per_pool must be > 0".into()));
        }
        if !self.host_pages_per_flash_page.is_power_of_two() {
            return Err(FtlError::Config(
                "host_pages_per_flash_page must be a power of two".into(),
            ));
        }
        if self.gc_limit_inverse == 0 {
            return Err(FtlError::Config("gc_limit_inverse must be > 0".into()));
        }
        Ok(())
    }

    /// Total logical page count N = P * B * K * H.
    pub fn total_logical_pages(&self) -> usize {
        self.nr_pools * self.nr_blks_per_pool * self.nr_pages_per_blk * self.host_pages_per_flash_page
    }

    pub fn total_aps(&self) -> usize {
        self.nr_pools * self.nr_aps_per_pool
    }

    pub fn serialize_pool(&self) -> bool {
        self.misc_flags.contains(Flags::POOL_SERIALIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_h() {
        let mut cfg = EngineConfig::default();
        cfg.host_pages_per_flash_page = 3;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn total_logical_pages_matches_formula() {
        let cfg = EngineConfig {
            nr_pools: 2,
            nr_blks_per_pool: 4,
            nr_pages_per_blk: 4,
            host_pages_per_flash_page: 1,
            ..EngineConfig::default()
        };
        assert_eq!(cfg.total_logical_pages(), 32);
    }

    #[test]
    fn loads_overrides_from_a_toml_file_on_disk() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "target_type = \"swap\"\nnr_pools = 8\nnr_blks_per_pool = 32\n"
        )
        .unwrap();
        let text = std::fs::read_to_string(file.path()).unwrap();
        let cfg = EngineConfig::load_toml(&text).unwrap();
        assert_eq!(cfg.target_type, TargetType::Swap);
        assert_eq!(cfg.nr_pools, 8);
        assert_eq!(cfg.nr_blks_per_pool, 32);
        // Unset fields fall back to the default rather than zeroing out.
        assert_eq!(cfg.nr_pages_per_blk, EngineConfig::default().nr_pages_per_blk);
    }
}
