//! Storage engine - coordinates all storage components

mod database;
mod version;

pub use database::{Database, DatabaseStats, Scan, Snapshot};

use crate::compaction::CompactionConfig;
use crate::compression::Compression;
use crate::sstable::SSTableConfig;
use crate::wal::{SyncPolicy, WalConfig};
use crate::{Result, StrataError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Storage engine configuration, fixed for the lifetime of an open database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Block cache capacity in bytes
    pub cache_size: usize,
    /// Table file handles kept open at once
    pub max_open_files: usize,
    /// Codec for newly written blocks; existing tables keep theirs
    pub compression: Compression,
    /// MemTable size limit in bytes
    pub memtable_size_limit: usize,
    /// Frozen memtables allowed before writers flush inline
    pub max_immutable_memtables: usize,
    /// Uncompressed data block size
    pub block_size: usize,
    /// Bloom filter bits per key
    pub bloom_bits_per_key: usize,
    /// L0 compaction trigger (number of files)
    pub l0_compaction_trigger: usize,
    /// Level size multiplier
    pub level_size_multiplier: usize,
    /// L1 target size in bytes
    pub base_level_size: u64,
    /// Compaction output file size in bytes
    pub target_file_size: u64,
    /// Maximum number of levels
    pub max_levels: usize,
    /// WAL configuration
    pub wal: WalConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_size: crate::config::CACHE_SIZE,
            max_open_files: crate::config::MAX_OPEN_FILES,
            compression: Compression::default(),
            memtable_size_limit: crate::config::MEMTABLE_SIZE_LIMIT,
            max_immutable_memtables: crate::config::MAX_IMMUTABLE_MEMTABLES,
            block_size: crate::config::BLOCK_SIZE,
            bloom_bits_per_key: crate::config::BLOOM_BITS_PER_KEY,
            l0_compaction_trigger: crate::config::L0_COMPACTION_TRIGGER,
            level_size_multiplier: crate::config::LEVEL_SIZE_MULTIPLIER,
            base_level_size: crate::config::BASE_LEVEL_SIZE,
            target_file_size: crate::config::TARGET_FILE_SIZE,
            max_levels: crate::config::MAX_LEVELS,
            wal: WalConfig::default(),
        }
    }
}

fn config_error(msg: impl Into<String>) -> StrataError {
    StrataError::Config(msg.into())
}

impl StorageConfig {
    /// Build a config from a string dictionary, e.g.
    /// `{"cache_size": "64MB", "max_open_files": "100", "compression": "snappy"}`.
    ///
    /// Sizes accept `B`, `KB`, `MB` and `GB` suffixes. Unknown keys are
    /// rejected. The result is validated.
    pub fn from_options(options: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        for (name, raw) in options {
            config.set(name, raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Set one option by name
    pub fn set(&mut self, name: &str, raw: &str) -> Result<()> {
        let raw = raw.trim();
        match name {
            "cache_size" => self.cache_size = parse_size(name, raw)? as usize,
            "max_open_files" => self.max_open_files = parse_count(name, raw)?,
            "compression" => self.compression = raw.parse()?,
            "memtable_size_limit" => self.memtable_size_limit = parse_size(name, raw)? as usize,
            "max_immutable_memtables" => self.max_immutable_memtables = parse_count(name, raw)?,
            "block_size" => self.block_size = parse_size(name, raw)? as usize,
            "bloom_bits_per_key" => self.bloom_bits_per_key = parse_count(name, raw)?,
            "l0_compaction_trigger" => self.l0_compaction_trigger = parse_count(name, raw)?,
            "level_size_multiplier" => self.level_size_multiplier = parse_count(name, raw)?,
            "base_level_size" => self.base_level_size = parse_size(name, raw)?,
            "target_file_size" => self.target_file_size = parse_size(name, raw)?,
            "max_levels" => self.max_levels = parse_count(name, raw)?,
            "wal_segment_size" => self.wal.segment_size = parse_size(name, raw)? as usize,
            "sync_policy" => self.wal.sync_policy = parse_sync_policy(raw)?,
            _ => return Err(config_error(format!("Unknown option: {}", name))),
        }
        Ok(())
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_open_files == 0 {
            return Err(config_error("max_open_files must be at least 1"));
        }
        if self.memtable_size_limit < 1024 {
            return Err(config_error(format!(
                "memtable_size_limit must be at least 1KB, got {}",
                self.memtable_size_limit
            )));
        }
        if self.max_immutable_memtables == 0 {
            return Err(config_error("max_immutable_memtables must be at least 1"));
        }
        if !(64..=16 * 1024 * 1024).contains(&self.block_size) {
            return Err(config_error(format!(
                "block_size must be between 64B and 16MB, got {}",
                self.block_size
            )));
        }
        if self.bloom_bits_per_key > 64 {
            return Err(config_error("bloom_bits_per_key must be at most 64"));
        }
        if self.l0_compaction_trigger == 0 {
            return Err(config_error("l0_compaction_trigger must be at least 1"));
        }
        if self.level_size_multiplier < 2 {
            return Err(config_error("level_size_multiplier must be at least 2"));
        }
        if self.base_level_size == 0 || self.target_file_size == 0 {
            return Err(config_error("level and file sizes must be positive"));
        }
        if !(2..=16).contains(&self.max_levels) {
            return Err(config_error(format!(
                "max_levels must be between 2 and 16, got {}",
                self.max_levels
            )));
        }
        if self.wal.segment_size < 1024 {
            return Err(config_error("wal segment_size must be at least 1KB"));
        }
        if let SyncPolicy::EveryN(0) = self.wal.sync_policy {
            return Err(config_error("sync_policy every_n needs n >= 1"));
        }
        Ok(())
    }

    pub fn sstable_config(&self) -> SSTableConfig {
        SSTableConfig {
            block_size: self.block_size,
            compression: self.compression,
            bloom_bits_per_key: self.bloom_bits_per_key,
        }
    }

    pub fn compaction_config(&self) -> CompactionConfig {
        CompactionConfig {
            l0_file_trigger: self.l0_compaction_trigger,
            level_size_multiplier: self.level_size_multiplier as u64,
            base_level_size: self.base_level_size,
            target_file_size: self.target_file_size,
            max_levels: self.max_levels,
            sstable_config: self.sstable_config(),
        }
    }
}

/// Parse `4096`, `64KB`, `16 MB`, `1gb`
fn parse_size(name: &str, raw: &str) -> Result<u64> {
    let upper = raw.to_ascii_uppercase();
    let (digits, multiplier) = [("GB", 1u64 << 30), ("MB", 1 << 20), ("KB", 1 << 10), ("B", 1)]
        .iter()
        .find_map(|(suffix, mult)| upper.strip_suffix(suffix).map(|d| (d.trim(), *mult)))
        .unwrap_or((upper.as_str(), 1));
    digits
        .parse::<u64>()
        .ok()
        .and_then(|n| n.checked_mul(multiplier))
        .ok_or_else(|| config_error(format!("Invalid size for {}: {:?}", name, raw)))
}

fn parse_count(name: &str, raw: &str) -> Result<usize> {
    raw.parse()
        .map_err(|_| config_error(format!("Invalid number for {}: {:?}", name, raw)))
}

/// `immediate`, `manual`, `every_n:<n>` or `interval:<millis>`
fn parse_sync_policy(raw: &str) -> Result<SyncPolicy> {
    let lower = raw.to_ascii_lowercase();
    let (kind, arg) = match lower.split_once(':') {
        Some((kind, arg)) => (kind, Some(arg.trim())),
        None => (lower.as_str(), None),
    };
    match (kind, arg) {
        ("immediate", None) => Ok(SyncPolicy::Immediate),
        ("manual", None) => Ok(SyncPolicy::Manual),
        ("every_n", Some(n)) => n
            .parse()
            .map(SyncPolicy::EveryN)
            .map_err(|_| config_error(format!("Invalid sync_policy: {:?}", raw))),
        ("interval", Some(ms)) => ms
            .parse()
            .map(|millis| SyncPolicy::Interval { millis })
            .map_err(|_| config_error(format!("Invalid sync_policy: {:?}", raw))),
        _ => Err(config_error(format!("Invalid sync_policy: {:?}", raw))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        StorageConfig::default().validate().unwrap();
    }

    #[test]
    fn test_from_options() {
        let config = StorageConfig::from_options(&options(&[
            ("cache_size", "64MB"),
            ("max_open_files", "100"),
            ("compression", "snappy"),
            ("memtable_size_limit", "512 KB"),
            ("sync_policy", "every_n:8"),
        ]))
        .unwrap();
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert_eq!(config.max_open_files, 100);
        assert_eq!(config.compression, Compression::Snappy);
        assert_eq!(config.memtable_size_limit, 512 * 1024);
        assert_eq!(config.wal.sync_policy, SyncPolicy::EveryN(8));
        assert_eq!(config.sstable_config().compression, Compression::Snappy);
    }

    #[test]
    fn test_invalid_options() {
        for pairs in [
            vec![("cache_sise", "1MB")],
            vec![("cache_size", "lots")],
            vec![("compression", "zstd")],
            vec![("max_open_files", "0")],
            vec![("max_levels", "1")],
            vec![("sync_policy", "sometimes")],
        ] {
            let err = StorageConfig::from_options(&options(&pairs)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "{:?}", pairs);
        }
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("x", "4096").unwrap(), 4096);
        assert_eq!(parse_size("x", "10B").unwrap(), 10);
        assert_eq!(parse_size("x", "2kb").unwrap(), 2048);
        assert_eq!(parse_size("x", "1GB").unwrap(), 1 << 30);
        assert!(parse_size("x", "MB").is_err());
    }

    #[test]
    fn test_json_config() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"cache_size": 1048576, "compression": "none", "wal": {"sync_policy": "immediate"}}"#,
        )
        .unwrap();
        assert_eq!(config.cache_size, 1 << 20);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.wal.sync_policy, SyncPolicy::Immediate);
        assert_eq!(config.max_levels, crate::config::MAX_LEVELS);

        assert!(serde_json::from_str::<StorageConfig>(r#"{"cache": 1}"#).is_err());
    }
}
