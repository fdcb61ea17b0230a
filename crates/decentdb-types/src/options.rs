//! Engine open options and bulk-load options.
//!
//! Options arrive either as a populated [`OpenOptions`] struct or as a
//! URL-query-style string (`cache_pages=512&checkpoint_bytes=1048576`).

use decentdb_error::{DecentError, Result};

use crate::PageSize;

/// How `fsync` is issued on the WAL and main file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Full fsync (data + metadata).
    #[default]
    Full,
    /// fdatasync where the platform offers it.
    Normal,
    /// No syncing at all. Test harnesses only; commits are not durable.
    NoSync,
}

/// Options honored by `open`. Defaults match the documented values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    /// Page cache capacity in pages.
    pub cache_pages: usize,
    /// Page size; only honored when creating a new file.
    pub page_size: PageSize,
    /// WAL sync mode.
    pub wal_sync_mode: SyncMode,
    /// Auto-checkpoint when the WAL reaches this many bytes.
    pub checkpoint_bytes: u64,
    /// Auto-checkpoint when this many milliseconds have elapsed since the
    /// last one. Zero disables the timer.
    pub checkpoint_ms: u64,
    /// Log a warning when a reader exceeds this age. Zero disables.
    pub reader_warn_ms: u64,
    /// Abort readers older than this. Zero disables.
    pub reader_timeout_ms: u64,
    /// Force WAL truncation when `reader_timeout_ms` fires.
    pub force_truncate_on_timeout: bool,
    /// Checkpoint when the in-memory WAL page index exceeds this many bytes.
    pub memory_threshold: u64,
    /// Checkpoint when accumulated WAL bytes per live reader exceed this.
    pub max_wal_bytes_per_reader: u64,
    /// Refuse to drive a query from the trigram index when the rarest
    /// trigram's posting count exceeds this.
    pub trigram_postings_threshold: u64,
    /// How long `begin` waits for the writer lock before `Transaction("busy")`.
    pub busy_timeout_ms: u64,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cache_pages: 1024,
            page_size: PageSize::DEFAULT,
            wal_sync_mode: SyncMode::Full,
            checkpoint_bytes: 64 * 1024 * 1024,
            checkpoint_ms: 0,
            reader_warn_ms: 0,
            reader_timeout_ms: 0,
            force_truncate_on_timeout: false,
            memory_threshold: 16 * 1024 * 1024,
            max_wal_bytes_per_reader: 0,
            trigram_postings_threshold: 10_000,
            busy_timeout_ms: 0,
        }
    }
}

impl OpenOptions {
    /// Parse a `key=value&key=value` option string on top of the defaults.
    ///
    /// Unknown keys and malformed values are `Sql` errors so the caller can
    /// surface them verbatim to whoever assembled the connection string.
    pub fn parse(query: &str) -> Result<Self> {
        let mut opts = Self::default();
        if query.is_empty() {
            return Ok(opts);
        }
        for pair in query.split('&') {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| DecentError::sql(format!("malformed option: {pair:?}")))?;
            opts.apply(key.trim(), value.trim())?;
        }
        Ok(opts)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            // `cache_size` is the historical spelling; both are accepted and
            // the last occurrence wins.
            "cache_pages" | "cache_size" => {
                self.cache_pages = parse_num(key, value)?;
                if self.cache_pages == 0 {
                    return Err(DecentError::sql("cache_pages must be positive"));
                }
            }
            "page_size" => {
                let raw: u32 = parse_num(key, value)?;
                self.page_size = PageSize::from_u32(raw).ok_or_else(|| {
                    DecentError::sql(format!("page_size must be one of 2048/4096/8192/16384, got {raw}"))
                })?;
            }
            "wal_sync_mode" => {
                self.wal_sync_mode = match value {
                    "FULL" => SyncMode::Full,
                    "NORMAL" => SyncMode::Normal,
                    #[cfg(feature = "unsafe-nosync")]
                    "TESTING_ONLY_UNSAFE_NOSYNC" => SyncMode::NoSync,
                    other => {
                        return Err(DecentError::sql(format!("unknown wal_sync_mode: {other}")));
                    }
                };
            }
            "checkpoint_bytes" => self.checkpoint_bytes = parse_num(key, value)?,
            "checkpoint_ms" => self.checkpoint_ms = parse_num(key, value)?,
            "reader_warn_ms" => self.reader_warn_ms = parse_num(key, value)?,
            "reader_timeout_ms" => self.reader_timeout_ms = parse_num(key, value)?,
            "force_truncate_on_timeout" => {
                self.force_truncate_on_timeout = parse_bool(key, value)?;
            }
            "memory_threshold" => self.memory_threshold = parse_num(key, value)?,
            "max_wal_bytes_per_reader" => self.max_wal_bytes_per_reader = parse_num(key, value)?,
            "trigram_postings_threshold" => {
                self.trigram_postings_threshold = parse_num(key, value)?;
            }
            "busy_timeout_ms" => self.busy_timeout_ms = parse_num(key, value)?,
            other => {
                return Err(DecentError::sql(format!("unknown option: {other}")));
            }
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DecentError::sql(format!("invalid value for {key}: {value:?}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "on" => Ok(true),
        "false" | "0" | "off" => Ok(false),
        _ => Err(DecentError::sql(format!(
            "invalid value for {key}: {value:?}"
        ))),
    }
}

/// Durability cadence for bulk loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Durability {
    /// Commit every batch.
    #[default]
    Full,
    /// Commit every `sync_interval` batches.
    Deferred,
    /// Never commit during the load; disables the WAL overlay for the rest
    /// of the connection.
    None,
}

/// Options for `bulk_load`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOptions {
    /// Rows per validation/insert batch.
    pub batch_size: usize,
    /// Batches between commits when durability is `Deferred`.
    pub sync_interval: usize,
    /// Drop secondary index maintenance during the load and rebuild after.
    pub disable_indexes: bool,
    /// Run a checkpoint once the load commits.
    pub checkpoint_on_complete: bool,
    pub durability: Durability,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            sync_interval: 8,
            disable_indexes: false,
            checkpoint_on_complete: true,
            durability: Durability::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = OpenOptions::default();
        assert_eq!(opts.cache_pages, 1024);
        assert_eq!(opts.page_size, PageSize::S4096);
        assert_eq!(opts.checkpoint_bytes, 64 * 1024 * 1024);
        assert_eq!(opts.wal_sync_mode, SyncMode::Full);
    }

    #[test]
    fn test_parse_empty_is_defaults() {
        assert_eq!(OpenOptions::parse("").unwrap(), OpenOptions::default());
    }

    #[test]
    fn test_parse_query_string() {
        let opts =
            OpenOptions::parse("cache_pages=64&page_size=8192&wal_sync_mode=NORMAL&checkpoint_bytes=1048576")
                .unwrap();
        assert_eq!(opts.cache_pages, 64);
        assert_eq!(opts.page_size, PageSize::S8192);
        assert_eq!(opts.wal_sync_mode, SyncMode::Normal);
        assert_eq!(opts.checkpoint_bytes, 1_048_576);
    }

    #[test]
    fn test_cache_size_alias_last_wins() {
        let opts = OpenOptions::parse("cache_size=100&cache_pages=200").unwrap();
        assert_eq!(opts.cache_pages, 200);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = OpenOptions::parse("page_sise=4096").unwrap_err();
        assert_eq!(err.kind_name(), "sql");
    }

    #[test]
    fn test_bad_page_size_rejected() {
        assert!(OpenOptions::parse("page_size=1000").is_err());
    }

    #[test]
    fn test_nosync_requires_feature() {
        let parsed = OpenOptions::parse("wal_sync_mode=TESTING_ONLY_UNSAFE_NOSYNC");
        #[cfg(feature = "unsafe-nosync")]
        assert_eq!(parsed.unwrap().wal_sync_mode, SyncMode::NoSync);
        #[cfg(not(feature = "unsafe-nosync"))]
        assert!(parsed.is_err());
    }

    #[test]
    fn test_force_truncate_bool_forms() {
        for (raw, expected) in [("true", true), ("0", false), ("on", true)] {
            let opts =
                OpenOptions::parse(&format!("force_truncate_on_timeout={raw}")).unwrap();
            assert_eq!(opts.force_truncate_on_timeout, expected);
        }
    }
}
