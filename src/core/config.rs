/// Engine configuration (spec §6, §9 "Dynamic configuration objects").
///
/// A plain struct with defaults. Loading it from a file or environment is
/// the host's job and out of scope here (spec §1 Non-goals).
use crate::core::types::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_THRESHOLD, DEFAULT_CONCURRENCY, DEFAULT_EVICTION_THRESHOLD,
    DEFAULT_MAX_RETRIES,
};

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum simultaneous HTTP fetches.
    pub concurrency: usize,

    /// Byte size for chunked files.
    pub chunk_size: u64,

    /// Soft cap on chunks per file, used by `LayoutTaskBuilder` when sizing.
    pub max_chunks_per_file: u64,

    /// Percent storage usage above which `CacheAnalyzer` evicts.
    pub threshold: u8,

    /// File size above which chunking is used instead of a single fetch.
    pub chunk_threshold: u64,

    /// Per-task retry budget.
    pub max_retries: u32,

    /// Directory holding the content-addressed blob store and its
    /// SQLite metadata database.
    pub data_dir: std::path::PathBuf,

    /// Directory for rolling log files. Defaults to `./logs` — the
    /// teacher hardcodes `%APPDATA%`, which only exists on Windows; a
    /// signage player is commonly embedded Linux, so this is a config
    /// field instead.
    pub log_dir: std::path::PathBuf,

    /// Storage quota in bytes, when the deployment has a fixed content
    /// partition. `None` means unbounded (§4.1 `capacity`), in which case
    /// `CacheAnalyzer` never evicts on usage percentage.
    pub quota: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunks_per_file: u64::MAX,
            threshold: DEFAULT_EVICTION_THRESHOLD,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            max_retries: DEFAULT_MAX_RETRIES,
            data_dir: std::path::PathBuf::from("./data"),
            log_dir: std::path::PathBuf::from("./logs"),
            quota: None,
        }
    }
}
