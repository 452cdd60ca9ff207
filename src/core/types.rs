/// Core download engine types and constants (spec §3, §6).
use std::collections::BTreeSet;

pub use signage_cache_protocol::{
    Capacity, DownloadMode, FileKind, FileRef, ListedFile, Manifest, RequiredFile,
};

/// Default number of simultaneous HTTP fetches (§6 `concurrency`).
pub const DEFAULT_CONCURRENCY: usize = 6;

/// Byte size for chunked files (§6 `chunkSize`).
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// File size above which chunking is used (§6 `chunkThreshold`).
pub const DEFAULT_CHUNK_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Percent storage usage above which `CacheAnalyzer` evicts (§6 `threshold`).
pub const DEFAULT_EVICTION_THRESHOLD: u8 = 80;

/// Per-task retry budget (§4.2, §6 `maxRetries`).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff schedule between retry attempts, in milliseconds (§4.2).
pub const RETRY_BACKOFF_MS: [u64; 3] = [500, 1_000, 1_500];

/// Priority of a queued task (§3 `DownloadTask.priority`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal = 0,
    High = 2,
    Urgent = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Lifecycle state of a single `DownloadTask` (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Downloading,
    Complete,
    Failed,
}

/// Lifecycle state of a `FileDownload` orchestrator (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileState {
    Pending,
    Preparing,
    Downloading,
    Complete,
    Failed,
}

/// Whether a stored file's bytes are complete or still being assembled
/// from chunks (§3 `StoredFile.completeness`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completeness {
    Whole,
    Chunked {
        total_chunks: u64,
        chunks_present: BTreeSet<u64>,
        chunk_size: u64,
    },
}

impl Completeness {
    /// §3 invariant: `exists = true` iff whole, or all chunk indices present.
    pub fn is_complete(&self) -> bool {
        match self {
            Completeness::Whole => true,
            Completeness::Chunked {
                total_chunks,
                chunks_present,
                ..
            } => chunks_present.len() as u64 == *total_chunks,
        }
    }
}

/// Persisted metadata for one cached artifact (§3 `StoredFile`).
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_ref: FileRef,
    pub size: u64,
    pub content_type: String,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub md5: Option<String>,
    pub completeness: Completeness,
}

impl StoredFile {
    pub fn exists(&self) -> bool {
        self.completeness.is_complete()
    }
}

/// Decide whether a file of the given size should be chunked, and if so
/// into how many pieces (§4.3 step 2).
pub fn chunk_plan(size: u64, chunk_threshold: u64, chunk_size: u64) -> Option<(u64, u64)> {
    if size > chunk_threshold {
        let total_chunks = size.div_ceil(chunk_size);
        Some((total_chunks, chunk_size))
    } else {
        None
    }
}

/// The inclusive byte range `[start, end]` for chunk `index` of a file of
/// `total_size` bytes chunked at `chunk_size`.
pub fn chunk_range(index: u64, total_size: u64, chunk_size: u64) -> (u64, u64) {
    let start = index * chunk_size;
    let end = (start + chunk_size - 1).min(total_size.saturating_sub(1));
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_plan_respects_threshold() {
        assert_eq!(chunk_plan(50, 100, 50), None);
        assert_eq!(chunk_plan(101, 100, 50), Some((3, 50)));
    }

    #[test]
    fn chunk_range_shortens_last_chunk() {
        assert_eq!(chunk_range(0, 120, 50), (0, 49));
        assert_eq!(chunk_range(1, 120, 50), (50, 99));
        assert_eq!(chunk_range(2, 120, 50), (100, 119));
    }

    #[test]
    fn completeness_reports_exists_per_invariant() {
        let whole = Completeness::Whole;
        assert!(whole.is_complete());

        let mut chunked = Completeness::Chunked {
            total_chunks: 2,
            chunks_present: BTreeSet::new(),
            chunk_size: 50,
        };
        assert!(!chunked.is_complete());
        if let Completeness::Chunked {
            chunks_present, ..
        } = &mut chunked
        {
            chunks_present.insert(0);
            chunks_present.insert(1);
        }
        assert!(chunked.is_complete());
    }
}
