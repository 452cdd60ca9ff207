/// Typed, URL-addressable blob store indexed by `(type, id)` (spec §4.1).
///
/// Blobs live as individual files under `data_dir/blobs/`; metadata lives in
/// a small SQLite table (`rusqlite`, as the teacher already depends on for
/// download-state persistence — here generalized from one sidecar file per
/// in-flight download into a single table covering every stored file).
use crate::core::error::DownloadError;
use crate::core::types::{Capacity, Completeness, FileRef, ListedFile, StoredFile};
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct ContentStore {
    blobs_dir: PathBuf,
    conn: Mutex<Connection>,
    /// Per-key write lock, so chunk appends to the same file are serialised
    /// while distinct files write concurrently (§4.1 invariant b).
    write_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    quota: Option<u64>,
}

fn blob_filename(key: &str) -> String {
    sanitize_filename::sanitize(key.replace('/', "__"))
}

impl ContentStore {
    pub async fn new(data_dir: &std::path::Path) -> Result<Self, DownloadError> {
        Self::with_quota(data_dir, None).await
    }

    pub async fn with_quota(
        data_dir: &std::path::Path,
        quota: Option<u64>,
    ) -> Result<Self, DownloadError> {
        let blobs_dir = data_dir.join("blobs");
        tokio::fs::create_dir_all(&blobs_dir).await?;

        let db_path = data_dir.join("store.sqlite");
        let conn = Connection::open(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS stored_files (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                size INTEGER NOT NULL,
                content_type TEXT NOT NULL,
                cached_at TEXT NOT NULL,
                md5 TEXT,
                completeness TEXT NOT NULL,
                total_chunks INTEGER,
                chunk_size INTEGER,
                chunks_present TEXT
            )",
            [],
        )?;

        Ok(Self {
            blobs_dir,
            conn: Mutex::new(conn),
            write_locks: Mutex::new(HashMap::new()),
            quota,
        })
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.blobs_dir.join(blob_filename(key))
    }

    /// `ContentStore.has(type, id) -> bool`: true iff a complete
    /// `StoredFile` exists.
    pub async fn has(&self, file_ref: &FileRef) -> Result<bool, DownloadError> {
        Ok(self
            .read_metadata(&file_ref.key())
            .await?
            .map(|f| f.exists())
            .unwrap_or(false))
    }

    /// `ContentStore.get(type, id) -> Blob | null`.
    pub async fn get(&self, file_ref: &FileRef) -> Result<Option<(Bytes, String)>, DownloadError> {
        let key = file_ref.key();
        let Some(meta) = self.read_metadata(&key).await? else {
            return Ok(None);
        };
        if !meta.exists() {
            return Ok(None);
        }
        let bytes = tokio::fs::read(self.blob_path(&key)).await?;
        Ok(Some((Bytes::from(bytes), meta.content_type)))
    }

    /// Range-read support backing `GET {BASE}/cache/{type}/{id}` with a
    /// `Range` header (§6 storage-layout invariant).
    pub async fn get_range(
        &self,
        file_ref: &FileRef,
        start: u64,
        end: u64,
    ) -> Result<Option<(Bytes, String)>, DownloadError> {
        let key = file_ref.key();
        let Some(meta) = self.read_metadata(&key).await? else {
            return Ok(None);
        };
        if !meta.exists() {
            return Ok(None);
        }
        use tokio::io::AsyncReadExt;
        let mut file = tokio::fs::File::open(self.blob_path(&key)).await?;
        let len = (end - start + 1) as usize;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        Ok(Some((Bytes::from(buf), meta.content_type)))
    }

    /// `ContentStore.put(type, id, body, contentType) -> bool`: atomic
    /// whole-file write.
    pub async fn put(
        &self,
        file_ref: &FileRef,
        body: Bytes,
        content_type: &str,
    ) -> Result<bool, DownloadError> {
        let key = file_ref.key();
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;

        let path = self.blob_path(&key);
        let tmp_path = path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp_path, &body).await {
            warn!(key = %key, error = %e, "failed writing blob");
            return Err(DownloadError::from(e));
        }
        tokio::fs::rename(&tmp_path, &path).await?;

        self.write_metadata(StoredFile {
            file_ref: file_ref.clone(),
            size: body.len() as u64,
            content_type: content_type.to_string(),
            cached_at: chrono::Utc::now(),
            md5: None,
            completeness: Completeness::Whole,
        })
        .await?;

        debug!(key = %key, bytes = body.len(), "stored whole file");
        Ok(true)
    }

    /// `ContentStore.appendChunk(...)`: idempotent chunk write; updates
    /// `chunksPresent`; transitions to `whole` once every chunk is present.
    pub async fn append_chunk(
        &self,
        file_ref: &FileRef,
        index: u64,
        total_chunks: u64,
        chunk_size: u64,
        total_size: u64,
        content_type: &str,
        bytes: Bytes,
    ) -> Result<(), DownloadError> {
        let key = file_ref.key();
        let lock = self.lock_for(&key).await;
        let _guard = lock.lock().await;

        let path = self.blob_path(&key);
        if !path.exists() {
            let file = tokio::fs::File::create(&path).await?;
            file.set_len(total_size).await?;
        }

        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.seek(std::io::SeekFrom::Start(index * chunk_size)).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;

        let mut meta = self
            .read_metadata(&key)
            .await?
            .unwrap_or_else(|| StoredFile {
                file_ref: file_ref.clone(),
                size: total_size,
                content_type: content_type.to_string(),
                cached_at: chrono::Utc::now(),
                md5: None,
                completeness: Completeness::Chunked {
                    total_chunks,
                    chunks_present: BTreeSet::new(),
                    chunk_size,
                },
            });

        if let Completeness::Chunked {
            chunks_present, ..
        } = &mut meta.completeness
        {
            chunks_present.insert(index);
            if chunks_present.len() as u64 == total_chunks {
                meta.completeness = Completeness::Whole;
                meta.cached_at = chrono::Utc::now();
            }
        }

        self.write_metadata(meta).await
    }

    /// `ContentStore.remove(refs) -> {deleted, total}`: best-effort batch
    /// delete.
    pub async fn remove(
        &self,
        refs: &[FileRef],
    ) -> Result<signage_cache_protocol::DeleteResponse, DownloadError> {
        let total = refs.len() as u64;
        let mut deleted = 0u64;
        for r in refs {
            let key = r.key();
            let path = self.blob_path(&key);
            let _ = tokio::fs::remove_file(&path).await;
            let conn = self.conn.lock().await;
            let n = conn
                .execute("DELETE FROM stored_files WHERE key = ?1", params![key])
                .unwrap_or(0);
            if n > 0 {
                deleted += 1;
            }
        }
        Ok(signage_cache_protocol::DeleteResponse { deleted, total })
    }

    /// `ContentStore.list() -> [{id, type, size, cachedAt}]`.
    pub async fn list(&self) -> Result<Vec<ListedFile>, DownloadError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT kind, id, size, cached_at FROM stored_files")?;
        let rows = stmt
            .query_map([], |row| {
                let kind: String = row.get(0)?;
                let id: String = row.get(1)?;
                let size: i64 = row.get(2)?;
                let cached_at: String = row.get(3)?;
                Ok((kind, id, size, cached_at))
            })?
            .filter_map(|r| r.ok())
            .filter_map(|(kind, id, size, cached_at)| {
                let kind = kind.parse().ok()?;
                let cached_at = cached_at.parse().ok()?;
                Some(ListedFile {
                    id,
                    kind,
                    size: size as u64,
                    cached_at,
                })
            })
            .collect();
        Ok(rows)
    }

    /// `ContentStore.capacity() -> {usage, quota}`. `quota` is whatever was
    /// configured at construction time, or `None` when the deployment
    /// exposes no limit (§4.1: "`quota` is unbounded when the platform does
    /// not expose a limit").
    pub async fn capacity(&self) -> Result<Capacity, DownloadError> {
        let conn = self.conn.lock().await;
        let usage: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM stored_files",
            [],
            |row| row.get(0),
        )?;

        Ok(Capacity {
            usage: usage as u64,
            quota: self.quota,
        })
    }

    async fn read_metadata(&self, key: &str) -> Result<Option<StoredFile>, DownloadError> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT kind, id, size, content_type, cached_at, md5, completeness,
                        total_chunks, chunk_size, chunks_present
                 FROM stored_files WHERE key = ?1",
                params![key],
                |row| {
                    let kind: String = row.get(0)?;
                    let id: String = row.get(1)?;
                    let size: i64 = row.get(2)?;
                    let content_type: String = row.get(3)?;
                    let cached_at: String = row.get(4)?;
                    let md5: Option<String> = row.get(5)?;
                    let completeness: String = row.get(6)?;
                    let total_chunks: Option<i64> = row.get(7)?;
                    let chunk_size: Option<i64> = row.get(8)?;
                    let chunks_present: Option<String> = row.get(9)?;
                    Ok((
                        kind,
                        id,
                        size,
                        content_type,
                        cached_at,
                        md5,
                        completeness,
                        total_chunks,
                        chunk_size,
                        chunks_present,
                    ))
                },
            )
            .optional()?;

        let Some((
            kind,
            id,
            size,
            content_type,
            cached_at,
            md5,
            completeness,
            total_chunks,
            chunk_size,
            chunks_present,
        )) = row
        else {
            return Ok(None);
        };

        let kind = kind
            .parse()
            .map_err(|e: String| DownloadError::Io(e))?;
        let cached_at = cached_at
            .parse()
            .map_err(|e: chrono::ParseError| DownloadError::Io(e.to_string()))?;

        let completeness = if completeness == "whole" {
            Completeness::Whole
        } else {
            let total_chunks = total_chunks.unwrap_or(0) as u64;
            let chunk_size = chunk_size.unwrap_or(0) as u64;
            let chunks_present: BTreeSet<u64> = chunks_present
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.is_empty())
                .filter_map(|s| s.parse().ok())
                .collect();
            Completeness::Chunked {
                total_chunks,
                chunks_present,
                chunk_size,
            }
        };

        Ok(Some(StoredFile {
            file_ref: FileRef {
                kind,
                id,
                filename: None,
            },
            size: size as u64,
            content_type,
            cached_at,
            md5,
            completeness,
        }))
    }

    async fn write_metadata(&self, meta: StoredFile) -> Result<(), DownloadError> {
        let key = meta.file_ref.key();
        let (completeness, total_chunks, chunk_size, chunks_present) = match &meta.completeness {
            Completeness::Whole => ("whole".to_string(), None, None, None),
            Completeness::Chunked {
                total_chunks,
                chunks_present,
                chunk_size,
            } => (
                "chunked".to_string(),
                Some(*total_chunks as i64),
                Some(*chunk_size as i64),
                Some(
                    chunks_present
                        .iter()
                        .map(|i| i.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                ),
            ),
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO stored_files
                (key, kind, id, size, content_type, cached_at, md5, completeness,
                 total_chunks, chunk_size, chunks_present)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(key) DO UPDATE SET
                size=excluded.size, content_type=excluded.content_type,
                cached_at=excluded.cached_at, md5=excluded.md5,
                completeness=excluded.completeness, total_chunks=excluded.total_chunks,
                chunk_size=excluded.chunk_size, chunks_present=excluded.chunks_present",
            params![
                key,
                meta.file_ref.kind.to_string(),
                meta.file_ref.id,
                meta.size as i64,
                meta.content_type,
                meta.cached_at.to_rfc3339(),
                meta.md5,
                completeness,
                total_chunks,
                chunk_size,
                chunks_present,
            ],
        )?;
        Ok(())
    }

    /// Delete just the blob + row for one key, used by `FileDownload` when
    /// MD5 verification fails (§4.3 `Integrity`).
    pub async fn delete_one(&self, file_ref: &FileRef) -> Result<(), DownloadError> {
        self.remove(std::slice::from_ref(file_ref)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signage_cache_protocol::FileKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path()).await.unwrap();
        let r = FileRef::new(FileKind::Media, "1");

        assert!(!store.has(&r).await.unwrap());
        store
            .put(&r, Bytes::from_static(b"hello"), "image/jpeg")
            .await
            .unwrap();
        assert!(store.has(&r).await.unwrap());

        let (bytes, ct) = store.get(&r).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"hello");
        assert_eq!(ct, "image/jpeg");
    }

    #[tokio::test]
    async fn chunks_in_any_order_reassemble() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path()).await.unwrap();
        let r = FileRef::new(FileKind::Media, "big");

        let chunk_size = 4u64;
        let total_size = 10u64; // 3 chunks: [0..4), [4..8), [8..10)
        let total_chunks = 3u64;
        let chunks = [
            (1u64, Bytes::from_static(b"DDDD")),
            (0u64, Bytes::from_static(b"AAAA")),
            (2u64, Bytes::from_static(b"GG")),
        ];
        for (idx, bytes) in chunks {
            store
                .append_chunk(&r, idx, total_chunks, chunk_size, total_size, "video/mp4", bytes)
                .await
                .unwrap();
        }

        assert!(store.has(&r).await.unwrap());
        let (bytes, _) = store.get(&r).await.unwrap().unwrap();
        assert_eq!(&bytes[..], b"AAAADDDDGG");
    }

    #[tokio::test]
    async fn missing_file_is_none_not_error() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path()).await.unwrap();
        let r = FileRef::new(FileKind::Media, "absent");
        assert_eq!(store.get(&r).await.unwrap(), None);
    }

    #[tokio::test]
    async fn remove_reports_counts() {
        let dir = tempdir().unwrap();
        let store = ContentStore::new(dir.path()).await.unwrap();
        let a = FileRef::new(FileKind::Media, "a");
        let b = FileRef::new(FileKind::Media, "b");
        store.put(&a, Bytes::from_static(b"x"), "x").await.unwrap();

        let resp = store.remove(&[a, b]).await.unwrap();
        assert_eq!(resp.total, 2);
        assert_eq!(resp.deleted, 1);
    }
}
