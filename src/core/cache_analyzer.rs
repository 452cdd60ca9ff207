/// Identifies cache entries no longer referenced by the current manifest
/// and evicts the oldest of them once usage crosses a threshold (spec
/// §4.6 `CacheAnalyzer`).
use crate::core::content_store::ContentStore;
use crate::core::error::DownloadError;
use signage_cache_protocol::{CacheReport, FileKind, FileRef, ListedFile, Manifest};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

pub struct CacheAnalyzer {
    store: Arc<ContentStore>,
    threshold: u8,
}

impl CacheAnalyzer {
    pub fn new(store: Arc<ContentStore>, threshold: u8) -> Self {
        Self { store, threshold }
    }

    /// Runs one analysis pass: partitions everything currently stored into
    /// required vs. orphaned against `manifest`, then evicts the oldest
    /// orphans until usage drops back under `threshold` percent of quota.
    /// Files still named by the manifest are never evicted, and eviction
    /// is skipped entirely when no quota is configured — there is no
    /// percentage to measure against (§4.1 "quota is unbounded").
    pub async fn analyze(&self, manifest: &Manifest) -> Result<CacheReport, DownloadError> {
        let listed = self.store.list().await?;
        let required_keys: HashSet<String> = manifest
            .files
            .iter()
            .map(|f| f.file_ref.key())
            .collect();
        let required_layout_ids: HashSet<&str> = manifest
            .files
            .iter()
            .filter(|f| f.file_ref.kind == FileKind::Layout)
            .map(|f| f.file_ref.id.as_str())
            .collect();

        let mut orphaned: Vec<ListedFile> = listed
            .into_iter()
            .filter(|f| !self.is_required(f, &required_keys, &required_layout_ids))
            .collect();
        orphaned.sort_by_key(|f| f.cached_at);

        let orphaned_size: u64 = orphaned.iter().map(|f| f.size).sum();
        let orphaned_refs: Vec<FileRef> = orphaned
            .iter()
            .map(|f| FileRef {
                kind: f.kind,
                id: f.id.clone(),
                filename: None,
            })
            .collect();

        let capacity = self.store.capacity().await?;
        let mut evicted = Vec::new();

        if let Some(quota) = capacity.quota {
            let threshold_bytes = quota.saturating_mul(self.threshold as u64) / 100;
            if capacity.usage > threshold_bytes {
                let mut remaining = capacity.usage;
                for listed_file in &orphaned {
                    if remaining <= threshold_bytes {
                        break;
                    }
                    let r = FileRef {
                        kind: listed_file.kind,
                        id: listed_file.id.clone(),
                        filename: None,
                    };
                    self.store.remove(std::slice::from_ref(&r)).await?;
                    remaining = remaining.saturating_sub(listed_file.size);
                    evicted.push(r);
                }
            }
        }

        let files = manifest.files.len() as u64 + orphaned_refs.len() as u64 - evicted.len() as u64;
        let report = CacheReport {
            timestamp: chrono::Utc::now(),
            storage: capacity,
            files,
            orphaned: orphaned_refs,
            orphaned_size,
            evicted,
            threshold: self.threshold,
        };

        info!(
            orphaned = report.orphaned.len(),
            evicted = report.evicted.len(),
            usage = report.storage.usage,
            "cache analysis complete"
        );

        Ok(report)
    }

    fn is_required(
        &self,
        listed: &ListedFile,
        required_keys: &HashSet<String>,
        required_layout_ids: &HashSet<&str>,
    ) -> bool {
        let key = format!("{}/{}", listed.kind, listed.id);
        if required_keys.contains(&key) {
            return true;
        }
        // A widget's id is packed as `layoutId/regionId/mediaId` — it is
        // required whenever its owning layout still is, even if the
        // manifest never names the widget id directly (§4.6).
        if listed.kind == FileKind::Widget {
            if let Some(layout_id) = listed.id.split('/').next() {
                if required_layout_ids.contains(layout_id) {
                    return true;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use signage_cache_protocol::{DownloadMode, RequiredFile};
    use tempfile::tempdir;

    #[tokio::test]
    async fn widget_inherits_requiredness_from_its_layout() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::with_quota(dir.path(), Some(1_000_000)).await.unwrap());

        let layout_ref = FileRef::new(FileKind::Layout, "7");
        store.put(&layout_ref, Bytes::from_static(b"xml"), "application/xml").await.unwrap();

        let widget_ref = FileRef::new(FileKind::Widget, "7/2/9".to_string());
        store.put(&widget_ref, Bytes::from_static(b"<html>"), "text/html").await.unwrap();

        let orphan_ref = FileRef::new(FileKind::Media, "999");
        store.put(&orphan_ref, Bytes::from_static(b"stale"), "video/mp4").await.unwrap();

        let manifest = Manifest {
            files: vec![RequiredFile {
                file_ref: layout_ref,
                url: "https://example.test/layout/7".into(),
                md5: None,
                size: Some(3),
                download_mode: DownloadMode::Http,
            }],
            layouts: Default::default(),
        };

        let analyzer = CacheAnalyzer::new(store, 80);
        let report = analyzer.analyze(&manifest).await.unwrap();

        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].id, "999");
    }

    #[tokio::test]
    async fn no_quota_means_no_eviction() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let orphan_ref = FileRef::new(FileKind::Media, "1");
        store.put(&orphan_ref, Bytes::from_static(b"stale"), "video/mp4").await.unwrap();

        let analyzer = CacheAnalyzer::new(store, 1);
        let report = analyzer.analyze(&Manifest::default()).await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(report.orphaned.len(), 1);
    }
}
