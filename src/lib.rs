//! Download scheduler and chunk-reassembly engine for an offline
//! signage-player content cache: fetches a host-supplied manifest of
//! media/layout/widget/static files, reassembles chunked downloads,
//! rewrites widget HTML to resolve CMS-signed resource URLs, and evicts
//! orphaned cache entries under a storage quota.

pub mod core;
pub mod network;
pub mod utils;

pub use crate::core::cache_analyzer::CacheAnalyzer;
pub use crate::core::config::Config;
pub use crate::core::content_store::ContentStore;
pub use crate::core::download_task::{DownloadTask, QueueEntry};
pub use crate::core::error::DownloadError;
pub use crate::core::file_download::FileDownload;
pub use crate::core::layout_builder::LayoutTaskBuilder;
pub use crate::core::queue::DownloadQueue;
pub use crate::core::types::{self, Priority};
pub use crate::core::widget_html::WidgetHtmlPreprocessor;
pub use signage_cache_protocol as protocol;

use protocol::{CacheReport, Capacity, DeleteResponse, FileKind, FileRef, ListedFile, Manifest, ProgressEvent};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Wires together the store, dispatch queue, and widget preprocessor
/// behind one facade — the shape a host process (or the HTTP server
/// binary) actually drives.
pub struct CacheEngine {
    config: Config,
    store: Arc<ContentStore>,
    queue: DownloadQueue,
    widget_preprocessor: WidgetHtmlPreprocessor,
    base: String,
}

impl CacheEngine {
    pub async fn new(config: Config, base: impl Into<String>) -> Result<Self, DownloadError> {
        let store = Arc::new(ContentStore::with_quota(&config.data_dir, config.quota).await?);
        let client = network::client::create_worker_client();
        let queue = DownloadQueue::new(config.clone(), store.clone(), client.clone());
        let base = base.into();
        let widget_preprocessor = WidgetHtmlPreprocessor::new(store.clone(), client, base.clone());

        Ok(Self {
            config,
            store,
            queue,
            widget_preprocessor,
            base,
        })
    }

    pub fn store(&self) -> Arc<ContentStore> {
        self.store.clone()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.queue.subscribe_progress()
    }

    /// Admits an entire manifest: each `layoutId → [mediaId]` grouping
    /// from `manifest.layouts` becomes one `LayoutTaskBuilder` batch (§4.5
    /// "one layout's worth"); files the manifest doesn't group are
    /// admitted together as a final, ungrouped batch.
    pub async fn enqueue_manifest(&self, manifest: &Manifest) -> Result<(), DownloadError> {
        let client = network::client::create_worker_client();
        let progress_tx = self.queue.progress_sender();

        let grouped_ids: HashSet<&str> = manifest
            .layouts
            .values()
            .flatten()
            .map(|s| s.as_str())
            .collect();

        for (layout_id, media_ids) in &manifest.layouts {
            let group: Vec<_> = manifest
                .files
                .iter()
                .filter(|f| {
                    media_ids.iter().any(|m| m == &f.file_ref.id)
                        || (f.file_ref.kind == FileKind::Layout && f.file_ref.id == *layout_id)
                })
                .collect();
            self.admit_group(&group, &client, progress_tx.clone()).await?;
        }

        let leftover: Vec<_> = manifest
            .files
            .iter()
            .filter(|f| {
                !grouped_ids.contains(f.file_ref.id.as_str())
                    && !manifest.layouts.contains_key(&f.file_ref.id)
            })
            .collect();
        self.admit_group(&leftover, &client, progress_tx).await?;

        Ok(())
    }

    async fn admit_group(
        &self,
        group: &[&protocol::RequiredFile],
        client: &reqwest::Client,
        progress_tx: broadcast::Sender<ProgressEvent>,
    ) -> Result<(), DownloadError> {
        if group.is_empty() {
            return Ok(());
        }
        let mut builder = LayoutTaskBuilder::new(
            self.store.clone(),
            self.config.chunk_threshold,
            self.config.chunk_size,
            progress_tx,
        );
        let next_id = || self.queue.next_task_id();
        for required in group {
            builder.add_file(required, client, &next_id).await?;
        }
        let (files, entries) = builder.build();
        self.queue.admit_batch(files, entries).await;
        Ok(())
    }

    pub async fn wait_for(&self, file_key: &str) -> Result<(), DownloadError> {
        self.queue.wait_for(file_key).await
    }

    pub async fn prioritize(&self, file_key: &str, priority: Priority) -> bool {
        self.queue.prioritize(file_key, priority).await
    }

    pub async fn urgent_chunk(&self, file_key: &str, chunk_index: u64) -> bool {
        self.queue.urgent_chunk(file_key, chunk_index).await
    }

    pub async fn clear(&self) {
        self.queue.clear().await
    }

    pub async fn remove_completed(&self) -> usize {
        self.queue.remove_completed().await
    }

    pub async fn analyze_cache(&self, manifest: &Manifest) -> Result<CacheReport, DownloadError> {
        CacheAnalyzer::new(self.store.clone(), self.config.threshold)
            .analyze(manifest)
            .await
    }

    pub async fn cache_widget_html(
        &self,
        layout_id: &str,
        region_id: &str,
        media_id: &str,
        html: &str,
    ) -> Result<(), DownloadError> {
        self.widget_preprocessor
            .cache_widget_html(layout_id, region_id, media_id, html)
            .await
    }

    pub async fn has(&self, file_ref: &FileRef) -> Result<bool, DownloadError> {
        self.store.has(file_ref).await
    }

    pub async fn get(&self, file_ref: &FileRef) -> Result<Option<(bytes::Bytes, String)>, DownloadError> {
        self.store.get(file_ref).await
    }

    pub async fn get_range(
        &self,
        file_ref: &FileRef,
        start: u64,
        end: u64,
    ) -> Result<Option<(bytes::Bytes, String)>, DownloadError> {
        self.store.get_range(file_ref, start, end).await
    }

    pub async fn put(
        &self,
        file_ref: &FileRef,
        body: bytes::Bytes,
        content_type: &str,
    ) -> Result<bool, DownloadError> {
        self.store.put(file_ref, body, content_type).await
    }

    pub async fn remove(&self, refs: &[FileRef]) -> Result<DeleteResponse, DownloadError> {
        self.store.remove(refs).await
    }

    pub async fn list(&self) -> Result<Vec<ListedFile>, DownloadError> {
        self.store.list().await
    }

    pub async fn capacity(&self) -> Result<Capacity, DownloadError> {
        self.store.capacity().await
    }

    pub fn base(&self) -> &str {
        &self.base
    }
}
