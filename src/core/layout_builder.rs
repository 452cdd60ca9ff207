/// Builds one ordered task batch for a layout's worth of required files
/// (spec §4.5 `LayoutTaskBuilder`).
///
/// The ordering rule: all whole-file tasks first, smallest file first (so a
/// layout's small static assets land before its video); then, for every
/// chunked file, its first and last chunk (so the player can start and can
/// probe the tail immediately); then a `Barrier`; then every remaining
/// chunk. The barrier is omitted entirely when nothing needed chunking.
use crate::core::content_store::ContentStore;
use crate::core::download_task::{DownloadTask, QueueEntry};
use crate::core::error::DownloadError;
use crate::core::file_download::FileDownload;
use reqwest::Client;
use signage_cache_protocol::{ProgressEvent, RequiredFile};
use std::sync::Arc;
use tokio::sync::broadcast;

pub struct LayoutTaskBuilder {
    store: Arc<ContentStore>,
    chunk_threshold: u64,
    chunk_size: u64,
    progress_tx: broadcast::Sender<ProgressEvent>,
    whole: Vec<(Arc<FileDownload>, Arc<DownloadTask>)>,
    chunked: Vec<(Arc<FileDownload>, Vec<Arc<DownloadTask>>)>,
}

impl LayoutTaskBuilder {
    pub fn new(
        store: Arc<ContentStore>,
        chunk_threshold: u64,
        chunk_size: u64,
        progress_tx: broadcast::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            store,
            chunk_threshold,
            chunk_size,
            progress_tx,
            whole: Vec::new(),
            chunked: Vec::new(),
        }
    }

    /// Prepares `required` and registers it with the builder. Files
    /// already complete in the store produce no tasks and are skipped.
    pub async fn add_file(
        &mut self,
        required: &RequiredFile,
        client: &Client,
        next_task_id: &impl Fn() -> u64,
    ) -> Result<(), DownloadError> {
        let file = FileDownload::new(required, self.store.clone(), self.progress_tx.clone());
        let tasks = file
            .prepare(client, self.chunk_threshold, self.chunk_size, next_task_id)
            .await?;

        if tasks.is_empty() {
            return Ok(());
        }

        if tasks.len() == 1 && tasks[0].chunk_index.is_none() {
            self.whole.push((file, tasks.into_iter().next().unwrap()));
        } else {
            self.chunked.push((file, tasks));
        }
        Ok(())
    }

    /// Produces the ordered entries and the full set of `FileDownload`s
    /// this batch touched, ready for `DownloadQueue::admit_batch`.
    pub fn build(mut self) -> (Vec<Arc<FileDownload>>, Vec<QueueEntry>) {
        self.whole
            .sort_by_key(|(f, _)| f.total_size.load(std::sync::atomic::Ordering::Relaxed));

        let mut files = Vec::new();
        let mut entries = Vec::new();

        for (file, task) in &self.whole {
            files.push(file.clone());
            entries.push(QueueEntry::Task(task.clone()));
        }

        if !self.chunked.is_empty() {
            for (file, tasks) in &self.chunked {
                files.push(file.clone());
                entries.push(QueueEntry::Task(tasks.first().unwrap().clone()));
                if tasks.len() > 1 {
                    entries.push(QueueEntry::Task(tasks.last().unwrap().clone()));
                }
            }

            entries.push(QueueEntry::Barrier);

            for (_, tasks) in &self.chunked {
                let remaining = if tasks.len() > 2 {
                    &tasks[1..tasks.len() - 1]
                } else {
                    &[][..]
                };
                for t in remaining {
                    entries.push(QueueEntry::Task(t.clone()));
                }
            }
        }

        (files, entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use signage_cache_protocol::FileRef;
    use signage_cache_protocol::FileKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn no_chunked_files_omits_barrier() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let (tx, _rx) = broadcast::channel(16);
        let cfg = Config::default();
        let mut builder = LayoutTaskBuilder::new(store, cfg.chunk_threshold, cfg.chunk_size, tx);

        let required = RequiredFile {
            file_ref: FileRef::new(FileKind::Static, "a"),
            url: "https://example.test/a.png".into(),
            md5: None,
            size: Some(10),
            download_mode: signage_cache_protocol::DownloadMode::Http,
        };
        let client = crate::network::client::create_worker_client();
        let counter = std::sync::atomic::AtomicU64::new(1);
        let next_id = || counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        builder.add_file(&required, &client, &next_id).await.unwrap();

        let (files, entries) = builder.build();
        assert_eq!(files.len(), 1);
        assert!(entries.iter().all(|e| matches!(e, QueueEntry::Task(_))));
    }
}
