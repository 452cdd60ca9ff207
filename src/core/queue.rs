/// The flat, barrier-respecting FIFO dispatch queue shared across every
/// in-flight file (spec §3 `DownloadQueue`, §4.4).
///
/// Deliberately *not* a priority heap: ordering is FIFO except where a
/// `Barrier` entry holds later tasks back until everything ahead of it has
/// completed, and `urgent_chunk` physically relocates one task ahead of the
/// next barrier for latency-sensitive requests (e.g. the chunk the player
/// is blocked on right now).
use crate::core::config::Config;
use crate::core::content_store::ContentStore;
use crate::core::download_task::{DownloadTask, QueueEntry};
use crate::core::error::DownloadError;
use crate::core::file_download::FileDownload;
use crate::core::types::Priority;
use reqwest::Client;
use signage_cache_protocol::ProgressEvent;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

pub struct DownloadQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    config: Config,
    store: Arc<ContentStore>,
    client: Client,
    entries: Mutex<VecDeque<QueueEntry>>,
    active_files: Mutex<HashMap<String, Arc<FileDownload>>>,
    running: AtomicUsize,
    next_task_id: AtomicU64,
    dispatch_lock: Mutex<()>,
    progress_tx: broadcast::Sender<ProgressEvent>,
}

impl DownloadQueue {
    pub fn new(config: Config, store: Arc<ContentStore>, client: Client) -> Self {
        let (progress_tx, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(QueueInner {
                config,
                store,
                client,
                entries: Mutex::new(VecDeque::new()),
                active_files: Mutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                next_task_id: AtomicU64::new(1),
                dispatch_lock: Mutex::new(()),
                progress_tx,
            }),
        }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress_tx.subscribe()
    }

    /// Registers a freshly prepared `FileDownload` and its ordered task
    /// list (as built by `LayoutTaskBuilder`), then kicks the dispatch
    /// loop. Files already active or already stored are silently skipped
    /// (§4.4 admission/dedup), except that a changed URL is hot-swapped
    /// into the existing `FileDownload` so a refreshed signed URL takes
    /// effect without restarting the download.
    pub async fn admit(
        &self,
        file: Arc<FileDownload>,
        tasks: Vec<Arc<DownloadTask>>,
        url: &str,
    ) -> bool {
        let key = file.file_ref.key();
        let mut active = self.inner.active_files.lock().await;
        if let Some(existing) = active.get(&key) {
            let current = existing.url.read().await.clone();
            if crate::core::url_expiry::expires_later(url, &current) {
                existing.refresh_url(url.to_string()).await;
            }
            return false;
        }
        active.insert(key, file.clone());
        drop(active);

        if !tasks.is_empty() {
            let mut entries = self.inner.entries.lock().await;
            entries.extend(tasks.into_iter().map(QueueEntry::Task));
        }
        self.dispatch().await;
        true
    }

    /// Appends a pre-ordered batch produced by `LayoutTaskBuilder` —
    /// chunk0, last chunk, `Barrier`, remaining chunks — across several
    /// files in one layout (§4.5).
    pub async fn enqueue_ordered_tasks(&self, entries: Vec<QueueEntry>) {
        let mut q = self.inner.entries.lock().await;
        q.extend(entries);
        drop(q);
        self.dispatch().await;
    }

    /// Registers every `FileDownload` in a `LayoutTaskBuilder` batch into
    /// the active set, then enqueues its pre-ordered task list in one shot
    /// (§4.5). Files already active are left untouched — `LayoutTaskBuilder`
    /// only emits tasks for files it was asked to prepare, which already
    /// excludes anything the caller knew was cached or in flight.
    pub async fn admit_batch(&self, files: Vec<Arc<FileDownload>>, entries: Vec<QueueEntry>) {
        let mut active = self.inner.active_files.lock().await;
        for f in files {
            active.entry(f.file_ref.key()).or_insert(f);
        }
        drop(active);
        self.enqueue_ordered_tasks(entries).await;
    }

    pub fn next_task_id(&self) -> u64 {
        self.inner.next_task_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn store(&self) -> Arc<ContentStore> {
        self.inner.store.clone()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn progress_sender(&self) -> broadcast::Sender<ProgressEvent> {
        self.inner.progress_tx.clone()
    }

    /// Bumps every un-started queued task for `file_key` to `priority`
    /// (§4.4 `prioritize`). The queue's FIFO order itself is unchanged —
    /// `priority` here is metadata the dispatcher may use as a tie-break;
    /// only `urgent_chunk` physically reorders entries. Returns `true` if
    /// the file is running, queued (and boosted), or already active;
    /// `false` if the file is unknown to the queue.
    pub async fn prioritize(&self, file_key: &str, priority: Priority) -> bool {
        let entries = self.inner.entries.lock().await;
        let mut found = false;
        for e in entries.iter() {
            if let QueueEntry::Task(t) = e {
                if t.file_ref.key() == file_key {
                    t.set_priority(priority);
                    found = true;
                }
            }
        }
        drop(entries);
        if found {
            return true;
        }
        self.inner.active_files.lock().await.contains_key(file_key)
    }

    /// Relocates the task for `file_key`'s chunk `chunk_index` to the very
    /// front of the queue, ahead of any barrier, and marks it `Urgent`
    /// (§4.4 barrier-bypass for latency-sensitive chunk requests).
    pub async fn urgent_chunk(&self, file_key: &str, chunk_index: u64) -> bool {
        let mut entries = self.inner.entries.lock().await;
        let pos = entries.iter().position(|e| match e {
            QueueEntry::Task(t) => t.file_ref.key() == file_key && t.chunk_index == Some(chunk_index),
            QueueEntry::Barrier => false,
        });
        let Some(pos) = pos else { return false };
        if let Some(QueueEntry::Task(t)) = entries.remove(pos) {
            t.set_priority(Priority::Urgent);
            entries.push_front(QueueEntry::Task(t));
            drop(entries);
            self.dispatch().await;
            true
        } else {
            false
        }
    }

    /// Blocks the caller until `file_key` reaches a terminal state.
    pub async fn wait_for(&self, file_key: &str) -> Result<(), DownloadError> {
        let file = self.inner.active_files.lock().await.get(file_key).cloned();
        match file {
            Some(f) => f.wait().await,
            None => {
                if self.inner.store.has(&Self::key_to_ref(file_key)).await? {
                    Ok(())
                } else {
                    Err(DownloadError::Cancelled(format!("{file_key} is not queued")))
                }
            }
        }
    }

    fn key_to_ref(key: &str) -> signage_cache_protocol::FileRef {
        let mut parts = key.splitn(2, '/');
        let kind = parts.next().unwrap_or("").parse().unwrap_or(signage_cache_protocol::FileKind::Static);
        let id = parts.next().unwrap_or("").to_string();
        signage_cache_protocol::FileRef { kind, id, filename: None }
    }

    /// Drops every not-yet-dispatched entry and clears the active set.
    /// In-flight tasks are left running to completion (§4.4 `clear`,
    /// §7 `Cancelled`): their writes still land, but the queue no longer
    /// tracks them, so a fresh `admit` for the same file starts over.
    pub async fn clear(&self) {
        let mut entries = self.inner.entries.lock().await;
        entries.clear();
        drop(entries);

        let mut active = self.inner.active_files.lock().await;
        let files: Vec<_> = active.drain().map(|(_, f)| f).collect();
        drop(active);

        for f in files {
            f.cancel_pending().await;
        }
        self.inner.running.store(0, Ordering::Relaxed);
        info!("download queue cleared");
    }

    /// Drops `FileDownload`s that have reached a terminal state from the
    /// active set, so long-running deployments don't leak memory
    /// (§4.4 `removeCompleted`).
    pub async fn remove_completed(&self) -> usize {
        let mut active = self.inner.active_files.lock().await;
        let before = active.len();
        active.retain(|_, f| {
            !matches!(
                f.state(),
                crate::core::types::FileState::Complete | crate::core::types::FileState::Failed
            )
        });
        before - active.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.active_files.lock().await.len()
    }

    /// Pulls entries from the front while concurrency allows, honoring the
    /// barrier gate: a `Barrier` at the front blocks further dispatch until
    /// every task already running has finished.
    async fn dispatch(&self) {
        let _guard = self.inner.dispatch_lock.lock().await;
        loop {
            if self.inner.running.load(Ordering::Acquire) >= self.inner.config.concurrency {
                return;
            }

            let mut entries = self.inner.entries.lock().await;
            match entries.front() {
                None => return,
                Some(QueueEntry::Barrier) => {
                    if self.inner.running.load(Ordering::Acquire) == 0 {
                        entries.pop_front();
                        continue;
                    }
                    return;
                }
                Some(QueueEntry::Task(_)) => {
                    let Some(QueueEntry::Task(task)) = entries.pop_front() else {
                        unreachable!()
                    };
                    drop(entries);
                    self.spawn_task(task);
                }
            }
        }
    }

    fn spawn_task(&self, task: Arc<DownloadTask>) {
        self.inner.running.fetch_add(1, Ordering::AcqRel);
        let inner = self.inner.clone();
        let client = self.inner.client.clone();
        let max_retries = self.inner.config.max_retries;
        tokio::spawn(async move {
            let id = task.id;
            debug!(task_id = id, file = %task.file_ref.key(), "dispatching task");
            let _ = task.run(&client, max_retries).await;
            inner.running.fetch_sub(1, Ordering::AcqRel);
            let queue = DownloadQueue { inner: inner.clone() };
            queue.dispatch().await;
        });
    }
}

impl Clone for DownloadQueue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileRef;
    use signage_cache_protocol::FileKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn barrier_blocks_dispatch_until_running_tasks_drain() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let client = crate::network::client::create_worker_client();
        let queue = DownloadQueue::new(Config::default(), store, client);

        // A barrier with nothing running ahead of it should be consumed
        // immediately, leaving the queue empty.
        queue.enqueue_ordered_tasks(vec![QueueEntry::Barrier]).await;
        assert_eq!(queue.inner.entries.lock().await.len(), 0);
    }

    #[tokio::test]
    async fn prioritize_reports_false_for_unknown_file() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let client = crate::network::client::create_worker_client();
        let queue = DownloadQueue::new(Config::default(), store, client);
        assert!(!queue.prioritize("media/missing", Priority::Urgent).await);
        let _ = FileRef::new(FileKind::Media, "missing");
    }
}
