/// One HTTP fetch unit: a whole file or a single byte-range chunk
/// (spec §3 `DownloadTask`, §4.2).
use crate::core::error::DownloadError;
use crate::core::file_download::FileDownload;
use crate::core::types::{FileRef, Priority, TaskState, RETRY_BACKOFF_MS};
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, RANGE};
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

fn state_to_u8(s: TaskState) -> u8 {
    match s {
        TaskState::Pending => 0,
        TaskState::Downloading => 1,
        TaskState::Complete => 2,
        TaskState::Failed => 3,
    }
}

fn u8_to_state(v: u8) -> TaskState {
    match v {
        1 => TaskState::Downloading,
        2 => TaskState::Complete,
        3 => TaskState::Failed,
        _ => TaskState::Pending,
    }
}

/// One fetch unit. `parent` is a non-owning back-reference (spec §3
/// Ownership): the `FileDownload` owns its `tasks` slice; the task merely
/// observes it through a `Weak` pointer so no ownership cycle forms
/// between task and file (spec §9 design notes).
pub struct DownloadTask {
    pub id: u64,
    pub file_ref: FileRef,
    pub url: AsyncMutex<String>,
    pub chunk_index: Option<u64>,
    pub range: Option<(u64, u64)>,
    priority: std::sync::atomic::AtomicU8,
    state: AtomicU8,
    pub retry_count: AtomicU32,
    pub parent: Weak<FileDownload>,
}

impl DownloadTask {
    pub fn new(
        id: u64,
        file_ref: FileRef,
        url: String,
        chunk_index: Option<u64>,
        range: Option<(u64, u64)>,
        priority: Priority,
        parent: Weak<FileDownload>,
    ) -> Self {
        Self {
            id,
            file_ref,
            url: AsyncMutex::new(url),
            chunk_index,
            range,
            priority: AtomicU8::new(priority as u8),
            state: AtomicU8::new(state_to_u8(TaskState::Pending)),
            retry_count: AtomicU32::new(0),
            parent,
        }
    }

    pub fn priority(&self) -> Priority {
        match self.priority.load(Ordering::Relaxed) {
            3 => Priority::Urgent,
            2 => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn set_priority(&self, p: Priority) {
        self.priority.store(p as u8, Ordering::Relaxed);
    }

    pub fn state(&self) -> TaskState {
        u8_to_state(self.state.load(Ordering::Acquire))
    }

    /// §3: "state must transition pending -> downloading before the first
    /// attempt and must never revert." We enforce "never revert" by only
    /// exposing forward transitions through these methods.
    fn mark_downloading(&self) {
        self.state.store(state_to_u8(TaskState::Downloading), Ordering::Release);
    }

    fn mark_complete(&self) {
        self.state.store(state_to_u8(TaskState::Complete), Ordering::Release);
    }

    fn mark_failed(&self) {
        self.state.store(state_to_u8(TaskState::Failed), Ordering::Release);
    }

    /// Runs the fetch to completion, including retry/backoff, and reports
    /// the outcome to the parent `FileDownload`. Returns the same
    /// `Result` spec §4.2 describes so the queue can log/count it too.
    pub async fn run(self: &Arc<Self>, client: &Client, max_retries: u32) -> Result<(), DownloadError> {
        self.mark_downloading();

        let mut attempt = 0u32;
        loop {
            match self.fetch_once(client).await {
                Ok(bytes) => {
                    self.mark_complete();
                    if let Some(parent) = self.parent.upgrade() {
                        parent.on_task_complete(self, bytes).await;
                    }
                    return Ok(());
                }
                Err(DownloadError::Pending(msg)) => {
                    // §4.2: a 202 is a non-fatal deferral, not a retryable
                    // failure. Surface it straight to the parent.
                    self.mark_failed();
                    if let Some(parent) = self.parent.upgrade() {
                        parent.on_task_pending(self).await;
                    }
                    return Err(DownloadError::Pending(msg));
                }
                Err(e) if e.is_retryable_at_task_level() && attempt < max_retries => {
                    self.retry_count.fetch_add(1, Ordering::Relaxed);
                    let delay = RETRY_BACKOFF_MS[attempt as usize % RETRY_BACKOFF_MS.len()];
                    warn!(task_id = self.id, attempt, error = %e, "task attempt failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                    continue;
                }
                Err(e) => {
                    self.mark_failed();
                    if let Some(parent) = self.parent.upgrade() {
                        parent.on_task_failed(self, e.clone()).await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn fetch_once(&self, client: &Client) -> Result<Bytes, DownloadError> {
        let url = self.url.lock().await.clone();
        let mut req = client.get(&url);
        if let Some((start, end)) = self.range {
            req = req.header(RANGE, format!("bytes={start}-{end}"));
        }

        let response = req.send().await?;
        let status = response.status();

        if status == StatusCode::ACCEPTED {
            return Err(DownloadError::Pending(format!(
                "server queued {} for background preparation",
                url
            )));
        }

        if self.range.is_some() {
            if status != StatusCode::PARTIAL_CONTENT {
                return Err(DownloadError::Http(format!(
                    "expected 206 Partial Content for ranged fetch, got {status}"
                )));
            }
        } else if !status.is_success() {
            return Err(DownloadError::Http(format!("unexpected status {status}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if crate::network::headers::is_unexpected_text_response(content_type.as_deref(), true) {
            return Err(DownloadError::Http(format!(
                "unexpected content-type {:?} for binary fetch",
                content_type
            )));
        }

        let bytes = response.bytes().await?;

        if let Some((start, end)) = self.range {
            let expected = (end - start + 1) as usize;
            if bytes.len() != expected {
                return Err(DownloadError::Integrity {
                    message: format!(
                        "range [{start},{end}] expected {expected} bytes, got {}",
                        bytes.len()
                    ),
                });
            }
        }

        debug!(task_id = self.id, bytes = bytes.len(), "task fetch succeeded");
        Ok(bytes)
    }
}

/// The distinguished queue-entry value for ordering barriers (spec §3
/// `QueueEntry`).
pub enum QueueEntry {
    Task(Arc<DownloadTask>),
    Barrier,
}
