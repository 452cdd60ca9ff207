/// Rewrites widget HTML to route CMS-signed resource URLs through the
/// local cache before publishing it, fetching and storing every resource
/// it references along the way (spec §4.7 `WidgetHtmlPreprocessor`).
use crate::core::content_store::ContentStore;
use crate::core::error::DownloadError;
use crate::network::headers::content_type_from_extension;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use signage_cache_protocol::FileRef;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

static BASE_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<base\b").unwrap());
static HEAD_OPEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)<head[^>]*>").unwrap());
static HEAD_CLOSE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</head>").unwrap());

// A CMS-signed resource URL: an absolute URL that routes through the xmds
// endpoint or the PWA file handler and names its payload via `file=`.
static CMS_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://[^\s"'<>]*?(?:xmds\.php|pwa/file)[^\s"'<>]*?file=([A-Za-z0-9._\-]+)[^\s"'<>]*"#).unwrap()
});

static HOST_ADDRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"hostAddress:\s*"(https?://[^"]*)""#).unwrap());

const CSS_SNIPPET_MARKER: &str = "signage-cache-normalize";
const CSS_SNIPPET: &str = "<style>/* signage-cache-normalize */ html,body{margin:0;padding:0;overflow:hidden;}</style>";

pub struct WidgetHtmlPreprocessor {
    store: Arc<ContentStore>,
    client: Client,
    base: String,
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
}

impl WidgetHtmlPreprocessor {
    pub fn new(store: Arc<ContentStore>, client: Client, base: impl Into<String>) -> Self {
        Self {
            store,
            client,
            base: base.into(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Materialises widget HTML for `(layout_id, region_id, media_id)`,
    /// rewriting and fetching every CMS-signed resource it names, and
    /// stores the result. Re-running this on already-processed HTML is a
    /// no-op beyond re-fetching resources (§4.7 idempotency).
    pub async fn cache_widget_html(
        &self,
        layout_id: &str,
        region_id: &str,
        media_id: &str,
        html: &str,
    ) -> Result<(), DownloadError> {
        let html = self.inject_base_tag(html);
        let (html, resources) = self.rewrite_cms_urls(&html);
        let html = self.inject_css_snippet(&html);
        let html = self.rewrite_host_address(&html);

        for (filename, url) in &resources {
            if let Err(e) = self.cache_static_resource(filename, url).await {
                warn!(filename = %filename, error = %e, "failed to cache widget static resource");
            }
        }

        let file_ref = FileRef::widget(layout_id, region_id, media_id);
        self.store
            .put(&file_ref, bytes::Bytes::from(html.into_bytes()), "text/html")
            .await?;
        Ok(())
    }

    fn inject_base_tag(&self, html: &str) -> String {
        if BASE_TAG_RE.is_match(html) {
            return html.to_string();
        }
        let tag = format!(r#"<base href="{}/cache/media/">"#, self.base);
        if let Some(m) = HEAD_OPEN_RE.find(html) {
            let mut out = String::with_capacity(html.len() + tag.len());
            out.push_str(&html[..m.end()]);
            out.push_str(&tag);
            out.push_str(&html[m.end()..]);
            out
        } else {
            format!("{tag}{html}")
        }
    }

    /// Rewrites CMS-signed URLs to local store paths, returning the
    /// rewritten HTML plus the `(filename, originalUrl)` pairs collected
    /// so the caller can fetch and store each one.
    fn rewrite_cms_urls(&self, html: &str) -> (String, Vec<(String, String)>) {
        Self::rewrite_cms_urls_with(&self.base, html)
    }

    fn rewrite_cms_urls_with(base: &str, html: &str) -> (String, Vec<(String, String)>) {
        let mut pairs = Vec::new();
        let rewritten = CMS_URL_RE.replace_all(html, |caps: &regex::Captures| {
            let full = caps.get(0).unwrap().as_str().to_string();
            let filename = caps.get(1).unwrap().as_str().to_string();
            pairs.push((filename.clone(), full));
            format!("{base}/cache/static/{filename}")
        });
        (rewritten.into_owned(), pairs)
    }

    fn inject_css_snippet(&self, html: &str) -> String {
        if html.contains(CSS_SNIPPET_MARKER) {
            return html.to_string();
        }
        if let Some(m) = HEAD_CLOSE_RE.find(html) {
            let mut out = String::with_capacity(html.len() + CSS_SNIPPET.len());
            out.push_str(&html[..m.start()]);
            out.push_str(CSS_SNIPPET);
            out.push_str(&html[m.start()..]);
            out
        } else {
            format!("{html}{CSS_SNIPPET}")
        }
    }

    fn rewrite_host_address(&self, html: &str) -> String {
        let base = self.base.clone();
        HOST_ADDRESS_RE
            .replace_all(html, move |caps: &regex::Captures| {
                let current = &caps[1];
                if current.starts_with(&base) {
                    caps[0].to_string()
                } else {
                    format!(r#"hostAddress: "{base}/ic""#)
                }
            })
            .into_owned()
    }

    /// Fetches and stores one static resource referenced by the widget
    /// HTML, deduplicating concurrent requests for the same filename
    /// (§4.7 step 5). For CSS, also discovers and recursively caches any
    /// fonts it references via the same CMS URL pattern.
    async fn cache_static_resource(&self, filename: &str, url: &str) -> Result<(), DownloadError> {
        let notify = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(filename) {
                let existing = existing.clone();
                drop(in_flight);
                existing.notified().await;
                return Ok(());
            }
            let notify = Arc::new(Notify::new());
            in_flight.insert(filename.to_string(), notify.clone());
            notify
        };

        let result = self.fetch_and_store_static(filename, url).await;

        self.in_flight.lock().await.remove(filename);
        notify.notify_waiters();
        result
    }

    async fn fetch_and_store_static(&self, filename: &str, url: &str) -> Result<(), DownloadError> {
        let file_ref = FileRef::new(signage_cache_protocol::FileKind::Static, filename);
        if self.store.has(&file_ref).await? {
            return Ok(());
        }

        let response = self.client.get(url).send().await?;
        let content_type = content_type_from_extension(filename);
        let body = response.bytes().await?;

        if content_type == "text/css" {
            let text = String::from_utf8_lossy(&body).into_owned();
            let (rewritten, fonts) = Self::rewrite_cms_urls_with(&self.base, &text);
            for (font_name, font_url) in fonts {
                debug!(font = %font_name, "recursively caching widget font referenced by CSS");
                Box::pin(self.cache_static_resource(&font_name, &font_url)).await?;
            }
            self.store
                .put(&file_ref, bytes::Bytes::from(rewritten.into_bytes()), content_type)
                .await?;
        } else {
            self.store.put(&file_ref, body, content_type).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn preprocessor(store: Arc<ContentStore>) -> WidgetHtmlPreprocessor {
        WidgetHtmlPreprocessor::new(store, crate::network::client::create_worker_client(), "http://localhost:9505")
    }

    #[tokio::test]
    async fn injects_base_tag_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let p = preprocessor(store);

        let html = "<html><head></head><body>hi</body></html>";
        let once = p.inject_base_tag(html);
        assert!(once.contains("<base href="));

        let twice = p.inject_base_tag(&once);
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn css_snippet_injection_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let p = preprocessor(store);

        let html = "<html><head></head><body></body></html>";
        let once = p.inject_css_snippet(html);
        let twice = p.inject_css_snippet(&once);
        assert_eq!(once, twice);
        assert_eq!(once.matches(CSS_SNIPPET_MARKER).count(), 1);
    }

    #[tokio::test]
    async fn rewrites_cms_signed_url_and_collects_filename() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let p = preprocessor(store);

        let html = r#"<img src="https://cms.example.test/xmds.php?file=logo.png&sig=abc">"#;
        let (rewritten, pairs) = p.rewrite_cms_urls(html);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "logo.png");
        assert!(rewritten.contains("http://localhost:9505/cache/static/logo.png"));
    }

    #[tokio::test]
    async fn host_address_rewrite_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ContentStore::new(dir.path()).await.unwrap());
        let p = preprocessor(store);

        let html = r#"var cfg = { hostAddress: "https://cms.example.test" };"#;
        let once = p.rewrite_host_address(html);
        assert!(once.contains(r#"hostAddress: "http://localhost:9505/ic""#));
        let twice = p.rewrite_host_address(&once);
        assert_eq!(once, twice);
    }
}
