/// Network client configuration and creation.
///
/// Provides HTTP client builders with pre-configured settings for the
/// download engine, following the teacher's split between a plain
/// metadata-probe client and a worker client tuned for chunk fetches.
const USER_AGENT: &str = concat!("signage-cache-core/", env!("CARGO_PKG_VERSION"));

/// Creates an HTTP client for HEAD probes and whole-file fetches.
pub fn create_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().user_agent(USER_AGENT).build()
}

/// Creates an HTTP client for chunk-fetching worker tasks, with bounded
/// connect/read timeouts so a stalled range request doesn't hang a worker
/// slot indefinitely.
///
/// # Panics
/// Panics if the client builder fails, which only happens for invalid TLS
/// configuration — not possible with these settings.
pub fn create_worker_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("failed to build worker HTTP client")
}
