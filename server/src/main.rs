//! HTTP surface for the signage content cache: the local URL namespace a
//! rendering engine uses to read cached bytes, and the store endpoints a
//! host process uses to populate the cache (spec §6).
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use signage_cache_core::protocol::{DeleteRequest, FileKind, FileRef, ListResponse};
use signage_cache_core::{CacheEngine, Config};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

#[derive(Clone)]
struct AppState {
    engine: Arc<CacheEngine>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config {
        data_dir: std::env::var("SIGNAGE_CACHE_DATA_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("./data")),
        log_dir: std::env::var("SIGNAGE_CACHE_LOG_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| std::path::PathBuf::from("./logs")),
        quota: std::env::var("SIGNAGE_CACHE_QUOTA_BYTES")
            .ok()
            .and_then(|v| v.parse().ok()),
        ..Config::default()
    };

    let _guard = signage_cache_core::utils::logger::init_logger(&config)
        .map_err(|e| anyhow::anyhow!("failed to initialize logger: {e}"))?;

    let base = std::env::var("SIGNAGE_CACHE_BASE").unwrap_or_else(|_| String::new());
    let port: u16 = std::env::var("SIGNAGE_CACHE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(9505);

    let engine = Arc::new(CacheEngine::new(config, base.clone()).await?);
    let state = AppState { engine };

    let app = Router::new()
        .route("/cache/:type/:id", get(get_cache).head(head_cache))
        .route("/store/:type/:id", put(put_store))
        .route(
            "/store/widget/:layout_id/:region_id/:media_id",
            put(put_widget),
        )
        .route("/store/delete", post(post_delete))
        .route("/store/list", get(get_list))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let app = if base.is_empty() {
        app
    } else {
        Router::new().nest(&base, app)
    };

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, base = %base, "signage cache server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn parse_file_ref(kind: &str, id: &str) -> Result<FileRef, StatusCode> {
    let kind: FileKind = kind.parse().map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(FileRef {
        kind,
        id: id.to_string(),
        filename: None,
    })
}

fn parse_range(headers: &HeaderMap, total: u64) -> Option<(u64, u64)> {
    let raw = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = raw.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        total.saturating_sub(1)
    } else {
        end.parse().ok()?
    };
    if start > end || end >= total {
        return None;
    }
    Some((start, end))
}

async fn get_cache(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let file_ref = match parse_file_ref(&kind, &id) {
        Ok(r) => r,
        Err(code) => return code.into_response(),
    };

    match state.engine.get(&file_ref).await {
        Ok(Some((bytes, content_type))) => {
            let total = bytes.len() as u64;
            if let Some((start, end)) = parse_range(&headers, total) {
                match state.engine.get_range(&file_ref, start, end).await {
                    Ok(Some((slice, _))) => {
                        let mut resp = (
                            StatusCode::PARTIAL_CONTENT,
                            [
                                (header::CONTENT_TYPE, content_type),
                                (
                                    header::CONTENT_RANGE,
                                    format!("bytes {start}-{end}/{total}"),
                                ),
                            ],
                            slice,
                        )
                            .into_response();
                        resp.headers_mut()
                            .insert(header::ACCEPT_RANGES, "bytes".parse().unwrap());
                        return resp;
                    }
                    _ => return StatusCode::NOT_FOUND.into_response(),
                }
            }
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], bytes).into_response()
        }
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, "GET /cache failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn head_cache(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let file_ref = match parse_file_ref(&kind, &id) {
        Ok(r) => r,
        Err(code) => return code.into_response(),
    };
    match state.engine.get(&file_ref).await {
        Ok(Some((bytes, content_type))) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type),
                (header::CONTENT_LENGTH, bytes.len().to_string()),
            ],
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(error = %e, "HEAD /cache failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn put_store(
    State(state): State<AppState>,
    Path((kind, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let file_ref = match parse_file_ref(&kind, &id) {
        Ok(r) => r,
        Err(code) => return code.into_response(),
    };
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    match state.engine.put(&file_ref, body, content_type).await {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "PUT /store failed");
            StatusCode::INSUFFICIENT_STORAGE.into_response()
        }
    }
}

async fn put_widget(
    State(state): State<AppState>,
    Path((layout_id, region_id, media_id)): Path<(String, String, String)>,
    body: axum::body::Bytes,
) -> Response {
    let html = String::from_utf8_lossy(&body).into_owned();
    match state
        .engine
        .cache_widget_html(&layout_id, &region_id, &media_id, &html)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "PUT /store/widget failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn post_delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> Response {
    match state.engine.remove(&req.files).await {
        Ok(resp) => Json(resp).into_response(),
        Err(e) => {
            error!(error = %e, "POST /store/delete failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn get_list(State(state): State<AppState>, Query(_params): Query<HashMap<String, String>>) -> Response {
    match state.engine.list().await {
        Ok(files) => Json(ListResponse { files }).into_response(),
        Err(e) => {
            error!(error = %e, "GET /store/list failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
