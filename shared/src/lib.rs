//! Wire DTOs shared between `signage-cache-core` and `signage-cache-server`.
//!
//! These mirror the manifest and local-URL-namespace shapes of §3 and §6
//! of the specification: the host hands the engine a `Manifest` of
//! `RequiredFile`s, and the engine reports back `ProgressEvent`s and
//! `CacheReport`s that the HTTP layer re-serializes for callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind half of a `FileRef` key. Widgets are addressed by the triple
/// `layoutId/regionId/mediaId` packed into `FileRef::id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Media,
    Layout,
    Widget,
    Static,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileKind::Media => "media",
            FileKind::Layout => "layout",
            FileKind::Widget => "widget",
            FileKind::Static => "static",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for FileKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "media" => Ok(FileKind::Media),
            "layout" => Ok(FileKind::Layout),
            "widget" => Ok(FileKind::Widget),
            "static" | "resource" => Ok(FileKind::Static),
            other => Err(format!("unknown file kind: {other}")),
        }
    }
}

/// The identity of a stored artifact. Keys compare equal regardless of
/// numeric vs string `id` representation — callers should normalise `id`
/// to its string form before constructing a `FileRef`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub id: String,
    pub filename: Option<String>,
}

impl FileRef {
    pub fn new(kind: FileKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            filename: None,
        }
    }

    pub fn widget(layout_id: &str, region_id: &str, media_id: &str) -> Self {
        Self::new(FileKind::Widget, format!("{layout_id}/{region_id}/{media_id}"))
    }

    /// The storage key used to namespace blobs and metadata rows.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.id)
    }
}

/// How the host wants a manifest entry fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    Http,
    Pending,
    Background,
}

/// A single entry in the host-supplied required-files manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredFile {
    #[serde(rename = "ref")]
    pub file_ref: FileRef,
    pub url: String,
    pub md5: Option<String>,
    pub size: Option<u64>,
    #[serde(rename = "downloadMode", default = "default_download_mode")]
    pub download_mode: DownloadMode,
}

fn default_download_mode() -> DownloadMode {
    DownloadMode::Http
}

/// The host-supplied ordered list of required files, with optional layout
/// grouping used by `prioritizeLayout`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<RequiredFile>,
    #[serde(default)]
    pub layouts: std::collections::HashMap<String, Vec<String>>,
}

/// Progress notification emitted after each chunk or significant progress
/// delta (§7, "User-visible behaviour").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub filename: String,
    pub loaded: u64,
    pub total: u64,
    pub percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `POST /store/delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub files: Vec<FileRef>,
}

/// Response of `POST /store/delete` and batch-delete operations generally.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub deleted: u64,
    pub total: u64,
}

/// One row of `GET /store/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListedFile {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
    #[serde(rename = "cachedAt")]
    pub cached_at: DateTime<Utc>,
}

/// Response of `GET /store/list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListResponse {
    pub files: Vec<ListedFile>,
}

/// Storage telemetry returned by `ContentStore::capacity`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capacity {
    pub usage: u64,
    /// `None` when the platform exposes no quota.
    pub quota: Option<u64>,
}

/// The structured report emitted by `CacheAnalyzer` on each pass (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheReport {
    pub timestamp: DateTime<Utc>,
    pub storage: Capacity,
    pub files: u64,
    pub orphaned: Vec<FileRef>,
    #[serde(rename = "orphanedSize")]
    pub orphaned_size: u64,
    pub evicted: Vec<FileRef>,
    pub threshold: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_ref_key_is_type_slash_id() {
        let r = FileRef::new(FileKind::Media, "42");
        assert_eq!(r.key(), "media/42");
    }

    #[test]
    fn widget_ref_packs_triple() {
        let r = FileRef::widget("7", "3", "99");
        assert_eq!(r.id, "7/3/99");
        assert_eq!(r.kind, FileKind::Widget);
    }

    #[test]
    fn file_kind_round_trips_through_str() {
        for (s, k) in [
            ("media", FileKind::Media),
            ("layout", FileKind::Layout),
            ("widget", FileKind::Widget),
            ("static", FileKind::Static),
            ("resource", FileKind::Static),
        ] {
            assert_eq!(s.parse::<FileKind>().unwrap(), k);
        }
        assert!("bogus".parse::<FileKind>().is_err());
    }
}
