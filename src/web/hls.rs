use crate::store::SegmentStore;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::{Component, Path as FsPath};
use tokio::fs::{self, File};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, warn};

pub const MANIFEST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";
/// Live manifests and segments must never be served from a cache
pub const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

/// Content type by file extension
pub fn content_type_for(file_name: &str) -> &'static str {
    match FsPath::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("m3u8") => MANIFEST_CONTENT_TYPE,
        Some("ts") => SEGMENT_CONTENT_TYPE,
        _ => FALLBACK_CONTENT_TYPE,
    }
}

/// A single path segment that stays inside its parent directory
fn is_plain_segment(segment: &str) -> bool {
    let mut components = FsPath::new(segment).components();
    matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none()
        && !segment.contains(&['/', '\\'][..])
}

/// `GET /:source_dir/:file_name`
///
/// Serves files straight from the segment store. The supervisor is never
/// consulted: a source that is not streaming simply has no file (404).
pub async fn serve_segment_file(
    State(store): State<SegmentStore>,
    Path((source_dir, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    // 1. Reject anything that is not a plain directory/file name
    if !is_plain_segment(&source_dir) || !is_plain_segment(&file_name) {
        warn!("Rejected path traversal attempt: {}/{}", source_dir, file_name);
        return Err((StatusCode::FORBIDDEN, "Forbidden".to_string()));
    }

    // 2. Resolve against the store root; symlinks must not lead outside it
    let requested = store.root().join(&source_dir).join(&file_name);
    let resolved = fs::canonicalize(&requested)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;
    if !resolved.starts_with(store.root()) {
        warn!("Rejected request escaping the segment root: {:?}", requested);
        return Err((StatusCode::FORBIDDEN, "Forbidden".to_string()));
    }

    // 3. Open the file for reading
    let metadata = fs::metadata(&resolved)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;
    if !metadata.is_file() {
        return Err((StatusCode::NOT_FOUND, "File not found".to_string()));
    }
    let file = File::open(&resolved)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;
    debug!("Serving {:?}", resolved);

    // Create a stream from the file
    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&file_name))
        .header(header::CACHE_CONTROL, NO_CACHE)
        .body(body)
        .map_err(|e| {
            error!("Failed to build response: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
        })
}
