//! HTTP handlers for downloading conversion artifacts and in-flight uploads.
//!
//! Paths arrive percent-decoded from the `{*path}` wildcard. Every segment must be a plain file or
//! directory name (400 otherwise), and the canonical target must still sit under the root it is
//! served from (404 otherwise). Files are streamed rather than buffered.

use std::path::Path;

use axum::{
    body::Body,
    extract::{Path as UrlPath, State},
    http::{HeaderValue, Response, header},
};
use tokio_util::io::ReaderStream;
use tracing::{instrument, warn};

use crate::{
    AppState,
    errors::{Error, Result},
    storage::resolve_relative,
};

const LONG_LIVED_CACHE: &str = "public, max-age=31536000";

/// Content type served for a file, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("glb") => "model/gltf-binary",
        Some("fbx") => "application/octet-stream",
        Some("usdz") => "model/vnd.usdz+zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Download a conversion artifact or saved model.
#[utoipa::path(
    get,
    path = "/api/files/{path}",
    tag = "files",
    summary = "Download artifact",
    params(("path" = String, Path, description = "Path relative to the output root, e.g. `<job_id>/vase.glb`")),
    responses(
        (status = 200, description = "File contents, typed by extension"),
        (status = 400, description = "Path contains an invalid segment", body = crate::errors::ErrorResponse),
        (status = 404, description = "No such file", body = crate::errors::ErrorResponse),
    )
)]
#[instrument(skip_all, fields(path = %path))]
pub async fn serve_output_file(State(state): State<AppState>, UrlPath(path): UrlPath<String>) -> Result<Response<Body>> {
    let root = state.orchestrator.storage().output_dir();
    let mut response = open_within(root, &path).await?;
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(LONG_LIVED_CACHE));
    Ok(response)
}

/// Fetch an uploaded source image while its conversion is still running.
#[utoipa::path(
    get,
    path = "/api/uploads/{path}",
    tag = "files",
    summary = "Download in-flight upload",
    params(("path" = String, Path, description = "Path relative to the uploads root, e.g. `<job_id>/shirt.png`")),
    responses(
        (status = 200, description = "File contents, typed by extension"),
        (status = 400, description = "Path contains an invalid segment", body = crate::errors::ErrorResponse),
        (status = 404, description = "No such file", body = crate::errors::ErrorResponse),
    )
)]
#[instrument(skip_all, fields(path = %path))]
pub async fn serve_upload(State(state): State<AppState>, UrlPath(path): UrlPath<String>) -> Result<Response<Body>> {
    let root = state.orchestrator.storage().uploads_dir();
    let mut response = open_within(root, &path).await?;
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(response)
}

/// Stream `relative` from under `root` with type, length and disposition headers set.
async fn open_within(root: &Path, relative: &str) -> Result<Response<Body>> {
    let candidate = resolve_relative(root, relative).map_err(|reason| Error::BadRequest {
        message: format!("Invalid file path: {reason}"),
    })?;
    let not_found = || Error::NotFound {
        resource: "File".to_string(),
        id: relative.to_string(),
    };

    let root = tokio::fs::canonicalize(root).await.map_err(|_| not_found())?;
    let resolved = tokio::fs::canonicalize(&candidate).await.map_err(|_| not_found())?;
    if !resolved.starts_with(&root) {
        warn!(requested = relative, resolved = %resolved.display(), "Refusing to serve file outside its root");
        return Err(not_found());
    }

    let metadata = tokio::fs::metadata(&resolved).await.map_err(|_| not_found())?;
    if !metadata.is_file() {
        return Err(not_found());
    }
    let file = tokio::fs::File::open(&resolved).await.map_err(|_| not_found())?;

    let file_name = candidate
        .file_name()
        .map(|name| name.to_string_lossy().replace(['"', '\\'], "_"))
        .unwrap_or_default();

    Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&candidate))
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(header::CONTENT_DISPOSITION, format!("inline; filename=\"{file_name}\""))
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| Error::Internal {
            operation: format!("build file response for {relative}: {e}"),
        })
}
