use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::coordinator::{CoordinatorHandle, SessionStats};
use crate::error::ServerError;
use crate::file_store::{FileStore, FileType};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub file_store: Arc<FileStore>,
    pub coordinator: CoordinatorHandle,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/api/files", post(create_file))
        .route("/api/files/chunk", post(create_chunk))
        .route("/api/files/:file_id/merge", get(merge_chunks))
        .route("/api/files/:file_id/info", get(file_info))
        .route("/api/files/:file_id/download", get(download_file))
        .route("/api/files/:file_id", axum::routing::delete(delete_file))
        .layer(DefaultBodyLimit::max(body_limit(state.file_store.max_size())))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    stats: SessionStats,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFileRequest {
    #[serde(default)]
    content: String,
    #[serde(default, rename = "type")]
    file_type: String,
    filename: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChunkRequest {
    #[serde(default)]
    content: String,
    #[serde(default, rename = "type")]
    file_type: String,
    file_chunk_id: String,
    order: u32,
    filename: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileResponse {
    success: bool,
    file_id: String,
    download_url: String,
    filename: String,
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MergeResponse {
    success: bool,
    file_id: Uuid,
    message: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileInfoResponse {
    success: bool,
    file_id: Uuid,
    filename: String,
    content_type: &'static str,
    download_url: String,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
    message: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Result<Json<ServerInfoResponse>, ServerError> {
    let stats = state
        .coordinator
        .stats()
        .await
        .map_err(|e| ServerError::Internal(e.to_string()))?;

    Ok(Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        stats,
    }))
}

/// Request body ceiling for a file of `max_file_size` bytes. JSON escaping
/// can double the content, plus room for the other fields.
fn body_limit(max_file_size: usize) -> usize {
    max_file_size.saturating_mul(2).saturating_add(64 * 1024)
}

/// Reject empty content and unknown types before touching the store.
fn validate_upload(content: &str, file_type: &str) -> Result<FileType, ServerError> {
    if content.is_empty() {
        return Err(ServerError::BadRequest("Content must not be empty".into()));
    }
    if file_type.is_empty() {
        return Err(ServerError::BadRequest("File type is required".into()));
    }
    FileType::parse(file_type).ok_or_else(|| {
        ServerError::BadRequest("Unsupported file type, only js, css and html are allowed".into())
    })
}

async fn create_file(
    State(state): State<AppState>,
    Json(req): Json<CreateFileRequest>,
) -> Result<Json<FileResponse>, ServerError> {
    let file_type = validate_upload(&req.content, &req.file_type)?;
    let info = state
        .file_store
        .save(&req.content, file_type, req.filename.as_deref())
        .await?;

    info!(id = %info.id, filename = %info.filename, "File created via API");

    Ok(Json(FileResponse {
        success: true,
        file_id: info.id.to_string(),
        download_url: info.download_url(),
        filename: info.filename,
        message: "File created",
    }))
}

async fn create_chunk(
    State(state): State<AppState>,
    Json(req): Json<CreateChunkRequest>,
) -> Result<Json<FileResponse>, ServerError> {
    let file_type = validate_upload(&req.content, &req.file_type)?;
    let chunk = state
        .file_store
        .save_chunk(
            &req.content,
            file_type,
            &req.file_chunk_id,
            req.order,
            req.filename.as_deref(),
        )
        .await?;

    info!(
        chunk = %chunk.file_chunk_id,
        order = chunk.order,
        path = %chunk.path.display(),
        "Chunk uploaded via API"
    );

    Ok(Json(FileResponse {
        success: true,
        file_id: chunk.file_chunk_id,
        // only available once merged
        download_url: String::new(),
        filename: chunk.filename,
        message: "Chunk stored",
    }))
}

async fn merge_chunks(
    State(state): State<AppState>,
    Path(file_chunk_id): Path<String>,
) -> Result<Json<MergeResponse>, ServerError> {
    let info = state.file_store.merge_chunks(&file_chunk_id).await?;
    Ok(Json(MergeResponse {
        success: true,
        file_id: info.id,
        message: "merge success",
    }))
}

async fn file_info(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<FileInfoResponse>, ServerError> {
    let info = state
        .file_store
        .info(file_id)
        .await
        .ok_or_else(|| ServerError::not_found(file_id))?;

    Ok(Json(FileInfoResponse {
        success: true,
        file_id: info.id,
        download_url: info.download_url(),
        content_type: info.content_type(),
        filename: info.filename,
        created_at: info.created_at,
    }))
}

/// Serve the file once, then remove it.
async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Response, ServerError> {
    let (info, content) = state.file_store.read(file_id).await?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        attachment_name(&info.filename)
    ))
    .map_err(|e| ServerError::Internal(format!("Invalid Content-Disposition: {e}")))?;

    if let Err(e) = state.file_store.delete(file_id).await {
        warn!(id = %file_id, error = %e, "Failed to delete file after download");
    } else {
        info!(id = %file_id, filename = %info.filename, "File downloaded and removed");
    }

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(info.content_type())),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        content,
    )
        .into_response())
}

async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
) -> Result<Json<DeleteResponse>, ServerError> {
    state.file_store.delete(file_id).await?;
    Ok(Json(DeleteResponse {
        success: true,
        message: "File deleted",
    }))
}

/// Keep header-safe ASCII; everything else becomes `_`.
fn attachment_name(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP + WebSocket server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_upload() {
        assert_eq!(validate_upload("x", "css").unwrap(), FileType::Css);
        assert!(matches!(validate_upload("", "css"), Err(ServerError::BadRequest(_))));
        assert!(matches!(validate_upload("x", ""), Err(ServerError::BadRequest(_))));
        assert!(matches!(validate_upload("x", "exe"), Err(ServerError::BadRequest(_))));
    }

    #[test]
    fn test_body_limit_fits_largest_file() {
        let max = 1024;
        let content = "\"".repeat(max);
        let body = serde_json::json!({"content": content, "type": "html", "filename": "page"})
            .to_string();
        assert!(body.len() > max);
        assert!(body.len() <= body_limit(max));
        assert_eq!(body_limit(usize::MAX), usize::MAX);
    }

    #[test]
    fn test_attachment_name() {
        assert_eq!(attachment_name("page.html"), "page.html");
        assert_eq!(attachment_name("my page.html"), "my page.html");
        assert_eq!(attachment_name("a\"b.js"), "a_b.js");
        assert_eq!(attachment_name("café.css"), "caf_.css");
    }

    #[test]
    fn test_chunk_request_shape() {
        let req: CreateChunkRequest = serde_json::from_str(
            r#"{"content":"<p>","type":"html","fileChunkId":"abc","order":3}"#,
        )
        .unwrap();
        assert_eq!(req.file_chunk_id, "abc");
        assert_eq!(req.order, 3);
        assert!(req.filename.is_none());
    }
}
