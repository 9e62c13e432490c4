/// Upload, download and file management endpoints
use super::{no_content, respond, JsonOrForm};
use crate::{
    auth::AuthUser,
    context::AppContext,
    db::FileRecord,
    error::{TroveError, TroveResult},
    files::content_disposition_value,
    upload::UploadRequest,
};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Build file routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route(
            "/upload",
            // The pipeline enforces the upload limit while streaming
            post(upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/files", get(list_files))
        .route("/trash", get(list_trash))
        .route("/download/:id", get(download))
        .route("/delete/:id", post(delete_file))
        .route("/restore/:id", post(restore_file))
        .route("/purge/:id", post(purge_file))
        .route("/rename/:id", post(rename_file))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub folder: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub folder: String,
    pub files: Vec<FileRecord>,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

fn multipart_error(err: impl std::fmt::Display) -> TroveError {
    TroveError::Validation(format!("Multipart error: {}", err))
}

/// Accept one file part and stream it through the upload pipeline
///
/// Text fields (`folder_path`, `filename`) are only honoured when they come
/// before the file part; the body is not buffered to look for them later.
#[instrument(skip(ctx, auth, headers, multipart), fields(user_id = auth.user.id))]
async fn upload(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> TroveResult<Response> {
    let mut request = UploadRequest {
        folder_path: "/".to_string(),
        ..Default::default()
    };
    let mut uploaded: Option<FileRecord> = None;
    let cancel = CancellationToken::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        match field.name() {
            Some("folder_path") => {
                request.folder_path = field.text().await.map_err(multipart_error)?;
            }
            Some("filename") => {
                let name = field.text().await.map_err(multipart_error)?;
                request.display_name = Some(name).filter(|n| !n.trim().is_empty());
            }
            Some("file") => {
                request.original_name = field.file_name().unwrap_or_default().to_string();
                request.content_type = field.content_type().map(str::to_string);
                request.declared_size = field
                    .headers()
                    .get(header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());

                let body = field.map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
                let reader = StreamReader::new(Box::pin(body));

                let record = ctx
                    .uploads
                    .upload(auth.user.id, request.clone(), reader, &cancel)
                    .await?;
                uploaded = Some(record);
                break;
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    let record =
        uploaded.ok_or_else(|| TroveError::Validation("Missing 'file' field".to_string()))?;
    Ok(respond(&headers, StatusCode::CREATED, Json(record)))
}

async fn list_files(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Query(query): Query<ListQuery>,
) -> TroveResult<Json<FileListResponse>> {
    let folder = crate::files::folders::normalize_path(query.folder.as_deref().unwrap_or("/"))?;
    let files = ctx.files.list(auth.user.id, &folder).await?;
    Ok(Json(FileListResponse { folder, files }))
}

async fn list_trash(
    State(ctx): State<AppContext>,
    auth: AuthUser,
) -> TroveResult<Json<Vec<FileRecord>>> {
    Ok(Json(ctx.files.list_deleted(auth.user.id).await?))
}

/// Stream a file back to its owner
#[instrument(skip(ctx, auth), fields(user_id = auth.user.id))]
async fn download(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> TroveResult<Response> {
    let download = ctx
        .files
        .open_download(auth.user.id, id, &CancellationToken::new())
        .await?;
    let file = download.file;
    let body = Body::from_stream(ReaderStream::new(download.reader));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.mime_type)
        .header(header::CONTENT_LENGTH, file.size.to_string())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition_value(&file.display_name),
        )
        .header(header::X_CONTENT_TYPE_OPTIONS, "nosniff")
        .header(header::CACHE_CONTROL, "private, no-cache")
        .body(body)
        .map_err(|e| TroveError::Internal(format!("Failed to build response: {}", e)))
}

async fn delete_file(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> TroveResult<Response> {
    ctx.files.soft_delete(auth.user.id, id).await?;
    Ok(no_content(&headers))
}

async fn restore_file(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> TroveResult<Response> {
    let record = ctx.files.restore(auth.user.id, id).await?;
    Ok(respond(&headers, StatusCode::OK, Json(record)))
}

async fn purge_file(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> TroveResult<Response> {
    ctx.files.purge(auth.user.id, id).await?;
    Ok(no_content(&headers))
}

async fn rename_file(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(id): Path<i64>,
    JsonOrForm(body): JsonOrForm<RenameRequest>,
) -> TroveResult<impl IntoResponse> {
    let record = ctx.files.rename(auth.user.id, id, &body.name).await?;
    Ok(respond(&headers, StatusCode::OK, Json(record)))
}
