/// Folder endpoints
use super::{no_content, respond, JsonOrForm};
use crate::{auth::AuthUser, context::AppContext, db::Folder, error::TroveResult};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

/// Build folder routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/folders", get(list_folders))
        .route("/folders/create", post(create_folder))
        .route("/folders/delete/*path", post(delete_folder))
}

#[derive(Debug, Deserialize)]
pub struct CreateFolderRequest {
    pub path: String,
}

async fn list_folders(
    State(ctx): State<AppContext>,
    auth: AuthUser,
) -> TroveResult<Json<Vec<Folder>>> {
    Ok(Json(ctx.folders.list(auth.user.id).await?))
}

async fn create_folder(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    JsonOrForm(body): JsonOrForm<CreateFolderRequest>,
) -> TroveResult<Response> {
    let folder = ctx.folders.create(auth.user.id, &body.path).await?;
    Ok(respond(&headers, StatusCode::CREATED, Json(folder)))
}

/// Delete an empty folder; `409` while it still holds files or subfolders
async fn delete_folder(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(path): Path<String>,
) -> TroveResult<Response> {
    ctx.folders.delete(auth.user.id, &path).await?;
    Ok(no_content(&headers))
}
