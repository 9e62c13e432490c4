/// Account, session and admin endpoints
use super::{respond, JsonOrForm};
use crate::{
    account::{LoginRequest, LoginResponse, RegisterRequest},
    auth::{AdminUser, AuthUser, SESSION_COOKIE},
    context::AppContext,
    db::User,
    error::TroveResult,
};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::{Deserialize, Serialize};

/// Build account routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/account/delete", post(delete_account))
        .route("/admin/users/:id/quota", put(set_quota))
        .route("/admin/users/:id/delete", post(admin_delete_user))
}

/// Current user with quota numbers
#[derive(Debug, Serialize)]
pub struct MeResponse {
    #[serde(flatten)]
    pub user: User,
    pub storage_available: i64,
}

#[derive(Debug, Deserialize)]
pub struct QuotaRequest {
    pub bytes: u64,
}

fn session_cookie(ctx: &AppContext, token: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(ctx.config.is_production())
        .build()
}

fn removal_cookie() -> Cookie<'static> {
    Cookie::build(SESSION_COOKIE).path("/").build()
}

async fn register(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    JsonOrForm(request): JsonOrForm<RegisterRequest>,
) -> TroveResult<Response> {
    let user = ctx.account_manager.register(request).await?;
    Ok(respond(&headers, StatusCode::CREATED, Json(user)))
}

/// Open a session; browsers get the token as an HttpOnly cookie
async fn login(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    JsonOrForm(request): JsonOrForm<LoginRequest>,
) -> TroveResult<(CookieJar, Json<LoginResponse>)> {
    let response = ctx.account_manager.login(request).await?;
    let jar = jar.add(session_cookie(&ctx, response.token.clone()));
    Ok((jar, Json(response)))
}

async fn logout(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    jar: CookieJar,
) -> TroveResult<impl IntoResponse> {
    ctx.account_manager.logout(&auth.session).await?;
    Ok((jar.remove(removal_cookie()), StatusCode::NO_CONTENT))
}

async fn me(State(ctx): State<AppContext>, auth: AuthUser) -> TroveResult<Json<MeResponse>> {
    // Re-read so usage reflects uploads made during this session
    let user = ctx.account_manager.get_user(auth.user.id).await?;
    Ok(Json(MeResponse {
        storage_available: user.available_bytes(),
        user,
    }))
}

/// Schedule the caller's own account for deletion
async fn delete_account(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    jar: CookieJar,
) -> TroveResult<impl IntoResponse> {
    ctx.account_manager.schedule_deletion(auth.user.id).await?;
    Ok((jar.remove(removal_cookie()), StatusCode::NO_CONTENT))
}

async fn set_quota(
    State(ctx): State<AppContext>,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<i64>,
    Json(request): Json<QuotaRequest>,
) -> TroveResult<Json<User>> {
    tracing::info!(admin_id = admin.user.id, user_id, "Admin quota change");
    Ok(Json(ctx.account_manager.set_quota(user_id, request.bytes).await?))
}

async fn admin_delete_user(
    State(ctx): State<AppContext>,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<i64>,
) -> TroveResult<StatusCode> {
    tracing::info!(admin_id = admin.user.id, user_id, "Admin scheduled account deletion");
    ctx.account_manager.get_user(user_id).await?;
    ctx.account_manager.schedule_deletion(user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
