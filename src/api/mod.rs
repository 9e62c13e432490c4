/// API routes and handlers
pub mod account;
pub mod files;
pub mod folders;
pub mod health;

use crate::{auth::wants_html, context::AppContext, error::TroveError};
use axum::{
    async_trait,
    extract::{FromRequest, Request},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Form, Json, Router,
};
use serde::de::DeserializeOwned;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(account::routes())
        .merge(files::routes())
        .merge(folders::routes())
}

/// Body accepted either as JSON or as an urlencoded HTML form
pub struct JsonOrForm<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for JsonOrForm<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = TroveError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);

        if is_form {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|e| TroveError::Validation(e.body_text()))?;
            Ok(JsonOrForm(value))
        } else {
            let Json(value) = Json::<T>::from_request(req, state)
                .await
                .map_err(|e| TroveError::Validation(e.body_text()))?;
            Ok(JsonOrForm(value))
        }
    }
}

/// Send browsers back where they came from
fn redirect_back(headers: &HeaderMap) -> Redirect {
    let target = headers
        .get(header::REFERER)
        .and_then(|v| v.to_str().ok())
        .filter(|r| !r.is_empty())
        .unwrap_or("/");
    Redirect::to(target)
}

/// `303` back for HTML forms, the given status and body for API clients
fn respond<B: IntoResponse>(headers: &HeaderMap, status: StatusCode, body: B) -> Response {
    if wants_html(headers) {
        redirect_back(headers).into_response()
    } else {
        (status, body).into_response()
    }
}

/// `303` back for HTML forms, `204` for API clients
fn no_content(headers: &HeaderMap) -> Response {
    if wants_html(headers) {
        redirect_back(headers).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}
