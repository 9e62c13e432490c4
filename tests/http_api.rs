//! HTTP surface, driven through the router without a socket

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use trove::blob_store::MemoryBlobBackend;
use trove::db::MetadataStore;
use trove::server::build_router;
use trove::{AppContext, ServerConfig};

const BOUNDARY: &str = "trove-test-boundary";

struct TestApp {
    router: Router,
    _dir: TempDir,
}

impl TestApp {
    async fn new(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::for_testing(dir.path());
        tweak(&mut config);
        let store = MetadataStore::in_memory().await.unwrap();
        let ctx = AppContext::from_parts(config, store, Arc::new(MemoryBlobBackend::new()));
        Self {
            router: build_router(ctx),
            _dir: dir,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn post_json(&self, uri: &str, token: Option<&str>, body: Value) -> Response {
        let mut builder = Request::post(uri).header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn get(&self, uri: &str, token: &str) -> Response {
        self.send(
            Request::get(uri)
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    /// Register and sign in; returns the login response body
    async fn sign_up(&self, handle: &str) -> Value {
        let response = self
            .post_json(
                "/register",
                None,
                json!({
                    "handle": handle,
                    "email": format!("{}@example.com", handle),
                    "password": "correct horse battery",
                }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = self
            .post_json(
                "/login",
                None,
                json!({ "identifier": handle, "password": "correct horse battery" }),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await
    }

    async fn upload(&self, token: &str, folder: &str, name: &str, content: &[u8]) -> Response {
        self.send(
            Request::post("/upload")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body(folder, name, content)))
                .unwrap(),
        )
        .await
    }
}

fn multipart_body(folder: &str, name: &str, content: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"folder_path\"\r\n\r\n{folder}\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n",
            b = BOUNDARY,
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn upload_list_download_delete() {
    let app = TestApp::new(|_| {}).await;
    let login = app.sign_up("alice").await;
    let token = login["token"].as_str().unwrap();

    let response = app.upload(token, "/docs", "hello.txt", b"abc").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let record = json_body(response).await;
    assert_eq!(record["size"], 3);
    assert_eq!(
        record["digest"],
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(record["logical_path"], "/docs");
    assert!(record.get("storage_key").is_none());
    let id = record["id"].as_i64().unwrap();

    let listing = json_body(app.get("/files?folder=/docs", token).await).await;
    assert_eq!(listing["files"].as_array().unwrap().len(), 1);

    let response = app.get(&format!("/download/{}", id), token).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "3");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.starts_with("attachment;"));
    assert!(disposition.contains("hello.txt"));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"abc");

    let me = json_body(app.get("/me", token).await).await;
    assert_eq!(me["storage_used"], 3);
    assert!(me.get("password_hash").is_none());

    let response = app
        .send(
            Request::post(format!("/delete/{}", id))
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.get(&format!("/download/{}", id), token).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let trash = json_body(app.get("/trash", token).await).await;
    assert_eq!(trash.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn other_users_files_are_not_found() {
    let app = TestApp::new(|_| {}).await;
    let alice = app.sign_up("alice").await;
    let bob = app.sign_up("bob").await;

    let record = json_body(
        app.upload(alice["token"].as_str().unwrap(), "/", "secret.txt", b"top secret")
            .await,
    )
    .await;
    let id = record["id"].as_i64().unwrap();

    let response = app
        .get(&format!("/download/{}", id), bob["token"].as_str().unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"], "NotFound");
}

#[tokio::test]
async fn unauthenticated_requests_are_rejected() {
    let app = TestApp::new(|_| {}).await;
    let response = app
        .send(Request::get("/files").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.upload("not-a-token", "/", "a.txt", b"a").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn size_and_quota_limits_map_to_413_and_507() {
    let app = TestApp::new(|c| {
        c.limits.max_upload_size = 1024;
        c.limits.default_user_quota = 1500;
    })
    .await;
    let login = app.sign_up("alice").await;
    let token = login["token"].as_str().unwrap();

    let response = app.upload(token, "/", "big.bin", &[1u8; 2048]).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let response = app.upload(token, "/", "first.bin", &[2u8; 1000]).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app.upload(token, "/", "second.bin", &[3u8; 1000]).await;
    assert_eq!(response.status(), StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(json_body(response).await["error"], "QuotaExceeded");
}

#[tokio::test]
async fn browser_form_gets_redirect() {
    let app = TestApp::new(|_| {}).await;
    let login = app.sign_up("alice").await;
    let token = login["token"].as_str().unwrap();

    let response = app
        .send(
            Request::post("/upload")
                .header(header::AUTHORIZATION, format!("Bearer {}", token))
                .header(header::ACCEPT, "text/html")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(multipart_body("/", "page.html", b"<p>hi</p>")))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn cookie_sessions_require_csrf_token_for_writes() {
    let app = TestApp::new(|_| {}).await;
    let login = app.sign_up("alice").await;
    let token = login["token"].as_str().unwrap();
    let csrf = login["csrf_token"].as_str().unwrap();
    let cookie = format!("trove_session={}", token);

    let create = |csrf: Option<&str>| {
        let mut builder = Request::post("/folders/create")
            .header(header::COOKIE, &cookie)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(csrf) = csrf {
            builder = builder.header("x-csrf-token", csrf);
        }
        builder.body(Body::from("path=%2Fphotos%2F2024")).unwrap()
    };

    let response = app.send(create(None)).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.send(create(Some(csrf))).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(json_body(response).await["path"], "/photos/2024");

    // Reads with the cookie alone are fine
    let response = app
        .send(
            Request::get("/folders")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn non_empty_folder_cannot_be_deleted() {
    let app = TestApp::new(|_| {}).await;
    let login = app.sign_up("alice").await;
    let token = login["token"].as_str().unwrap();

    app.upload(token, "/keep", "a.txt", b"a").await;
    let delete = |path: &str| {
        Request::post(format!("/folders/delete/{}", path))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(app.send(delete("keep")).await.status(), StatusCode::CONFLICT);

    let response = app
        .post_json("/folders/create", Some(token), json!({ "path": "/empty" }))
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(app.send(delete("empty")).await.status(), StatusCode::NO_CONTENT);
    assert_eq!(app.send(delete("empty")).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn login_sets_http_only_cookie_and_logout_clears_it() {
    let app = TestApp::new(|_| {}).await;
    app.sign_up("alice").await;

    let response = app
        .post_json(
            "/login",
            None,
            json!({ "identifier": "alice", "password": "correct horse battery" }),
        )
        .await;
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
    assert!(set_cookie.starts_with("trove_session="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));

    let token = json_body(response).await["token"].as_str().unwrap().to_string();
    let response = app.post_json("/logout", Some(&token), json!({})).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    assert_eq!(app.get("/me", &token).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn only_admins_change_quotas() {
    let app = TestApp::new(|_| {}).await;
    let admin = app.sign_up("admin").await;
    let user = app.sign_up("user").await;
    let user_id = user["user"]["id"].as_i64().unwrap();

    let put = |token: &str| {
        Request::put(format!("/admin/users/{}/quota", user_id))
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "bytes": 2048 }).to_string()))
            .unwrap()
    };

    let response = app.send(put(user["token"].as_str().unwrap())).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.send(put(admin["token"].as_str().unwrap())).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["storage_quota"], 2048);
}

#[tokio::test]
async fn health_reports_components() {
    let app = TestApp::new(|_| {}).await;
    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["storage"]["status"], "ok");
    assert!(body["uptime"].is_u64());
    assert!(body["version"].is_string());
}
