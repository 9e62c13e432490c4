/// Authentication extractors and utilities
use crate::{
    account::ValidatedSession,
    config::IpCidr,
    context::AppContext,
    db::User,
    error::{TroveError, TroveResult},
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap, Method},
};
use axum_extra::extract::cookie::CookieJar;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::IpAddr;

/// Cookie carrying the session token for browsers
pub const SESSION_COOKIE: &str = "trove_session";

/// Header carrying the CSRF token on cookie-authenticated writes
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Argon2 memory cost in KiB
const ARGON2_MEMORY_KIB: u32 = 19 * 1024;

/// Hash a password into a PHC string
///
/// `cost` is the Argon2 iteration count, clamped to 1..=10.
pub fn hash_password(password: &str, cost: u32) -> TroveResult<String> {
    let params = Params::new(ARGON2_MEMORY_KIB, cost.clamp(1, 10), 1, None)
        .map_err(|e| TroveError::Internal(format!("Invalid Argon2 parameters: {}", e)))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let salt = SaltString::generate(&mut OsRng);
    let hash = argon
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| TroveError::Internal(format!("Password hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC string; malformed hashes never match
pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Fresh random token: 32 bytes, base64url without padding
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// What the database stores for a session token
pub fn session_token_hash(secret: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time string comparison
fn tokens_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Extract bearer token from the Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Whether the client prefers an HTML page over JSON
pub fn wants_html(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

/// Address of the real client
///
/// When the peer is a trusted proxy the left-most `X-Forwarded-For` entry is
/// used instead of the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &[IpCidr]) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.iter().any(|cidr| cidr.contains(peer)) {
        return Some(peer);
    }

    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or(Some(peer))
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// How the request proved who it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Bearer,
    Cookie,
}

/// Authenticated user, extracted from a bearer token or the session cookie
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub session: ValidatedSession,
    pub credential: Credential,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = TroveError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let (token, credential) = match extract_bearer_token(&parts.headers) {
            Some(token) => (token, Credential::Bearer),
            None => {
                let jar = CookieJar::from_headers(&parts.headers);
                let token = jar
                    .get(SESSION_COOKIE)
                    .map(|c| c.value().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| TroveError::Authentication("Not signed in".to_string()))?;
                (token, Credential::Cookie)
            }
        };

        let session = state.account_manager.validate_session(&token).await?;

        // Browsers send cookies on cross-site requests; bearer tokens they do not
        if credential == Credential::Cookie
            && state.config.authentication.csrf_enabled
            && !is_safe_method(&parts.method)
        {
            let sent = parts
                .headers
                .get(CSRF_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if !tokens_match(sent, &session.payload.csrf_token) {
                tracing::warn!(user_id = session.user.id, "CSRF token mismatch");
                return Err(TroveError::Forbidden("Invalid CSRF token".to_string()));
            }
        }

        Ok(AuthUser {
            user: session.user.clone(),
            session,
            credential,
        })
    }
}

/// Authenticated administrator
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

#[async_trait]
impl FromRequestParts<AppContext> for AdminUser {
    type Rejection = TroveError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthUser::from_request_parts(parts, state).await?;
        if !auth.user.is_admin {
            tracing::warn!(user_id = auth.user.id, "Admin route refused");
            return Err(TroveError::Forbidden("Admin role required".to_string()));
        }
        Ok(AdminUser(auth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_password_round_trip() {
        let hash = hash_password("correct horse", 1).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hash.contains("t=1"));
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn test_cost_is_clamped() {
        let hash = hash_password("pw", 0).unwrap();
        assert!(hash.contains("t=1"));
    }

    #[test]
    fn test_tokens() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);

        let h1 = session_token_hash("secret", &a);
        assert_eq!(h1.len(), 64);
        assert_ne!(h1, session_token_hash("other", &a));
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abc", "abd"));
        assert!(!tokens_match("abc", "abcd"));
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(extract_bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(extract_bearer_token(&headers).as_deref(), Some("tok"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic xyz"));
        assert!(extract_bearer_token(&headers).is_none());
    }

    #[test]
    fn test_client_ip_behind_proxy() {
        let trusted: Vec<IpCidr> = vec!["10.0.0.0/8".parse().unwrap()];
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.2"),
        );

        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let stranger: IpAddr = "198.51.100.1".parse().unwrap();

        assert_eq!(
            client_ip(&headers, Some(proxy), &trusted),
            Some("203.0.113.7".parse().unwrap())
        );
        assert_eq!(client_ip(&headers, Some(stranger), &trusted), Some(stranger));
        assert_eq!(client_ip(&HeaderMap::new(), Some(proxy), &trusted), Some(proxy));
    }

    #[test]
    fn test_wants_html() {
        let mut headers = HeaderMap::new();
        assert!(!wants_html(&headers));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml"),
        );
        assert!(wants_html(&headers));
    }
}
