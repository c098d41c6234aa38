use axum::http::HeaderMap;
use subtrack_core::config::{AuthConfig, AuthMode};

/// `Authorization: Bearer <token>` check for the admin API.
pub fn check_auth(auth: &AuthConfig, headers: &HeaderMap) -> bool {
    match auth.mode {
        AuthMode::None => true,
        AuthMode::Token => {
            let expected = match &auth.token {
                Some(t) if !t.is_empty() => t.as_str(),
                // Token mode without a token value denies everything.
                _ => return false,
            };
            extract_bearer(headers).is_some_and(|t| t == expected)
        }
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
