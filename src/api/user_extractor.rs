use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};

use crate::api::handlers::AppState;
use crate::model::UserContext;

pub const DEFAULT_SESSION_ID: &str = "default";

/// Axum extractor for UserContext from request headers
///
/// - X-User-Id: user identifier, recorded as author
/// - X-User-Email: optional user email
/// - X-User-Name: optional user display name
///
/// Without X-User-Id the configured default author is used.
#[async_trait]
impl<S> FromRequestParts<AppState<S>> for UserContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState<S>,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;

        match extract_header_value(headers, "x-user-id") {
            Some(user_id) => {
                let user_email = extract_header_value(headers, "x-user-email");
                let user_name = extract_header_value(headers, "x-user-name");
                Ok(UserContext::with_details(user_id, user_email, user_name))
            }
            None => Ok(UserContext::new(state.settings.default_author.clone())),
        }
    }
}

/// Session key from the X-Session-Id header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for SessionId
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(SessionId(
            extract_header_value(&parts.headers, "x-session-id")
                .unwrap_or_else(|| DEFAULT_SESSION_ID.to_string()),
        ))
    }
}

/// Extract a non-empty header value as string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
