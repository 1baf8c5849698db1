use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::VcsConfig;
use crate::error::VcsError;
use crate::model::{Session, UserContext};
use crate::store::traits::Store;

/// Everything a request handler can reach.
pub struct AppContext<S> {
    pub store: S,
    pub sessions: SessionRegistry,
    pub settings: VcsConfig,
}

impl<S> AppContext<S> {
    pub fn new(store: S, settings: VcsConfig) -> Self {
        Self {
            store,
            sessions: SessionRegistry::with_ttl(settings.session_ttl()),
            settings,
        }
    }
}

pub type AppState<S> = Arc<AppContext<S>>;

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    last_seen: Instant,
}

/// Sessions keyed by the x-session-id header. Handlers take a copy, run the
/// operation on it and put it back. Idle sessions expire after `ttl`.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::with_ttl(Duration::from_secs(3600))
    }
}

impl SessionRegistry {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fetch the session for `id`, opening a fresh one on main when it is
    /// unknown or has expired. The caller's identity always replaces the
    /// one recorded earlier.
    pub fn checkout(&self, id: &str, user: &UserContext) -> Session {
        let mut sessions = self.sessions.lock();
        let ttl = self.ttl;
        sessions.retain(|_, entry| entry.last_seen.elapsed() <= ttl);

        let entry = sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionEntry {
                session: Session::new(id, user.clone()),
                last_seen: Instant::now(),
            });
        entry.session.user = user.clone();
        entry.last_seen = Instant::now();
        entry.session.clone()
    }

    pub fn store(&self, session: Session) {
        self.sessions.lock().insert(
            session.id.clone(),
            SessionEntry {
                session,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn current_branch(&self, id: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(id)
            .filter(|entry| entry.last_seen.elapsed() <= self.ttl)
            .map(|entry| entry.session.current_branch.clone())
    }

    /// Forget a session. Returns false when it was not registered.
    pub fn remove(&self, id: &str) -> bool {
        self.sessions.lock().remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// DELETE /sessions/:id
pub async fn end_session<S: Store + 'static>(
    State(ctx): State<AppState<S>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if ctx.sessions.remove(&id) {
        log::debug!("session {} ended", id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error_response(VcsError::not_found("session", &id)))
    }
}

/// Simple health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> ListResponse<T> {
    pub fn new(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: &str) -> Self {
        Self {
            error: message.to_string(),
        }
    }
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);
pub type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn status_for(error: &VcsError) -> StatusCode {
    match error {
        VcsError::NullOrEmptyParameter(_) | VcsError::InvalidFormat { .. } => {
            StatusCode::BAD_REQUEST
        }
        VcsError::NotFound { .. } => StatusCode::NOT_FOUND,
        VcsError::AlreadyExists { .. } | VcsError::Dependency(_) => StatusCode::CONFLICT,
        VcsError::Forbidden(_) => StatusCode::FORBIDDEN,
        VcsError::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
        VcsError::Storage(_)
        | VcsError::Database(_)
        | VcsError::Migration(_)
        | VcsError::Serialization(_)
        | VcsError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map an engine error onto the JSON error body.
pub fn error_response(error: VcsError) -> ApiError {
    let status = status_for(&error);
    if status.is_server_error() {
        log::error!("request failed: {}", error);
    }
    (status, Json(ErrorResponse::new(&error.to_string())))
}
