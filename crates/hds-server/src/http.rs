//! Admin HTTP surface.
//!
//! Everything except `/id`, the OAuth callback, and scripted-assignment
//! downloads sits behind the authorization policy. The auth middleware
//! translates [`AuthDecision`] values into HTTP responses; the handlers
//! call straight into the domain server's aggregates.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use hds_auth::{
    AuthDecision, AuthPolicy, AuthRequest, CallbackFlow, OAuthClient, SESSION_COOKIE_NAME,
    SessionStore, StateTokens, run_callback_flow,
};

use crate::{ContentManager, DomainServer};

const UNAUTHENTICATED_BODY: &str =
    "You do not have permission to access this domain-server.";

/// Shared state behind the admin router.
#[derive(Clone)]
pub struct AppState {
    /// The orchestration core.
    pub domain: Arc<DomainServer>,
    /// Authorization policy.
    pub policy: Arc<AuthPolicy>,
    /// Web session store.
    pub sessions: Arc<SessionStore>,
    /// Single-use OAuth state tokens.
    pub states: Arc<StateTokens>,
    /// OAuth client, when a provider is configured.
    pub oauth: Option<Arc<OAuthClient>>,
    /// Backup/content collaborator.
    pub content: Arc<dyn ContentManager>,
}

/// Build the admin router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/nodes.json", get(get_nodes))
        .route("/nodes", delete(delete_all_nodes))
        .route("/nodes/{id}", delete(delete_node))
        .route("/assignments.json", get(get_assignments))
        .route("/assignment", post(post_assignment))
        .route("/api/backups", get(list_backups).post(create_backup))
        .route("/api/backups/{id}", delete(delete_backup))
        .route("/api/backups/recover/{id}", post(recover_backup))
        .route("/api/backups/consolidate/{id}", post(consolidate_backup))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth_gate));

    Router::new()
        .route("/id", get(get_id))
        .route("/oauth", get(oauth_callback))
        .route("/assignment/{id}", get(download_assignment))
        .merge(protected)
        .with_state(state)
}

async fn auth_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let decision = {
        let headers = request.headers();
        let auth_request = AuthRequest {
            cookie: headers.get(header::COOKIE).and_then(|v| v.to_str().ok()),
            authorization: headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok()),
            is_xhr: headers
                .get("X-Requested-With")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == "XMLHttpRequest"),
        };
        state
            .policy
            .authorize(&state.sessions, &state.states, &auth_request)
    };

    match decision {
        AuthDecision::Allow => next.run(request).await,
        AuthDecision::Unauthorized => {
            (StatusCode::UNAUTHORIZED, UNAUTHENTICATED_BODY).into_response()
        }
        AuthDecision::RedirectToProvider { state: token } => match &state.oauth {
            Some(oauth) => {
                let location = oauth.authorization_url(token).to_string();
                (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
            }
            None => {
                warn!("oauth policy active but no oauth client configured");
                (StatusCode::UNAUTHORIZED, UNAUTHENTICATED_BODY).into_response()
            }
        },
        AuthDecision::BasicChallenge { realm } => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, format!("Basic realm='{realm}'"))],
            UNAUTHENTICATED_BODY,
        )
            .into_response(),
    }
}

async fn get_id(State(state): State<AppState>) -> String {
    state.domain.session_id().to_string()
}

async fn get_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "nodes": state.domain.node_views() }))
}

async fn delete_node(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.domain.kill_node(id) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn delete_all_nodes(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "killed": state.domain.kill_all_nodes() }))
}

async fn get_assignments(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.domain.assignment_listing())
}

async fn post_assignment(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty assignment payload").into_response();
    }
    let pool = params.get("pool").cloned().unwrap_or_default();
    let id = state.domain.upload_scripted_assignment(body, pool);
    Json(json!({ "id": id })).into_response()
}

async fn download_assignment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.domain.assignment_payload(id) {
        Some(payload) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            payload,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateBackupRequest {
    name: String,
}

async fn list_backups(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.content.list_backups().await)
}

async fn create_backup(
    State(state): State<AppState>,
    Json(request): Json<CreateBackupRequest>,
) -> impl IntoResponse {
    let outcome = state.content.create_backup(&request.name).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

async fn delete_backup(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let outcome = state.content.delete_backup(&id).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

async fn recover_backup(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let outcome = state.content.recover_from_backup(&id).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

async fn consolidate_backup(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let outcome = state.content.consolidate_backup(&id).await;
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(outcome))
}

async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(code), Some(raw_state)) = (params.get("code"), params.get("state")) else {
        return (StatusCode::BAD_REQUEST, "missing code or state").into_response();
    };

    let Ok(token) = Uuid::parse_str(raw_state) else {
        return (StatusCode::BAD_REQUEST, "malformed state token").into_response();
    };

    // each state token is consumable exactly once; replays die here
    if !state.states.consume(token) {
        return (StatusCode::BAD_REQUEST, "unknown or replayed state token").into_response();
    }

    let Some(oauth) = &state.oauth else {
        return (StatusCode::BAD_REQUEST, "oauth is not configured").into_response();
    };

    let mut flow = CallbackFlow::begin(token);
    match run_callback_flow(oauth, &mut flow, code).await {
        Ok(profile) => {
            let cookie_id = state.sessions.insert(profile);
            let cookie = format!(
                "{SESSION_COOKIE_NAME}={cookie_id}; Path=/; Max-Age=2592000; HttpOnly"
            );
            (
                StatusCode::FOUND,
                [
                    (header::SET_COOKIE, cookie),
                    (header::LOCATION, "/".to_owned()),
                ],
            )
                .into_response()
        }
        Err(error) => {
            warn!(%error, "oauth callback flow failed");
            (StatusCode::BAD_GATEWAY, "could not complete sign-in").into_response()
        }
    }
}
