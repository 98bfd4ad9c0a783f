//! Admin API for account and pool management
//!
//! Runs on its own listener (default port 9090) behind a bearer token that
//! is distinct from any end-user credential. Missing or invalid tokens get
//! one uniform 401 regardless of route or method, so an unauthenticated
//! caller learns nothing about which account ids exist.
//!
//! Endpoints:
//! - GET    /admin/accounts       - list accounts with state and masked tokens
//! - POST   /admin/accounts       - add an account, triggers an immediate probe
//! - DELETE /admin/accounts/:id   - remove an account (idempotent)
//! - GET    /admin/config         - current pool settings
//! - PUT    /admin/config         - replace pool settings wholesale
//! - GET    /admin/pool           - pool snapshot with totals

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use serde::Deserialize;
use tracing::{info, warn};

use account_pool::{Pool, PoolSettings};
use common::Secret;
use session_store::{AccountSeed, SessionCredential};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
    admin_token: Arc<Secret<String>>,
}

impl AdminState {
    pub fn new(pool: Arc<Pool>, admin_token: Secret<String>) -> Self {
        Self {
            pool,
            admin_token: Arc::new(admin_token),
        }
    }
}

/// Build the admin axum router with all management endpoints behind the
/// bearer-token middleware.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts).post(add_account))
        .route("/admin/accounts/{id}", delete(remove_account))
        .route("/admin/config", get(get_config).put(update_config))
        .route("/admin/pool", get(pool_status))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ))
        .with_state(state)
}

type JsonResponse = (
    StatusCode,
    [(axum::http::HeaderName, &'static str); 1],
    String,
);

fn json_response(status: StatusCode, body: serde_json::Value) -> JsonResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Bearer-token check applied to every admin route. The rejection is one
/// fixed shape for every route and failure mode: no hint about whether a
/// path or account id exists leaks before authentication.
async fn require_admin(State(state): State<AdminState>, request: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", state.admin_token.expose());
    let presented = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if presented != Some(expected.as_str()) {
        return json_response(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({"error": "unauthorized"}),
        )
        .into_response();
    }
    next.run(request).await
}

/// GET /admin/accounts - every account's live status. Tokens appear only as
/// the masked suffix the snapshot carries.
async fn list_accounts(State(state): State<AdminState>) -> JsonResponse {
    let snapshot = state.pool.snapshot().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "accounts": snapshot.accounts }),
    )
}

/// Request body for the add-account endpoint.
#[derive(Deserialize)]
struct AddAccountRequest {
    id: String,
    session_token: String,
    csrf_token: String,
}

/// POST /admin/accounts - validate, persist, and admit a new account.
///
/// The pool queues an immediate probe so the account's real state is known
/// before selection first offers it. Duplicate ids and empty tokens are
/// rejected with 400 and leave the pool untouched.
async fn add_account(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<AddAccountRequest>,
) -> JsonResponse {
    let seed = AccountSeed {
        id: body.id.clone(),
        credential: SessionCredential {
            session_token: body.session_token,
            csrf_token: body.csrf_token,
        },
    };

    match state.pool.add_account(seed).await {
        Ok(()) => {
            info!(account_id = body.id, "account added via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "account_id": body.id, "status": "added" }),
            )
        }
        Err(e) if e.is_config() => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e) => {
            warn!(account_id = body.id, error = %e, "account add failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// DELETE /admin/accounts/:id - remove an account. Idempotent: removing an
/// unknown id returns 200, so repeated admin calls are safe.
async fn remove_account(State(state): State<AdminState>, Path(id): Path<String>) -> JsonResponse {
    match state.pool.remove_account(&id).await {
        Ok(()) => {
            info!(account_id = %id, "account removed via admin API");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "account_id": id, "status": "removed" }),
            )
        }
        Err(e) => {
            warn!(account_id = %id, error = %e, "account removal failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// GET /admin/config - current heartbeat and fallback settings.
async fn get_config(State(state): State<AdminState>) -> JsonResponse {
    let settings = state.pool.settings().await;
    match serde_json::to_value(&settings) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// PUT /admin/config - replace the pool settings wholesale. Takes effect on
/// the heartbeat's next cycle; invalid settings are rejected with 400 and
/// the running configuration is unchanged.
async fn update_config(
    State(state): State<AdminState>,
    axum::Json(settings): axum::Json<PoolSettings>,
) -> JsonResponse {
    match state.pool.update_settings(settings).await {
        Ok(()) => {
            info!("pool settings updated via admin API");
            json_response(StatusCode::OK, serde_json::json!({ "status": "updated" }))
        }
        Err(e) if e.is_config() => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": e.to_string() }),
        ),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// GET /admin/pool - full snapshot with per-account status and totals.
async fn pool_status(State(state): State<AdminState>) -> JsonResponse {
    let snapshot = state.pool.snapshot().await;
    match serde_json::to_value(&snapshot) {
        Ok(value) => json_response(StatusCode::OK, value),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}
