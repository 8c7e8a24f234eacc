//! HTTP surface: axum router, handlers, and server startup.
//!
//! Every chat endpoint requires `Authorization: Bearer <access>`; a missing,
//! unknown or expired credential gets 401 with a JSON `detail` body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde_json::json;

use casedesk_proto::auth::{LoginRequest, RefreshRequest, RefreshResponse, TokenPair};
use casedesk_proto::ids::{MessageId, UserId};
use casedesk_proto::message::{MarkReadRequest, RawMessage, SendMessageRequest};
use casedesk_proto::user::Peer;

use crate::state::{DevError, DevState, DevUser};

type Shared = State<Arc<DevState>>;

impl IntoResponse for DevError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Build the API router, mounted under `/api`.
pub fn router(state: Arc<DevState>) -> Router {
    let api = Router::new()
        .route("/auth/login/", post(login))
        .route("/auth/refresh/", post(refresh))
        .route("/chat/available-users/", get(available_users))
        .route("/chat/messages/", get(list_messages).post(send_message))
        .route("/chat/messages/{id}/", patch(mark_read));

    Router::new()
        .nest("/api", api)
        .layer(middleware::from_fn(log_request))
        .with_state(state)
}

/// Starts the server with a pre-configured [`DevState`].
///
/// Bind to `127.0.0.1:0` for an OS-assigned port; the bound address is
/// returned alongside the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<DevState>,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "dev server error");
        }
    });

    Ok((bound_addr, handle))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let response = next.run(request).await;
    tracing::info!(
        %method,
        %path,
        request_id = %request_id,
        status = response.status().as_u16(),
        "request"
    );
    response
}

fn caller(state: &DevState, headers: &HeaderMap) -> Result<DevUser, DevError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(DevError::Unauthorized)?;
    state.authenticate(token.trim()).cloned()
}

async fn login(
    State(state): Shared,
    Json(body): Json<LoginRequest>,
) -> Result<Json<TokenPair>, DevError> {
    state.login(&body.email, &body.password).map(Json)
}

async fn refresh(
    State(state): Shared,
    Json(body): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, DevError> {
    let access = state.refresh(&body.refresh)?;
    Ok(Json(RefreshResponse {
        access,
        refresh: None,
    }))
}

async fn available_users(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<Json<Vec<Peer>>, DevError> {
    let me = caller(&state, &headers)?;
    Ok(Json(state.available_users(&me)))
}

#[derive(Debug, serde::Deserialize)]
struct ListParams {
    chat_with: Option<String>,
}

async fn list_messages(
    State(state): Shared,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<RawMessage>>, DevError> {
    let me = caller(&state, &headers)?;
    let listed = match params.chat_with {
        Some(raw) => {
            let peer: UserId = raw
                .parse()
                .map_err(|e| DevError::BadRequest(format!("chat_with: {e}")))?;
            state.conversation(&me, peer)
        }
        None => state.inbox(&me),
    };
    Ok(Json(listed))
}

async fn send_message(
    State(state): Shared,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<RawMessage>), DevError> {
    let me = caller(&state, &headers)?;
    let created = state.send(&me, body)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn mark_read(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<MarkReadRequest>,
) -> Result<Json<RawMessage>, DevError> {
    let me = caller(&state, &headers)?;
    let id: MessageId = id
        .parse()
        .map_err(|e| DevError::BadRequest(format!("message id: {e}")))?;
    if !body.read {
        return Err(DevError::BadRequest("messages cannot be marked unread".into()));
    }
    state.mark_read(&me, id).map(Json)
}
