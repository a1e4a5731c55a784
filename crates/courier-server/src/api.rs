//! HTTP query interface.
//!
//! - `GET /chat/messages?userId=<other>` - conversation between the caller
//!   and another user
//! - `GET /users` - every other user with their presence

use crate::auth::{self, AuthError};
use crate::handlers::AppState;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use courier_core::DeliveryError;
use courier_protocol::{Message, User, UserId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationQuery {
    pub user_id: i64,
}

/// Errors returned by the HTTP endpoints.
#[derive(Debug)]
pub enum ApiError {
    Auth(AuthError),
    Delivery(DeliveryError),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        ApiError::Delivery(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Auth(e) => (
                StatusCode::UNAUTHORIZED,
                courier_protocol::codes::UNAUTHORIZED,
                e.to_string(),
            ),
            ApiError::Delivery(e) => {
                let status = match e {
                    DeliveryError::Validation(_) => StatusCode::BAD_REQUEST,
                    DeliveryError::NotFound(_) => StatusCode::NOT_FOUND,
                    DeliveryError::Unauthorized => StatusCode::FORBIDDEN,
                    DeliveryError::InvalidState(_) => StatusCode::CONFLICT,
                    DeliveryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                (status, e.code(), e.to_string())
            }
        };

        (
            status,
            Json(serde_json::json!({ "error": message, "code": code })),
        )
            .into_response()
    }
}

fn caller(state: &AppState, headers: &HeaderMap) -> Result<UserId, ApiError> {
    Ok(auth::authenticate(state.verifier.as_ref(), headers, None)?)
}

/// `GET /chat/messages?userId=<other>`
pub async fn conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ConversationQuery>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let me = caller(&state, &headers)?;
    let other = UserId(query.user_id);

    let messages = state.router.messages_between(me, other).await?;
    debug!(user = %me, other = %other, count = messages.len(), "Conversation fetched");
    Ok(Json(messages))
}

/// `GET /users`
pub async fn users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>, ApiError> {
    let me = caller(&state, &headers)?;
    Ok(Json(state.router.list_users_except(me).await?))
}
