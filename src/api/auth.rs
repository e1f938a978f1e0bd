//! `POST /api/auth` and the bearer-token guard.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;

use super::AppState;
use crate::auth::{password_matches, TokenIssuer};

pub struct AuthState {
    pub tokens: TokenIssuer,
    pub password: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    password: String,
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(body) => body,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };

    if !password_matches(state.auth.password.as_deref(), &request.password) {
        warn!("Rejected login attempt");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid password" })),
        )
            .into_response();
    }

    info!("Issued API token");
    Json(json!({ "token": state.auth.tokens.issue() })).into_response()
}

pub async fn require_token(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| state.auth.tokens.verify(token).is_ok());

    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(req).await
}
