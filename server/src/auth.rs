//! Bearer-token middleware. A verified token places the user id into the
//! request extensions, where every authenticated handler reads it.

use axum::extract::Request;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::response::Response;
use tracing::debug;
use uuid::Uuid;

use crate::AppState;

/// The authenticated caller, injected by [`require_auth`].
#[derive(Clone, Copy, Debug)]
pub struct AuthUser(pub Uuid);

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let Some(token) = token else {
        debug!("missing or malformed Authorization header");
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.accounts.verify_token(token) {
        Ok(user_id) => {
            request.extensions_mut().insert(AuthUser(user_id));
            next.run(request).await
        }
        Err(err) => {
            debug!("token rejected: {err}");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}
