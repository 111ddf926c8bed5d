use axum::Extension;
use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::response::Response;

use tally_protocol::AccountError;
use tally_protocol::LedgerError;
use tally_protocol::OrderError;
use tally_protocol::money;

use crate::AppState;
use crate::auth::AuthUser;
use crate::views::BalanceView;
use crate::views::Credentials;
use crate::views::OrderView;
use crate::views::TokenView;
use crate::views::WithdrawRequest;
use crate::views::WithdrawalView;

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Response {
    let Ok(Json(credentials)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state
        .accounts
        .register(&credentials.login, &credentials.password)
        .await
    {
        Ok(token) => token_response(token),
        Err(err) => account_status(&err).into_response(),
    }
}

pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<Credentials>, JsonRejection>,
) -> Response {
    let Ok(Json(credentials)) = payload else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state
        .accounts
        .login(&credentials.login, &credentials.password)
        .await
    {
        Ok(token) => token_response(token),
        Err(err) => account_status(&err).into_response(),
    }
}

/// The order number arrives as a bare `text/plain` body.
pub async fn upload_order(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let is_plain_text = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/plain"));
    if !is_plain_text {
        return StatusCode::BAD_REQUEST;
    }

    match state.orders.upload(user_id, body.trim()).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(OrderError::AlreadyUploaded) => StatusCode::OK,
        Err(OrderError::UploadedByAnotherUser) => StatusCode::CONFLICT,
        Err(OrderError::InvalidNumber) => StatusCode::UNPROCESSABLE_ENTITY,
        Err(OrderError::AlreadyProcessed | OrderError::Internal) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub async fn list_orders(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Response {
    match state.orders.list(user_id).await {
        Ok(orders) if orders.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(orders) => {
            let views: Vec<OrderView> = orders.into_iter().map(OrderView::from).collect();
            Json(views).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn balance(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Response {
    match state.ledger.get(user_id).await {
        Ok(balance) => Json(BalanceView::from(balance)).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

pub async fn withdraw(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    payload: Result<Json<WithdrawRequest>, JsonRejection>,
) -> StatusCode {
    let Ok(Json(request)) = payload else {
        return StatusCode::BAD_REQUEST;
    };
    match state
        .ledger
        .withdraw(user_id, &request.order, money::to_cents(request.sum))
        .await
    {
        Ok(()) => StatusCode::OK,
        Err(LedgerError::NotEnoughBalance) => StatusCode::PAYMENT_REQUIRED,
        Err(LedgerError::InvalidOrderNumber) => StatusCode::UNPROCESSABLE_ENTITY,
        Err(LedgerError::InvalidWithdrawalSum) => StatusCode::BAD_REQUEST,
        Err(LedgerError::Internal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub async fn list_withdrawals(
    State(state): State<AppState>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
) -> Response {
    match state.ledger.history(user_id).await {
        Ok(entries) if entries.is_empty() => StatusCode::NO_CONTENT.into_response(),
        Ok(entries) => {
            let views: Vec<WithdrawalView> =
                entries.into_iter().map(WithdrawalView::from).collect();
            Json(views).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn token_response(token: String) -> Response {
    let bearer = HeaderValue::from_str(&format!("Bearer {token}"));
    let mut response = Json(TokenView { token }).into_response();
    if let Ok(bearer) = bearer {
        response.headers_mut().insert(AUTHORIZATION, bearer);
    }
    response
}

fn account_status(err: &AccountError) -> StatusCode {
    match err {
        AccountError::EmptyLogin | AccountError::PasswordTooShort => StatusCode::BAD_REQUEST,
        AccountError::LoginTaken => StatusCode::CONFLICT,
        AccountError::InvalidPair | AccountError::InvalidToken => StatusCode::UNAUTHORIZED,
        AccountError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
