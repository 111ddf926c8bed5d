//! The HTTP surface: routing, handlers, and bearer-token authentication for
//! the loyalty API under `/api/user`.

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::get;
use axum::routing::post;
use tokio::net::TcpListener;

use tally_core::AccountService;
use tally_core::LedgerService;
use tally_core::OrderService;

mod auth;
mod handlers;
mod views;

pub use auth::AuthUser;

#[derive(Clone)]
pub struct AppState {
    pub accounts: Arc<AccountService>,
    pub orders: Arc<OrderService>,
    pub ledger: Arc<LedgerService>,
}

pub fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/register", post(handlers::register))
        .route("/login", post(handlers::login));

    let authenticated = Router::new()
        .route(
            "/orders",
            post(handlers::upload_order).get(handlers::list_orders),
        )
        .route("/balance", get(handlers::balance))
        .route("/balance/withdraw", post(handlers::withdraw))
        .route("/withdrawals", get(handlers::list_withdrawals))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .nest("/api/user", public.merge(authenticated))
        .layer(middleware::from_fn(log_requests))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then stop accepting connections.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn log_requests(
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = next.run(request).await;

    tracing::info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}
