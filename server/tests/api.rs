//! Full-stack API tests: the axum app on a real listener, in-memory
//! storage, and a wiremock accrual authority.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::sleep;
use uuid::Uuid;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path_regex;

use tally_core::AccountService;
use tally_core::LedgerService;
use tally_core::OrderService;
use tally_core::OrderStore;
use tally_core::TokenSigner;
use tally_core::events::LedgerBus;
use tally_engine::AccrualPoller;
use tally_engine::PollerConfig;
use tally_protocol::OrderStatus;
use tally_server::AppState;
use tally_state::memory::MemoryBalanceStore;
use tally_state::memory::MemoryOrderStore;
use tally_state::memory::MemoryTxProvider;
use tally_state::memory::MemoryUserStore;
use tally_state::memory::MemoryWithdrawalStore;

const PASSWORD: &str = "longmegapassword";
const ORDER: &str = "12345678903";
const OTHER_ORDER: &str = "2377225624";

struct TestApp {
    base_url: String,
    http: reqwest::Client,
    accrual: MockServer,
    state: AppState,
    order_store: Arc<MemoryOrderStore>,
    balance_store: Arc<MemoryBalanceStore>,
}

async fn spawn_app() -> TestApp {
    let accrual = MockServer::start().await;

    let order_store = Arc::new(MemoryOrderStore::default());
    let balance_store = Arc::new(MemoryBalanceStore::default());
    let bus = LedgerBus::new();

    let mut poller_config = PollerConfig::new(accrual.uri());
    poller_config.request_timeout = Duration::from_secs(5);
    let poller = AccrualPoller::new(poller_config).expect("build poller");

    let state = AppState {
        accounts: Arc::new(AccountService::new(
            Arc::new(MemoryUserStore::default()),
            TokenSigner::new(b"integration-test-secret", Duration::from_secs(3600)),
            12,
        )),
        orders: Arc::new(OrderService::new(
            Arc::clone(&order_store) as _,
            Arc::new(poller) as _,
            bus.clone(),
        )),
        ledger: Arc::new(LedgerService::new(
            Arc::clone(&balance_store) as _,
            Arc::new(MemoryWithdrawalStore::default()) as _,
            Arc::new(MemoryTxProvider::default()) as _,
            bus,
        )),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(tally_server::serve(
        listener,
        state.clone(),
        std::future::pending(),
    ));

    TestApp {
        base_url: format!("http://{addr}"),
        http: reqwest::Client::new(),
        accrual,
        state,
        order_store,
        balance_store,
    }
}

impl TestApp {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn register(&self, login: &str) -> String {
        let response = self
            .http
            .post(self.url("/api/user/register"))
            .json(&json!({ "login": login, "password": PASSWORD }))
            .send()
            .await
            .expect("register request");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers().contains_key("authorization"),
            "register should set the Authorization header"
        );
        let body: Value = response.json().await.expect("register body");
        body["token"].as_str().expect("token field").to_string()
    }

    async fn upload(&self, token: &str, number: &str) -> StatusCode {
        self.http
            .post(self.url("/api/user/orders"))
            .bearer_auth(token)
            .header("content-type", "text/plain")
            .body(number.to_string())
            .send()
            .await
            .expect("upload request")
            .status()
    }

    async fn balance(&self, token: &str) -> Value {
        self.http
            .get(self.url("/api/user/balance"))
            .bearer_auth(token)
            .send()
            .await
            .expect("balance request")
            .json()
            .await
            .expect("balance body")
    }

    async fn wait_for_balance(&self, token: &str, current: f64) {
        for _ in 0..300 {
            if self.balance(token).await["current"].as_f64() == Some(current) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("balance never reached {current}");
    }

    async fn mount_accrual(&self, status: &str, accrual: Option<f64>, times: u64) {
        let mut body = json!({ "status": status });
        if let Some(accrual) = accrual {
            body["accrual"] = json!(accrual);
        }
        Mock::given(method("GET"))
            .and(path_regex(r"^/api/orders/\d+$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .up_to_n_times(times)
            .mount(&self.accrual)
            .await;
    }
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let app = spawn_app().await;
    let status = reqwest::get(app.url("/healthz"))
        .await
        .expect("healthz")
        .status();
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn registration_validates_and_conflicts() {
    let app = spawn_app().await;
    app.register("alice").await;

    let conflict = app
        .http
        .post(app.url("/api/user/register"))
        .json(&json!({ "login": "alice", "password": PASSWORD }))
        .send()
        .await
        .expect("request");
    assert_eq!(conflict.status(), StatusCode::CONFLICT);

    for body in [
        json!({ "login": "", "password": PASSWORD }),
        json!({ "login": "bob", "password": "short" }),
    ] {
        let response = app
            .http
            .post(app.url("/api/user/register"))
            .json(&body)
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
    }

    let malformed = app
        .http
        .post(app.url("/api/user/register"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .expect("request");
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn login_issues_tokens_for_valid_pairs_only() {
    let app = spawn_app().await;
    app.register("alice").await;

    let ok = app
        .http
        .post(app.url("/api/user/login"))
        .json(&json!({ "login": "alice", "password": PASSWORD }))
        .send()
        .await
        .expect("request");
    assert_eq!(ok.status(), StatusCode::OK);
    let body: Value = ok.json().await.expect("body");
    assert!(body["token"].is_string());

    let unauthorized = app
        .http
        .post(app.url("/api/user/login"))
        .json(&json!({ "login": "alice", "password": "wrong-password" }))
        .send()
        .await
        .expect("request");
    assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn authenticated_routes_reject_missing_and_bad_tokens() {
    let app = spawn_app().await;
    for path in [
        "/api/user/orders",
        "/api/user/balance",
        "/api/user/withdrawals",
    ] {
        let bare = app.http.get(app.url(path)).send().await.expect("request");
        assert_eq!(bare.status(), StatusCode::UNAUTHORIZED, "path {path}");

        let junk = app
            .http
            .get(app.url(path))
            .bearer_auth("junk-token")
            .send()
            .await
            .expect("request");
        assert_eq!(junk.status(), StatusCode::UNAUTHORIZED, "path {path}");
    }
}

#[tokio::test]
async fn order_upload_accrues_points_end_to_end() {
    let app = spawn_app().await;
    let token = app.register("alice").await;

    // No orders yet.
    let empty = app
        .http
        .get(app.url("/api/user/orders"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request");
    assert_eq!(empty.status(), StatusCode::NO_CONTENT);

    app.mount_accrual("PROCESSING", None, 1).await;
    app.mount_accrual("PROCESSED", Some(100.93), 1).await;

    assert_eq!(app.upload(&token, ORDER).await, StatusCode::ACCEPTED);
    app.wait_for_balance(&token, 100.93).await;

    let balance = app.balance(&token).await;
    assert_eq!(balance["current"].as_f64(), Some(100.93));
    assert_eq!(balance["withdrawn"].as_f64(), Some(0.0));

    let orders: Value = app
        .http
        .get(app.url("/api/user/orders"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("orders body");
    let listed = orders.as_array().expect("orders array");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["number"].as_str(), Some(ORDER));
    assert_eq!(listed[0]["status"].as_str(), Some("PROCESSED"));
    assert_eq!(listed[0]["accrual"].as_f64(), Some(100.93));
    assert!(listed[0]["uploaded_at"].is_string());

    // Re-upload by the same user is idempotent.
    assert_eq!(app.upload(&token, ORDER).await, StatusCode::OK);

    // Another user hits a conflict.
    let bob = app.register("bob").await;
    assert_eq!(app.upload(&bob, ORDER).await, StatusCode::CONFLICT);

    // Checksum failures and wrong content types never reach the engine.
    assert_eq!(
        app.upload(&token, "12345").await,
        StatusCode::UNPROCESSABLE_ENTITY
    );
    let wrong_type = app
        .http
        .post(app.url("/api/user/orders"))
        .bearer_auth(&token)
        .json(&json!({ "number": ORDER }))
        .send()
        .await
        .expect("request");
    assert_eq!(wrong_type.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn withdrawals_debit_until_the_balance_runs_out() {
    use tally_core::BalanceStore;

    let app = spawn_app().await;
    let token = app.register("alice").await;
    let user_id = app
        .state
        .accounts
        .verify_token(&token)
        .expect("token carries the user id");
    app.balance_store
        .increase(user_id, 10093)
        .await
        .expect("seed balance");

    // Empty journal renders as 204.
    let empty = app
        .http
        .get(app.url("/api/user/withdrawals"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request");
    assert_eq!(empty.status(), StatusCode::NO_CONTENT);

    let withdraw = |order: &str, sum: f64| {
        let request = app
            .http
            .post(app.url("/api/user/balance/withdraw"))
            .bearer_auth(&token)
            .json(&json!({ "order": order, "sum": sum }));
        async move { request.send().await.expect("request").status() }
    };

    assert_eq!(withdraw(OTHER_ORDER, 50.0).await, StatusCode::OK);

    let balance = app.balance(&token).await;
    assert_eq!(balance["current"].as_f64(), Some(50.93));
    assert_eq!(balance["withdrawn"].as_f64(), Some(50.0));

    assert_eq!(
        withdraw(OTHER_ORDER, 100.0).await,
        StatusCode::PAYMENT_REQUIRED
    );
    assert_eq!(
        withdraw("12345", 1.0).await,
        StatusCode::UNPROCESSABLE_ENTITY
    );
    assert_eq!(withdraw(OTHER_ORDER, 0.0).await, StatusCode::BAD_REQUEST);
    assert_eq!(withdraw(OTHER_ORDER, -3.0).await, StatusCode::BAD_REQUEST);

    let journal: Value = app
        .http
        .get(app.url("/api/user/withdrawals"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("journal body");
    let entries = journal.as_array().expect("journal array");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["order"].as_str(), Some(OTHER_ORDER));
    assert_eq!(entries[0]["sum"].as_f64(), Some(50.0));
    assert!(entries[0]["processed_at"].is_string());
}

#[tokio::test]
async fn restart_recovery_finishes_in_flight_orders() {
    let app = spawn_app().await;
    let token = app.register("alice").await;
    let user_id = app
        .state
        .accounts
        .verify_token(&token)
        .expect("token carries the user id");

    // An order left mid-flight by a previous run.
    app.order_store
        .add(user_id, ORDER, OrderStatus::Processing)
        .await
        .expect("seed order");
    app.mount_accrual("PROCESSED", Some(42.0), 1).await;

    let recovered = app
        .state
        .orders
        .recover_unprocessed()
        .await
        .expect("recover");
    assert_eq!(recovered, 1);

    app.wait_for_balance(&token, 42.0).await;
}

#[tokio::test]
async fn unknown_user_id_in_a_valid_token_still_yields_empty_data() {
    let app = spawn_app().await;
    // A token signed with the right secret but for a user that was never
    // registered: the data endpoints treat it as empty state.
    let signer = TokenSigner::new(b"integration-test-secret", Duration::from_secs(3600));
    let token = signer.issue(Uuid::new_v4()).expect("issue");

    let balance = app.balance(&token).await;
    assert_eq!(balance["current"].as_f64(), Some(0.0));
    assert_eq!(balance["withdrawn"].as_f64(), Some(0.0));
}
