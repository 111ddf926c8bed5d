//! The `tally` binary: wires storage, the polling engine, and the HTTP
//! surface together, recovers in-flight orders, and serves until a shutdown
//! signal arrives.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use tally_core::AccountService;
use tally_core::LedgerService;
use tally_core::OrderService;
use tally_core::TokenSigner;
use tally_core::events::LedgerBus;
use tally_core::secrets;
use tally_engine::AccrualPoller;
use tally_engine::PollerConfig;
use tally_server::AppState;
use tally_state::postgres;
use tally_state::postgres::PgBalanceStore;
use tally_state::postgres::PgOrderStore;
use tally_state::postgres::PgSecretStore;
use tally_state::postgres::PgTxProvider;
use tally_state::postgres::PgUserStore;
use tally_state::postgres::PgWithdrawalStore;

mod config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = config::Cli::parse();
    config::validate(&cli)?;

    let pool = postgres::connect(&cli.database_uri, config::DATABASE_TIMEOUT)
        .await
        .context("database init failed")?;

    let secret_store = PgSecretStore::new(pool.clone(), config::DATABASE_TIMEOUT);
    let secret = secrets::load_or_create_token_secret(&secret_store)
        .await
        .context("token secret bootstrap failed")?;

    let accounts = Arc::new(AccountService::new(
        Arc::new(PgUserStore::new(pool.clone(), config::DATABASE_TIMEOUT)),
        TokenSigner::new(&secret, config::TOKEN_TTL),
        config::MIN_PASSWORD_LEN,
    ));

    let bus = LedgerBus::new();
    let poller = AccrualPoller::new(PollerConfig::new(&cli.accrual_address))
        .context("failed to build accrual poller")?;

    let orders = Arc::new(OrderService::new(
        Arc::new(PgOrderStore::new(pool.clone(), config::DATABASE_TIMEOUT)),
        Arc::new(poller.clone()),
        bus.clone(),
    ));
    let ledger = Arc::new(LedgerService::new(
        Arc::new(PgBalanceStore::new(pool.clone(), config::DATABASE_TIMEOUT)),
        Arc::new(PgWithdrawalStore::new(pool.clone(), config::DATABASE_TIMEOUT)),
        Arc::new(PgTxProvider::new(pool.clone())),
        bus.clone(),
    ));

    orders
        .recover_unprocessed()
        .await
        .context("startup recovery failed")?;

    let listener = TcpListener::bind(&cli.run_address)
        .await
        .with_context(|| format!("could not bind {}", cli.run_address))?;
    info!(address = %cli.run_address, "listening");

    let state = AppState {
        accounts,
        orders,
        ledger: Arc::clone(&ledger),
    };
    tally_server::serve(listener, state, shutdown_signal())
        .await
        .context("server failed")?;

    // Stopped accepting requests; now drain the rest in dependency order.
    info!("shutting down");
    poller.close().await;
    ledger.close();
    bus.release().await;
    pool.close().await;
    info!("bye");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
