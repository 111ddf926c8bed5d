use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use clap::Parser;
use url::Url;

/// Loyalty points service.
#[derive(Debug, Parser)]
#[command(name = "tally", version)]
pub struct Cli {
    /// Address to listen on, host:port.
    #[arg(
        short = 'a',
        long = "address",
        env = "RUN_ADDRESS",
        default_value = "localhost:8080"
    )]
    pub run_address: String,

    /// PostgreSQL connection string.
    #[arg(short = 'd', long = "database-uri", env = "DATABASE_URI")]
    pub database_uri: String,

    /// Accrual authority base URL, scheme and host only.
    #[arg(short = 'r', long = "accrual-address", env = "ACCRUAL_SYSTEM_ADDRESS")]
    pub accrual_address: String,
}

pub const DATABASE_TIMEOUT: Duration = Duration::from_secs(5);
pub const TOKEN_TTL: Duration = Duration::from_secs(60 * 60);
pub const MIN_PASSWORD_LEN: usize = 12;

pub fn validate(cli: &Cli) -> anyhow::Result<()> {
    validate_run_address(&cli.run_address).context("invalid run address")?;
    validate_accrual_address(&cli.accrual_address).context("invalid accrual system address")?;
    Ok(())
}

fn validate_run_address(address: &str) -> anyhow::Result<()> {
    let Some((host, port)) = address.rsplit_once(':') else {
        bail!("expected host:port, got {address:?}");
    };
    if host != "localhost" && host.parse::<IpAddr>().is_err() {
        bail!("host must be localhost or an IP address, got {host:?}");
    }
    port.parse::<u16>()
        .with_context(|| format!("invalid port {port:?}"))?;
    Ok(())
}

fn validate_accrual_address(address: &str) -> anyhow::Result<()> {
    let url = Url::parse(address).context("could not parse url")?;
    if url.host_str().is_none() {
        bail!("url must have a host");
    }
    if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
        bail!("url must not contain a path, query, or fragment");
    }
    Ok(())
}
