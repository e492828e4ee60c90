//! Gateway CLI.

use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::Context;

/// paygate: personal payment aggregator gateway
#[derive(Debug, argh::FromArgs)]
pub struct GatewayArgs {
    /// the <ip-address:port> to listen on.
    ///
    /// Default: `127.0.0.1:8080`.
    /// Env: `LISTEN_ADDR`.
    #[argh(option)]
    pub listen_addr: Option<SocketAddr>,

    /// path to the sqlite database file.
    ///
    /// Default: `data/paygate.db`.
    /// Env: `DB_PATH`.
    #[argh(option)]
    pub db_path: Option<PathBuf>,

    /// the operator wallet openapi gateway url.
    ///
    /// Default: the public gateway.
    /// Env: `WALLET_GATEWAY_URL`.
    #[argh(option)]
    pub wallet_gateway_url: Option<String>,
}

impl GatewayArgs {
    /// Parse CLI args, filling unset options from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut args = argh::from_env::<Self>();
        or_env(&mut args.listen_addr, "LISTEN_ADDR")?;
        or_env(&mut args.db_path, "DB_PATH")?;
        or_env(&mut args.wallet_gateway_url, "WALLET_GATEWAY_URL")?;
        Ok(args)
    }
}

fn or_env<T>(slot: &mut Option<T>, var: &str) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if slot.is_some() {
        return Ok(());
    }
    if let Ok(raw) = std::env::var(var) {
        let value = raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid ${var}: {raw:?}"))?;
        *slot = Some(value);
    }
    Ok(())
}
