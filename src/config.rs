use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use std::{env, net::IpAddr, path::PathBuf, str::FromStr, time::Duration};
use alloy::primitives::Address;
use tracing::{info, warn};

use crate::price::PriceEndpoints;
use crate::rpc::{parse_address, DEFAULT_RPC_TEMPLATE};

pub const DEFAULT_EXCLUDED_PRODUCTS: &str = "optimism-bridged-bifi-vault";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub rpc_url_template: String,
    pub alchemy_key: String,
    pub store_url: String,
    pub store_token: String,
    pub prices: PriceEndpoints,
    pub contracts_path: PathBuf,
    pub accounts_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
    /// Overrides the accounts file when non-empty.
    pub wallets: Vec<Address>,
    pub nxm_staking_token_id: Option<u64>,
    pub update_secret: Option<String>,
    pub allow_anonymous_trigger: bool,
    /// Peer IPs allowed to trigger without the secret.
    pub allowed_callers: Vec<IpAddr>,
    pub update_interval: Option<Duration>,
    pub rpc_timeout: Duration,
    pub price_timeout: Duration,
    pub store_timeout: Duration,
    pub beefy_excluded_products: Vec<String>,
    pub record_history: bool,
}

fn var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| eyre!("{} has invalid value '{}': {}", name, raw, e)),
        None => Ok(default),
    }
}

fn flag(name: &str, default: bool) -> Result<bool> {
    match var(name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(eyre!("{} must be a boolean, got '{}'", name, v)),
    }
}

fn list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_secs(parsed(name, default)?))
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    let store_url = var("PORTFOLIO_STORE_URL").ok_or_else(|| eyre!("PORTFOLIO_STORE_URL is required"))?;
    let store_token = var("PORTFOLIO_STORE_TOKEN").ok_or_else(|| eyre!("PORTFOLIO_STORE_TOKEN is required"))?;

    let wallets = var("WALLET_ADDRESSES")
        .map(|raw| list(&raw))
        .unwrap_or_default()
        .iter()
        .map(|w| parse_address(w))
        .collect::<std::result::Result<Vec<_>, _>>()
        .wrap_err("WALLET_ADDRESSES")?;

    let allowed_callers = var("UPDATE_ALLOWED_CALLERS")
        .map(|raw| list(&raw))
        .unwrap_or_default()
        .iter()
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|e| eyre!("UPDATE_ALLOWED_CALLERS entry '{}': {}", ip, e))
        })
        .collect::<Result<Vec<_>>>()?;

    let nxm_staking_token_id = match var("NXM_STAKING_TOKEN_ID") {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|e| eyre!("NXM_STAKING_TOKEN_ID '{}': {}", raw, e))?,
        ),
        None => None,
    };

    let update_interval = match var("UPDATE_INTERVAL_SECS") {
        Some(_) => Some(secs("UPDATE_INTERVAL_SECS", 0)?).filter(|d| !d.is_zero()),
        None => None,
    };

    let prices = PriceEndpoints {
        beefy_api_key: var("BEEFY_API_KEY"),
        coingecko_api_key: var("COINGECKO_API_KEY"),
        databarn_api_key: var("DATABARN_API_KEY"),
        ..PriceEndpoints::default()
    };

    let cfg = Config {
        host: parsed("HOST", IpAddr::from([127, 0, 0, 1]))?,
        port: parsed("PORT", 3001)?,
        rpc_url_template: var("RPC_URL_TEMPLATE").unwrap_or_else(|| DEFAULT_RPC_TEMPLATE.to_string()),
        alchemy_key: var("ALCHEMY_RPC_KEY").unwrap_or_default(),
        store_url,
        store_token,
        prices,
        contracts_path: var("CONTRACTS_PATH")
            .unwrap_or_else(|| "data/contracts/contracts.json".to_string())
            .into(),
        accounts_path: var("ACCOUNTS_PATH")
            .unwrap_or_else(|| "data/accounts/accounts.json".to_string())
            .into(),
        metadata_path: var("METADATA_PATH").map(PathBuf::from),
        wallets,
        nxm_staking_token_id,
        update_secret: var("UPDATE_SECRET"),
        allow_anonymous_trigger: flag("ALLOW_ANONYMOUS_TRIGGER", true)?,
        allowed_callers,
        update_interval,
        rpc_timeout: secs("RPC_TIMEOUT_SECS", 15)?,
        price_timeout: secs("PRICE_TIMEOUT_SECS", 10)?,
        store_timeout: secs("STORE_TIMEOUT_SECS", 10)?,
        beefy_excluded_products: list(
            &var("BEEFY_EXCLUDED_PRODUCTS").unwrap_or_else(|| DEFAULT_EXCLUDED_PRODUCTS.to_string()),
        ),
        record_history: flag("RECORD_HISTORY", true)?,
    };

    if cfg.alchemy_key.is_empty() && cfg.rpc_url_template.contains("{key}") {
        warn!("ALCHEMY_RPC_KEY is not set; chain reads will likely be rejected");
    }
    if cfg.update_secret.is_none() {
        if cfg.allow_anonymous_trigger {
            warn!("UPDATE_SECRET is not set; the update trigger is open to anyone");
        } else {
            warn!("UPDATE_SECRET is not set and anonymous triggers are disabled; only allow-listed callers may update");
        }
    }

    // Secrets stay out of the log.
    info!("Loaded config:");
    info!("  Listen: {}:{}", cfg.host, cfg.port);
    info!("  Store: {}", cfg.store_url);
    info!("  Contracts: {}", cfg.contracts_path.display());
    if cfg.wallets.is_empty() {
        info!("  Accounts: {}", cfg.accounts_path.display());
    } else {
        info!("  Wallets: {:?}", cfg.wallets);
    }
    info!("  Allow-listed callers: {:?}", cfg.allowed_callers);
    info!("  NXM staking token: {:?}", cfg.nxm_staking_token_id);
    info!("  Update interval: {:?}", cfg.update_interval);
    info!("  Beefy exclusions: {:?}", cfg.beefy_excluded_products);
    info!("  Record history: {}", cfg.record_history);

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_skip_blank_items() {
        assert_eq!(list(" a, ,b ,"), vec!["a".to_string(), "b".to_string()]);
        assert!(list("").is_empty());
    }
}
