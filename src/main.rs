use std::sync::Arc;

use portfolio_api::{
    api::{self, AppState, TriggerAuth},
    config::{self, Config},
    contracts::ContractRegistry,
    metadata::MetadataCatalog,
    price::HttpPriceOracle,
    protocols::{
        aave::AaveModule,
        beefy::{BeefyModule, HttpTimeline, DEFAULT_TIMELINE_URL},
        bifi::BifiModule,
        eth::EthModule,
        gno::GnoModule,
        nxm::NxmModule,
        xdai::XDaiModule,
        ProtocolContext, ProtocolRegistry,
    },
    rpc::JsonRpcReader,
    store::{HttpKvStore, PortfolioStore},
    updater::{self, PortfolioUpdater, WalletSource},
};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn build_updater(cfg: &Config) -> eyre::Result<PortfolioUpdater> {
    let contracts = Arc::new(ContractRegistry::load(&cfg.contracts_path)?);
    let catalog = Arc::new(MetadataCatalog::load(cfg.metadata_path.as_deref())?);

    let chain = Arc::new(JsonRpcReader::new(&cfg.rpc_url_template, &cfg.alchemy_key, cfg.rpc_timeout)?);
    let prices = Arc::new(HttpPriceOracle::new(cfg.prices.clone(), cfg.price_timeout)?);
    let ctx = ProtocolContext::new(contracts, chain, prices);
    let timeline = Arc::new(HttpTimeline::new(DEFAULT_TIMELINE_URL, cfg.price_timeout)?);

    let registry = ProtocolRegistry::new()
        .with_asset(Arc::new(BifiModule::new(ctx.clone())))
        .with_asset(Arc::new(GnoModule::new(ctx.clone())))
        .with_asset(Arc::new(NxmModule::new(ctx.clone(), cfg.nxm_staking_token_id)))
        .with_asset(Arc::new(XDaiModule::new(ctx.clone())))
        .with_asset(Arc::new(EthModule::new(ctx.clone())))
        .with_discovery(Arc::new(BeefyModule::new(
            timeline,
            cfg.beefy_excluded_products.clone(),
            catalog.clone(),
        )))
        .with_discovery(Arc::new(AaveModule::new(ctx, catalog)));
    info!("Registered protocols: {:?}", registry.tags().collect::<Vec<_>>());

    let kv = Arc::new(HttpKvStore::new(&cfg.store_url, &cfg.store_token, cfg.store_timeout)?);
    let wallets = if cfg.wallets.is_empty() {
        WalletSource::File(cfg.accounts_path.clone())
    } else {
        WalletSource::Fixed(cfg.wallets.clone())
    };

    Ok(PortfolioUpdater::new(
        PortfolioStore::new(kv),
        registry,
        wallets,
        cfg.record_history,
    ))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    info!("Portfolio API starting...");

    let cfg = config::load()?;
    let updater = Arc::new(build_updater(&cfg)?);
    let state = AppState::new(updater.clone(), TriggerAuth::from_config(&cfg));

    let api_handle = tokio::spawn({
        let cfg = cfg.clone();
        async move { api::serve(cfg, state).await }
    });

    let scheduler_handle = tokio::spawn({
        let interval = cfg.update_interval;
        async move {
            match interval {
                Some(interval) => updater::run_every(updater, interval).await,
                None => std::future::pending().await,
            }
        }
    });

    tokio::select! {
        res = api_handle => match res {
            Ok(Ok(_)) => info!("API exited cleanly"),
            Ok(Err(e)) => error!("API error: {:?}", e),
            Err(e) => error!("API task panicked: {:?}", e),
        },
        res = scheduler_handle => match res {
            Ok(Ok(_)) => info!("Scheduler exited cleanly"),
            Ok(Err(e)) => error!("Scheduler error: {:?}", e),
            Err(e) => error!("Scheduler task panicked: {:?}", e),
        },
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received, stopping...");
        }
    }

    info!("Portfolio API stopped.");
    Ok(())
}
