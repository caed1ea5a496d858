use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use alloy::primitives::Address;
use chrono::{NaiveDate, Utc};
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::aggregator::run_task;
use crate::error::{PortfolioError, Result};
use crate::models::{round_balance, round_value, HistoricSummary, Portfolio, Total};
use crate::protocols::ProtocolRegistry;
use crate::rpc::parse_address;
use crate::store::PortfolioStore;

/// Where the tracked wallets come from.
#[derive(Debug, Clone)]
pub enum WalletSource {
    /// Accounts file whose top-level keys are wallet addresses; re-read every run.
    File(PathBuf),
    Fixed(Vec<Address>),
}

impl WalletSource {
    pub fn wallets(&self) -> Result<Vec<Address>> {
        match self {
            WalletSource::Fixed(wallets) => Ok(wallets.clone()),
            WalletSource::File(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| PortfolioError::Accounts(format!("{}: {}", path.display(), e)))?;
                parse_accounts(&raw)
            }
        }
    }
}

pub fn parse_accounts(raw: &str) -> Result<Vec<Address>> {
    let accounts: serde_json::Map<String, Value> =
        serde_json::from_str(raw).map_err(|e| PortfolioError::Accounts(e.to_string()))?;
    accounts.keys().map(|key| parse_address(key)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Reading,
    Aggregating,
    Normalizing,
    Writing,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::Reading => "reading",
            Stage::Aggregating => "aggregating",
            Stage::Normalizing => "normalizing",
            Stage::Writing => "writing",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Runs one full read, aggregate, normalize, write cycle at a time.
pub struct PortfolioUpdater {
    store: PortfolioStore,
    registry: ProtocolRegistry,
    wallets: WalletSource,
    record_history: bool,
    running: Mutex<()>,
}

impl PortfolioUpdater {
    pub fn new(store: PortfolioStore, registry: ProtocolRegistry, wallets: WalletSource, record_history: bool) -> Self {
        Self {
            store,
            registry,
            wallets,
            record_history,
            running: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &PortfolioStore {
        &self.store
    }

    /// Refresh every protocol and persist the result.
    ///
    /// A run already in flight makes this fail with `UpdateInProgress`
    /// rather than wait. Nothing is written unless every task succeeds.
    pub async fn update(&self) -> Result<Portfolio> {
        let _guard = self.running.try_lock().map_err(|_| PortfolioError::UpdateInProgress)?;
        let started = std::time::Instant::now();
        match self.run().await {
            Ok(portfolio) => {
                log_stage(Stage::Done);
                info!(
                    "✅ Portfolio updated in {:?}: {} positions, total ${}",
                    started.elapsed(),
                    portfolio.positions.len(),
                    portfolio.total.map(|t| t.value).unwrap_or_default()
                );
                Ok(portfolio)
            }
            Err(e) => {
                log_stage(Stage::Failed);
                error!("❌ Portfolio update failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run(&self) -> Result<Portfolio> {
        log_stage(Stage::Reading);
        let wallets = self.wallets.wallets()?;
        let mut portfolio = self.store.read().await?;

        log_stage(Stage::Aggregating);
        info!(
            "Running {} protocol tasks ({}) over {} wallets",
            self.registry.len(),
            self.registry.tags().collect::<Vec<_>>().join(", "),
            wallets.len()
        );
        let updates = try_join_all(self.registry.tasks().map(|task| run_task(task, &wallets))).await?;
        for update in updates {
            let partition = update.partition.to_string();
            let removed = portfolio.positions.replace_partition(update);
            debug!("🧹 {}: replaced {} stored entries", partition, removed);
        }

        log_stage(Stage::Normalizing);
        let portfolio = normalize(portfolio);

        log_stage(Stage::Writing);
        self.store.write(&portfolio).await?;

        if self.record_history {
            if let Err(e) = self.record_history(&portfolio, Utc::now().date_naive()).await {
                warn!("⚠️ Portfolio written but history not recorded: {}", e);
            }
        }
        Ok(portfolio)
    }

    /// Store the day's summary, replacing any earlier summary for that day.
    pub async fn record_history(&self, portfolio: &Portfolio, day: NaiveDate) -> Result<()> {
        let mut history = self.store.read_history().await?;
        let key = day.format("%Y-%m-%d").to_string();
        history.insert(key.clone(), HistoricSummary::from_portfolio(portfolio));
        self.store.write_history(&history).await?;
        info!("🗓️ Recorded portfolio history for {}", key);
        Ok(())
    }
}

/// Periodic runs sharing the trigger's guard; a run still in flight is skipped.
pub async fn run_every(updater: Arc<PortfolioUpdater>, interval: Duration) -> eyre::Result<()> {
    info!("Scheduler started, updating every {:?}", interval);
    loop {
        sleep(interval).await;
        match updater.update().await {
            Ok(_) => {}
            Err(PortfolioError::UpdateInProgress) => info!("Scheduled update skipped, a run is already in flight"),
            Err(e) => warn!("Scheduled update failed: {}", e),
        }
    }
}

fn log_stage(stage: Stage) {
    info!("🔄 Update stage: {}", stage);
}

/// Round every entry, order by category then value (highest first), and
/// recompute the total from the rounded values.
pub fn normalize(mut portfolio: Portfolio) -> Portfolio {
    for entry in portfolio.positions.values_mut() {
        entry.balance = round_balance(entry.balance);
        entry.value = round_value(entry.value);
    }
    portfolio.positions.sort_by(|(ka, a), (kb, b)| {
        a.category
            .as_str()
            .cmp(b.category.as_str())
            .then_with(|| b.value.cmp(&a.value))
            .then_with(|| ka.cmp(kb))
    });
    let total: Decimal = portfolio.positions.values().map(|e| e.value).sum();
    portfolio.total = Some(Total { value: round_value(total) });
    portfolio
}
