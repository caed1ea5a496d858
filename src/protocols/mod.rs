//! Per-protocol balance and value resolution.
//!
//! Single-asset modules implement [`AssetModule`] and own one fixed key in the
//! portfolio. Discovery modules implement [`DiscoveryModule`] and own every
//! entry tagged with their protocol.

pub mod aave;
pub mod beefy;
pub mod bifi;
pub mod eth;
pub mod gno;
pub mod nxm;
pub mod xdai;

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::contracts::{ContractDescriptor, ContractRegistry, PriceRef};
use crate::error::{PortfolioError, Result};
use crate::models::{round_dp, DefiProtocol, EntryMetadata, Position};
use crate::price::PriceOracle;
use crate::rpc::{CallArg, Chain, ChainReader, ViewCall};

/// One asset held across chains, reported under a single key.
#[async_trait]
pub trait AssetModule: Send + Sync {
    fn key(&self) -> &'static str;

    fn metadata(&self) -> EntryMetadata;

    async fn balance(&self, wallet: Address) -> Result<Decimal>;

    async fn value(&self, wallet: Address) -> Result<Decimal>;

    /// Balance and value together. Modules whose two figures share chain
    /// reads or price lookups override this to fetch them once.
    async fn position(&self, wallet: Address) -> Result<Position> {
        let (balance, value) = futures_util::try_join!(self.balance(wallet), self.value(wallet))?;
        Ok(Position::new(balance, value))
    }

    /// Holdings not tied to any wallet, counted once per run.
    async fn shared_position(&self) -> Result<Position> {
        Ok(Position::default())
    }
}

/// A protocol whose products are discovered per wallet.
#[async_trait]
pub trait DiscoveryModule: Send + Sync {
    fn protocol(&self) -> DefiProtocol;

    async fn discover(&self, wallet: Address) -> Result<BTreeMap<String, Position>>;

    fn metadata(&self, key: &str) -> EntryMetadata;
}

#[derive(Clone)]
pub enum ProtocolTask {
    Asset(Arc<dyn AssetModule>),
    Discovery(Arc<dyn DiscoveryModule>),
}

impl ProtocolTask {
    pub fn tag(&self) -> String {
        match self {
            ProtocolTask::Asset(m) => m.key().to_string(),
            ProtocolTask::Discovery(m) => m.protocol().as_str().to_string(),
        }
    }
}

/// Modules run on every update, keyed by protocol tag.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    tasks: BTreeMap<String, ProtocolTask>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, module: Arc<dyn AssetModule>) -> Self {
        self.register(ProtocolTask::Asset(module));
        self
    }

    pub fn with_discovery(mut self, module: Arc<dyn DiscoveryModule>) -> Self {
        self.register(ProtocolTask::Discovery(module));
        self
    }

    pub fn register(&mut self, task: ProtocolTask) {
        self.tasks.insert(task.tag(), task);
    }

    pub fn get(&self, tag: &str) -> Option<&ProtocolTask> {
        self.tasks.get(tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &ProtocolTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Shared collaborators handed to every module at construction.
#[derive(Clone)]
pub struct ProtocolContext {
    pub contracts: Arc<ContractRegistry>,
    pub chain: Arc<dyn ChainReader>,
    pub prices: Arc<dyn PriceOracle>,
}

impl ProtocolContext {
    pub fn new(
        contracts: Arc<ContractRegistry>,
        chain: Arc<dyn ChainReader>,
        prices: Arc<dyn PriceOracle>,
    ) -> Self {
        Self {
            contracts,
            chain,
            prices,
        }
    }

    pub fn contract(&self, name: &str) -> Result<&ContractDescriptor> {
        self.contracts.get(name)
    }

    pub async fn view_uint(&self, contract: &ContractDescriptor, method: &str, args: Vec<CallArg>) -> Result<U256> {
        let call = ViewCall::new(contract, method, args)?;
        self.chain.call_view(call).await?.into_uint()
    }

    pub async fn view_text(&self, contract: &ContractDescriptor, method: &str, args: Vec<CallArg>) -> Result<String> {
        let call = ViewCall::new(contract, method, args)?;
        self.chain.call_view(call).await?.into_text()
    }

    /// `balanceOf(wallet)` in token units, unrounded.
    pub async fn token_units(&self, contract: &ContractDescriptor, wallet: Address) -> Result<Decimal> {
        let raw = self
            .view_uint(contract, "balanceOf", vec![CallArg::Address(wallet)])
            .await?;
        scale_units(raw, contract.decimals)
    }

    pub async fn token_balance(&self, contract: &ContractDescriptor, wallet: Address, dp: u32) -> Result<Decimal> {
        Ok(round_dp(self.token_units(contract, wallet).await?, dp))
    }

    pub async fn native_balance(&self, chain: Chain, wallet: Address, dp: u32) -> Result<Decimal> {
        let raw = self.chain.native_balance(chain, wallet).await?;
        Ok(round_dp(scale_units(raw, 18)?, dp))
    }

    /// `balance * price` rounded to cents. A zero balance never reaches the
    /// price source.
    pub async fn value_of(&self, balance: Decimal, price: &PriceRef) -> Result<Decimal> {
        if balance.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let price = self.prices.price_of(price).await?;
        Ok(round_dp(balance * price, 2))
    }

    /// Value of a balance of the contract's own token, priced through its
    /// descriptor. Price metadata is only required once the balance is nonzero.
    pub async fn contract_value(&self, contract: &ContractDescriptor, balance: Decimal) -> Result<Decimal> {
        if balance.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let price = contract.price_ref()?;
        self.value_of(balance, &price).await
    }

    /// Summed per-leg values for balances of the contract's token. The price
    /// is looked up once, and only when some leg is nonzero.
    pub async fn legs_value(&self, contract: &ContractDescriptor, legs: &[Decimal]) -> Result<Decimal> {
        if legs.iter().all(Decimal::is_zero) {
            return Ok(Decimal::ZERO);
        }
        let price = self.prices.price_of(&contract.price_ref()?).await?;
        Ok(legs.iter().map(|balance| round_dp(*balance * price, 2)).sum())
    }

    /// Share-to-underlying rate from an ERC-4626 style `convertToAssets(1e18)`.
    pub async fn convert_to_assets_rate(&self, vault: &ContractDescriptor) -> Result<Decimal> {
        let one = U256::from(10u64).pow(U256::from(vault.decimals));
        let raw = self
            .view_uint(vault, "convertToAssets", vec![CallArg::Uint(one)])
            .await?;
        scale_units(raw, vault.decimals)
    }

    /// Beefy vault `getPricePerFullShare()` as a decimal rate.
    pub async fn price_per_full_share(&self, vault: &ContractDescriptor) -> Result<Decimal> {
        let raw = self.view_uint(vault, "getPricePerFullShare", vec![]).await?;
        scale_units(raw, 18)
    }
}

/// Raw integer amount divided by `10^decimals`, exactly.
pub fn scale_units(raw: U256, decimals: u32) -> Result<Decimal> {
    let mut amount = Decimal::from_str(&raw.to_string())
        .map_err(|e| PortfolioError::Decode(format!("amount {} does not fit a decimal: {}", raw, e)))?;
    amount
        .set_scale(decimals)
        .map_err(|e| PortfolioError::Decode(format!("scale {}: {}", decimals, e)))?;
    Ok(amount.normalize())
}
