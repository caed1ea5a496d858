use alloy::primitives::Address;
use async_trait::async_trait;
use futures_util::future::try_join_all;
use rust_decimal::Decimal;
use tracing::debug;

use super::{AssetModule, ProtocolContext};
use crate::contracts::ContractDescriptor;
use crate::error::Result;
use crate::models::{round_dp, round_value, Category, EntryMetadata, Position};

/// WETH descriptors, one per chain; the first one also prices ETH.
const WETH_CONTRACTS: [&str; 4] = ["ethweth", "opweth", "baseweth", "arbweth"];
const ETH_DP: u32 = 8;

/// Native ETH plus WETH across the configured L1/L2 chains.
pub struct EthModule {
    ctx: ProtocolContext,
    wrapped: Vec<&'static str>,
}

impl EthModule {
    pub fn new(ctx: ProtocolContext) -> Self {
        let wrapped: Vec<&'static str> = WETH_CONTRACTS
            .into_iter()
            .filter(|name| ctx.contracts.find(name).is_some())
            .collect();
        debug!("ETH module tracking {:?}", wrapped);
        Self { ctx, wrapped }
    }

    fn pricing(&self) -> Result<&ContractDescriptor> {
        self.ctx.contract(WETH_CONTRACTS[0])
    }

    /// Native plus wrapped balance on one chain, as separate legs.
    async fn legs(&self, name: &str, wallet: Address) -> Result<(Decimal, Decimal)> {
        let weth = self.ctx.contract(name)?;
        let chain = weth.chain()?;
        let native = self.ctx.native_balance(chain, wallet, ETH_DP).await?;
        let wrapped = self.ctx.token_balance(weth, wallet, ETH_DP).await?;
        Ok((native, wrapped))
    }

    async fn all_legs(&self, wallet: Address) -> Result<Vec<Decimal>> {
        let per_chain = try_join_all(self.wrapped.iter().map(|name| self.legs(name, wallet))).await?;
        Ok(per_chain
            .into_iter()
            .flat_map(|(native, wrapped)| [native, wrapped])
            .collect())
    }
}

#[async_trait]
impl AssetModule for EthModule {
    fn key(&self) -> &'static str {
        "eth"
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            name: "Ether".into(),
            category: Category::Native,
            defi_protocol: None,
            exposure: Some("eth".into()),
            url: "https://ethereum.org/".into(),
            img: "/images/portfolio/eth-token.png".into(),
        }
    }

    async fn balance(&self, wallet: Address) -> Result<Decimal> {
        Ok(self.position(wallet).await?.balance)
    }

    async fn value(&self, wallet: Address) -> Result<Decimal> {
        Ok(self.position(wallet).await?.value)
    }

    /// Every leg is read once and WETH is priced once for all of them.
    async fn position(&self, wallet: Address) -> Result<Position> {
        let legs = self.all_legs(wallet).await?;
        let value = self.ctx.legs_value(self.pricing()?, &legs).await?;
        Ok(Position::new(
            round_dp(legs.iter().sum(), ETH_DP),
            round_value(value),
        ))
    }
}
