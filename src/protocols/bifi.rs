use alloy::primitives::Address;
use async_trait::async_trait;
use futures_util::try_join;
use rust_decimal::Decimal;
use tracing::debug;

use super::{AssetModule, ProtocolContext};
use crate::error::{PortfolioError, Result};
use crate::models::{round_balance, round_value, Category, EntryMetadata, Position};

const ETH_MOO_BIFI: &str = "ethMooBifi";
const OP_MOO_BIFI: &str = "opMooBifi";
const OP_BIFI_ETH_LP: &str = "opBifiEthLp";
const ETH_BIFI: &str = "ethBifi";

/// BIFI held through mooBIFI vaults on Ethereum and Optimism, plus the BIFI
/// half of the Optimism BIFI-ETH LP vault when it is configured.
pub struct BifiModule {
    ctx: ProtocolContext,
    with_lp: bool,
}

impl BifiModule {
    pub fn new(ctx: ProtocolContext) -> Self {
        let with_lp = ctx.contracts.find(OP_BIFI_ETH_LP).is_some();
        if !with_lp {
            debug!("{} not configured; BIFI-ETH LP leg disabled", OP_BIFI_ETH_LP);
        }
        Self { ctx, with_lp }
    }

    /// BIFI backing mooBIFI share legs, via the Ethereum vault's PPFS.
    async fn moo_bifi_as_bifi(&self, shares: &[Decimal]) -> Result<Decimal> {
        if shares.iter().all(Decimal::is_zero) {
            return Ok(Decimal::ZERO);
        }
        let ppfs = self
            .ctx
            .price_per_full_share(self.ctx.contract(ETH_MOO_BIFI)?)
            .await?;
        Ok(shares.iter().map(|s| round_balance(*s * ppfs)).sum())
    }

    /// LP value = shares x share-to-underlying rate x LP token price.
    async fn lp_value(&self, wallet: Address) -> Result<Decimal> {
        if !self.with_lp {
            return Ok(Decimal::ZERO);
        }
        let lp = self.ctx.contract(OP_BIFI_ETH_LP)?;
        let shares = self.ctx.token_units(lp, wallet).await?;
        if shares.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let price = lp.price_ref()?;
        let (ppfs, lp_price) = try_join!(
            self.ctx.prices.share_to_underlying(&price.symbol),
            self.ctx.prices.price_of(&price),
        )?;
        Ok(round_value(shares * ppfs * lp_price))
    }

    /// BIFI side of the LP: half the pool value, converted back to a token
    /// count at the BIFI spot price.
    async fn lp_bifi_balance(&self, lp_value: Decimal) -> Result<Decimal> {
        let half = round_value(lp_value / Decimal::TWO);
        if half.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let bifi = self.ctx.contract(ETH_BIFI)?.price_ref()?;
        let spot = self.ctx.prices.price_of(&bifi).await?;
        let balance = half
            .checked_div(spot)
            .ok_or_else(|| PortfolioError::PriceUnavailable {
                symbol: bifi.symbol.clone(),
                provider: bifi.source.as_str(),
            })?;
        Ok(round_balance(balance))
    }
}

#[async_trait]
impl AssetModule for BifiModule {
    fn key(&self) -> &'static str {
        "bifi"
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            name: "Beefy Finance".into(),
            category: Category::Governance,
            defi_protocol: None,
            exposure: Some("bifi".into()),
            url: "https://beefy.com/".into(),
            img: "/images/portfolio/bifi-token.png".into(),
        }
    }

    async fn balance(&self, wallet: Address) -> Result<Decimal> {
        Ok(self.position(wallet).await?.balance)
    }

    async fn value(&self, wallet: Address) -> Result<Decimal> {
        Ok(self.position(wallet).await?.value)
    }

    /// Shares and the LP value are read once; both mooBIFI legs share one
    /// PPFS read and one mooBIFI price.
    async fn position(&self, wallet: Address) -> Result<Position> {
        let eth_vault = self.ctx.contract(ETH_MOO_BIFI)?;
        let op_vault = self.ctx.contract(OP_MOO_BIFI)?;
        let (eth_shares, op_shares, lp_value) = try_join!(
            self.ctx.token_units(eth_vault, wallet),
            self.ctx.token_units(op_vault, wallet),
            self.lp_value(wallet),
        )?;
        let shares = [eth_shares, op_shares];
        let (moo_bifi, lp_bifi, moo_value) = try_join!(
            self.moo_bifi_as_bifi(&shares),
            self.lp_bifi_balance(lp_value),
            self.ctx.legs_value(eth_vault, &shares),
        )?;
        Ok(Position::new(
            round_balance(moo_bifi + lp_bifi),
            round_value(moo_value + lp_value),
        ))
    }
}
