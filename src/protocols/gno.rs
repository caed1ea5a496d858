use alloy::primitives::Address;
use async_trait::async_trait;
use futures_util::try_join;
use rust_decimal::Decimal;

use super::{AssetModule, ProtocolContext};
use crate::error::Result;
use crate::models::{round_balance, round_value, Category, EntryMetadata, Position};

const ETH_GNO: &str = "ethGno";
const GNO_GNO: &str = "gnoGno";
const GNO_OS_GNO: &str = "gnoOsGno";
const OS_GNO_VAULT: &str = "gnoOsGnoGenesisVault";

/// GNO on Ethereum and Gnosis, plus osGNO counted as its underlying GNO.
pub struct GnoModule {
    ctx: ProtocolContext,
}

impl GnoModule {
    pub fn new(ctx: ProtocolContext) -> Self {
        Self { ctx }
    }

    async fn plain_balance(&self, name: &str, wallet: Address) -> Result<Decimal> {
        let contract = self.ctx.contract(name)?;
        self.ctx.token_balance(contract, wallet, 3).await
    }

    /// GNO redeemable for the wallet's osGNO.
    async fn os_gno_underlying(&self, wallet: Address) -> Result<Decimal> {
        let shares = self.plain_balance(GNO_OS_GNO, wallet).await?;
        if shares.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let rate = self
            .ctx
            .convert_to_assets_rate(self.ctx.contract(OS_GNO_VAULT)?)
            .await?;
        Ok(round_balance(shares * rate))
    }
}

#[async_trait]
impl AssetModule for GnoModule {
    fn key(&self) -> &'static str {
        "gno"
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            name: "Gnosis".into(),
            category: Category::Governance,
            defi_protocol: None,
            exposure: Some("gno".into()),
            url: "https://gnosis.io/".into(),
            img: "/images/portfolio/gno-token.png".into(),
        }
    }

    async fn balance(&self, wallet: Address) -> Result<Decimal> {
        Ok(self.position(wallet).await?.balance)
    }

    async fn value(&self, wallet: Address) -> Result<Decimal> {
        Ok(self.position(wallet).await?.value)
    }

    /// All three legs are GNO, so they share one price lookup.
    async fn position(&self, wallet: Address) -> Result<Position> {
        let (eth, gnosis, os) = try_join!(
            self.plain_balance(ETH_GNO, wallet),
            self.plain_balance(GNO_GNO, wallet),
            self.os_gno_underlying(wallet),
        )?;
        let value = self
            .ctx
            .legs_value(self.ctx.contract(ETH_GNO)?, &[eth, gnosis, os])
            .await?;
        Ok(Position::new(round_balance(eth + gnosis + os), round_value(value)))
    }
}
