use alloy::primitives::Address;
use async_trait::async_trait;
use rust_decimal::Decimal;

use super::{AssetModule, ProtocolContext};
use crate::error::Result;
use crate::models::{Category, EntryMetadata};

const GNO_SDAI: &str = "gnoSDai";

/// Savings xDAI held on Gnosis.
pub struct XDaiModule {
    ctx: ProtocolContext,
}

impl XDaiModule {
    pub fn new(ctx: ProtocolContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl AssetModule for XDaiModule {
    fn key(&self) -> &'static str {
        "xdai"
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            name: "xDAI".into(),
            category: Category::Stablecoin,
            defi_protocol: None,
            exposure: Some("usd stablecoins".into()),
            url: "https://docs.gnosischain.com/about/tokens/xdai".into(),
            img: "/images/portfolio/xdai-token.png".into(),
        }
    }

    async fn balance(&self, wallet: Address) -> Result<Decimal> {
        let sdai = self.ctx.contract(GNO_SDAI)?;
        self.ctx.token_balance(sdai, wallet, 3).await
    }

    async fn value(&self, wallet: Address) -> Result<Decimal> {
        let sdai = self.ctx.contract(GNO_SDAI)?;
        let balance = self.ctx.token_balance(sdai, wallet, 3).await?;
        self.ctx.contract_value(sdai, balance).await
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use alloy::primitives::U256;
    use serde_json::json;

    use super::*;
    use crate::error::PortfolioError;
    use crate::protocols::testing::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn balance_respects_configured_decimals() {
        let mut sdai = descriptor("gnosis", 1, Some(("savings-xdai", "coingecko")));
        sdai["decimals"] = json!(6);
        let chain = Arc::new(FakeChain::new());
        chain.set_balance(1, wallet(2), U256::from(1_234_567u64));
        let prices = Arc::new(FakePrices::new().with("savings-xdai", dec("1.1")));
        let module = XDaiModule::new(context(registry(json!({ "gnoSDai": sdai })), chain, prices));

        assert_eq!(module.balance(wallet(2)).await.unwrap(), dec("1.235"));
        assert_eq!(module.value(wallet(2)).await.unwrap(), dec("1.36"));
    }

    #[tokio::test]
    async fn missing_price_metadata_only_blocks_value() {
        let chain = Arc::new(FakeChain::new());
        chain.set_balance(1, wallet(2), units(3));
        let module = XDaiModule::new(context(
            registry(json!({ "gnoSDai": descriptor("gnosis", 1, None) })),
            chain,
            Arc::new(FakePrices::new()),
        ));

        assert_eq!(module.balance(wallet(2)).await.unwrap(), dec("3"));
        assert!(matches!(
            module.value(wallet(2)).await,
            Err(PortfolioError::Configuration { field: "price_symbol", .. })
        ));
    }
}
