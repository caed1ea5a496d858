use std::collections::BTreeMap;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use futures_util::future::try_join_all;

use super::{DiscoveryModule, ProtocolContext};
use crate::contracts::ContractDescriptor;
use crate::error::Result;
use crate::metadata::MetadataCatalog;
use crate::models::{DefiProtocol, EntryMetadata, Position};

/// aToken precision kept per wallet; the aggregator rounds the sums.
const ATOKEN_DP: u32 = 18;

/// Every descriptor tagged `aave` is one market, read independently.
pub struct AaveModule {
    ctx: ProtocolContext,
    catalog: Arc<MetadataCatalog>,
}

impl AaveModule {
    pub fn new(ctx: ProtocolContext, catalog: Arc<MetadataCatalog>) -> Self {
        Self { ctx, catalog }
    }

    async fn market_position(&self, market: &ContractDescriptor, wallet: Address) -> Result<(String, Position)> {
        let balance = self.ctx.token_balance(market, wallet, ATOKEN_DP).await?;
        let value = self.ctx.contract_value(market, balance).await?;
        Ok((market.name.clone(), Position::new(balance, value)))
    }
}

#[async_trait]
impl DiscoveryModule for AaveModule {
    fn protocol(&self) -> DefiProtocol {
        DefiProtocol::Aave
    }

    async fn discover(&self, wallet: Address) -> Result<BTreeMap<String, Position>> {
        let markets = self.ctx.contracts.tagged(DefiProtocol::Aave);
        let positions = try_join_all(markets.map(|m| self.market_position(m, wallet))).await?;
        Ok(positions.into_iter().collect())
    }

    fn metadata(&self, key: &str) -> EntryMetadata {
        self.catalog.entry(DefiProtocol::Aave, key)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use alloy::primitives::U256;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;
    use crate::protocols::testing::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn market(byte: u8, symbol: &str, decimals: u32) -> serde_json::Value {
        let mut d = descriptor("optimism", byte, Some((symbol, "beefy api")));
        d["defi_protocol"] = json!("aave");
        d["decimals"] = json!(decimals);
        d
    }

    #[tokio::test]
    async fn reports_every_tagged_market() {
        let contracts = registry(json!({
            "aOptWstEth": market(1, "wstETH", 18),
            "aOptWbtc": market(2, "WBTC", 8),
            "ethGno": descriptor("ethereum", 3, Some(("GNO", "beefy api"))),
        }));
        let chain = Arc::new(FakeChain::new());
        let holder = wallet(4);
        chain.set_balance(1, holder, units(2));
        chain.set_balance(2, holder, U256::from(50_000_000u64));
        let prices = Arc::new(FakePrices::new().with("wstETH", dec("3000")).with("WBTC", dec("60000")));
        let module = AaveModule::new(context(contracts, chain, prices), Arc::new(MetadataCatalog::default()));

        let found = module.discover(holder).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found["aOptWstEth"], Position::new(dec("2"), dec("6000")));
        assert_eq!(found["aOptWbtc"], Position::new(dec("0.5"), dec("30000")));
        assert_eq!(module.metadata("aOptWbtc").name, "Aave OP wBTC");
    }

    #[tokio::test]
    async fn idle_markets_cost_no_price_calls() {
        let contracts = registry(json!({ "aOptWstEth": market(1, "wstETH", 18) }));
        let prices = Arc::new(FakePrices::new());
        let module = AaveModule::new(
            context(contracts, Arc::new(FakeChain::new()), prices.clone()),
            Arc::new(MetadataCatalog::default()),
        );

        let found = module.discover(wallet(1)).await.unwrap();
        assert_eq!(found["aOptWstEth"], Position::default());
        assert_eq!(prices.count(), 0);
    }
}
