use std::collections::BTreeMap;

use alloy::primitives::Address;
use futures_util::future::{try_join, try_join_all};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::{Partition, PartitionUpdate, Position};
use crate::protocols::{AssetModule, DiscoveryModule, ProtocolTask};

/// Sum one asset across every wallet, plus its shared holdings.
///
/// Wallet positions are fetched concurrently and already rounded by the
/// module, so the sum is a sum of rounded figures.
pub async fn aggregate_asset(module: &dyn AssetModule, wallets: &[Address]) -> Result<PartitionUpdate> {
    let per_wallet = try_join_all(wallets.iter().map(|&wallet| module.position(wallet)));
    let (per_wallet, shared) = try_join(per_wallet, module.shared_position()).await?;

    let mut total = shared;
    for position in per_wallet {
        total += position;
    }

    let entry = module.metadata().into_entry(total);
    info!(
        "📊 {}: balance {} value ${} across {} wallets",
        module.key(),
        entry.balance,
        entry.value,
        wallets.len()
    );
    Ok(PartitionUpdate {
        partition: Partition::Key(module.key().to_string()),
        entries: vec![(module.key().to_string(), entry)],
    })
}

/// One entry per discovered product, summed per key across wallets.
///
/// The update owns the whole protocol tag, so products that vanished since
/// the last run are dropped when it is applied.
pub async fn aggregate_discovery(module: &dyn DiscoveryModule, wallets: &[Address]) -> Result<PartitionUpdate> {
    let per_wallet = try_join_all(wallets.iter().map(|&wallet| module.discover(wallet))).await?;

    let mut summed: BTreeMap<String, Position> = BTreeMap::new();
    for found in per_wallet {
        for (key, position) in found {
            *summed.entry(key).or_default() += position;
        }
    }

    let entries: Vec<_> = summed
        .into_iter()
        .map(|(key, position)| {
            let entry = module.metadata(&key).into_entry(position);
            debug!("{} {}: {} (${})", module.protocol(), key, entry.balance, entry.value);
            (key, entry)
        })
        .collect();
    info!("📊 {}: {} positions", module.protocol(), entries.len());

    Ok(PartitionUpdate {
        partition: Partition::Protocol(module.protocol()),
        entries,
    })
}

pub async fn run_task(task: &ProtocolTask, wallets: &[Address]) -> Result<PartitionUpdate> {
    match task {
        ProtocolTask::Asset(module) => aggregate_asset(module.as_ref(), wallets).await,
        ProtocolTask::Discovery(module) => aggregate_discovery(module.as_ref(), wallets).await,
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::error::PortfolioError;
    use crate::models::{round_balance, round_value, Category, DefiProtocol, EntryMetadata};
    use crate::protocols::testing::wallet;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn meta(name: &str, category: Category, protocol: Option<DefiProtocol>) -> EntryMetadata {
        EntryMetadata {
            name: name.into(),
            category,
            defi_protocol: protocol,
            exposure: None,
            url: "https://example.org".into(),
            img: "/img.png".into(),
        }
    }

    /// Rounds per wallet like the real modules do.
    struct Vault {
        raw: BTreeMap<Address, Decimal>,
        price: Decimal,
        shared: Position,
    }

    #[async_trait]
    impl AssetModule for Vault {
        fn key(&self) -> &'static str {
            "vault"
        }

        fn metadata(&self) -> EntryMetadata {
            meta("Vault", Category::Governance, None)
        }

        async fn balance(&self, wallet: Address) -> Result<Decimal> {
            Ok(round_balance(self.raw.get(&wallet).copied().unwrap_or_default()))
        }

        async fn value(&self, wallet: Address) -> Result<Decimal> {
            let raw = self.raw.get(&wallet).copied().unwrap_or_default();
            Ok(round_value(round_balance(raw) * self.price))
        }

        async fn shared_position(&self) -> Result<Position> {
            Ok(self.shared)
        }
    }

    #[tokio::test]
    async fn sums_individually_rounded_wallet_figures() {
        let module = Vault {
            raw: [(wallet(1), dec("1.0004")), (wallet(2), dec("1.0004"))].into_iter().collect(),
            price: dec("3.333"),
            shared: Position::default(),
        };

        let update = aggregate_asset(&module, &[wallet(1), wallet(2)]).await.unwrap();
        let (key, entry) = &update.entries[0];

        assert_eq!(update.partition, Partition::Key("vault".into()));
        assert_eq!(key, "vault");
        // 1.000 + 1.000, and 3.33 + 3.33 rather than 2.0008 * 3.333
        assert_eq!(entry.balance, dec("2"));
        assert_eq!(entry.value, dec("6.66"));
    }

    #[tokio::test]
    async fn shared_holdings_are_added_once() {
        let module = Vault {
            raw: [(wallet(1), dec("1"))].into_iter().collect(),
            price: dec("2"),
            shared: Position::new(dec("10"), dec("20")),
        };

        let update = aggregate_asset(&module, &[wallet(1), wallet(2), wallet(3)]).await.unwrap();
        assert_eq!(update.entries[0].1.balance, dec("11"));
        assert_eq!(update.entries[0].1.value, dec("22"));
    }

    struct Vaults(BTreeMap<Address, BTreeMap<String, Position>>);

    #[async_trait]
    impl DiscoveryModule for Vaults {
        fn protocol(&self) -> DefiProtocol {
            DefiProtocol::Beefy
        }

        async fn discover(&self, wallet: Address) -> Result<BTreeMap<String, Position>> {
            match self.0.get(&wallet) {
                Some(found) => Ok(found.clone()),
                None => Err(PortfolioError::Upstream { service: "beefy timeline", status: 503, body: String::new() }),
            }
        }

        fn metadata(&self, key: &str) -> EntryMetadata {
            meta(&format!("Beefy {}", key), Category::Defi, Some(DefiProtocol::Beefy))
        }
    }

    #[tokio::test]
    async fn discovery_sums_products_across_wallets() {
        let mut first = BTreeMap::new();
        first.insert("a".to_string(), Position::new(dec("1.5"), dec("3")));
        first.insert("b".to_string(), Position::new(dec("2"), dec("2")));
        let mut second = BTreeMap::new();
        second.insert("a".to_string(), Position::new(dec("0.5"), dec("1.004")));
        let module = Vaults([(wallet(1), first), (wallet(2), second)].into_iter().collect());

        let update = aggregate_discovery(&module, &[wallet(1), wallet(2)]).await.unwrap();

        assert_eq!(update.partition, Partition::Protocol(DefiProtocol::Beefy));
        assert_eq!(update.entries.len(), 2);
        let (key, a) = &update.entries[0];
        assert_eq!(key, "a");
        assert_eq!(a.balance, dec("2"));
        assert_eq!(a.value, dec("4"));
        assert_eq!(a.defi_protocol, Some(DefiProtocol::Beefy));
    }

    #[tokio::test]
    async fn empty_discovery_still_claims_the_protocol() {
        let module = Vaults([(wallet(1), BTreeMap::new())].into_iter().collect());
        let update = run_task(&ProtocolTask::Discovery(Arc::new(module)), &[wallet(1)]).await.unwrap();
        assert!(update.entries.is_empty());
        assert_eq!(update.partition, Partition::Protocol(DefiProtocol::Beefy));
    }

    #[tokio::test]
    async fn one_failing_wallet_fails_the_task() {
        let module = Vaults([(wallet(1), BTreeMap::new())].into_iter().collect());
        assert!(aggregate_discovery(&module, &[wallet(1), wallet(2)]).await.is_err());
    }
}
