use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::debug;

use super::DiscoveryModule;
use crate::error::{PortfolioError, Result};
use crate::metadata::MetadataCatalog;
use crate::models::{DefiProtocol, EntryMetadata, Position};

/// One event from the per-wallet Beefy timeline.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineEntry {
    pub datetime: DateTime<Utc>,
    #[serde(default)]
    pub product_key: String,
    pub display_name: String,
    #[serde(default)]
    pub chain: String,
    #[serde(default)]
    pub is_eol: bool,
    #[serde(default)]
    pub share_balance: f64,
    pub underlying_balance: f64,
    pub usd_balance: f64,
}

#[async_trait]
pub trait TimelineSource: Send + Sync {
    async fn timeline(&self, wallet: Address) -> Result<Vec<TimelineEntry>>;
}

/// Databarn timeline endpoint.
#[derive(Debug, Clone)]
pub struct HttpTimeline {
    client: Client,
    base_url: String,
}

pub const DEFAULT_TIMELINE_URL: &str = "https://databarn.beefy.com/api/v1/beefy/timeline";

impl HttpTimeline {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl TimelineSource for HttpTimeline {
    async fn timeline(&self, wallet: Address) -> Result<Vec<TimelineEntry>> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("address", wallet.to_string())])
            .send()
            .await?;
        let status = resp.status();
        // unknown addresses have no timeline
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PortfolioError::Upstream {
                service: "beefy timeline",
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| PortfolioError::Decode(format!("beefy timeline response: {}", e)))
    }
}

/// Beefy vault positions discovered from wallet history.
pub struct BeefyModule {
    timeline: Arc<dyn TimelineSource>,
    excluded: HashSet<String>,
    catalog: Arc<MetadataCatalog>,
}

impl BeefyModule {
    pub fn new(
        timeline: Arc<dyn TimelineSource>,
        excluded: impl IntoIterator<Item = String>,
        catalog: Arc<MetadataCatalog>,
    ) -> Self {
        Self {
            timeline,
            excluded: excluded.into_iter().collect(),
            catalog,
        }
    }
}

/// Latest entry per product, keeping material, non-excluded positions.
pub fn current_positions(
    timeline: Vec<TimelineEntry>,
    excluded: &HashSet<String>,
) -> BTreeMap<String, Position> {
    let mut latest: HashMap<String, TimelineEntry> = HashMap::new();
    for entry in timeline {
        match latest.get(&entry.display_name) {
            Some(existing) if existing.datetime >= entry.datetime => {}
            _ => {
                latest.insert(entry.display_name.clone(), entry);
            }
        }
    }

    latest
        .into_iter()
        .filter(|(name, entry)| {
            entry.underlying_balance != 0.0 && entry.usd_balance != 0.0 && !excluded.contains(name)
        })
        .filter_map(|(name, entry)| {
            let balance = Decimal::from_f64(entry.underlying_balance)?;
            let value = Decimal::from_f64(entry.usd_balance)?;
            Some((name, Position::new(balance, value)))
        })
        .collect()
}

#[async_trait]
impl DiscoveryModule for BeefyModule {
    fn protocol(&self) -> DefiProtocol {
        DefiProtocol::Beefy
    }

    async fn discover(&self, wallet: Address) -> Result<BTreeMap<String, Position>> {
        let timeline = self.timeline.timeline(wallet).await?;
        let events = timeline.len();
        let positions = current_positions(timeline, &self.excluded);
        debug!(
            "Beefy timeline for {}: {} events, {} open positions",
            wallet,
            events,
            positions.len()
        );
        Ok(positions)
    }

    fn metadata(&self, key: &str) -> EntryMetadata {
        self.catalog.entry(DefiProtocol::Beefy, key)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn event(name: &str, at: &str, underlying: f64, usd: f64) -> TimelineEntry {
        TimelineEntry {
            datetime: DateTime::parse_from_rfc3339(at).unwrap().with_timezone(&Utc),
            product_key: format!("beefy:vault:optimism:{}", name),
            display_name: name.to_string(),
            chain: "optimism".into(),
            is_eol: false,
            share_balance: underlying,
            underlying_balance: underlying,
            usd_balance: usd,
        }
    }

    fn excluded() -> HashSet<String> {
        ["optimism-bridged-bifi-vault".to_string()].into_iter().collect()
    }

    #[test]
    fn keeps_only_the_latest_event_per_product() {
        let positions = current_positions(
            vec![
                event("curve-op-crvusd-usdt", "2024-05-02T00:00:00Z", 150.0, 151.0),
                event("curve-op-crvusd-usdt", "2024-01-01T00:00:00Z", 10.0, 10.0),
            ],
            &excluded(),
        );
        assert_eq!(
            positions["curve-op-crvusd-usdt"],
            Position::new(Decimal::from(150), Decimal::from(151))
        );
    }

    #[test]
    fn drops_closed_and_excluded_products() {
        let positions = current_positions(
            vec![
                event("velodrome-v2-frax-usdc", "2024-01-01T00:00:00Z", 5.0, 5.0),
                event("velodrome-v2-frax-usdc", "2024-03-01T00:00:00Z", 0.0, 0.0),
                event("dusty-vault", "2024-03-01T00:00:00Z", 1.0, 0.0),
                event("optimism-bridged-bifi-vault", "2024-03-01T00:00:00Z", 9.0, 900.0),
                event("live-vault", "2024-03-01T00:00:00Z", 2.5, 7.25),
            ],
            &excluded(),
        );
        assert_eq!(positions.keys().collect::<Vec<_>>(), vec!["live-vault"]);
        assert_eq!(positions["live-vault"].value, Decimal::from_str("7.25").unwrap());
    }

    #[test]
    fn timeline_json_parses() {
        let raw = r#"[{
            "datetime": "2024-03-01T12:00:00.000Z",
            "product_key": "beefy:vault:optimism:x",
            "display_name": "x",
            "chain": "optimism",
            "is_eol": false,
            "is_dashboard_eol": false,
            "transaction_hash": "0xabc",
            "share_to_underlying_price": 1.01,
            "underlying_to_usd_price": 1.0,
            "share_balance": 10.0,
            "underlying_balance": 10.1,
            "usd_balance": 10.1,
            "share_diff": 10.0,
            "underlying_diff": 10.1,
            "usd_diff": 10.1
        }]"#;
        let parsed: Vec<TimelineEntry> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].display_name, "x");
    }

    struct Canned(Vec<TimelineEntry>);

    #[async_trait]
    impl TimelineSource for Canned {
        async fn timeline(&self, _wallet: Address) -> Result<Vec<TimelineEntry>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn discovery_uses_catalog_metadata() {
        let module = BeefyModule::new(
            Arc::new(Canned(vec![event("curve-op-crvusd-usdt", "2024-05-02T00:00:00Z", 1.0, 1.0)])),
            excluded(),
            Arc::new(MetadataCatalog::default()),
        );
        let found = module.discover(Address::ZERO).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(module.metadata("curve-op-crvusd-usdt").name, "Beefy OP Curve crvUSD-USDT");
    }
}
