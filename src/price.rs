use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use crate::contracts::{PriceRef, PriceSource};
use crate::error::{PortfolioError, Result};

/// Current USD prices. Implementations do not cache; every call is a lookup.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn price(&self, symbol: &str, source: PriceSource) -> Result<Decimal>;

    /// Vault share to underlying rate for a databarn oracle id.
    async fn share_to_underlying(&self, oracle_id: &str) -> Result<Decimal>;

    async fn price_of(&self, price: &PriceRef) -> Result<Decimal> {
        self.price(&price.symbol, price.source).await
    }
}

/// Base URLs and credentials for the three price backends.
#[derive(Debug, Clone)]
pub struct PriceEndpoints {
    pub beefy_prices: String,
    pub coingecko: String,
    pub databarn: String,
    pub beefy_api_key: Option<String>,
    pub coingecko_api_key: Option<String>,
    pub databarn_api_key: Option<String>,
}

impl Default for PriceEndpoints {
    fn default() -> Self {
        Self {
            beefy_prices: "https://api.beefy.finance/prices".into(),
            coingecko: "https://api.coingecko.com/api/v3".into(),
            databarn: "https://db-core.beefy.com/api/v1".into(),
            beefy_api_key: None,
            coingecko_api_key: None,
            databarn_api_key: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CoingeckoQuote {
    usd: f64,
}

#[derive(Debug, Deserialize)]
struct DatabarnRow {
    price: f64,
}

#[derive(Debug, Deserialize)]
struct DatabarnResponse {
    #[serde(rename = "priceRows", default)]
    price_rows: Vec<DatabarnRow>,
}

#[derive(Debug, Clone)]
pub struct HttpPriceOracle {
    client: Client,
    endpoints: PriceEndpoints,
}

impl HttpPriceOracle {
    pub fn new(endpoints: PriceEndpoints, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoints })
    }

    async fn fetch<T: DeserializeOwned>(&self, service: &'static str, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PortfolioError::Upstream {
                service,
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| PortfolioError::Decode(format!("{} response: {}", service, e)))
    }

    async fn beefy_api(&self, symbol: &str) -> Result<Decimal> {
        let mut req = self.client.get(&self.endpoints.beefy_prices);
        if let Some(key) = &self.endpoints.beefy_api_key {
            req = req.bearer_auth(key);
        }
        let table: HashMap<String, Option<f64>> = self.fetch("beefy api", req).await?;
        match table.get(symbol) {
            Some(Some(price)) => to_decimal(*price, symbol),
            _ => Err(PortfolioError::PriceNotFound {
                symbol: symbol.to_string(),
                provider: "beefy api",
                sample: sample_keys(table.keys()),
            }),
        }
    }

    async fn coingecko(&self, id: &str) -> Result<Decimal> {
        let url = format!("{}/simple/price", self.endpoints.coingecko.trim_end_matches('/'));
        let mut req = self
            .client
            .get(url)
            .query(&[("ids", id), ("vs_currencies", "usd")]);
        if let Some(key) = &self.endpoints.coingecko_api_key {
            req = req.header("x-cg-demo-api-key", key);
        }
        let quotes: HashMap<String, CoingeckoQuote> = self.fetch("coingecko", req).await?;
        match quotes.get(id) {
            Some(quote) => to_decimal(quote.usd, id),
            None => Err(PortfolioError::PriceNotFound {
                symbol: id.to_string(),
                provider: "coingecko",
                sample: sample_keys(quotes.keys()),
            }),
        }
    }

    async fn databarn(&self, oracle_id: &str, price_type: &str) -> Result<Decimal> {
        let url = format!(
            "{}/price/around-a-date",
            self.endpoints.databarn.trim_end_matches('/')
        );
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut req = self.client.get(url).query(&[
            ("price_type", price_type),
            ("oracle_id", oracle_id),
            ("utc_datetime", now.as_str()),
            ("look_around", "1day"),
            ("half_limit", "1"),
        ]);
        if let Some(key) = &self.endpoints.databarn_api_key {
            req = req.bearer_auth(key);
        }
        let data: DatabarnResponse = self.fetch("beefy databarn", req).await?;
        match data.price_rows.first() {
            Some(row) => to_decimal(row.price, oracle_id),
            None => Err(PortfolioError::PriceUnavailable {
                symbol: oracle_id.to_string(),
                provider: "beefy databarn",
            }),
        }
    }
}

#[async_trait]
impl PriceOracle for HttpPriceOracle {
    async fn price(&self, symbol: &str, source: PriceSource) -> Result<Decimal> {
        let price = match source {
            PriceSource::BeefyApi => self.beefy_api(symbol).await?,
            PriceSource::Coingecko => self.coingecko(symbol).await?,
            PriceSource::BeefyDatabarn => self.databarn(symbol, "token_usd").await?,
        };
        debug!("Price {} via {} = ${}", symbol, source, price);
        Ok(price)
    }

    async fn share_to_underlying(&self, oracle_id: &str) -> Result<Decimal> {
        let ppfs = self.databarn(oracle_id, "share_to_underlying").await?;
        debug!("PPFS {} = {}", oracle_id, ppfs);
        Ok(ppfs)
    }
}

fn to_decimal(price: f64, symbol: &str) -> Result<Decimal> {
    Decimal::from_f64(price)
        .ok_or_else(|| PortfolioError::Decode(format!("price {} for '{}' is not a finite number", price, symbol)))
}

fn sample_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    let mut keys: Vec<&str> = keys.map(String::as_str).collect();
    keys.sort_unstable();
    keys.truncate(20);
    keys.join(", ")
}


#[cfg(test)]
mod http_tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn oracle(server: &MockServer, beefy_api_key: Option<&str>) -> HttpPriceOracle {
        let endpoints = PriceEndpoints {
            beefy_prices: format!("{}/prices", server.uri()),
            coingecko: server.uri(),
            databarn: format!("{}/api/v1/", server.uri()),
            beefy_api_key: beefy_api_key.map(String::from),
            coingecko_api_key: None,
            databarn_api_key: Some("db-key".into()),
        };
        HttpPriceOracle::new(endpoints, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn beefy_table_lookup_sends_the_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prices"))
            .and(header("authorization", "Bearer bf-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "BIFI": 412.5, "GNO": 150.0, "DEAD": null })))
            .mount(&server)
            .await;

        let price = oracle(&server, Some("bf-key")).price("BIFI", PriceSource::BeefyApi).await.unwrap();
        assert_eq!(price, Decimal::new(4125, 1));
    }

    #[tokio::test]
    async fn missing_symbol_lists_sample_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prices"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "BIFI": 412.5, "GNO": 150.0, "DEAD": null })))
            .mount(&server)
            .await;
        let oracle = oracle(&server, None);

        match oracle.price("NOPE", PriceSource::BeefyApi).await {
            Err(PortfolioError::PriceNotFound { symbol, provider, sample }) => {
                assert_eq!(symbol, "NOPE");
                assert_eq!(provider, "beefy api");
                assert_eq!(sample, "BIFI, DEAD, GNO");
            }
            other => panic!("expected PriceNotFound, got {:?}", other),
        }
        assert!(matches!(
            oracle.price("DEAD", PriceSource::BeefyApi).await,
            Err(PortfolioError::PriceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn coingecko_quotes_by_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .and(query_param("ids", "nxm"))
            .and(query_param("vs_currencies", "usd"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nxm": { "usd": 61.25 } })))
            .mount(&server)
            .await;

        let price = oracle(&server, None).price("nxm", PriceSource::Coingecko).await.unwrap();
        assert_eq!(price, Decimal::new(6125, 2));
    }

    #[tokio::test]
    async fn databarn_rate_uses_first_row() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/price/around-a-date"))
            .and(query_param("price_type", "share_to_underlying"))
            .and(query_param("oracle_id", "lp-vault"))
            .and(header("authorization", "Bearer db-key"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "priceRows": [{ "price": 2.5 }, { "price": 9.0 }] })),
            )
            .mount(&server)
            .await;

        let rate = oracle(&server, None).share_to_underlying("lp-vault").await.unwrap();
        assert_eq!(rate, Decimal::new(25, 1));
    }

    #[tokio::test]
    async fn empty_databarn_rows_are_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/price/around-a-date"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "priceRows": [] })))
            .mount(&server)
            .await;

        assert!(matches!(
            oracle(&server, None).price("lp-vault", PriceSource::BeefyDatabarn).await,
            Err(PortfolioError::PriceUnavailable { provider: "beefy databarn", .. })
        ));
    }

    #[tokio::test]
    async fn error_status_carries_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        match oracle(&server, None).price("nxm", PriceSource::Coingecko).await {
            Err(PortfolioError::Upstream { service, status, body }) => {
                assert_eq!(service, "coingecko");
                assert_eq!(status, 429);
                assert_eq!(body, "slow down");
            }
            other => panic!("expected Upstream, got {:?}", other),
        }
    }
}
