use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{PortfolioError, Result};
use crate::models::{HistoricPortfolio, Portfolio};

pub const PORTFOLIO_KEY: &str = "portfolio";
pub const HISTORY_KEY: &str = "portfolio_history";

/// Remote string-valued key/value store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;
}

#[derive(Deserialize)]
struct GetResponse {
    result: Option<String>,
}

/// REST key/value store: `GET {base}/get/{key}` and `POST {base}/set/{key}`,
/// both authorised with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpKvStore {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpKvStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Every failure, transport and decoding included, is a store error.
    async fn check(key: &str, sent: reqwest::Result<reqwest::Response>) -> Result<reqwest::Response> {
        let resp = sent.map_err(|e| PortfolioError::Store(format!("{}: {}", key, e)))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PortfolioError::store_status(status.as_u16(), &body))
    }
}

#[async_trait]
impl KeyValueStore for HttpKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = format!("{}/get/{}", self.base_url, key);
        debug!("📡 Store GET {}", key);
        let sent = self.client.get(&url).bearer_auth(&self.token).send().await;
        let body: GetResponse = Self::check(key, sent)
            .await?
            .json()
            .await
            .map_err(|e| PortfolioError::Store(format!("{}: malformed response: {}", key, e)))?;
        Ok(body.result)
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let url = format!("{}/set/{}", self.base_url, key);
        debug!("📡 Store SET {} ({} bytes)", key, value.len());
        let sent = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .body(value)
            .send()
            .await;
        Self::check(key, sent).await?;
        Ok(())
    }
}

/// Typed access to the portfolio document and its history.
#[derive(Clone)]
pub struct PortfolioStore {
    kv: std::sync::Arc<dyn KeyValueStore>,
}

impl PortfolioStore {
    pub fn new(kv: std::sync::Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Raw stored document, exactly as persisted. A blank value counts as missing.
    pub async fn read_raw(&self) -> Result<Option<String>> {
        Ok(present(self.kv.get(PORTFOLIO_KEY).await?))
    }

    /// A missing document reads as an empty portfolio.
    pub async fn read(&self) -> Result<Portfolio> {
        match self.read_raw().await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| PortfolioError::Decode(format!("stored portfolio: {}", e))),
            None => {
                info!("No stored portfolio yet, starting empty");
                Ok(Portfolio::default())
            }
        }
    }

    /// The document is fully encoded before the store is touched.
    pub async fn write(&self, portfolio: &Portfolio) -> Result<()> {
        let raw = serde_json::to_string(portfolio)
            .map_err(|e| PortfolioError::Decode(format!("encode portfolio: {}", e)))?;
        self.kv.set(PORTFOLIO_KEY, raw).await
    }

    pub async fn read_history_raw(&self) -> Result<Option<String>> {
        Ok(present(self.kv.get(HISTORY_KEY).await?))
    }

    pub async fn read_history(&self) -> Result<HistoricPortfolio> {
        match self.read_history_raw().await? {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| PortfolioError::Decode(format!("stored history: {}", e))),
            None => Ok(HistoricPortfolio::new()),
        }
    }

    pub async fn write_history(&self, history: &HistoricPortfolio) -> Result<()> {
        let raw = serde_json::to_string(history)
            .map_err(|e| PortfolioError::Decode(format!("encode history: {}", e)))?;
        self.kv.set(HISTORY_KEY, raw).await
    }
}

fn present(raw: Option<String>) -> Option<String> {
    raw.filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// In-process store with write counting and injectable failures.
    #[derive(Default)]
    pub struct MemoryStore {
        data: Mutex<HashMap<String, String>>,
        pub writes: AtomicUsize,
        pub fail_writes: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn raw(&self, key: &str) -> Option<String> {
            self.data.lock().unwrap().get(key).cloned()
        }

        pub fn put(&self, key: &str, value: &str) {
            self.data.lock().unwrap().insert(key.to_string(), value.to_string());
        }
    }

    #[async_trait]
    impl KeyValueStore for MemoryStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.raw(key))
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PortfolioError::store_status(500, "write rejected"));
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.data.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use super::memory::MemoryStore;
    use super::*;
    use crate::models::{Category, HistoricSummary, PortfolioEntry, Total};

    #[tokio::test]
    async fn missing_document_reads_empty() {
        let store = PortfolioStore::new(Arc::new(MemoryStore::new()));
        let portfolio = store.read().await.unwrap();
        assert!(portfolio.positions.is_empty());
        assert!(portfolio.total.is_none());
        assert!(store.read_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn written_document_reads_back_identical() {
        let kv = Arc::new(MemoryStore::new());
        let store = PortfolioStore::new(kv.clone());
        let mut portfolio = Portfolio::default();
        portfolio.positions.insert(
            "gno",
            PortfolioEntry {
                name: "Gnosis".into(),
                category: Category::Governance,
                defi_protocol: None,
                exposure: Some("gno".into()),
                url: "https://gnosis.io".into(),
                img: "/gno.png".into(),
                balance: Decimal::from_str("12.345").unwrap(),
                value: Decimal::from_str("2469.01").unwrap(),
            },
        );
        portfolio.total = Some(Total { value: Decimal::from_str("2469.01").unwrap() });

        store.write(&portfolio).await.unwrap();

        assert_eq!(store.read().await.unwrap(), portfolio);
        let raw = kv.raw(PORTFOLIO_KEY).unwrap();
        assert!(raw.contains("\"value\":2469.01"));
    }

    #[tokio::test]
    async fn corrupt_document_is_a_decode_error() {
        let kv = Arc::new(MemoryStore::new());
        kv.put(PORTFOLIO_KEY, "{not json");
        let store = PortfolioStore::new(kv);
        assert!(matches!(store.read().await, Err(PortfolioError::Decode(_))));
    }

    #[tokio::test]
    async fn blank_document_reads_empty() {
        let kv = Arc::new(MemoryStore::new());
        kv.put(PORTFOLIO_KEY, "");
        kv.put(HISTORY_KEY, "  ");
        let store = PortfolioStore::new(kv);

        assert!(store.read_raw().await.unwrap().is_none());
        assert_eq!(store.read().await.unwrap(), Portfolio::default());
        assert!(store.read_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn history_round_trips_by_date() {
        let store = PortfolioStore::new(Arc::new(MemoryStore::new()));
        let mut history = HistoricPortfolio::new();
        history.insert("2024-06-01".into(), HistoricSummary::default());
        store.write_history(&history).await.unwrap();
        assert_eq!(store.read_history().await.unwrap(), history);
    }
}
