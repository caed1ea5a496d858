use thiserror::Error;

/// Errors produced while building or persisting a portfolio snapshot.
#[derive(Debug, Error)]
pub enum PortfolioError {
    /// A contract descriptor lacks a field needed by the operation.
    #[error("configuration error: contract '{contract}' is missing {field}")]
    Configuration { contract: String, field: &'static str },

    #[error("unsupported chain \"{0}\"")]
    UnsupportedChain(String),

    #[error("price not found for '{symbol}' in {provider} response. Sample keys: {sample}")]
    PriceNotFound {
        symbol: String,
        provider: &'static str,
        sample: String,
    },

    #[error("{provider} returned no price rows for '{symbol}'")]
    PriceUnavailable { symbol: String, provider: &'static str },

    #[error("{service} request failed with HTTP {status}: {body}")]
    Upstream {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("json-rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("accounts error: {0}")]
    Accounts(String),

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("staking metadata error: {0}")]
    Metadata(String),

    #[error("a portfolio update is already in progress")]
    UpdateInProgress,

    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
}

impl PortfolioError {
    pub fn missing(contract: impl Into<String>, field: &'static str) -> Self {
        PortfolioError::Configuration {
            contract: contract.into(),
            field,
        }
    }

    pub fn store_status(status: u16, body: impl Into<String>) -> Self {
        PortfolioError::Store(format!("request failed {}: {}", status, body.into()))
    }
}

pub type Result<T> = std::result::Result<T, PortfolioError>;
