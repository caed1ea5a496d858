use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::error::{PortfolioError, Result};
use crate::models::DefiProtocol;
use crate::rpc::Chain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum PriceSource {
    #[serde(rename = "beefy api")]
    BeefyApi,
    #[serde(rename = "beefy databarn")]
    BeefyDatabarn,
    #[serde(rename = "coingecko")]
    Coingecko,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::BeefyApi => "beefy api",
            PriceSource::BeefyDatabarn => "beefy databarn",
            PriceSource::Coingecko => "coingecko",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbol plus the source that knows how to price it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PriceRef {
    pub symbol: String,
    pub source: PriceSource,
}

/// Static reference data for one on-chain contract.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractDescriptor {
    #[serde(skip)]
    pub name: String,
    pub chain: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub defi_protocol: Option<DefiProtocol>,
    #[serde(default)]
    pub price_symbol: Option<String>,
    #[serde(default)]
    pub price_source: Option<PriceSource>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub abi: Option<Vec<Value>>,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
}

fn default_decimals() -> u32 {
    18
}

impl ContractDescriptor {
    pub fn chain(&self) -> Result<Chain> {
        self.chain.parse()
    }

    pub fn require_address(&self) -> Result<&str> {
        match self.address.as_deref() {
            Some(a) if !a.trim().is_empty() => Ok(a),
            _ => Err(PortfolioError::missing(&self.name, "address")),
        }
    }

    pub fn require_abi(&self) -> Result<&[Value]> {
        match self.abi.as_deref() {
            Some(abi) if !abi.is_empty() => Ok(abi),
            _ => Err(PortfolioError::missing(&self.name, "abi")),
        }
    }

    /// Price metadata is optional on load; value queries need both halves.
    pub fn price_ref(&self) -> Result<PriceRef> {
        let symbol = self
            .price_symbol
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PortfolioError::missing(&self.name, "price_symbol"))?;
        let source = self
            .price_source
            .ok_or_else(|| PortfolioError::missing(&self.name, "price_source"))?;
        Ok(PriceRef {
            symbol: symbol.to_string(),
            source,
        })
    }
}

/// Immutable set of contract descriptors, keyed by logical name.
#[derive(Debug, Clone, Default)]
pub struct ContractRegistry {
    contracts: BTreeMap<String, ContractDescriptor>,
}

impl ContractRegistry {
    pub fn from_json(raw: &str) -> std::result::Result<Self, serde_json::Error> {
        let parsed: BTreeMap<String, ContractDescriptor> = serde_json::from_str(raw)?;
        Ok(Self::from_descriptors(parsed))
    }

    pub fn load(path: impl AsRef<Path>) -> eyre::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("failed to read contracts file {}: {}", path.display(), e))?;
        let registry = Self::from_json(&raw)?;
        info!("Loaded {} contract descriptors from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn from_descriptors(contracts: impl IntoIterator<Item = (String, ContractDescriptor)>) -> Self {
        let contracts = contracts
            .into_iter()
            .map(|(name, mut descriptor)| {
                descriptor.name = name.clone();
                (name, descriptor)
            })
            .collect();
        Self { contracts }
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn find(&self, name: &str) -> Option<&ContractDescriptor> {
        self.contracts.get(name)
    }

    pub fn get(&self, name: &str) -> Result<&ContractDescriptor> {
        self.find(name)
            .ok_or_else(|| PortfolioError::missing(name, "descriptor"))
    }

    pub fn tagged(&self, protocol: DefiProtocol) -> impl Iterator<Item = &ContractDescriptor> {
        self.contracts
            .values()
            .filter(move |c| c.defi_protocol == Some(protocol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "aOptWstEth": {
            "chain": "optimism",
            "type": "defi",
            "defi_protocol": "aave",
            "price_symbol": "wstETH",
            "price_source": "beefy api",
            "address": "0xc45A479877e1e9Dfe9FcD4056c699575a1045dAA",
            "abi": [{"type": "function", "name": "balanceOf"}],
            "decimals": 18
        },
        "gnoGno": {
            "chain": "gnosis",
            "type": "governance",
            "defi_protocol": null,
            "price_symbol": "GNO",
            "price_source": null,
            "address": "0x9C58BAcC331c9aa871AFD802DB6379a98e80CEdb",
            "abi": [],
            "decimals": 18
        }
    }"#;

    #[test]
    fn loads_descriptors_with_names() {
        let registry = ContractRegistry::from_json(SAMPLE).unwrap();
        let aave = registry.get("aOptWstEth").unwrap();
        assert_eq!(aave.name, "aOptWstEth");
        assert_eq!(aave.chain().unwrap(), Chain::Optimism);
        assert_eq!(registry.tagged(DefiProtocol::Aave).count(), 1);
        assert_eq!(
            aave.price_ref().unwrap(),
            PriceRef {
                symbol: "wstETH".into(),
                source: PriceSource::BeefyApi
            }
        );
    }

    #[test]
    fn half_configured_price_fails_naming_the_field() {
        let registry = ContractRegistry::from_json(SAMPLE).unwrap();
        let gno = registry.get("gnoGno").unwrap();
        match gno.price_ref() {
            Err(PortfolioError::Configuration { contract, field }) => {
                assert_eq!(contract, "gnoGno");
                assert_eq!(field, "price_source");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            gno.require_abi(),
            Err(PortfolioError::Configuration { field: "abi", .. })
        ));
    }

    #[test]
    fn unknown_descriptor_is_a_configuration_error() {
        let registry = ContractRegistry::from_json(SAMPLE).unwrap();
        assert!(matches!(
            registry.get("missing"),
            Err(PortfolioError::Configuration { field: "descriptor", .. })
        ));
    }
}
