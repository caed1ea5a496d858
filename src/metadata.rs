use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::models::{Category, DefiProtocol, EntryMetadata};

/// Display data for a discovered product.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PositionMetadata {
    pub name: String,
    #[serde(default)]
    pub exposure: String,
    pub url: String,
    pub img: String,
}

impl PositionMetadata {
    fn new(name: &str, exposure: &str, url: &str, img: &str) -> Self {
        Self {
            name: name.to_string(),
            exposure: exposure.to_string(),
            url: url.to_string(),
            img: img.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    aave: HashMap<String, PositionMetadata>,
    #[serde(default)]
    beefy: HashMap<String, PositionMetadata>,
}

/// Per-product display metadata for discovery protocols.
#[derive(Debug, Clone)]
pub struct MetadataCatalog {
    aave: HashMap<String, PositionMetadata>,
    beefy: HashMap<String, PositionMetadata>,
}

const AAVE_RESERVE: &str = "https://app.aave.com/reserve-overview/?underlyingAsset=";

impl Default for MetadataCatalog {
    fn default() -> Self {
        let aave = [
            ("aOptWstEth", "Aave OP wstETH", "eth", "0x1f32b1c2345538c0c6f582fcb022739c4a194ebb&marketName=proto_optimism_v3", "wsteth"),
            ("aOptWbtc", "Aave OP wBTC", "btc", "0x68f180fcce6836688e9084f035309e29bf0a2095&marketName=proto_optimism_v3", "wbtc"),
            ("aGnowstEth", "Aave Gnosis wstETH", "eth", "0x6c76971f98945ae98dd7d4dfca8711ebea946ea6&marketName=proto_gnosis_v3", "wsteth"),
            ("aBaseCbEth", "Aave Base cbETH", "eth", "0x2ae3f1ec7f1f5012cfeab0185bfc7aa3cf0dec22&marketName=proto_base_v3", "cbeth"),
            ("aBaseCbBtc", "Aave Base cbBTC", "btc", "0xcbb7c0000ab88b473b1f5afd9ef808440eed33bf&marketName=proto_base_v3", "cbbtc"),
            ("aBaseWeEth", "Aave Base weETH", "eth", "0x04c0599ae5a44757c0af6f9ec3b93da8976c150a&marketName=proto_base_v3", "weeth"),
            ("aBaseWrsEth", "Aave Base wrsETH", "eth", "0xedfa23602d0ec14714057867a78d01e94176bea0&marketName=proto_base_v3", "wrseth"),
            ("aBaseEzEth", "Aave Base ezETH", "eth", "0x2416092f143378750bb29b79ed961ab195cceea5&marketName=proto_base_v3", "ezeth"),
        ]
        .into_iter()
        .map(|(key, name, exposure, reserve, img)| {
            (
                key.to_string(),
                PositionMetadata::new(
                    name,
                    exposure,
                    &format!("{}{}", AAVE_RESERVE, reserve),
                    &format!("/images/portfolio/{}-token.webp", img),
                ),
            )
        })
        .collect();

        let beefy = [
            ("velodrome-v2-frax-usdc", "Beefy OP Velodrome FRAX-USDC"),
            ("curve-op-crvusd-usdt", "Beefy OP Curve crvUSD-USDT"),
        ]
        .into_iter()
        .map(|(key, name)| {
            (
                key.to_string(),
                PositionMetadata::new(
                    name,
                    "usd stablecoins",
                    &format!("https://app.beefy.com/vault/{}", key),
                    "/images/portfolio/bifi-token.webp",
                ),
            )
        })
        .collect();

        Self { aave, beefy }
    }
}

impl MetadataCatalog {
    /// Built-in entries overlaid with the optional JSON file.
    pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
        let mut catalog = Self::default();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| eyre::eyre!("failed to read metadata file {}: {}", path.display(), e))?;
            let file: CatalogFile = serde_json::from_str(&raw)?;
            info!(
                "Loaded metadata overrides: {} aave, {} beefy",
                file.aave.len(),
                file.beefy.len()
            );
            catalog.aave.extend(file.aave);
            catalog.beefy.extend(file.beefy);
        }
        Ok(catalog)
    }

    pub fn lookup(&self, protocol: DefiProtocol, key: &str) -> PositionMetadata {
        match protocol {
            DefiProtocol::Aave => self.aave.get(key).cloned().unwrap_or_else(|| {
                PositionMetadata::new(
                    &format!("Aave {}", key),
                    "",
                    "https://app.aave.com/",
                    "/images/portfolio/aave-token.webp",
                )
            }),
            DefiProtocol::Beefy => self.beefy.get(key).cloned().unwrap_or_else(|| {
                PositionMetadata::new(
                    &format!("Beefy {}", key),
                    "",
                    &format!("https://app.beefy.com/vault/{}", key),
                    "/images/portfolio/bifi-token.webp",
                )
            }),
        }
    }

    pub fn entry(&self, protocol: DefiProtocol, key: &str) -> EntryMetadata {
        let meta = self.lookup(protocol, key);
        EntryMetadata {
            name: meta.name,
            category: Category::Defi,
            defi_protocol: Some(protocol),
            exposure: Some(meta.exposure).filter(|e| !e.is_empty()),
            url: meta.url,
            img: meta.img,
        }
    }
}
