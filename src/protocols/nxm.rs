use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use regex::Regex;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::{info, warn};

use super::{AssetModule, ProtocolContext};
use crate::error::{PortfolioError, Result};
use crate::models::{round_balance, Category, EntryMetadata, Position};
use crate::rpc::CallArg;

const ETH_NXM: &str = "ethNxm";
const STAKING_NFT: &str = "nxmStakingNFT";

#[derive(Debug, Clone, Deserialize)]
pub struct StakingMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: String,
}

/// Amounts recovered from a staking NFT description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StakedAmounts {
    pub staked: Decimal,
    pub rewards: Decimal,
}

impl StakedAmounts {
    pub fn total(&self) -> Decimal {
        self.staked + self.rewards
    }
}

/// NXM held by wallets plus one staking NFT position.
pub struct NxmModule {
    ctx: ProtocolContext,
    staking_token_id: Option<u64>,
}

impl NxmModule {
    pub fn new(ctx: ProtocolContext, staking_token_id: Option<u64>) -> Self {
        Self {
            ctx,
            staking_token_id,
        }
    }

    pub async fn staking_metadata(&self, token_id: u64) -> Result<StakingMetadata> {
        let nft = self.ctx.contract(STAKING_NFT)?;
        let uri = self
            .ctx
            .view_text(nft, "tokenURI", vec![CallArg::Uint(U256::from(token_id))])
            .await?;
        decode_token_uri(&uri)
    }
}

/// `data:application/json;base64,<payload>` into the metadata JSON.
pub fn decode_token_uri(uri: &str) -> Result<StakingMetadata> {
    let encoded = uri
        .split(',')
        .nth(1)
        .ok_or_else(|| PortfolioError::Metadata("token URI has no data payload".into()))?;
    let raw = STANDARD
        .decode(encoded.trim())
        .map_err(|e| PortfolioError::Metadata(format!("invalid base64 payload: {}", e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| PortfolioError::Metadata(format!("invalid metadata json: {}", e)))
}

static STAKED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Staked amount: ([\d.]+) NXM").expect("static pattern"));
static REWARDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Pending rewards: ([\d.]+) NXM").expect("static pattern"));

fn grab(re: &Regex, description: &str) -> Decimal {
    re.captures(description)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .and_then(|raw| match Decimal::from_str(raw) {
            Ok(d) => Some(d),
            Err(_) => {
                warn!("Unparseable NXM amount '{}' in staking metadata", raw);
                None
            }
        })
        .unwrap_or(Decimal::ZERO)
}

/// Missing or malformed amounts count as zero.
pub fn parse_staked_amounts(description: &str) -> StakedAmounts {
    StakedAmounts {
        staked: grab(&STAKED, description),
        rewards: grab(&REWARDS, description),
    }
}

#[async_trait]
impl AssetModule for NxmModule {
    fn key(&self) -> &'static str {
        "nxm"
    }

    fn metadata(&self) -> EntryMetadata {
        EntryMetadata {
            name: "Nexus Mutual".into(),
            category: Category::Governance,
            defi_protocol: None,
            exposure: Some("nxm".into()),
            url: "https://nexusmutual.io/".into(),
            img: "/images/portfolio/nxm-token.png".into(),
        }
    }

    async fn balance(&self, wallet: Address) -> Result<Decimal> {
        let nxm = self.ctx.contract(ETH_NXM)?;
        self.ctx.token_balance(nxm, wallet, 3).await
    }

    async fn value(&self, wallet: Address) -> Result<Decimal> {
        let nxm = self.ctx.contract(ETH_NXM)?;
        let balance = self.ctx.token_balance(nxm, wallet, 3).await?;
        self.ctx.contract_value(nxm, balance).await
    }

    /// The staking NFT is one position for the whole fund, not per wallet.
    async fn shared_position(&self) -> Result<Position> {
        let Some(token_id) = self.staking_token_id else {
            return Ok(Position::default());
        };
        let metadata = self.staking_metadata(token_id).await?;
        let amounts = parse_staked_amounts(&metadata.description);
        info!(
            "NXM staking NFT {}: staked {}, rewards {}",
            token_id, amounts.staked, amounts.rewards
        );
        let balance = round_balance(amounts.total());
        let value = self
            .ctx
            .contract_value(self.ctx.contract(ETH_NXM)?, amounts.total())
            .await?;
        Ok(Position::new(balance, value))
    }
}
