// src/models.rs
use std::collections::BTreeMap;
use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Round half away from zero, matching how balances are shown to users.
pub fn round_dp(amount: Decimal, dp: u32) -> Decimal {
    amount
        .round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

pub fn round_balance(amount: Decimal) -> Decimal {
    round_dp(amount, 3)
}

pub fn round_value(amount: Decimal) -> Decimal {
    round_dp(amount, 2)
}

/// Token amount and USD value for one wallet (or a sum of wallets).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub balance: Decimal,
    pub value: Decimal,
}

impl Position {
    pub fn new(balance: Decimal, value: Decimal) -> Self {
        Self { balance, value }
    }

    pub fn is_zero(&self) -> bool {
        self.balance.is_zero() && self.value.is_zero()
    }
}

impl std::ops::Add for Position {
    type Output = Position;

    fn add(self, rhs: Position) -> Position {
        Position {
            balance: self.balance + rhs.balance,
            value: self.value + rhs.value,
        }
    }
}

impl std::ops::AddAssign for Position {
    fn add_assign(&mut self, rhs: Position) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Defi,
    Governance,
    Native,
    Other,
    Stablecoin,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Defi => "defi",
            Category::Governance => "governance",
            Category::Native => "native",
            Category::Other => "other",
            Category::Stablecoin => "stablecoin",
        }
    }
}

/// Tag grouping entries produced by the same discovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefiProtocol {
    Aave,
    Beefy,
}

impl DefiProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            DefiProtocol::Aave => "aave",
            DefiProtocol::Beefy => "beefy",
        }
    }
}

impl fmt::Display for DefiProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub category: Category,
    #[serde(default)]
    pub defi_protocol: Option<DefiProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<String>,
    pub url: String,
    pub img: String,
    #[serde(default)]
    pub balance: Decimal,
    pub value: Decimal,
}

/// Display data attached to an entry, independent of the amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub name: String,
    pub category: Category,
    pub defi_protocol: Option<DefiProtocol>,
    pub exposure: Option<String>,
    pub url: String,
    pub img: String,
}

impl EntryMetadata {
    pub fn into_entry(self, position: Position) -> PortfolioEntry {
        PortfolioEntry {
            name: self.name,
            category: self.category,
            defi_protocol: self.defi_protocol,
            exposure: self.exposure,
            url: self.url,
            img: self.img,
            balance: round_balance(position.balance),
            value: round_value(position.value),
        }
    }
}

/// Key space of `positions` owned by one aggregation task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Partition {
    /// A single fixed asset key such as `bifi`.
    Key(String),
    /// Every entry tagged with the protocol.
    Protocol(DefiProtocol),
}

impl Partition {
    fn owns(&self, key: &str, entry: &PortfolioEntry) -> bool {
        match self {
            Partition::Key(owned) => owned == key,
            Partition::Protocol(protocol) => entry.defi_protocol == Some(*protocol),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Key(key) => write!(f, "{}", key),
            Partition::Protocol(protocol) => write!(f, "protocol:{}", protocol),
        }
    }
}

/// Replacement entries for one partition, produced by an aggregation task.
#[derive(Debug, Clone)]
pub struct PartitionUpdate {
    pub partition: Partition,
    pub entries: Vec<(String, PortfolioEntry)>,
}

/// Ordered mapping of asset key to entry; order survives JSON round trips.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Positions(Vec<(String, PortfolioEntry)>);

impl Positions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&PortfolioEntry> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, e)| e)
    }

    /// Insert or overwrite in place, keeping the key's position.
    pub fn insert(&mut self, key: impl Into<String>, entry: PortfolioEntry) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = entry,
            None => self.0.push((key, entry)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PortfolioEntry)> {
        self.0.iter().map(|(k, e)| (k, e))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &PortfolioEntry> {
        self.0.iter().map(|(_, e)| e)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut PortfolioEntry> {
        self.0.iter_mut().map(|(_, e)| e)
    }

    /// Drop owned entries the update does not re-supply, then insert the
    /// replacements. Re-supplied keys keep their position. A partition whose
    /// update is empty ends up with no entries at all.
    pub fn replace_partition(&mut self, update: PartitionUpdate) -> usize {
        let before = self.0.len();
        self.0.retain(|(k, e)| {
            !update.partition.owns(k, e) || update.entries.iter().any(|(key, _)| key == k)
        });
        let removed = before - self.0.len();
        for (key, entry) in update.entries {
            self.insert(key, entry);
        }
        removed
    }

    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&(String, PortfolioEntry), &(String, PortfolioEntry)) -> std::cmp::Ordering,
    {
        self.0.sort_by(|a, b| compare(a, b));
    }
}

impl Serialize for Positions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, entry) in &self.0 {
            map.serialize_entry(key, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Positions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PositionsVisitor;

        impl<'de> Visitor<'de> for PositionsVisitor {
            type Value = Positions;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of asset keys to portfolio entries")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Positions, A::Error> {
                let mut positions = Positions::new();
                while let Some((key, entry)) = access.next_entry::<String, PortfolioEntry>()? {
                    positions.insert(key, entry);
                }
                Ok(positions)
            }
        }

        deserializer.deserialize_map(PositionsVisitor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Total {
    pub value: Decimal,
}

/// The single persisted snapshot served to clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    #[serde(default)]
    pub positions: Positions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<Total>,
}

/// Daily summary recorded next to each full update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricSummary {
    pub total: Decimal,
    pub by_type: BTreeMap<String, Decimal>,
    pub by_exposure: BTreeMap<String, Decimal>,
}

impl HistoricSummary {
    pub fn from_portfolio(portfolio: &Portfolio) -> Self {
        let mut by_type = BTreeMap::new();
        let mut by_exposure = BTreeMap::new();
        for entry in portfolio.positions.values() {
            *by_type
                .entry(entry.category.as_str().to_string())
                .or_insert(Decimal::ZERO) += entry.value;
            let exposure = entry.exposure.clone().unwrap_or_else(|| "other".to_string());
            *by_exposure.entry(exposure).or_insert(Decimal::ZERO) += entry.value;
        }
        let total = portfolio
            .total
            .map(|t| t.value)
            .unwrap_or_else(|| portfolio.positions.values().map(|e| e.value).sum());
        Self {
            total: round_value(total),
            by_type: by_type.into_iter().map(|(k, v)| (k, round_value(v))).collect(),
            by_exposure: by_exposure
                .into_iter()
                .map(|(k, v)| (k, round_value(v)))
                .collect(),
        }
    }
}

/// Date (`YYYY-MM-DD`) keyed summaries.
pub type HistoricPortfolio = BTreeMap<String, HistoricSummary>;
