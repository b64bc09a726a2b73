//! Core data model (§3): address rows, per-(entity,chain) address sets, chain
//! config, cursors, endpoint health, and the normalized transfer event.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// One row produced by an external address loader (§6): an address attributed
/// to an entity on a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRow {
    pub entity: String,
    pub chain: String,
    pub address: String,
}

/// Chain family, used to decide case-normalization rules for address matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    Bitcoin,
    Evm,
    Solana,
}

/// Classifies a chain name into the family that drives its case-normalization
/// and adapter choice. Bitcoin and Solana are named explicitly; every other
/// chain name is assumed EVM-compatible and routed to the EVM adapter (§3).
pub fn chain_family(chain: &str) -> ChainFamily {
    match chain.to_ascii_lowercase().as_str() {
        "bitcoin" | "btc" => ChainFamily::Bitcoin,
        "solana" | "sol" => ChainFamily::Solana,
        _ => ChainFamily::Evm,
    }
}

/// Unordered set of addresses watched for one (entity, chain) pair, normalized
/// per the chain family's case rules so membership checks are O(1).
#[derive(Debug, Clone, Default)]
pub struct EntityAddressSet {
    family: Option<ChainFamily>,
    addresses: HashSet<String>,
}

impl EntityAddressSet {
    pub fn new(family: ChainFamily) -> Self {
        Self {
            family: Some(family),
            addresses: HashSet::new(),
        }
    }

    fn normalize(&self, addr: &str) -> String {
        match self.family {
            Some(ChainFamily::Evm) => addr.to_ascii_lowercase(),
            Some(ChainFamily::Bitcoin) | Some(ChainFamily::Solana) | None => addr.to_string(),
        }
    }

    pub fn insert(&mut self, addr: &str) {
        self.addresses.insert(self.normalize(addr));
        // Bitcoin matches are attempted in both exact and lower forms; Solana
        // is case-sensitive but also checked against a lowercased set for
        // safety (§9). EVM is already normalized to lowercase above.
        if matches!(self.family, Some(ChainFamily::Bitcoin) | Some(ChainFamily::Solana)) {
            self.addresses.insert(addr.to_ascii_lowercase());
        }
    }

    /// Bitcoin and Solana are checked case-exact first, falling back to a
    /// lowercased comparison (§9: address case handling is chain-specific).
    pub fn contains(&self, addr: &str) -> bool {
        if self.addresses.contains(addr) {
            return true;
        }
        self.addresses.contains(&addr.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Iterates the normalized addresses, used by the EVM adapter to build
    /// chunked `OR` topic filters for `eth_getLogs` (§4.3.1).
    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.addresses.iter()
    }
}

/// Per-chain RPC/REST endpoint list plus asset descriptors.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChainConfig {
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub erc20_tokens: Vec<Erc20Token>,
    #[serde(default)]
    pub spl_tokens: Vec<SplToken>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Erc20Token {
    pub symbol: String,
    pub contract: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SplToken {
    pub symbol: String,
    pub mint: String,
}

/// In-memory cursor table: (entity, chain) -> next block/slot to scan.
#[derive(Debug, Clone, Default)]
pub struct CursorTable {
    cursors: HashMap<(String, String), u64>,
}

impl CursorTable {
    pub fn get(&self, entity: &str, chain: &str) -> Option<u64> {
        self.cursors.get(&(entity.to_string(), chain.to_string())).copied()
    }

    /// Invariant: cursor is monotonically non-decreasing (§3). Callers only
    /// ever advance forward; this just enforces that invariant defensively.
    pub fn set(&mut self, entity: &str, chain: &str, value: u64) {
        let key = (entity.to_string(), chain.to_string());
        let entry = self.cursors.entry(key).or_insert(0);
        if value > *entry {
            *entry = value;
        }
    }
}

/// Per-endpoint health tracked by the Solana pool (§3). EVM/Bitcoin pools use
/// only the rotating index, not this struct.
#[derive(Debug, Clone, Default)]
pub struct EndpointHealth {
    pub banned_until: Option<Instant>,
    pub cooldown_until: Option<Instant>,
    pub current_backoff: Option<tokio::time::Duration>,
    pub last_call_at: Option<Instant>,
    pub last_degrade_attempt_at: Option<Instant>,
}

impl EndpointHealth {
    pub fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn is_cooling(&self, now: Instant) -> bool {
        self.cooldown_until.map(|until| now < until).unwrap_or(false)
    }

    pub fn is_healthy(&self, now: Instant) -> bool {
        !self.is_banned(now) && !self.is_cooling(now)
    }

    /// Any success clears cooldown/backoff for that endpoint (§4.2).
    pub fn mark_success(&mut self, now: Instant) {
        self.cooldown_until = None;
        self.current_backoff = None;
        self.last_call_at = Some(now);
    }
}

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// A normalized transfer event emitted to ingest (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub entity: String,
    pub chain: String,
    pub coin: String,
    pub direction: Direction,
    /// Decimal string, up to 8 fractional digits, never negative.
    pub amount: String,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "tx_id")]
    pub txid: String,
    pub from: String,
    pub to: String,
    pub address: String,
    #[serde(rename = "log_index")]
    pub log_index: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evm_addresses_normalize_to_lowercase() {
        let mut set = EntityAddressSet::new(ChainFamily::Evm);
        set.insert("0xABCDEF1234567890abcdef1234567890ABCDEF12");
        assert!(set.contains("0xabcdef1234567890abcdef1234567890abcdef12"));
        assert!(set.contains("0xABCDEF1234567890abcdef1234567890ABCDEF12"));
    }

    #[test]
    fn bitcoin_addresses_match_exact_or_lowercase() {
        let mut set = EntityAddressSet::new(ChainFamily::Bitcoin);
        set.insert("BC1Qxyz");
        assert!(set.contains("BC1Qxyz"));
        assert!(set.contains("bc1qxyz"));
    }

    #[test]
    fn solana_addresses_are_case_sensitive_with_lowercase_fallback() {
        let mut set = EntityAddressSet::new(ChainFamily::Solana);
        set.insert("AbCxyz");
        assert!(set.contains("AbCxyz"));
        // Also checked against a lowercased set for safety (§9).
        assert!(set.contains("abcxyz"));
        assert!(!set.contains("SomethingElse"));
    }

    #[test]
    fn cursor_table_never_moves_backward() {
        let mut table = CursorTable::default();
        table.set("acme", "ethereum", 100);
        table.set("acme", "ethereum", 50);
        assert_eq!(table.get("acme", "ethereum"), Some(100));
        table.set("acme", "ethereum", 150);
        assert_eq!(table.get("acme", "ethereum"), Some(150));
    }

    #[test]
    fn chain_family_routes_known_names_and_defaults_to_evm() {
        assert_eq!(chain_family("bitcoin"), ChainFamily::Bitcoin);
        assert_eq!(chain_family("Solana"), ChainFamily::Solana);
        assert_eq!(chain_family("ethereum"), ChainFamily::Evm);
        assert_eq!(chain_family("arbitrum"), ChainFamily::Evm);
    }

    #[test]
    fn endpoint_health_defaults_to_healthy() {
        let health = EndpointHealth::default();
        let now = Instant::now();
        assert!(health.is_healthy(now));
    }
}
