//! EVM adapter (§4.3.1): native value transfers + ERC-20 `Transfer` log
//! scanning, normalized against the watched address set.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ethers::types::U256;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::AdapterError;
use crate::model::{Direction, EntityAddressSet, Erc20Token, Event};
use crate::pool::SimplePool;
use crate::transport::Transport;

use super::{chunk, ChainAdapter, EVM_LAG, EVM_WINDOW};

const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";
const CALL_DEADLINE: Duration = Duration::from_secs(45);
const ADDRESS_CHUNK_SIZE: usize = 100;
const DEFAULT_DECIMALS: u32 = 18;

/// `decimals()` selector, `keccak256("decimals()")[..4]`.
const DECIMALS_SELECTOR: &str = "0x313ce567";

fn native_symbol(chain: &str) -> Option<&'static str> {
    match chain.to_ascii_lowercase().as_str() {
        "ethereum" => Some("ETH"),
        "bsc" | "bnb" | "bnbchain" | "bnbsmartchain" => Some("BNB"),
        "polygon" | "matic" => Some("MATIC"),
        "avalanche" | "avax" | "avaxc" | "avalanchec" => Some("AVAX"),
        "fantom" | "ftm" => Some("FTM"),
        "optimism" | "op" => Some("ETH"),
        "arbitrum" | "arb" | "arbitrumone" => Some("ETH"),
        "base" => Some("ETH"),
        _ => None,
    }
}

pub struct EvmAdapter {
    chain: String,
    pool: SimplePool,
    transport: Transport,
    tokens: Vec<Erc20Token>,
    allowed: HashSet<String>,
    decimals_cache: Mutex<HashMap<String, u32>>,
    timestamp_cache: Mutex<HashMap<u64, DateTime<Utc>>>,
}

impl EvmAdapter {
    pub fn new(
        chain: impl Into<String>,
        endpoints: Vec<String>,
        tokens: Vec<Erc20Token>,
        allowed: HashSet<String>,
        transport: Transport,
    ) -> Self {
        let chain = chain.into();
        let pool = SimplePool::new(chain.clone(), endpoints);
        Self {
            chain,
            pool,
            transport,
            tokens,
            allowed,
            decimals_cache: Mutex::new(HashMap::new()),
            timestamp_cache: Mutex::new(HashMap::new()),
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let transport = self.transport.clone();
        let method = method.to_string();
        self.pool
            .call_with_retry(move |url| {
                let transport = transport.clone();
                let method = method.clone();
                let params = params.clone();
                async move { transport.jsonrpc(&url, &method, params, CALL_DEADLINE).await }
            })
            .await
            .map_err(AdapterError::from)
    }

    async fn fetch_block(&self, number: u64, full_tx: bool) -> Result<Value, AdapterError> {
        let params = serde_json::json!([format!("0x{:x}", number), full_tx]);
        self.rpc("eth_getBlockByNumber", params).await
    }

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, AdapterError> {
        if let Some(ts) = self.timestamp_cache.lock().await.get(&number) {
            return Ok(*ts);
        }
        let block = self.fetch_block(number, false).await?;
        let ts = block_timestamp_from_value(&block)?;
        self.timestamp_cache.lock().await.insert(number, ts);
        Ok(ts)
    }

    async fn decimals(&self, contract: &str) -> u32 {
        if let Some(d) = self.decimals_cache.lock().await.get(contract) {
            return *d;
        }
        let resolved = self.fetch_decimals(contract).await.unwrap_or(DEFAULT_DECIMALS);
        let resolved = if resolved == 0 || resolved > 36 {
            DEFAULT_DECIMALS
        } else {
            resolved
        };
        self.decimals_cache
            .lock()
            .await
            .insert(contract.to_string(), resolved);
        resolved
    }

    async fn fetch_decimals(&self, contract: &str) -> Option<u32> {
        let params = serde_json::json!([
            { "to": contract, "data": DECIMALS_SELECTOR },
            "latest",
        ]);
        let result = self.rpc("eth_call", params).await.ok()?;
        let hex = result.as_str()?;
        let value = parse_hex_u256(hex)?;
        if value > U256::from(u32::MAX) {
            return None;
        }
        Some(value.as_u32())
    }

    async fn fetch_logs(
        &self,
        contract: &str,
        topic1: Option<Vec<String>>,
        topic2: Option<Vec<String>>,
        from: u64,
        to: u64,
    ) -> Result<Vec<Value>, AdapterError> {
        let topics = serde_json::json!([
            TRANSFER_TOPIC,
            topic1,
            topic2,
        ]);
        let params = serde_json::json!([{
            "address": contract,
            "fromBlock": format!("0x{:x}", from),
            "toBlock": format!("0x{:x}", to),
            "topics": topics,
        }]);
        let result = self.rpc("eth_getLogs", params).await?;
        Ok(result.as_array().cloned().unwrap_or_default())
    }

    async fn scan_native(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        from: u64,
        to: u64,
    ) -> Result<Vec<Event>, AdapterError> {
        let mut events = Vec::new();
        let Some(symbol) = native_symbol(&self.chain) else {
            return Ok(events);
        };
        if !self.allowed.is_empty() && !self.allowed.contains(symbol) {
            return Ok(events);
        }

        for number in from..=to {
            let block = self.fetch_block(number, true).await?;
            let ts = block_timestamp_from_value(&block)?;
            let txs = block
                .get("transactions")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for tx in txs {
                let value = tx
                    .get("value")
                    .and_then(Value::as_str)
                    .and_then(parse_hex_u256)
                    .unwrap_or_default();
                if value.is_zero() {
                    continue;
                }
                let from_addr = tx.get("from").and_then(Value::as_str).unwrap_or("").to_ascii_lowercase();
                let to_addr = tx
                    .get("to")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_ascii_lowercase();
                let from_watched = addrs.contains(&from_addr);
                let to_watched = addrs.contains(&to_addr);
                if !from_watched && !to_watched {
                    continue;
                }
                let (direction, address) = if from_watched && !to_watched {
                    (Direction::Out, from_addr.clone())
                } else {
                    (Direction::In, to_addr.clone())
                };
                let txid = tx.get("hash").and_then(Value::as_str).unwrap_or("").to_string();
                events.push(Event {
                    entity: entity.to_string(),
                    chain: self.chain.clone(),
                    coin: symbol.to_string(),
                    direction,
                    amount: format_8dp(scale_to_8dp(value, 18)),
                    timestamp: ts,
                    txid,
                    from: from_addr,
                    to: to_addr,
                    address,
                    log_index: -1,
                });
            }
        }
        Ok(events)
    }

    async fn scan_erc20(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        from: u64,
        to: u64,
    ) -> Result<Vec<Event>, AdapterError> {
        let mut events = Vec::new();
        let mut seen: HashSet<(String, i64)> = HashSet::new();
        let watched: Vec<String> = addrs.iter().cloned().collect();

        for token in &self.tokens {
            if !self.allowed.is_empty() && !self.allowed.contains(&token.symbol) {
                continue;
            }
            let decimals = self.decimals(&token.contract).await;

            // Pass 1: from in watched set.
            for group in chunk(&watched, ADDRESS_CHUNK_SIZE) {
                let topic1 = group.iter().map(|a| address_to_topic(a)).collect();
                let logs = self
                    .fetch_logs(&token.contract, Some(topic1), None, from, to)
                    .await?;
                for log in &logs {
                    let Some((txid, log_index, from_addr, to_addr, raw)) = decode_transfer_log(log)
                    else {
                        continue;
                    };
                    let key = (txid.clone(), log_index);
                    if seen.contains(&key) {
                        continue;
                    }
                    if raw.is_zero() {
                        seen.insert(key);
                        continue;
                    }
                    seen.insert(key.clone());
                    let to_watched = addrs.contains(&to_addr);
                    let (direction, address) = if to_watched {
                        (Direction::In, to_addr.clone())
                    } else {
                        (Direction::Out, from_addr.clone())
                    };
                    let block_number = log
                        .get("blockNumber")
                        .and_then(Value::as_str)
                        .and_then(parse_hex_u64)
                        .unwrap_or(from);
                    let ts = self.block_timestamp(block_number).await?;
                    events.push(Event {
                        entity: entity.to_string(),
                        chain: self.chain.clone(),
                        coin: token.symbol.clone(),
                        direction,
                        amount: format_8dp(scale_to_8dp(raw, decimals)),
                        timestamp: ts,
                        txid,
                        from: from_addr,
                        to: to_addr,
                        address,
                        log_index,
                    });
                }
            }

            // Pass 2: to in watched set; dedup drops anything pass 1 already saw.
            for group in chunk(&watched, ADDRESS_CHUNK_SIZE) {
                let topic2 = group.iter().map(|a| address_to_topic(a)).collect();
                let logs = self
                    .fetch_logs(&token.contract, None, Some(topic2), from, to)
                    .await?;
                for log in &logs {
                    let Some((txid, log_index, from_addr, to_addr, raw)) = decode_transfer_log(log)
                    else {
                        continue;
                    };
                    let key = (txid.clone(), log_index);
                    if seen.contains(&key) {
                        continue;
                    }
                    if raw.is_zero() {
                        seen.insert(key);
                        continue;
                    }
                    seen.insert(key);
                    let block_number = log
                        .get("blockNumber")
                        .and_then(Value::as_str)
                        .and_then(parse_hex_u64)
                        .unwrap_or(from);
                    let ts = self.block_timestamp(block_number).await?;
                    events.push(Event {
                        entity: entity.to_string(),
                        chain: self.chain.clone(),
                        coin: token.symbol.clone(),
                        direction: Direction::In,
                        amount: format_8dp(scale_to_8dp(raw, decimals)),
                        timestamp: ts,
                        txid,
                        from: from_addr,
                        to: to_addr.clone(),
                        address: to_addr,
                        log_index,
                    });
                }
            }
        }
        Ok(events)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    async fn tip(&self) -> Result<u64, AdapterError> {
        let result = self.rpc("eth_blockNumber", serde_json::json!([])).await?;
        result
            .as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| AdapterError::Tip(format!("malformed eth_blockNumber result: {result}")))
    }

    async fn scan_window(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        from: u64,
        to: u64,
    ) -> Result<Vec<Event>, AdapterError> {
        let mut events = self.scan_native(entity, addrs, from, to).await?;
        events.extend(self.scan_erc20(entity, addrs, from, to).await?);
        Ok(events)
    }

    fn window_size(&self) -> u64 {
        EVM_WINDOW
    }

    fn confirmation_lag(&self) -> u64 {
        EVM_LAG
    }

    fn chain_name(&self) -> &str {
        &self.chain
    }
}

fn decode_transfer_log(log: &Value) -> Option<(String, i64, String, String, U256)> {
    let topics = log.get("topics")?.as_array()?;
    if topics.len() < 3 {
        return None;
    }
    let from_addr = topic_to_address(topics[1].as_str()?);
    let to_addr = topic_to_address(topics[2].as_str()?);
    let txid = log.get("transactionHash")?.as_str()?.to_string();
    let log_index = log.get("logIndex")?.as_str().and_then(parse_hex_i64)?;
    let raw = log.get("data").and_then(Value::as_str).and_then(parse_hex_u256)?;
    Some((txid, log_index, from_addr, to_addr, raw))
}

fn address_to_topic(addr: &str) -> String {
    let stripped = addr.trim_start_matches("0x");
    format!("0x{:0>64}", stripped.to_ascii_lowercase())
}

fn topic_to_address(topic: &str) -> String {
    let stripped = topic.trim_start_matches("0x");
    let low20 = if stripped.len() >= 40 {
        &stripped[stripped.len() - 40..]
    } else {
        stripped
    };
    format!("0x{}", low20.to_ascii_lowercase())
}

fn parse_hex_u256(hex: &str) -> Option<U256> {
    let stripped = hex.trim_start_matches("0x");
    if stripped.is_empty() {
        return Some(U256::zero());
    }
    U256::from_str_radix(stripped, 16).ok()
}

fn parse_hex_u64(hex: &str) -> Option<u64> {
    let stripped = hex.trim_start_matches("0x");
    u64::from_str_radix(stripped, 16).ok()
}

fn parse_hex_i64(hex: &str) -> Option<i64> {
    let stripped = hex.trim_start_matches("0x");
    i64::from_str_radix(stripped, 16).ok()
}

fn block_timestamp_from_value(block: &Value) -> Result<DateTime<Utc>, AdapterError> {
    let hex = block
        .get("timestamp")
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Shape("block missing timestamp".to_string()))?;
    let secs = parse_hex_u64(hex)
        .ok_or_else(|| AdapterError::Shape(format!("malformed timestamp: {hex}")))?;
    Ok(Utc
        .timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now))
}

/// Rescales a raw token-unit integer so it represents value in units of
/// 1e-8, regardless of the token's own `decimals` (§4.3.1: amounts render to
/// 8 fractional digits independent of on-chain precision).
fn scale_to_8dp(raw: U256, decimals: u32) -> U256 {
    if decimals >= 8 {
        let divisor = U256::from(10u64).pow(U256::from(decimals - 8));
        raw / divisor
    } else {
        let multiplier = U256::from(10u64).pow(U256::from(8 - decimals));
        raw * multiplier
    }
}

fn format_8dp(scaled: U256) -> String {
    let base = U256::from(100_000_000u64);
    let whole = scaled / base;
    let frac = scaled % base;
    format!("{}.{:08}", whole, frac.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_symbol_mapping_matches_spec() {
        assert_eq!(native_symbol("ethereum"), Some("ETH"));
        assert_eq!(native_symbol("Bnb"), Some("BNB"));
        assert_eq!(native_symbol("matic"), Some("MATIC"));
        assert_eq!(native_symbol("avalanchec"), Some("AVAX"));
        assert_eq!(native_symbol("arbitrumone"), Some("ETH"));
        assert_eq!(native_symbol("base"), Some("ETH"));
        assert_eq!(native_symbol("solana"), None);
    }

    #[test]
    fn address_topic_roundtrip() {
        let addr = "0xabc0000000000000000000000000000000dead";
        let topic = address_to_topic(addr);
        assert_eq!(topic.len(), 66);
        assert_eq!(topic_to_address(&topic), addr);
    }

    #[test]
    fn scale_to_8dp_handles_18_decimal_tokens() {
        // 1.5 * 10^18
        let raw = U256::from(1_500_000_000_000_000_000u64);
        let scaled = scale_to_8dp(raw, 18);
        assert_eq!(format_8dp(scaled), "1.50000000");
    }

    #[test]
    fn scale_to_8dp_handles_low_decimal_tokens() {
        // USDC-like 6 decimals: 2.5 units = 2_500_000
        let raw = U256::from(2_500_000u64);
        let scaled = scale_to_8dp(raw, 6);
        assert_eq!(format_8dp(scaled), "2.50000000");
    }

    #[test]
    fn decode_transfer_log_skips_short_topics() {
        let log = serde_json::json!({
            "topics": ["0xddf2"],
            "transactionHash": "0xabc",
            "logIndex": "0x1",
            "data": "0x01",
        });
        assert!(decode_transfer_log(&log).is_none());
    }

    #[test]
    fn decode_transfer_log_extracts_fields() {
        let from_topic = address_to_topic("0x1111111111111111111111111111111111111111");
        let to_topic = address_to_topic("0x2222222222222222222222222222222222222222");
        let log = serde_json::json!({
            "topics": [TRANSFER_TOPIC, from_topic, to_topic],
            "transactionHash": "0xdeadbeef",
            "logIndex": "0x7",
            "data": format!("0x{:064x}", 1000u64),
        });
        let (txid, idx, from, to, raw) = decode_transfer_log(&log).unwrap();
        assert_eq!(txid, "0xdeadbeef");
        assert_eq!(idx, 7);
        assert_eq!(from, "0x1111111111111111111111111111111111111111");
        assert_eq!(to, "0x2222222222222222222222222222222222222222");
        assert_eq!(raw, U256::from(1000u64));
    }
}
