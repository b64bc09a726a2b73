//! Bitcoin adapter (§4.3.2): Esplora-style REST client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::errors::AdapterError;
use crate::model::{Direction, EntityAddressSet, Event};
use crate::pool::SimplePool;
use crate::transport::Transport;

use super::{ChainAdapter, BITCOIN_LAG, BITCOIN_WINDOW};

const CALL_DEADLINE: Duration = Duration::from_secs(30);
const PAGE_SIZE: usize = 25;
const MAX_TXS_PER_BLOCK: usize = 20_000;

pub struct BitcoinAdapter {
    pool: SimplePool,
    transport: Transport,
}

impl BitcoinAdapter {
    pub fn new(endpoints: Vec<String>, transport: Transport) -> Self {
        Self {
            pool: SimplePool::new("bitcoin", endpoints),
            transport,
        }
    }

    async fn get(&self, path: &str) -> Result<String, AdapterError> {
        let transport = self.transport.clone();
        let path = path.to_string();
        self.pool
            .call_with_retry(move |base| {
                let transport = transport.clone();
                let url = format!("{}{}", base.trim_end_matches('/'), path);
                async move { transport.get(&url, CALL_DEADLINE).await }
            })
            .await
            .map_err(AdapterError::from)
    }

    async fn block_hash(&self, height: u64) -> Result<String, AdapterError> {
        self.get(&format!("/block-height/{height}")).await
    }

    async fn block_txs(&self, hash: &str) -> Result<Vec<Value>, AdapterError> {
        let mut txs = Vec::new();
        let mut offset = 0usize;
        loop {
            let path = if offset == 0 {
                format!("/block/{hash}/txs")
            } else {
                format!("/block/{hash}/txs/{offset}")
            };
            let body = self.get(&path).await?;
            let page: Vec<Value> = serde_json::from_str(&body)
                .map_err(|e| AdapterError::Shape(format!("malformed txs page: {e}")))?;
            let page_len = page.len();
            txs.extend(page);
            if page_len < PAGE_SIZE || txs.len() >= MAX_TXS_PER_BLOCK {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(txs)
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    async fn tip(&self) -> Result<u64, AdapterError> {
        let body = self.get("/blocks/tip/height").await?;
        body.trim()
            .parse::<u64>()
            .map_err(|e| AdapterError::Tip(format!("malformed tip height {body:?}: {e}")))
    }

    async fn scan_window(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        from: u64,
        to: u64,
    ) -> Result<Vec<Event>, AdapterError> {
        let mut events = Vec::new();
        for height in from..=to {
            let hash = self.block_hash(height).await?;
            let txs = self.block_txs(&hash).await?;
            for tx in &txs {
                events.extend(events_from_tx(entity, addrs, tx));
            }
        }
        Ok(events)
    }

    fn window_size(&self) -> u64 {
        BITCOIN_WINDOW
    }

    fn confirmation_lag(&self) -> u64 {
        BITCOIN_LAG
    }

    fn chain_name(&self) -> &str {
        "bitcoin"
    }
}

fn events_from_tx(entity: &str, addrs: &EntityAddressSet, tx: &Value) -> Vec<Event> {
    let mut events = Vec::new();
    let txid = tx.get("txid").and_then(Value::as_str).unwrap_or("").to_string();
    let ts = tx_timestamp(tx);

    let vin = tx.get("vin").and_then(Value::as_array).cloned().unwrap_or_default();
    let vout = tx.get("vout").and_then(Value::as_array).cloned().unwrap_or_default();

    let first_vout_addr = vout
        .iter()
        .find_map(|v| v.get("scriptpubkey_address").and_then(Value::as_str))
        .unwrap_or("")
        .to_string();
    let first_vin_addr = vin
        .iter()
        .find_map(|v| {
            v.get("prevout")
                .and_then(|p| p.get("scriptpubkey_address"))
                .and_then(Value::as_str)
        })
        .unwrap_or("")
        .to_string();

    for (i, input) in vin.iter().enumerate() {
        let Some(prevout) = input.get("prevout") else {
            continue;
        };
        let value = prevout.get("value").and_then(Value::as_u64).unwrap_or(0);
        if value == 0 {
            continue;
        }
        let Some(addr) = prevout.get("scriptpubkey_address").and_then(Value::as_str) else {
            continue;
        };
        if !addrs.contains(addr) {
            continue;
        }
        events.push(Event {
            entity: entity.to_string(),
            chain: "bitcoin".to_string(),
            coin: "BTC".to_string(),
            direction: Direction::Out,
            amount: format_sats(value),
            timestamp: ts,
            txid: txid.clone(),
            from: addr.to_string(),
            to: first_vout_addr.clone(),
            address: addr.to_string(),
            log_index: -((i as i64) + 1),
        });
    }

    for (i, output) in vout.iter().enumerate() {
        let value = output.get("value").and_then(Value::as_u64).unwrap_or(0);
        if value == 0 {
            continue;
        }
        let Some(addr) = output.get("scriptpubkey_address").and_then(Value::as_str) else {
            continue;
        };
        if !addrs.contains(addr) {
            continue;
        }
        events.push(Event {
            entity: entity.to_string(),
            chain: "bitcoin".to_string(),
            coin: "BTC".to_string(),
            direction: Direction::In,
            amount: format_sats(value),
            timestamp: ts,
            txid: txid.clone(),
            from: first_vin_addr.clone(),
            to: addr.to_string(),
            address: addr.to_string(),
            log_index: i as i64,
        });
    }

    events
}

fn tx_timestamp(tx: &Value) -> DateTime<Utc> {
    tx.get("status")
        .and_then(|s| s.get("block_time"))
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

fn format_sats(value: u64) -> String {
    let whole = value / 100_000_000;
    let frac = value % 100_000_000;
    format!("{whole}.{frac:08}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChainFamily;

    fn watched(addrs: &[&str]) -> EntityAddressSet {
        let mut set = EntityAddressSet::new(ChainFamily::Bitcoin);
        for a in addrs {
            set.insert(a);
        }
        set
    }

    #[test]
    fn format_sats_renders_8_fractional_digits() {
        assert_eq!(format_sats(200_000), "0.00200000");
        assert_eq!(format_sats(100_000_000), "1.00000000");
    }

    #[test]
    fn spend_emits_out_event_with_negative_log_index() {
        let tx = serde_json::json!({
            "txid": "tx1",
            "status": { "block_time": 1_700_000_000 },
            "vin": [
                { "prevout": { "scriptpubkey_address": "bc1qwatched", "value": 200_000u64 } }
            ],
            "vout": [
                { "scriptpubkey_address": "bc1qother1", "value": 150_000u64 },
                { "scriptpubkey_address": "bc1qother2", "value": 40_000u64 }
            ],
        });
        let addrs = watched(&["bc1qwatched"]);
        let events = events_from_tx("acme", &addrs, &tx);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.direction, Direction::Out);
        assert_eq!(ev.amount, "0.00200000");
        assert_eq!(ev.from, "bc1qwatched");
        assert_eq!(ev.to, "bc1qother1");
        assert_eq!(ev.log_index, -1);
    }

    #[test]
    fn receipt_emits_in_event_with_vout_index() {
        let tx = serde_json::json!({
            "txid": "tx2",
            "status": { "block_time": 1_700_000_000 },
            "vin": [
                { "prevout": { "scriptpubkey_address": "bc1qsender", "value": 500_000u64 } }
            ],
            "vout": [
                { "scriptpubkey_address": "bc1qwatched", "value": 300_000u64 }
            ],
        });
        let addrs = watched(&["bc1qwatched"]);
        let events = events_from_tx("acme", &addrs, &tx);
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.direction, Direction::In);
        assert_eq!(ev.to, "bc1qwatched");
        assert_eq!(ev.from, "bc1qsender");
        assert_eq!(ev.log_index, 0);
    }

    #[test]
    fn zero_value_outputs_are_skipped() {
        let tx = serde_json::json!({
            "txid": "tx3",
            "status": { "block_time": 1_700_000_000 },
            "vin": [],
            "vout": [
                { "scriptpubkey_address": "bc1qwatched", "value": 0u64 }
            ],
        });
        let addrs = watched(&["bc1qwatched"]);
        assert!(events_from_tx("acme", &addrs, &tx).is_empty());
    }
}
