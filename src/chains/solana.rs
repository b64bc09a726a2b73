//! Solana adapter (§4.3.3): `getBlock`/`getSlot` over the Solana pool's
//! ban/cooldown/degrade state machine, with three independent event
//! extractors combined per transaction behind a running `log_index` counter.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use serde_json::Value;

use crate::errors::AdapterError;
use crate::model::{Direction, EntityAddressSet, Event, SplToken};
use crate::pool::SolanaPool;
use crate::transport::Transport;

use super::{ChainAdapter, SOLANA_LAG, SOLANA_WINDOW};

const CALL_DEADLINE: Duration = Duration::from_secs(20);
const DEFAULT_SPL_DECIMALS: u32 = 6;
const LAMPORTS_PER_SOL: u32 = 9;

pub struct SolanaAdapter {
    pool: SolanaPool,
    transport: Transport,
    /// Lowercased mint -> symbol, built from the chain's configured SPL tokens (§3).
    mints: HashMap<String, String>,
    allowed: HashSet<String>,
}

impl SolanaAdapter {
    pub fn new(
        pool: SolanaPool,
        transport: Transport,
        spl_tokens: Vec<SplToken>,
        allowed: HashSet<String>,
    ) -> Self {
        let mints = spl_tokens
            .into_iter()
            .map(|t| (t.mint.to_ascii_lowercase(), t.symbol))
            .collect();
        Self {
            pool,
            transport,
            mints,
            allowed,
        }
    }

    fn symbol_allowed(&self, symbol: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(symbol)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, AdapterError> {
        let transport = self.transport.clone();
        let method = method.to_string();
        self.pool
            .call(move |url| {
                let transport = transport.clone();
                let method = method.clone();
                let params = params.clone();
                async move { transport.jsonrpc(&url, &method, params, CALL_DEADLINE).await }
            })
            .await
            .map_err(AdapterError::from)
    }

    async fn fetch_block(&self, slot: u64) -> Result<Option<Value>, AdapterError> {
        let params = serde_json::json!([
            slot,
            {
                "encoding": "jsonParsed",
                "transactionDetails": "full",
                "rewards": false,
                "maxSupportedTransactionVersion": 0,
                "commitment": "confirmed",
            }
        ]);
        let result = self.rpc("getBlock", params).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(result))
    }

    fn events_for_block(&self, entity: &str, addrs: &EntityAddressSet, block: &Value) -> Vec<Event> {
        let mut events = Vec::new();
        let txs = block.get("transactions").and_then(Value::as_array).cloned().unwrap_or_default();
        for tx in &txs {
            events.extend(self.events_for_tx(entity, addrs, tx));
        }
        events
    }

    fn events_for_tx(&self, entity: &str, addrs: &EntityAddressSet, tx: &Value) -> Vec<Event> {
        let mut events = Vec::new();
        let mut log_index: i64 = 0;

        let txid = tx
            .get("transaction")
            .and_then(|t| t.get("signatures"))
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let ts = tx
            .get("blockTime")
            .and_then(Value::as_i64)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        let message = tx.get("transaction").and_then(|t| t.get("message"));
        let meta = tx.get("meta");

        // 1. Parsed-instruction transfers (top-level + inner instructions).
        let mut instructions: Vec<Value> = message
            .and_then(|m| m.get("instructions"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if let Some(inner) = meta.and_then(|m| m.get("innerInstructions")).and_then(Value::as_array) {
            for group in inner {
                if let Some(list) = group.get("instructions").and_then(Value::as_array) {
                    instructions.extend(list.iter().cloned());
                }
            }
        }

        for ix in &instructions {
            if let Some(ev) = self.event_from_instruction(entity, addrs, ix, &txid, ts, log_index) {
                log_index += 1;
                events.push(ev);
            }
        }

        // 2. Lamport-balance delta fallback (only if SOL is allowed).
        if self.symbol_allowed("SOL") {
            if let Some(m) = meta {
                let pre = m.get("preBalances").and_then(Value::as_array);
                let post = m.get("postBalances").and_then(Value::as_array);
                let keys = message.and_then(|msg| msg.get("accountKeys")).and_then(Value::as_array);
                if let (Some(pre), Some(post), Some(keys)) = (pre, post, keys) {
                    for i in 0..pre.len().min(post.len()).min(keys.len()) {
                        let Some(account) = account_key_string(&keys[i]) else {
                            continue;
                        };
                        if !addrs.contains(&account) {
                            continue;
                        }
                        let pre_v = pre[i].as_i64().unwrap_or(0);
                        let post_v = post[i].as_i64().unwrap_or(0);
                        let diff = post_v - pre_v;
                        if diff == 0 {
                            continue;
                        }
                        let direction = if diff > 0 { Direction::In } else { Direction::Out };
                        let amount = lamports_to_decimal(diff.unsigned_abs());
                        events.push(Event {
                            entity: entity.to_string(),
                            chain: "solana".to_string(),
                            coin: "SOL".to_string(),
                            direction,
                            amount: format_8dp(amount),
                            timestamp: ts,
                            txid: txid.clone(),
                            from: String::new(),
                            to: String::new(),
                            address: account,
                            log_index,
                        });
                        log_index += 1;
                    }
                }
            }
        }

        // 3. SPL-balance delta fallback.
        if let Some(m) = meta {
            let pre = m.get("preTokenBalances").and_then(Value::as_array).cloned().unwrap_or_default();
            let post = m.get("postTokenBalances").and_then(Value::as_array).cloned().unwrap_or_default();
            let mut post_by_index: HashMap<i64, &Value> = HashMap::new();
            for p in &post {
                if let Some(idx) = p.get("accountIndex").and_then(Value::as_i64) {
                    post_by_index.insert(idx, p);
                }
            }
            for pre_entry in &pre {
                let Some(idx) = pre_entry.get("accountIndex").and_then(Value::as_i64) else {
                    continue;
                };
                let Some(post_entry) = post_by_index.get(&idx) else {
                    continue;
                };
                let pre_mint = pre_entry.get("mint").and_then(Value::as_str).unwrap_or("");
                let post_mint = post_entry.get("mint").and_then(Value::as_str).unwrap_or("");
                if pre_mint != post_mint || pre_mint.is_empty() {
                    continue;
                }
                let Some(symbol) = self.mints.get(&pre_mint.to_ascii_lowercase()) else {
                    continue;
                };
                if !self.symbol_allowed(symbol) {
                    continue;
                }
                let owner = pre_entry
                    .get("owner")
                    .and_then(Value::as_str)
                    .or_else(|| post_entry.get("owner").and_then(Value::as_str))
                    .unwrap_or("");
                if owner.is_empty() || !addrs.contains(owner) {
                    continue;
                }
                let decimals = pre_entry
                    .get("uiTokenAmount")
                    .and_then(|u| u.get("decimals"))
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_SPL_DECIMALS as u64) as u32;
                let pre_amount = ui_token_amount_raw(pre_entry.get("uiTokenAmount"));
                let post_amount = ui_token_amount_raw(post_entry.get("uiTokenAmount"));
                let diff = post_amount - pre_amount;
                if diff.is_zero() {
                    continue;
                }
                let direction = if diff.is_sign_positive() { Direction::In } else { Direction::Out };
                let scaled = diff.abs() / pow10_decimal(decimals);
                events.push(Event {
                    entity: entity.to_string(),
                    chain: "solana".to_string(),
                    coin: symbol.clone(),
                    direction,
                    amount: format_8dp(scaled),
                    timestamp: ts,
                    txid: txid.clone(),
                    from: String::new(),
                    to: String::new(),
                    address: owner.to_string(),
                    log_index,
                });
                log_index += 1;
            }
        }

        events
    }

    fn event_from_instruction(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        ix: &Value,
        txid: &str,
        ts: DateTime<Utc>,
        log_index: i64,
    ) -> Option<Event> {
        let program = ix.get("program").and_then(Value::as_str)?;
        let parsed = ix.get("parsed")?;
        let ty = parsed.get("type").and_then(Value::as_str)?;
        let info = parsed.get("info")?;

        if program == "system" && ty == "transfer" {
            let lamports = any_to_i128(info.get("lamports"))?;
            if lamports == 0 || !self.symbol_allowed("SOL") {
                return None;
            }
            let source = info.get("source").and_then(Value::as_str).unwrap_or("").to_string();
            let dest = info.get("destination").and_then(Value::as_str).unwrap_or("").to_string();
            let (direction, address) = tie_break(addrs, &source, &dest)?;
            return Some(Event {
                entity: entity.to_string(),
                chain: "solana".to_string(),
                coin: "SOL".to_string(),
                direction,
                amount: format_8dp(lamports_to_decimal(lamports.unsigned_abs() as u64)),
                timestamp: ts,
                txid: txid.to_string(),
                from: source,
                to: dest,
                address,
                log_index,
            });
        }

        if program == "spl-token" && (ty == "transfer" || ty == "transferChecked") {
            let mint = info.get("mint").and_then(Value::as_str).unwrap_or("").to_ascii_lowercase();
            let symbol = self.mints.get(&mint)?;
            if !self.symbol_allowed(symbol) {
                return None;
            }
            let amount = spl_instruction_amount(info)?;
            if amount.is_zero() {
                return None;
            }
            let source = info.get("source").and_then(Value::as_str).unwrap_or("").to_string();
            let dest = info.get("destination").and_then(Value::as_str).unwrap_or("").to_string();
            let (direction, address) = tie_break(addrs, &source, &dest)?;
            return Some(Event {
                entity: entity.to_string(),
                chain: "solana".to_string(),
                coin: symbol.clone(),
                direction,
                amount: format_8dp(amount),
                timestamp: ts,
                txid: txid.to_string(),
                from: source,
                to: dest,
                address,
                log_index,
            });
        }

        None
    }
}

/// Direction tie-break shared with the EVM native-transfer logic: both sides
/// watched resolves to "in"; otherwise whichever side is watched wins.
fn tie_break(addrs: &EntityAddressSet, source: &str, dest: &str) -> Option<(Direction, String)> {
    let source_watched = !source.is_empty() && addrs.contains(source);
    let dest_watched = !dest.is_empty() && addrs.contains(dest);
    if !source_watched && !dest_watched {
        return None;
    }
    if source_watched && !dest_watched {
        Some((Direction::Out, source.to_string()))
    } else {
        Some((Direction::In, dest.to_string()))
    }
}

fn account_key_string(key: &Value) -> Option<String> {
    if let Some(s) = key.as_str() {
        return Some(s.to_string());
    }
    key.get("pubkey").and_then(Value::as_str).map(|s| s.to_string())
}

fn any_to_i128(v: Option<&Value>) -> Option<i128> {
    let v = v?;
    if let Some(n) = v.as_i64() {
        return Some(n as i128);
    }
    if let Some(n) = v.as_u64() {
        return Some(n as i128);
    }
    v.as_str().and_then(|s| s.parse::<i128>().ok())
}

fn lamports_to_decimal(lamports: u64) -> Decimal {
    Decimal::from(lamports) / Decimal::from(10u64.pow(LAMPORTS_PER_SOL))
}

/// `10^decimals` as a `Decimal`, clamped to a representable exponent.
/// `decimals` comes straight off the RPC response (on-chain it's a `u8`, so
/// 0-255 is "valid" input as far as the wire format goes); `10u64.pow` would
/// overflow well before that, so build the divisor via checked multiplication
/// and saturate once further multiplying would overflow `Decimal`'s range.
fn pow10_decimal(decimals: u32) -> Decimal {
    let ten = Decimal::from(10u64);
    let mut result = Decimal::from(1u64);
    for _ in 0..decimals {
        match result.checked_mul(ten) {
            Some(next) => result = next,
            None => break,
        }
    }
    result
}

fn ui_token_amount_raw(ui: Option<&Value>) -> Decimal {
    let Some(ui) = ui else { return Decimal::ZERO };
    ui.get("amount")
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str(s).ok())
        .unwrap_or(Decimal::ZERO)
}

/// Amount resolution order for a parsed SPL transfer instruction (§4.3.3):
/// `uiAmountString` first, then `amount` scaled by `decimals` (default 6),
/// then the bare `info.amount` with the same default decimals.
fn spl_instruction_amount(info: &Value) -> Option<Decimal> {
    if let Some(ui_str) = info
        .get("tokenAmount")
        .and_then(|t| t.get("uiAmountString"))
        .and_then(Value::as_str)
    {
        if let Ok(d) = Decimal::from_str(ui_str) {
            return Some(d);
        }
    }
    if let Some(token_amount) = info.get("tokenAmount") {
        if let Some(raw) = token_amount.get("amount").and_then(Value::as_str) {
            let decimals = token_amount.get("decimals").and_then(Value::as_u64).unwrap_or(DEFAULT_SPL_DECIMALS as u64) as u32;
            if let Ok(d) = Decimal::from_str(raw) {
                return Some(d / pow10_decimal(decimals));
            }
        }
    }
    if let Some(raw) = info.get("amount").and_then(Value::as_str) {
        if let Ok(d) = Decimal::from_str(raw) {
            return Some(d / pow10_decimal(DEFAULT_SPL_DECIMALS));
        }
    }
    None
}

/// Truncates (never rounds up) to 8 fractional digits, matching the EVM/BTC
/// adapters' amount formatting.
fn format_8dp(value: Decimal) -> String {
    let truncated = value.trunc_with_scale(8);
    format!("{:.8}", truncated)
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    async fn tip(&self) -> Result<u64, AdapterError> {
        let result = self.rpc("getSlot", serde_json::json!([{"commitment": "confirmed"}])).await?;
        result
            .as_u64()
            .ok_or_else(|| AdapterError::Tip(format!("malformed getSlot result: {result}")))
    }

    async fn scan_window(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        from: u64,
        to: u64,
    ) -> Result<Vec<Event>, AdapterError> {
        let mut events = Vec::new();
        for slot in from..=to {
            match self.fetch_block(slot).await {
                Ok(Some(block)) => events.extend(self.events_for_block(entity, addrs, &block)),
                Ok(None) => {
                    tracing::debug!(slot, "solana block not available, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    fn window_size(&self) -> u64 {
        SOLANA_WINDOW
    }

    fn confirmation_lag(&self) -> u64 {
        SOLANA_LAG
    }

    fn chain_name(&self) -> &str {
        "solana"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChainFamily;

    fn watched(addrs: &[&str]) -> EntityAddressSet {
        let mut set = EntityAddressSet::new(ChainFamily::Solana);
        for a in addrs {
            set.insert(a);
        }
        set
    }

    fn adapter(mints: Vec<(&str, &str)>, allowed: &[&str]) -> SolanaAdapter {
        SolanaAdapter::new(
            SolanaPool::new(vec!["http://a".into()], Default::default()),
            Transport::new(),
            mints
                .into_iter()
                .map(|(mint, symbol)| SplToken {
                    symbol: symbol.to_string(),
                    mint: mint.to_string(),
                })
                .collect(),
            allowed.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn system_transfer_emits_sol_event() {
        let a = adapter(vec![], &[]);
        let addrs = watched(&["Watched1"]);
        let ix = serde_json::json!({
            "program": "system",
            "parsed": {
                "type": "transfer",
                "info": { "source": "Watched1", "destination": "Other", "lamports": 1_500_000_000u64 }
            }
        });
        let ev = a
            .event_from_instruction("acme", &addrs, &ix, "sig1", Utc::now(), 0)
            .unwrap();
        assert_eq!(ev.direction, Direction::Out);
        assert_eq!(ev.amount, "1.50000000");
        assert_eq!(ev.coin, "SOL");
        assert_eq!(ev.address, "Watched1");
    }

    #[test]
    fn unmapped_spl_mint_is_dropped() {
        let a = adapter(vec![], &[]);
        let addrs = watched(&["Watched1"]);
        let ix = serde_json::json!({
            "program": "spl-token",
            "parsed": {
                "type": "transfer",
                "info": {
                    "source": "Watched1", "destination": "Other", "mint": "UnknownMint",
                    "tokenAmount": {"uiAmountString": "5", "amount": "5000000", "decimals": 6}
                }
            }
        });
        assert!(a.event_from_instruction("acme", &addrs, &ix, "sig1", Utc::now(), 0).is_none());
    }

    #[test]
    fn spl_transfer_uses_ui_amount_string_first() {
        let a = adapter(vec![("MintAbc", "USDC")], &[]);
        let addrs = watched(&["Watched1"]);
        let ix = serde_json::json!({
            "program": "spl-token",
            "parsed": {
                "type": "transferChecked",
                "info": {
                    "source": "Other", "destination": "Watched1", "mint": "MintAbc",
                    "tokenAmount": {"uiAmountString": "12.5", "amount": "12500000", "decimals": 6}
                }
            }
        });
        let ev = a
            .event_from_instruction("acme", &addrs, &ix, "sig1", Utc::now(), 0)
            .unwrap();
        assert_eq!(ev.direction, Direction::In);
        assert_eq!(ev.amount, "12.50000000");
        assert_eq!(ev.coin, "USDC");
    }

    #[test]
    fn both_sides_watched_resolves_to_in() {
        let addrs = watched(&["A", "B"]);
        let (direction, address) = tie_break(&addrs, "A", "B").unwrap();
        assert_eq!(direction, Direction::In);
        assert_eq!(address, "B");
    }

    #[test]
    fn lamport_delta_fallback_emits_when_balance_changes() {
        let a = adapter(vec![], &[]);
        let addrs = watched(&["Watched1"]);
        let tx = serde_json::json!({
            "transaction": {
                "signatures": ["sig1"],
                "message": { "accountKeys": ["Watched1", "Other"], "instructions": [] }
            },
            "meta": {
                "preBalances": [1_000_000_000u64, 2_000_000_000u64],
                "postBalances": [1_500_000_000u64, 1_500_000_000u64],
                "innerInstructions": []
            },
            "blockTime": 1_700_000_000i64,
        });
        let events = a.events_for_tx("acme", &addrs, &tx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Direction::In);
        assert_eq!(events[0].amount, "0.50000000");
        assert_eq!(events[0].address, "Watched1");
    }

    #[test]
    fn format_8dp_truncates_not_rounds() {
        let v = Decimal::from_str("1.999999999").unwrap();
        assert_eq!(format_8dp(v), "1.99999999");
    }

    #[test]
    fn pow10_decimal_does_not_panic_on_out_of_range_decimals() {
        // uiTokenAmount.decimals is a u8 on the wire; values well past what
        // any real mint uses must not panic or wrap like `10u64.pow` would.
        assert_eq!(pow10_decimal(6), Decimal::from(1_000_000u64));
        let huge = pow10_decimal(255);
        assert!(huge > Decimal::ZERO);
    }
}
