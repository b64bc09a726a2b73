//! Cursor Client (C4) — read/write of per-(entity, chain) cursor against the
//! ingest service (§4.4). A missing cursor or transport error seeds from the
//! chain's confirmation lag (or `-start-block`), never treated as fatal.

use std::time::Duration;

use tracing::warn;

use crate::errors::CursorError;
use crate::transport::Transport;

const CALL_DEADLINE: Duration = Duration::from_secs(30);

pub struct CursorClient {
    transport: Transport,
    api_base: String,
}

impl CursorClient {
    pub fn new(transport: Transport, api_base: impl Into<String>) -> Self {
        Self {
            transport,
            api_base: api_base.into(),
        }
    }

    /// Returns `None` on a missing cursor or any transport error — not fatal (§4.4).
    pub async fn get(&self, entity: &str, chain: &str) -> Option<u64> {
        let url = format!(
            "{}/sync/cursor?entity={}&chain={}",
            self.api_base.trim_end_matches('/'),
            urlencode(entity),
            urlencode(chain)
        );
        match self.transport.get(&url, CALL_DEADLINE).await {
            Ok(body) => match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(v) => v.get("block").and_then(serde_json::Value::as_u64),
                Err(e) => {
                    warn!(entity, chain, error = %e, "malformed cursor response, treating as no cursor");
                    None
                }
            },
            Err(e) => {
                warn!(entity, chain, error = %e, "cursor read failed, treating as no cursor");
                None
            }
        }
    }

    pub async fn set(&self, entity: &str, chain: &str, next: u64) -> Result<(), CursorError> {
        let url = format!(
            "{}/sync/cursor?entity={}&chain={}",
            self.api_base.trim_end_matches('/'),
            urlencode(entity),
            urlencode(chain)
        );
        let body = serde_json::json!({ "block": next });
        self.transport
            .post_json(&url, &body, CALL_DEADLINE)
            .await
            .map(|_| ())
            .map_err(|e| CursorError::Write(e.to_string()))
    }

    /// Startup seeding (§4.4): a real, nonzero cursor from the server wins;
    /// otherwise fall back to `start_from_flag` if non-negative, else
    /// `tip - chain_lag` (saturating to `tip` if that would underflow).
    pub async fn seed(
        &self,
        entity: &str,
        chain: &str,
        tip: u64,
        chain_lag: u64,
        start_from_flag: i64,
    ) -> u64 {
        let existing = self.get(entity, chain).await;
        resolve_seed(existing, tip, chain_lag, start_from_flag)
    }
}

fn resolve_seed(existing: Option<u64>, tip: u64, chain_lag: u64, start_from_flag: i64) -> u64 {
    match existing {
        Some(value) if value != 0 => value,
        _ => {
            if start_from_flag >= 0 {
                start_from_flag as u64
            } else {
                tip.checked_sub(chain_lag).unwrap_or(tip)
            }
        }
    }
}

/// Percent-encodes a query-string value. Shared with the dispatcher so
/// `entity` is encoded identically in `/sync/cursor` and `/ingest/events`
/// URLs.
pub fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_seed_uses_chain_lag_when_no_cursor_and_flag_negative() {
        assert_eq!(resolve_seed(None, 1000, 4, -5), 996);
    }

    #[test]
    fn resolve_seed_uses_start_from_flag_when_non_negative() {
        assert_eq!(resolve_seed(None, 1000, 4, 10), 10);
    }

    #[test]
    fn resolve_seed_treats_zero_cursor_as_missing() {
        assert_eq!(resolve_seed(Some(0), 1000, 4, -5), 996);
    }

    #[test]
    fn resolve_seed_prefers_real_nonzero_cursor() {
        assert_eq!(resolve_seed(Some(500), 1000, 4, -5), 500);
    }

    #[test]
    fn resolve_seed_saturates_to_tip_when_lag_exceeds_tip() {
        assert_eq!(resolve_seed(None, 50, 200, -5), 50);
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("acme corp"), "acme%20corp");
        assert_eq!(urlencode("acme-1_2.3"), "acme-1_2.3");
    }
}
