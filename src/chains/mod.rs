//! Chain Adapters (C3) — per-chain tip/window scanning behind a common trait
//! so the Scan Loop (C6) doesn't need per-chain branching.

pub mod bitcoin;
pub mod evm;
pub mod solana;

use async_trait::async_trait;

use crate::errors::AdapterError;
use crate::model::{EntityAddressSet, Event};

/// Window size in native units (blocks or slots) per chain family (§4.3).
pub const EVM_WINDOW: u64 = 500;
pub const BITCOIN_WINDOW: u64 = 6;
pub const SOLANA_WINDOW: u64 = 200;

/// Confirmation lag subtracted from tip when seeding a cursor from scratch (§4.4).
pub const EVM_LAG: u64 = 4;
pub const BITCOIN_LAG: u64 = 1;
pub const SOLANA_LAG: u64 = 200;

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Current chain head height (EVM, Bitcoin) or slot (Solana).
    async fn tip(&self) -> Result<u64, AdapterError>;

    /// Scan the inclusive window `[from, to]` for transfers touching `addrs`,
    /// attributing hits to `entity`.
    async fn scan_window(
        &self,
        entity: &str,
        addrs: &EntityAddressSet,
        from: u64,
        to: u64,
    ) -> Result<Vec<Event>, AdapterError>;

    /// Window size in native units for this chain.
    fn window_size(&self) -> u64;

    /// Confirmation lag used when seeding a cursor with no prior value.
    fn confirmation_lag(&self) -> u64;

    fn chain_name(&self) -> &str;
}

/// Splits a slice into chunks of at most `size`, used for the EVM adapter's
/// `<=100 addresses per eth_getLogs call` batching (§4.3.1).
pub fn chunk<'a, T>(items: &'a [T], size: usize) -> impl Iterator<Item = &'a [T]> {
    items.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_splits_into_bounded_groups() {
        let items: Vec<u32> = (0..250).collect();
        let chunks: Vec<&[u32]> = chunk(&items, 100).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }
}
