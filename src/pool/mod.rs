//! Endpoint Pool (C2) — round-robin + health-aware endpoint selection.
//!
//! `SimplePool` (EVM/Bitcoin) rotates across an ordered URL list with
//! exponential backoff on network errors. `SolanaPool` additionally tracks
//! per-endpoint ban/cooldown/degrade state (§4.2, §3's `EndpointHealth`).

pub mod simple;
pub mod solana;

pub use simple::SimplePool;
pub use solana::{SolanaPool, SolanaPoolConfig};
