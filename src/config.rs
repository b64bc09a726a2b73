//! CLI & Config (A1) — `clap`-derived flag parsing with `.env`/environment
//! fallbacks (§6). `.env` loading happens once in `main` before this parses.

use std::collections::HashSet;
use std::path::PathBuf;

use clap::Parser;

/// Multi-chain transfer scanner: tails BTC/EVM/Solana heads and posts
/// normalized transfer events to the ingest service.
#[derive(Debug, Parser)]
#[command(name = "chainwatch-scanner", version, about)]
pub struct Config {
    /// Chain configuration file (endpoints + token descriptors per chain).
    #[arg(long = "config", env = "CHAINWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Comma-separated allow-list of coin symbols.
    #[arg(long = "only", env = "CHAINWATCH_ONLY", default_value = "BTC,ETH,SOL,USDC,USDT")]
    pub only: String,

    /// Ingest service base URL.
    #[arg(long = "api", env = "CHAINWATCH_API", default_value = "http://localhost:8010")]
    pub api: String,

    /// Restrict scanning to a single entity.
    #[arg(long = "entity", env = "CHAINWATCH_ENTITY")]
    pub entity: Option<String>,

    /// Address-list loader: a Binance proof-of-reserves zip archive.
    #[arg(long = "zip-binance", env = "CHAINWATCH_ZIP_BINANCE")]
    pub zip_binance: Option<PathBuf>,
    #[arg(long = "binance-entity", env = "CHAINWATCH_BINANCE_ENTITY")]
    pub binance_entity: Option<String>,
    #[arg(long = "binance-include-deposit", default_value_t = false)]
    pub binance_include_deposit: bool,

    /// Address-list loader: an OKX proof-of-reserves archive.
    #[arg(long = "okx-por", env = "CHAINWATCH_OKX_POR")]
    pub okx_por: Option<PathBuf>,
    #[arg(long = "okx-entity", env = "CHAINWATCH_OKX_ENTITY")]
    pub okx_entity: Option<String>,
    #[arg(long = "okx-include-deposit", default_value_t = false)]
    pub okx_include_deposit: bool,
    #[arg(long = "okx-include-staking", default_value_t = false)]
    pub okx_include_staking: bool,

    /// Starting block/slot override. Negative (default -5) means "use tip
    /// minus the chain's confirmation lag"; non-negative pins an absolute start.
    #[arg(long = "start-block", default_value_t = -5)]
    pub start_block: i64,

    /// Poll interval in seconds, used when no (chain, entity) pair advanced.
    #[arg(long = "poll", default_value_t = 4)]
    pub poll_secs: u64,

    /// Comma- or space-separated list of chain names to skip entirely.
    #[arg(long = "exclude-chains", default_value = "")]
    pub exclude_chains: String,

    /// Target requests/sec per Solana endpoint.
    #[arg(long = "sol-rps", default_value_t = 8.0)]
    pub sol_rps: f64,

    /// Initial Solana 429 cooldown, in seconds.
    #[arg(long = "sol-429-cooldown", default_value_t = 8)]
    pub sol_429_cooldown_secs: u64,

    /// Verbose logging.
    #[arg(short = 'v', long = "verbose", default_value_t = false)]
    pub verbose: bool,

    /// Emit a progress log every N windows scanned (0 disables).
    #[arg(long = "log-every", default_value_t = 0)]
    pub log_every: u64,
}

impl Config {
    pub fn allowed_symbols(&self) -> HashSet<String> {
        split_list(&self.only)
            .into_iter()
            .map(|s| s.to_ascii_uppercase())
            .collect()
    }

    pub fn excluded_chains(&self) -> HashSet<String> {
        split_list(&self.exclude_chains)
            .into_iter()
            .map(|s| s.to_ascii_lowercase())
            .collect()
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_secs)
    }
}

/// Splits on commas and/or whitespace, dropping empty tokens — `-only` and
/// `-exclude-chains` are documented as "comma/space list" (§6).
fn split_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_handles_commas_and_spaces() {
        assert_eq!(split_list("BTC,ETH, SOL"), vec!["BTC", "ETH", "SOL"]);
        assert_eq!(split_list("bitcoin solana"), vec!["bitcoin", "solana"]);
        assert_eq!(split_list(""), Vec::<String>::new());
    }

    #[test]
    fn allowed_symbols_uppercases() {
        let cfg = Config::parse_from(["chainwatch-scanner", "--only", "btc,eth"]);
        let allowed = cfg.allowed_symbols();
        assert!(allowed.contains("BTC"));
        assert!(allowed.contains("ETH"));
    }

    #[test]
    fn default_start_block_is_negative_five() {
        let cfg = Config::parse_from(["chainwatch-scanner"]);
        assert_eq!(cfg.start_block, -5);
    }
}
