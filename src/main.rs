//! Multi-chain transfer scanner: tails Bitcoin/EVM/Solana heads, extracts
//! normalized transfer events for a set of watched addresses, and posts
//! batches of them to the ingest service while advancing a per-(entity,
//! chain) cursor.
//!
//! Startup: parse CLI/env config, load addresses and chain config, seed
//! cursors from the ingest service, then run the scan loop until SIGINT/SIGTERM.

mod chains;
mod config;
mod cursor;
mod dispatch;
mod errors;
mod loaders;
mod model;
mod pool;
mod scan_loop;
mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chains::{bitcoin::BitcoinAdapter, evm::EvmAdapter, solana::SolanaAdapter, ChainAdapter};
use config::Config;
use cursor::CursorClient;
use dispatch::Dispatcher;
use model::{chain_family, AddressRow, ChainConfig, ChainFamily, CursorTable, EntityAddressSet};
use pool::{SolanaPool, SolanaPoolConfig};
use scan_loop::{ScanLoop, Target};
use transport::Transport;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    dotenvy::dotenv().ok();
    let cfg = Config::parse();
    init_logging(cfg.verbose);

    match run(cfg).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = ?e, "fatal startup error");
            std::process::ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "chainwatch_scanner=debug,info" } else { "chainwatch_scanner=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .json()
        .init();
}

async fn run(cfg: Config) -> Result<()> {
    info!(api = %cfg.api, poll_secs = cfg.poll_secs, "starting chainwatch-scanner");

    let (mut addresses, chain_configs) = load_config(&cfg)?;
    addresses.extend(load_extra_addresses(&cfg)?);

    if addresses.is_empty() {
        bail!("no addresses loaded: provide -config, -zip-binance, or -okx-por");
    }

    let allowed = cfg.allowed_symbols();
    let excluded = cfg.excluded_chains();

    let transport = Transport::new();
    let adapters = build_adapters(&chain_configs, &excluded, &allowed, &cfg, transport.clone())
        .context("failed to build chain adapters")?;

    if adapters.is_empty() {
        bail!("no chain RPC configuration available for any watched chain");
    }

    let cursor_client = CursorClient::new(transport.clone(), cfg.api.clone());
    let dispatcher = Dispatcher::new(transport.clone(), cfg.api.clone());

    let seeded_targets = build_targets(&addresses, &adapters, &cfg.entity, &cursor_client, cfg.start_block).await;
    if seeded_targets.is_empty() {
        bail!("no (entity, chain) targets after filtering excluded chains / --entity");
    }

    let mut cursors = CursorTable::default();
    for t in &seeded_targets {
        cursors.set(&t.target.entity, &t.target.chain, t.seeded);
    }

    let targets: Vec<Target> = seeded_targets.into_iter().map(|t| t.target).collect();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_writer = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received shutdown signal, finishing current tick");
            shutdown_writer.store(true, Ordering::Relaxed);
        }
    });

    let scan_loop = ScanLoop::new(targets, cursors, cursor_client, dispatcher, cfg.poll_interval(), cfg.log_every);
    scan_loop.run(shutdown).await;
    Ok(())
}

fn load_config(cfg: &Config) -> Result<(Vec<AddressRow>, HashMap<String, ChainConfig>)> {
    let Some(path) = &cfg.config else {
        bail!("-config is required: no chain configuration available");
    };
    loaders::load_scanner_config(path).with_context(|| format!("loading {}", path.display()))
}

fn load_extra_addresses(cfg: &Config) -> Result<Vec<AddressRow>> {
    let mut rows = Vec::new();
    if let Some(path) = &cfg.zip_binance {
        let entity = cfg.binance_entity.clone().unwrap_or_else(|| "binance".to_string());
        rows.extend(
            loaders::load_addresses_from_binance_zip(path, &entity, cfg.binance_include_deposit)
                .context("loading binance proof-of-reserves addresses")?,
        );
    }
    if let Some(path) = &cfg.okx_por {
        let entity = cfg.okx_entity.clone().unwrap_or_else(|| "okx".to_string());
        rows.extend(
            loaders::load_addresses_from_okx_por(
                path,
                &entity,
                cfg.okx_include_deposit,
                cfg.okx_include_staking,
            )
            .context("loading okx proof-of-reserves addresses")?,
        );
    }
    Ok(rows)
}

fn build_adapters(
    chain_configs: &HashMap<String, ChainConfig>,
    excluded: &HashSet<String>,
    allowed: &HashSet<String>,
    cfg: &Config,
    transport: Transport,
) -> Result<HashMap<String, Arc<dyn ChainAdapter>>> {
    let mut adapters: HashMap<String, Arc<dyn ChainAdapter>> = HashMap::new();

    for (chain_name, chain_cfg) in chain_configs {
        let lower = chain_name.to_ascii_lowercase();
        if excluded.contains(&lower) {
            continue;
        }
        if chain_cfg.endpoints.is_empty() {
            warn!(chain = %chain_name, "chain config has no endpoints, skipping");
            continue;
        }

        let adapter: Arc<dyn ChainAdapter> = match chain_family(&lower) {
            ChainFamily::Bitcoin => Arc::new(BitcoinAdapter::new(chain_cfg.endpoints.clone(), transport.clone())),
            ChainFamily::Solana => {
                let pool_cfg = SolanaPoolConfig {
                    rps: cfg.sol_rps,
                    cooldown_base: std::time::Duration::from_secs(cfg.sol_429_cooldown_secs),
                    ..SolanaPoolConfig::default()
                };
                let pool = SolanaPool::new(chain_cfg.endpoints.clone(), pool_cfg);
                Arc::new(SolanaAdapter::new(pool, transport.clone(), chain_cfg.spl_tokens.clone(), allowed.clone()))
            }
            ChainFamily::Evm => Arc::new(EvmAdapter::new(
                lower.clone(),
                chain_cfg.endpoints.clone(),
                chain_cfg.erc20_tokens.clone(),
                allowed.clone(),
                transport.clone(),
            )),
        };

        adapters.insert(lower, adapter);
    }

    Ok(adapters)
}

struct SeededTarget {
    target: Target,
    seeded: u64,
}

async fn build_targets(
    addresses: &[AddressRow],
    adapters: &HashMap<String, Arc<dyn ChainAdapter>>,
    entity_filter: &Option<String>,
    cursor_client: &CursorClient,
    start_block: i64,
) -> Vec<SeededTarget> {
    let mut address_sets: HashMap<(String, String), EntityAddressSet> = HashMap::new();

    for row in addresses {
        let chain_lower = row.chain.to_ascii_lowercase();
        if !adapters.contains_key(&chain_lower) {
            continue;
        }
        if let Some(only) = entity_filter {
            if &row.entity != only {
                continue;
            }
        }
        let family = chain_family(&chain_lower);
        let set = address_sets
            .entry((row.entity.clone(), chain_lower))
            .or_insert_with(|| EntityAddressSet::new(family));
        set.insert(&row.address);
    }

    let mut out = Vec::new();
    for ((entity, chain), addrs) in address_sets {
        if addrs.is_empty() {
            continue;
        }
        let Some(adapter) = adapters.get(&chain) else { continue };

        let tip = match adapter.tip().await {
            Ok(t) => t,
            Err(e) => {
                warn!(entity = %entity, chain = %chain, error = %e, "failed to fetch tip during startup seeding, seeding at 0");
                0
            }
        };
        let seeded = cursor_client.seed(&entity, &chain, tip, adapter.confirmation_lag(), start_block).await;
        info!(entity = %entity, chain = %chain, tip, seeded, "seeded cursor");

        out.push(SeededTarget {
            target: Target {
                entity,
                chain,
                adapter: adapter.clone(),
                addrs,
            },
            seeded,
        });
    }
    out
}
