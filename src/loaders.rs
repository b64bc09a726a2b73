//! Address-source and chain-config loaders (§6). Loading address lists from
//! exchange proof-of-reserves archives and the chain config format are
//! collaborator concerns outside the core's scope (§1); this module gives
//! each interface a real signature, with `load_addresses_from_config` and
//! `load_chain_config` backed by minimal working implementations so the CLI
//! has something to run against standalone.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::LoadError;
use crate::model::{AddressRow, ChainConfig};

#[derive(Debug, Deserialize)]
struct AddressRowDe {
    entity: String,
    chain: String,
    address: String,
}

/// Reads a small JSON document: `[{ "entity": ..., "chain": ..., "address": ... }, ...]`.
pub fn load_addresses_from_config(path: &Path) -> Result<Vec<AddressRow>, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let rows: Vec<AddressRowDe> = serde_json::from_str(&text).map_err(|source| LoadError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(rows
        .into_iter()
        .map(|r| AddressRow {
            entity: r.entity,
            chain: r.chain,
            address: r.address,
        })
        .collect())
}

/// Binance proof-of-reserves zip extraction is a collaborator concern (§1);
/// this signature exists so the CLI flag has somewhere to dispatch to.
pub fn load_addresses_from_binance_zip(
    path: &Path,
    entity: &str,
    include_deposit: bool,
) -> Result<Vec<AddressRow>, LoadError> {
    let _ = (path, entity, include_deposit);
    Err(LoadError::NotImplemented(
        "binance proof-of-reserves zip parsing is outside the core scanner's scope".to_string(),
    ))
}

/// OKX proof-of-reserves parsing is a collaborator concern (§1); same shape as above.
pub fn load_addresses_from_okx_por(
    path: &Path,
    entity: &str,
    include_deposit: bool,
    include_staking: bool,
) -> Result<Vec<AddressRow>, LoadError> {
    let _ = (path, entity, include_deposit, include_staking);
    Err(LoadError::NotImplemented(
        "okx proof-of-reserves parsing is outside the core scanner's scope".to_string(),
    ))
}

/// Parses a chain-config document (TOML or JSON, chosen by file extension)
/// into `ChainConfig` per chain name.
pub fn load_chain_config(path: &Path) -> Result<HashMap<String, ChainConfig>, LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let is_toml = path.extension().and_then(|e| e.to_str()) == Some("toml");
    if is_toml {
        toml::from_str(&text).map_err(|source| LoadError::Toml {
            path: path.display().to_string(),
            source,
        })
    } else {
        serde_json::from_str(&text).map_err(|source| LoadError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// The `-config` flag's document: a single JSON file bundling the address
/// rows and the per-chain endpoint/token config, since the CLI surface (§6)
/// exposes only one generic `-config` path alongside the exchange-specific
/// `-zip-binance`/`-okx-por` address sources. `load_addresses_from_config`
/// and `load_chain_config` remain independently usable per their documented
/// signatures; this just composes them for the common single-file case.
#[derive(Debug, Deserialize)]
struct ScannerConfigDe {
    #[serde(default)]
    addresses: Vec<AddressRowDe>,
    #[serde(default)]
    chains: HashMap<String, ChainConfig>,
}

pub fn load_scanner_config(path: &Path) -> Result<(Vec<AddressRow>, HashMap<String, ChainConfig>), LoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let parsed: ScannerConfigDe = serde_json::from_str(&text).map_err(|source| LoadError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    let rows = parsed
        .addresses
        .into_iter()
        .map(|r| AddressRow {
            entity: r.entity,
            chain: r.chain,
            address: r.address,
        })
        .collect();
    Ok((rows, parsed.chains))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn load_addresses_from_config_parses_rows() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"[{{"entity":"acme","chain":"ethereum","address":"0xabc"}}]"#
        )
        .unwrap();
        let rows = load_addresses_from_config(f.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity, "acme");
    }

    #[test]
    fn load_addresses_from_config_rejects_malformed_json() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "not json").unwrap();
        assert!(matches!(load_addresses_from_config(f.path()), Err(LoadError::Parse { .. })));
    }

    #[test]
    fn binance_loader_is_explicitly_not_implemented() {
        let result = load_addresses_from_binance_zip(Path::new("/tmp/x.zip"), "acme", true);
        assert!(matches!(result, Err(LoadError::NotImplemented(_))));
    }

    #[test]
    fn okx_loader_is_explicitly_not_implemented() {
        let result = load_addresses_from_okx_por(Path::new("/tmp/x.json"), "acme", true, false);
        assert!(matches!(result, Err(LoadError::NotImplemented(_))));
    }

    #[test]
    fn load_scanner_config_bundles_addresses_and_chains() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            f,
            r#"{{
                "addresses": [{{"entity":"acme","chain":"bitcoin","address":"bc1qxyz"}}],
                "chains": {{"bitcoin": {{"endpoints": ["https://blockstream.info/api"]}}}}
            }}"#
        )
        .unwrap();
        let (rows, chains) = load_scanner_config(f.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(chains.contains_key("bitcoin"));
    }

    #[test]
    fn load_chain_config_parses_json() {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        writeln!(
            f,
            r#"{{"ethereum": {{"endpoints": ["https://rpc.example"], "erc20_tokens": [], "spl_tokens": []}}}}"#
        )
        .unwrap();
        let cfg = load_chain_config(f.path()).unwrap();
        assert!(cfg.contains_key("ethereum"));
        assert_eq!(cfg["ethereum"].endpoints, vec!["https://rpc.example"]);
    }
}
