//! Deployment configuration: endpoints, wallet and exchange addresses.
//!
//! Loaded from a TOML file named by `DEPLOYMENT_FILE` (values may reference
//! environment variables as `${VAR}`), or directly from environment variables.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use liquidator_chain::Exchange;
use serde::{Deserialize, Serialize};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;

const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";

/// Deployment file as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentFile {
    /// HTTP RPC endpoint
    pub rpc_url: String,
    /// WebSocket endpoint; derived from `rpc_url` if omitted
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Path to the liquidator wallet's JSON keypair
    pub keypair_path: String,
    pub exchange_program: String,
    pub exchange_state: String,
    pub exchange_authority: String,
    /// processed, confirmed or finalized
    #[serde(default)]
    pub commitment: Option<String>,
}

/// Resolved deployment.
#[derive(Debug, Clone)]
pub struct Deployment {
    pub rpc_url: String,
    pub ws_url: String,
    pub keypair_path: PathBuf,
    pub exchange: Exchange,
    pub commitment: CommitmentConfig,
}

impl Deployment {
    /// Load from `DEPLOYMENT_FILE` if set, otherwise from environment variables.
    pub fn from_env() -> Result<Self> {
        let lookup = |key: &str| std::env::var(key).ok();
        match lookup("DEPLOYMENT_FILE") {
            Some(path) => Self::from_file(&path, lookup),
            None => Self::from_lookup(lookup),
        }
    }

    pub fn from_file(path: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading deployment file {path}"))?;
        Self::from_toml_str(&content, lookup)
    }

    /// Parse a deployment file, expanding `${VAR}` references through `lookup`.
    pub fn from_toml_str(content: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut file: DeploymentFile = toml::from_str(content)?;

        file.rpc_url = expand_env(&file.rpc_url, &lookup)?;
        file.keypair_path = expand_env(&file.keypair_path, &lookup)?;
        file.exchange_program = expand_env(&file.exchange_program, &lookup)?;
        file.exchange_state = expand_env(&file.exchange_state, &lookup)?;
        file.exchange_authority = expand_env(&file.exchange_authority, &lookup)?;
        if let Some(ref mut ws) = file.ws_url {
            *ws = expand_env(ws, &lookup)?;
        }

        Self::resolve(file)
    }

    /// Build from individual variables (`RPC_URL`, `WS_URL`, `KEYPAIR_PATH`,
    /// `EXCHANGE_PROGRAM`, `EXCHANGE_STATE`, `EXCHANGE_AUTHORITY`, `COMMITMENT`).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let require = |key: &str| lookup(key).ok_or_else(|| anyhow!("Missing env var: {key}"));

        let keypair_path = match lookup("KEYPAIR_PATH") {
            Some(path) => path,
            None => {
                let home = require("HOME")?;
                format!("{home}/.config/solana/id.json")
            }
        };

        Self::resolve(DeploymentFile {
            rpc_url: lookup("RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            ws_url: lookup("WS_URL"),
            keypair_path,
            exchange_program: require("EXCHANGE_PROGRAM")?,
            exchange_state: require("EXCHANGE_STATE")?,
            exchange_authority: require("EXCHANGE_AUTHORITY")?,
            commitment: lookup("COMMITMENT"),
        })
    }

    fn resolve(file: DeploymentFile) -> Result<Self> {
        let ws_url = match file.ws_url {
            Some(ws) if !ws.is_empty() => ws,
            _ => derive_ws_url(&file.rpc_url),
        };
        let commitment = match file.commitment.as_deref() {
            None => CommitmentConfig::confirmed(),
            Some(level) => parse_commitment(level)?,
        };

        Ok(Self {
            exchange: Exchange::new(
                parse_pubkey(&file.exchange_program, "exchange_program")?,
                parse_pubkey(&file.exchange_state, "exchange_state")?,
                parse_pubkey(&file.exchange_authority, "exchange_authority")?,
            ),
            rpc_url: file.rpc_url,
            ws_url,
            keypair_path: PathBuf::from(file.keypair_path),
            commitment,
        })
    }

    pub fn log_config(&self) {
        tracing::info!(
            rpc = %self.rpc_url,
            ws = %self.ws_url,
            commitment = ?self.commitment.commitment,
            program = %self.exchange.program_id,
            state = %self.exchange.state,
            "Deployment loaded"
        );
    }
}

fn parse_pubkey(value: &str, field: &str) -> Result<Pubkey> {
    Pubkey::from_str(value).map_err(|e| anyhow!("Invalid {field} '{value}': {e}"))
}

fn parse_commitment(level: &str) -> Result<CommitmentConfig> {
    match level.to_lowercase().as_str() {
        "processed" => Ok(CommitmentConfig::processed()),
        "confirmed" => Ok(CommitmentConfig::confirmed()),
        "finalized" => Ok(CommitmentConfig::finalized()),
        other => Err(anyhow!("Unknown commitment level '{other}'")),
    }
}

/// `https://host` -> `wss://host`, `http://host` -> `ws://host`.
fn derive_ws_url(http: &str) -> String {
    if let Some(rest) = http.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http.to_string()
    }
}

/// Expand ${VAR_NAME} patterns with values from `lookup`.
fn expand_env(s: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut result = s.to_string();
    let re = regex_lite::Regex::new(r"\$\{([^}]+)\}")?;

    for cap in re.captures_iter(s) {
        if let (Some(full_match), Some(var_match)) = (cap.get(0), cap.get(1)) {
            let var_name = var_match.as_str();
            let value = lookup(var_name).ok_or_else(|| anyhow!("Missing env var: {var_name}"))?;
            result = result.replace(full_match.as_str(), &value);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, String)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_expand_env() {
        let lookup = vars(&[("RPC_HOST", "rpc.example.com".to_string())]);
        assert_eq!(expand_env("${RPC_HOST}", &lookup).unwrap(), "rpc.example.com");
        assert_eq!(
            expand_env("https://${RPC_HOST}/v1", &lookup).unwrap(),
            "https://rpc.example.com/v1"
        );
        assert_eq!(expand_env("no_vars", &lookup).unwrap(), "no_vars");
        assert!(expand_env("${MISSING}", &lookup).is_err());
    }

    #[test]
    fn test_derive_ws_url() {
        assert_eq!(derive_ws_url("https://api.devnet.solana.com"), "wss://api.devnet.solana.com");
        assert_eq!(derive_ws_url("http://127.0.0.1:8899"), "ws://127.0.0.1:8899");
    }

    #[test]
    fn test_from_toml_with_expansion() {
        let program = Pubkey::new_unique();
        let state = Pubkey::new_unique();
        let authority = Pubkey::new_unique();
        let lookup = vars(&[("EXCHANGE", program.to_string())]);

        let content = format!(
            r#"
            rpc_url = "https://rpc.example.com"
            keypair_path = "/keys/liquidator.json"
            exchange_program = "${{EXCHANGE}}"
            exchange_state = "{state}"
            exchange_authority = "{authority}"
            commitment = "finalized"
            "#
        );
        let deployment = Deployment::from_toml_str(&content, lookup).unwrap();

        assert_eq!(deployment.exchange.program_id, program);
        assert_eq!(deployment.exchange.state, state);
        assert_eq!(deployment.ws_url, "wss://rpc.example.com");
        assert_eq!(deployment.commitment, CommitmentConfig::finalized());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let lookup = vars(&[
            ("HOME", "/home/bot".to_string()),
            ("EXCHANGE_PROGRAM", Pubkey::new_unique().to_string()),
            ("EXCHANGE_STATE", Pubkey::new_unique().to_string()),
            ("EXCHANGE_AUTHORITY", Pubkey::new_unique().to_string()),
        ]);
        let deployment = Deployment::from_lookup(lookup).unwrap();

        assert_eq!(deployment.rpc_url, DEFAULT_RPC_URL);
        assert_eq!(
            deployment.keypair_path,
            PathBuf::from("/home/bot/.config/solana/id.json")
        );
        assert_eq!(deployment.commitment, CommitmentConfig::confirmed());
    }

    #[test]
    fn test_from_lookup_requires_exchange_addresses() {
        let lookup = vars(&[("KEYPAIR_PATH", "/k.json".to_string())]);
        let err = Deployment::from_lookup(lookup).unwrap_err();
        assert!(err.to_string().contains("EXCHANGE_PROGRAM"));
    }

    #[test]
    fn test_rejects_bad_commitment_and_pubkey() {
        assert!(parse_commitment("eventually").is_err());
        assert!(parse_pubkey("not-a-key", "exchange_state").is_err());
    }
}
