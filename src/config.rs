//! Configuration management for the federator
//!
//! Loads configuration from a TOML file with environment variable substitution
//! and derives one immutable [`FederatorConfig`] per relay direction.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::chain::ConfirmationPolicy;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub federator: FederatorSettings,
    pub mainchain: ChainConfig,
    pub sidechain: ChainConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub gas: GasConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub confirmation_table: HashMap<String, ChainConfirmations>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederatorSettings {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_run_every_minutes")]
    pub run_every_minutes: u64,
    #[serde(default = "default_block_page_size")]
    pub block_page_size: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_receipt_timeout_secs")]
    pub receipt_timeout_secs: u64,
    #[serde(default = "default_receipt_poll_secs")]
    pub receipt_poll_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub bridge_address: String,
    #[serde(default)]
    pub multisig_address: Option<String>,
    /// First block scanned when no checkpoint exists yet
    #[serde(default)]
    pub from_block: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key: Option<String>,
    pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    /// Network on which the gas price multiplier applies
    #[serde(default)]
    pub primary_chain_id: Option<u64>,
    #[serde(default = "default_multiplier_percent")]
    pub multiplier_percent: u64,
    #[serde(default = "default_gas_limit_buffer_percent")]
    pub gas_limit_buffer_percent: u64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            primary_chain_id: None,
            multiplier_percent: default_multiplier_percent(),
            gas_limit_buffer_percent: default_gas_limit_buffer_percent(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    File,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointConfig {
    pub backend: CheckpointBackend,
    pub path: Option<PathBuf>,
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub token: String,
    pub group_id: Option<i64>,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.token.is_empty() && self.group_id.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

/// Confirmation requirements for transfers whose destination is one chain
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfirmations {
    pub default: u64,
    pub min_confirmation: u64,
    #[serde(default)]
    pub tiers: HashMap<String, Vec<ConfirmationTier>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationTier {
    /// Threshold in whole token units, e.g. "0.5"
    pub amount: String,
    pub confirmations: u64,
}

fn default_instance_id() -> String {
    "federator".to_string()
}

fn default_run_every_minutes() -> u64 {
    2
}

fn default_block_page_size() -> u64 {
    1000
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_receipt_timeout_secs() -> u64 {
    300
}

fn default_receipt_poll_secs() -> u64 {
    5
}

fn default_multiplier_percent() -> u64 {
    150
}

fn default_gas_limit_buffer_percent() -> u64 {
    20
}

fn default_max_connections() -> u32 {
    5
}

/// Hex encoded secp256k1 key; never printed
#[derive(Clone)]
pub struct SigningKey(String);

impl SigningKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// Immutable configuration of one relay direction (source -> destination)
#[derive(Debug, Clone)]
pub struct FederatorConfig {
    pub source: ChainConfig,
    pub destination: ChainConfig,
    pub signing_key: SigningKey,
    pub gas: GasConfig,
    pub confirmation_table: HashMap<String, ChainConfirmations>,
    pub block_page_size: u64,
    pub rpc_timeout: Duration,
    pub receipt_timeout: Duration,
    pub receipt_poll: Duration,
}

impl FederatorConfig {
    /// Key identifying this direction in logs, metrics and checkpoint storage
    pub fn direction(&self) -> String {
        format!("{}-to-{}", self.source.name, self.destination.name)
    }
}

impl Settings {
    /// Load settings from the configuration file
    pub fn load() -> Result<Self> {
        let config_path = env::var("FEDERATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.federator.run_every_minutes == 0 {
            anyhow::bail!("federator.run_every_minutes must be greater than zero");
        }
        if self.federator.block_page_size == 0 {
            anyhow::bail!("federator.block_page_size must be greater than zero");
        }
        if self.mainchain.chain_id == self.sidechain.chain_id {
            anyhow::bail!(
                "mainchain and sidechain share chain id {}",
                self.mainchain.chain_id
            );
        }

        if self.mainchain.name == self.sidechain.name {
            anyhow::bail!(
                "mainchain and sidechain share the name {:?}; it keys each direction's checkpoint",
                self.mainchain.name
            );
        }

        for chain in [&self.mainchain, &self.sidechain] {
            if !is_path_safe_name(&chain.name) {
                anyhow::bail!(
                    "Chain name {:?} may only contain letters, digits, '_' and '-'",
                    chain.name
                );
            }
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", chain.name);
            }
            chain
                .bridge_address
                .parse::<ethers::types::Address>()
                .with_context(|| format!("Chain {} has an invalid bridge address", chain.name))?;
            if let Some(multisig) = &chain.multisig_address {
                multisig.parse::<ethers::types::Address>().with_context(|| {
                    format!("Chain {} has an invalid multisig address", chain.name)
                })?;
            }
        }

        match self.checkpoint.backend {
            CheckpointBackend::File if self.checkpoint.path.is_none() => {
                anyhow::bail!("checkpoint.path is required for the file backend")
            }
            CheckpointBackend::Postgres if self.checkpoint.database_url.is_none() => {
                anyhow::bail!("checkpoint.database_url is required for the postgres backend")
            }
            _ => {}
        }

        self.signing_key()?;

        ConfirmationPolicy::new(&self.confirmation_table)
            .map_err(|e| anyhow::anyhow!("Invalid confirmation table: {}", e))?;

        Ok(())
    }

    /// Resolve the signing credential from inline config or a key file
    pub fn signing_key(&self) -> Result<SigningKey> {
        let raw = match (&self.wallet.private_key, &self.wallet.private_key_path) {
            (Some(key), _) if !key.trim().is_empty() => key.clone(),
            (_, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read key file: {:?}", path))?,
            _ => anyhow::bail!("wallet.private_key or wallet.private_key_path is required"),
        };

        let key = raw.trim().trim_start_matches("0x").to_string();
        if key.len() != 64 || hex::decode(&key).is_err() {
            anyhow::bail!("Signing key must be 32 hex encoded bytes");
        }

        Ok(SigningKey::new(key))
    }

    /// Polling interval of the scheduler
    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.federator.run_every_minutes * 60)
    }

    /// Main chain to side chain
    pub fn forward(&self) -> Result<FederatorConfig> {
        self.direction(&self.mainchain, &self.sidechain)
    }

    /// Side chain to main chain, same code with source and destination swapped
    pub fn reverse(&self) -> Result<FederatorConfig> {
        self.direction(&self.sidechain, &self.mainchain)
    }

    fn direction(&self, source: &ChainConfig, destination: &ChainConfig) -> Result<FederatorConfig> {
        Ok(FederatorConfig {
            source: source.clone(),
            destination: destination.clone(),
            signing_key: self.signing_key()?,
            gas: self.gas.clone(),
            confirmation_table: self.confirmation_table.clone(),
            block_page_size: self.federator.block_page_size,
            rpc_timeout: Duration::from_secs(self.federator.rpc_timeout_secs),
            receipt_timeout: Duration::from_secs(self.federator.receipt_timeout_secs),
            receipt_poll: Duration::from_secs(self.federator.receipt_poll_secs),
        })
    }
}

/// Chain names end up in checkpoint paths and table keys
fn is_path_safe_name(name: &str) -> bool {
    lazy_static::lazy_static! {
        static ref CHAIN_NAME: regex::Regex =
            regex::Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex");
    }

    CHAIN_NAME.is_match(name)
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio_test::assert_ok;

    pub(crate) const TEST_KEY: &str =
        "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    pub(crate) fn sample_toml() -> String {
        format!(
            r#"
[federator]
instance_id = "fed-test"
run_every_minutes = 2

[mainchain]
name = "rsk"
chain_id = 31
rpc_urls = ["http://localhost:4444"]
bridge_address = "0x1684a2c5d2b9b7a5c4d0b7c9b8e0fa0e6c7c8b3a"
from_block = 100

[sidechain]
name = "eth"
chain_id = 4
rpc_urls = ["http://localhost:8545", "http://localhost:8546"]
bridge_address = "0x2684a2c5d2b9b7a5c4d0b7c9b8e0fa0e6c7c8b3a"
multisig_address = "0x3684a2c5d2b9b7a5c4d0b7c9b8e0fa0e6c7c8b3a"

[wallet]
private_key = "0x{key}"

[gas]
primary_chain_id = 30

[checkpoint]
backend = "file"
path = "./db"

[confirmation_table.4]
default = 12
min_confirmation = 10

[[confirmation_table.4.tiers.WETH]]
amount = "0"
confirmations = 10

[[confirmation_table.4.tiers.WETH]]
amount = "0.2"
confirmations = 11

[[confirmation_table.4.tiers.WETH]]
amount = "0.5"
confirmations = 12

[confirmation_table.31]
default = 10
min_confirmation = 10
"#,
            key = TEST_KEY
        )
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample_settings() {
        let settings = assert_ok!(Settings::from_toml(&sample_toml()));
        assert_eq!(settings.federator.instance_id, "fed-test");
        assert_eq!(settings.federator.block_page_size, 1000);
        assert_eq!(settings.gas.multiplier_percent, 150);
        assert_eq!(settings.polling_interval(), Duration::from_secs(120));
        assert!(settings.telegram.is_none());
        assert_eq!(settings.confirmation_table["4"].tiers["WETH"].len(), 3);
    }

    #[test]
    fn test_directions_swap_source_and_destination() {
        let settings = Settings::from_toml(&sample_toml()).unwrap();
        let forward = settings.forward().unwrap();
        let reverse = settings.reverse().unwrap();

        assert_eq!(forward.direction(), "rsk-to-eth");
        assert_eq!(reverse.direction(), "eth-to-rsk");
        assert_eq!(forward.source.chain_id, reverse.destination.chain_id);
        assert_eq!(forward.destination.chain_id, reverse.source.chain_id);
        assert_eq!(forward.signing_key.expose(), TEST_KEY);
    }

    #[test]
    fn test_signing_key_is_redacted() {
        let settings = Settings::from_toml(&sample_toml()).unwrap();
        let printed = format!("{:?}", settings.forward().unwrap());
        assert!(!printed.contains(TEST_KEY));
    }

    #[test]
    fn test_rejects_missing_rpc_urls() {
        let toml = sample_toml().replace(
            r#"rpc_urls = ["http://localhost:4444"]"#,
            "rpc_urls = []",
        );
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("no RPC URLs"));
    }

    #[test]
    fn test_rejects_missing_signing_key() {
        let toml = sample_toml().replace(&format!("private_key = \"0x{}\"", TEST_KEY), "");
        assert!(Settings::from_toml(&toml).is_err());
    }

    #[test]
    fn test_rejects_decreasing_confirmations() {
        let toml = sample_toml().replace("confirmations = 12", "confirmations = 9");
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("confirmation table"));
    }

    #[test]
    fn test_rejects_chains_sharing_a_name() {
        let toml = sample_toml().replace(r#"name = "rsk""#, r#"name = "eth""#);
        let err = Settings::from_toml(&toml).unwrap_err();
        assert!(err.to_string().contains("share the name"));
    }

    #[test]
    fn test_rejects_chain_names_unfit_for_paths() {
        for name in ["../rsk", "rsk/main", "", "rsk main"] {
            let toml = sample_toml().replace(r#"name = "rsk""#, &format!("name = {:?}", name));
            let err = Settings::from_toml(&toml).unwrap_err();
            assert!(err.to_string().contains("may only contain"), "{}", name);
        }
    }

    #[test]
    fn test_rejects_postgres_backend_without_url() {
        let toml = sample_toml().replace("backend = \"file\"", "backend = \"postgres\"");
        assert!(Settings::from_toml(&toml).is_err());
    }
}
