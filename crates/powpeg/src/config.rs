//! Network constants of the peg and their loading from TOML files.

use crate::activations::ActivationConfig;
use crate::{
    DEFAULT_FEE_PER_KB, MAX_CSV_VALUE, MAX_STANDARD_TX_SIZE, MIN_NONDUST_OUTPUT,
};
use bitcoin::{Network, PublicKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    #[error("Configuration validation error: {field} - {reason}")]
    ValidationError { field: String, reason: String },
}

pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

const MAINNET_ERP_PUBKEYS: [&str; 4] = [
    "0257c293086c4d4fe8943deda5f890a37d11bebd140e220faa76258a41d077b4d4",
    "03c2660a46aa73078ee6016dee953488566426cf55fc8011edd0085634d75395f9",
    "03cd3e383ec6e12719a6c69515e5559bcbe037d0aa24c187e1e26ce932e22ad7b3",
    "02370a9838e4d15708ad14a104ee5606b36caaaaf739d833e67770ce9fd9b3ec80",
];

const TESTNET_ERP_PUBKEYS: [&str; 3] = [
    "0216c23b2ea8e4f11c3f9e22711addb1d16a93964796913830856b568cc3ea21d3",
    "034db69f2112f4fb1bb6141bf6e2bd6631f0484d0bd95b16767902c9fe219d4a6f",
    "0275562901dd8faae20de0a4166362a4f82188db77dbed4ca887422ea1ec185f14",
];

const REGTEST_ERP_PUBKEYS: [&str; 5] = [
    "03b9fc46657cf72a1afa007ecf431de1cd27ff5cc8829fa625b66ca47b967e6b24",
    "029cecea902067992d52c38b28bf0bb2345bda9b21eca76b16a17c477a64e43301",
    "03284178e5fbcc63c54c3b38e3ef88adf2da6c526313650041b0ef955763634ebd",
    "03776b1fd8f86da3c1db3d69699e8250a15877d286734ea9a6da8e9d8ad25d16c1",
    "03ab0e2cd7ed158687fc13b88019990860cdb72b1f5777b58513312550ea1584bc",
];

/// Peg parameters that differ between Bitcoin networks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConstants {
    pub network: Network,
    /// Keys of the emergency branch of ERP federations.
    pub erp_fed_pubkeys: Vec<PublicKey>,
    /// Blocks an ERP output has to age before the emergency branch can spend it.
    pub erp_fed_activation_delay: u64,
    pub fee_per_kb: u64,
    pub min_nondust_output: u64,
    pub max_transaction_size: usize,
}

impl BridgeConstants {
    pub fn mainnet() -> Result<Self, ConfigError> {
        Self::with_erp_keys(Network::Bitcoin, &MAINNET_ERP_PUBKEYS, 52_560)
    }

    pub fn testnet() -> Result<Self, ConfigError> {
        Self::with_erp_keys(Network::Testnet, &TESTNET_ERP_PUBKEYS, 52_560)
    }

    pub fn regtest() -> Result<Self, ConfigError> {
        Self::with_erp_keys(Network::Regtest, &REGTEST_ERP_PUBKEYS, 500)
    }

    pub fn for_network(network: Network) -> Result<Self, ConfigError> {
        match network {
            Network::Bitcoin => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
            other => Err(ConfigError::ValidationError {
                field: "bridge.network".to_string(),
                reason: format!("No peg constants for network {other}"),
            }),
        }
    }

    fn with_erp_keys(
        network: Network,
        keys: &[&str],
        erp_fed_activation_delay: u64,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            network,
            erp_fed_pubkeys: parse_erp_keys(keys)?,
            erp_fed_activation_delay,
            fee_per_kb: DEFAULT_FEE_PER_KB,
            min_nondust_output: MIN_NONDUST_OUTPUT,
            max_transaction_size: MAX_STANDARD_TX_SIZE,
        })
    }
}

fn parse_erp_keys(keys: &[&str]) -> Result<Vec<PublicKey>, ConfigError> {
    keys.iter()
        .map(|key| {
            PublicKey::from_str(key).map_err(|e| ConfigError::ValidationError {
                field: "bridge.erp_fed_pubkeys".to_string(),
                reason: format!("Invalid public key {key}: {e}"),
            })
        })
        .collect()
}

impl Validate for BridgeConstants {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.erp_fed_pubkeys.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "bridge.erp_fed_pubkeys".to_string(),
                reason: "At least one emergency key is required".to_string(),
            });
        }

        if self.erp_fed_activation_delay == 0 || self.erp_fed_activation_delay > MAX_CSV_VALUE {
            return Err(ConfigError::ValidationError {
                field: "bridge.erp_fed_activation_delay".to_string(),
                reason: format!("Must be between 1 and {MAX_CSV_VALUE}"),
            });
        }

        if self.fee_per_kb == 0 {
            return Err(ConfigError::ValidationError {
                field: "bridge.fee_per_kb".to_string(),
                reason: "Fee per kB must be greater than 0".to_string(),
            });
        }

        if self.min_nondust_output == 0 {
            return Err(ConfigError::ValidationError {
                field: "bridge.min_nondust_output".to_string(),
                reason: "Dust threshold must be greater than 0".to_string(),
            });
        }

        if self.max_transaction_size == 0 {
            return Err(ConfigError::ValidationError {
                field: "bridge.max_transaction_size".to_string(),
                reason: "Maximum transaction size must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

/// Everything a node needs to run the peg engine for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowpegConfig {
    pub bridge: BridgeConstants,
    #[serde(default)]
    pub activations: ActivationConfig,
}

impl PowpegConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|_| ConfigError::FileNotFound {
                path: path.as_ref().display().to_string(),
            })?;

        let config: PowpegConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })
    }
}

impl Validate for PowpegConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.bridge.validate()
    }
}
