//! Bitcoin side of the PowPeg: federation redeem scripts, release transaction
//! construction, federator signature collection and peg transaction classification.

pub mod activations;
pub mod classifier;
pub mod config;
pub mod federation;
pub mod metrics;
pub mod pegout_size;
pub mod redeem_script;
pub mod release_builder;
pub mod signatures;
pub mod spending;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_utils;

use thiserror::Error;

pub use bitcoin;

pub use activations::{ActivationConfig, ConsensusRule, ForBlock};
pub use classifier::{classify, pegout_sighash, PegTxType, PegoutSigHashIndex};
pub use config::{BridgeConstants, ConfigError, PowpegConfig, Validate};
pub use federation::{
    ErpParams, Federation, FederationArgs, FederationError, FederationKind, FederationMember,
    FormatVersion,
};
pub use pegout_size::{
    estimate_pegout_fee, estimate_pegout_size, regular_pegout_size, SizeEstimationError,
};
pub use redeem_script::{CsvEncoding, RedeemScriptBuilder, ScriptCreationError};
pub use release_builder::{BuildResult, ReleaseRequest, ReleaseTransactionBuilder, ResponseCode};
pub use signatures::{
    BridgeEvent, InvalidSignatureReason, PegoutId, PegoutsWaitingForSignatures,
    PendingSignatureTx, SignatureCollector, SigningOutcome, SigningReport,
};
pub use spending::{MultisigSpend, RedeemScriptInfo, ScriptShape, SpendingError};
pub use wallet::{FederationWallet, Utxo, UtxoProvider, UtxoProviderError, WalletError};

/// Largest item the script interpreter lets onto the stack, which bounds P2SH redeem scripts.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;
/// Standardness bound for P2WSH witness scripts.
pub const MAX_STANDARD_P2WSH_SCRIPT_SIZE: usize = 3_600;
/// Largest relative lock that fits the 16 bit block field of a CSV sequence.
pub const MAX_CSV_VALUE: u64 = 65_535;
pub const MIN_NONDUST_OUTPUT: u64 = 546;
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;
/// Fallback fee rate, in satoshis per 1000 bytes.
pub const DEFAULT_FEE_PER_KB: u64 = 100_000;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Federation error: {0}")]
    Federation(#[from] FederationError),
    #[error("Redeem script error: {0}")]
    ScriptCreation(#[from] ScriptCreationError),
    #[error("Size estimation error: {0}")]
    SizeEstimation(#[from] SizeEstimationError),
    #[error("Spending data error: {0}")]
    Spending(#[from] SpendingError),
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Sighash computation failed: {0}")]
    Sighash(#[from] bitcoin::sighash::Error),
    #[error("Consensus rule {0:?} is not active")]
    RuleNotActive(ConsensusRule),
    #[error("Illegal state: {0}")]
    IllegalState(String),
}
