//! Consensus rules that change how scripts and transactions are derived, and the
//! per-block view of which of them are in force.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusRule {
    /// Release transactions are created with version 2 instead of 1.
    BtcTxVersion2,
    /// Testnet ERP federations stop using the fixed script deployed before the fix.
    ErpTestnetScriptFix,
    /// The CSV value of ERP scripts is pushed as a minimal signed little endian number.
    ErpCsvLittleEndian,
    /// A federator signing the same pegout twice is a silent no-op.
    AddSignatureIdempotence,
    /// Migration transactions follow `BtcTxVersion2` instead of staying on version 1.
    MigrationTxVersion2,
    /// Transactions are classified through the pegout sighash index.
    PegoutSigHashIndex,
}

impl ConsensusRule {
    pub const ALL: [ConsensusRule; 6] = [
        ConsensusRule::BtcTxVersion2,
        ConsensusRule::ErpTestnetScriptFix,
        ConsensusRule::ErpCsvLittleEndian,
        ConsensusRule::AddSignatureIdempotence,
        ConsensusRule::MigrationTxVersion2,
        ConsensusRule::PegoutSigHashIndex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusRule::BtcTxVersion2 => "btc_tx_version_2",
            ConsensusRule::ErpTestnetScriptFix => "erp_testnet_script_fix",
            ConsensusRule::ErpCsvLittleEndian => "erp_csv_little_endian",
            ConsensusRule::AddSignatureIdempotence => "add_signature_idempotence",
            ConsensusRule::MigrationTxVersion2 => "migration_tx_version_2",
            ConsensusRule::PegoutSigHashIndex => "pegout_sighash_index",
        }
    }
}

/// Activation height of every rule. A rule without a height never activates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
    pub btc_tx_version_2: Option<u64>,
    pub erp_testnet_script_fix: Option<u64>,
    pub erp_csv_little_endian: Option<u64>,
    pub add_signature_idempotence: Option<u64>,
    pub migration_tx_version_2: Option<u64>,
    pub pegout_sighash_index: Option<u64>,
}

impl ActivationConfig {
    /// Every rule active from genesis.
    pub fn all_active() -> Self {
        ConsensusRule::ALL
            .into_iter()
            .fold(Self::default(), |config, rule| config.with_height(rule, 0))
    }

    pub fn with_height(mut self, rule: ConsensusRule, height: u64) -> Self {
        *self.height_mut(rule) = Some(height);
        self
    }

    pub fn without(mut self, rule: ConsensusRule) -> Self {
        *self.height_mut(rule) = None;
        self
    }

    pub fn height(&self, rule: ConsensusRule) -> Option<u64> {
        match rule {
            ConsensusRule::BtcTxVersion2 => self.btc_tx_version_2,
            ConsensusRule::ErpTestnetScriptFix => self.erp_testnet_script_fix,
            ConsensusRule::ErpCsvLittleEndian => self.erp_csv_little_endian,
            ConsensusRule::AddSignatureIdempotence => self.add_signature_idempotence,
            ConsensusRule::MigrationTxVersion2 => self.migration_tx_version_2,
            ConsensusRule::PegoutSigHashIndex => self.pegout_sighash_index,
        }
    }

    fn height_mut(&mut self, rule: ConsensusRule) -> &mut Option<u64> {
        match rule {
            ConsensusRule::BtcTxVersion2 => &mut self.btc_tx_version_2,
            ConsensusRule::ErpTestnetScriptFix => &mut self.erp_testnet_script_fix,
            ConsensusRule::ErpCsvLittleEndian => &mut self.erp_csv_little_endian,
            ConsensusRule::AddSignatureIdempotence => &mut self.add_signature_idempotence,
            ConsensusRule::MigrationTxVersion2 => &mut self.migration_tx_version_2,
            ConsensusRule::PegoutSigHashIndex => &mut self.pegout_sighash_index,
        }
    }

    pub fn for_block(&self, block_number: u64) -> ForBlock {
        let active = ConsensusRule::ALL
            .into_iter()
            .filter(|rule| matches!(self.height(*rule), Some(height) if height <= block_number))
            .collect();
        ForBlock {
            block_number,
            active,
        }
    }
}

/// Rules in force at one block. Every derivation receives one of these explicitly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForBlock {
    block_number: u64,
    active: BTreeSet<ConsensusRule>,
}

impl ForBlock {
    pub fn new(block_number: u64, active: impl IntoIterator<Item = ConsensusRule>) -> Self {
        Self {
            block_number,
            active: active.into_iter().collect(),
        }
    }

    pub fn all_active(block_number: u64) -> Self {
        Self::new(block_number, ConsensusRule::ALL)
    }

    /// Same block with `rule` switched off.
    pub fn without(&self, rule: ConsensusRule) -> Self {
        let mut active = self.active.clone();
        active.remove(&rule);
        Self {
            block_number: self.block_number,
            active,
        }
    }

    pub fn is_active(&self, rule: ConsensusRule) -> bool {
        self.active.contains(&rule)
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }
}
