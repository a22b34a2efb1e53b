use crate::activations::{ConsensusRule, ForBlock};
use crate::metrics::CLASSIFIED_TRANSACTIONS;
use crate::spending::MultisigSpend;
use crate::wallet::{FederationWallet, UtxoProvider};
use crate::Error;
use bitcoin::sighash::{EcdsaSighashType, LegacySighash, SighashCache};
use bitcoin::Transaction;
use std::collections::HashSet;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PegTxType {
    Pegin,
    PegoutOrMigration,
    Unknown,
}

impl PegTxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PegTxType::Pegin => "pegin",
            PegTxType::PegoutOrMigration => "pegout_or_migration",
            PegTxType::Unknown => "unknown",
        }
    }
}

/// Sighashes of the first input of every transaction the federation released.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PegoutSigHashIndex {
    sighashes: HashSet<LegacySighash>,
}

impl PegoutSigHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when `sighash` was already present.
    pub fn insert(&mut self, sighash: LegacySighash) -> bool {
        self.sighashes.insert(sighash)
    }

    pub fn contains(&self, sighash: &LegacySighash) -> bool {
        self.sighashes.contains(sighash)
    }

    /// Indexes a transaction built by the federation. Transactions that do not spend a
    /// federation output are left out.
    pub fn record(&mut self, tx: &Transaction) -> Result<bool, Error> {
        Ok(match pegout_sighash(tx)? {
            Some(sighash) => self.insert(sighash),
            None => false,
        })
    }

    pub fn len(&self) -> usize {
        self.sighashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sighashes.is_empty()
    }
}

impl FromIterator<LegacySighash> for PegoutSigHashIndex {
    fn from_iter<T: IntoIterator<Item = LegacySighash>>(iter: T) -> Self {
        Self {
            sighashes: iter.into_iter().collect(),
        }
    }
}

/// Legacy SIGHASH_ALL hash of the first input under the redeem script it carries. Signing
/// does not change it, since legacy sighashes blank every scriptSig. `None` when the first
/// input does not spend a federation script.
pub fn pegout_sighash(tx: &Transaction) -> Result<Option<LegacySighash>, Error> {
    let Some(input) = tx.input.first() else {
        return Ok(None);
    };
    let Ok(spend) = MultisigSpend::decode(input) else {
        return Ok(None);
    };
    let sighash = SighashCache::new(tx).legacy_signature_hash(
        0,
        spend.redeem_script(),
        EcdsaSighashType::All.to_u32(),
    )?;
    Ok(Some(sighash))
}

pub fn classify<P: UtxoProvider>(
    activations: &ForBlock,
    index: &PegoutSigHashIndex,
    wallet: &FederationWallet<'_, P>,
    tx: &Transaction,
) -> Result<PegTxType, Error> {
    if !activations.is_active(ConsensusRule::PegoutSigHashIndex) {
        return Err(Error::RuleNotActive(ConsensusRule::PegoutSigHashIndex));
    }

    let txid = tx.txid();
    let peg_type = match pegout_sighash(tx)? {
        Some(sighash) if index.contains(&sighash) => PegTxType::PegoutOrMigration,
        _ if tx
            .output
            .iter()
            .any(|output| output.value > 0 && wallet.is_watched(&output.script_pubkey)) =>
        {
            PegTxType::Pegin
        }
        _ => PegTxType::Unknown,
    };

    CLASSIFIED_TRANSACTIONS
        .with_label_values(&[peg_type.as_str()])
        .inc();
    match peg_type {
        PegTxType::Unknown => debug!("Transaction {txid} is not a peg transaction"),
        _ => info!("Transaction {txid} classified as {}", peg_type.as_str()),
    }
    Ok(peg_type)
}
