//! Signed size predictions for transactions spending federation outputs.
//!
//! Estimates serialize a placeholder transaction whose inputs carry the federation's real
//! redeem script and signature slots filled with signature sized placeholders, so every
//! script shape (standard, ERP, segwit) is measured rather than approximated.

use crate::activations::ForBlock;
use crate::federation::Federation;
use crate::spending::{MultisigSpend, SpendingError};
use bitcoin::absolute::LockTime;
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use thiserror::Error;

/// Size of a P2PKH output script, used for estimated outputs.
const ESTIMATED_OUTPUT_SCRIPT_SIZE: usize = 25;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SizeEstimationError {
    #[error("Invalid pegout size arguments: {inputs} inputs, {outputs} outputs")]
    InvalidArguments { inputs: usize, outputs: usize },
}

pub fn estimate_pegout_size(
    activations: &ForBlock,
    federation: &Federation,
    inputs: usize,
    outputs: usize,
) -> Result<usize, crate::Error> {
    if inputs == 0 || outputs == 0 {
        return Err(SizeEstimationError::InvalidArguments { inputs, outputs }.into());
    }

    let spend = MultisigSpend::unsigned(federation, activations)?;
    let tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: (0..inputs)
            .map(|vout| TxIn {
                previous_output: OutPoint {
                    vout: vout as u32,
                    ..Default::default()
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect(),
        output: (0..outputs)
            .map(|_| TxOut {
                value: 0,
                script_pubkey: ScriptBuf::from(vec![0u8; ESTIMATED_OUTPUT_SCRIPT_SIZE]),
            })
            .collect(),
    };
    let spends = vec![spend; inputs];

    Ok(signed_size(&tx, &spends)?)
}

/// Size of the usual release: two federation inputs paying a user and the change.
pub fn regular_pegout_size(
    activations: &ForBlock,
    federation: &Federation,
) -> Result<usize, crate::Error> {
    estimate_pegout_size(activations, federation, 2, 2)
}

/// Fee for `size` bytes at `fee_per_kb`, rounded up to the next satoshi. `None` when the
/// fee does not fit in a `u64`.
pub fn estimate_pegout_fee(fee_per_kb: u64, size: usize) -> Option<u64> {
    let millis = fee_per_kb.checked_mul(u64::try_from(size).ok()?)?;
    Some(millis / 1000 + u64::from(millis % 1000 != 0))
}

/// Virtual size `tx` will have once each input carries all the signatures of its spend.
pub(crate) fn signed_size(
    tx: &Transaction,
    spends: &[MultisigSpend],
) -> Result<usize, SpendingError> {
    let mut signed = tx.clone();
    for (input, spend) in signed.input.iter_mut().zip(spends) {
        spend.with_placeholder_signatures().apply(input)?;
    }
    Ok(signed.vsize())
}
