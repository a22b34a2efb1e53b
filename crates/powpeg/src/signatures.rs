//! Collection of federator signatures over pending release transactions.

use crate::activations::{ConsensusRule, ForBlock};
use crate::federation::Federation;
use crate::metrics::SIGNATURE_SUBMISSIONS;
use crate::spending::MultisigSpend;
use crate::Error;
use bitcoin::consensus::encode::serialize;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, Secp256k1, VerifyOnly};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{PublicKey, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;
use tracing::{debug, info, warn};

/// Hash of the pegged chain transaction that created a release.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PegoutId(pub [u8; 32]);

impl fmt::Display for PegoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PegoutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PegoutId({self})")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSignatureTx {
    pub transaction: Transaction,
    /// Values of the spent outputs, in input order.
    pub prevout_values: Vec<u64>,
}

impl PendingSignatureTx {
    pub fn new(transaction: Transaction, prevout_values: Vec<u64>) -> Self {
        Self {
            transaction,
            prevout_values,
        }
    }
}

/// Releases built but not fully signed yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PegoutsWaitingForSignatures {
    entries: BTreeMap<PegoutId, PendingSignatureTx>,
}

impl PegoutsWaitingForSignatures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        id: PegoutId,
        pending: PendingSignatureTx,
    ) -> Option<PendingSignatureTx> {
        self.entries.insert(id, pending)
    }

    pub fn get(&self, id: &PegoutId) -> Option<&PendingSignatureTx> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &PegoutId) -> Option<&mut PendingSignatureTx> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &PegoutId) -> Option<PendingSignatureTx> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &PegoutId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, PegoutId, PendingSignatureTx> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidSignatureReason {
    CountMismatch { expected: usize, found: usize },
    MalformedDer { input: usize },
    HighS { input: usize },
    VerificationFailed { input: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    NotAFederator,
    UnknownTransaction,
    InvalidParameters(InvalidSignatureReason),
    /// The federator already signed every input. Nothing changed.
    AlreadySigned,
    /// The federator is not a signer of the federation spending the inputs.
    NotInSpendingFederation,
    PartiallySigned,
    FullySigned { transaction: Transaction },
}

impl SigningOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningOutcome::NotAFederator => "not_a_federator",
            SigningOutcome::UnknownTransaction => "unknown_transaction",
            SigningOutcome::InvalidParameters(_) => "invalid_parameters",
            SigningOutcome::AlreadySigned => "already_signed",
            SigningOutcome::NotInSpendingFederation => "not_in_spending_federation",
            SigningOutcome::PartiallySigned => "partially_signed",
            SigningOutcome::FullySigned { .. } => "fully_signed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    AddSignature {
        pegout_id: PegoutId,
        federator_key: PublicKey,
        raw_tx: Vec<u8>,
    },
    ReleaseBtc {
        pegout_id: PegoutId,
        raw_tx: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningReport {
    pub outcome: SigningOutcome,
    pub events: Vec<BridgeEvent>,
}

impl SigningReport {
    fn new(outcome: SigningOutcome, events: Vec<BridgeEvent>) -> Self {
        SIGNATURE_SUBMISSIONS
            .with_label_values(&[outcome.as_str()])
            .inc();
        Self { outcome, events }
    }
}

/// Signing state of one input for the submitting federator.
struct InputSigning {
    spend: MultisigSpend,
    signature: Vec<u8>,
    position: Option<usize>,
}

pub struct SignatureCollector<'a> {
    active: &'a Federation,
    retiring: Option<&'a Federation>,
    activations: ForBlock,
    secp: Secp256k1<VerifyOnly>,
}

impl<'a> SignatureCollector<'a> {
    pub fn new(
        active: &'a Federation,
        retiring: Option<&'a Federation>,
        activations: ForBlock,
    ) -> Self {
        Self {
            active,
            retiring,
            activations,
            secp: Secp256k1::verification_only(),
        }
    }

    fn is_federator(&self, key: &PublicKey) -> bool {
        self.active.has_btc_public_key(key)
            || self
                .retiring
                .map_or(false, |federation| federation.has_btc_public_key(key))
    }

    /// Adds the signatures of `federator` to the pending release `pegout_id`, one DER
    /// signature per input. Either every input is updated or none is.
    pub fn add_signature(
        &self,
        pending: &mut PegoutsWaitingForSignatures,
        federator: &PublicKey,
        signatures: &[Vec<u8>],
        pegout_id: &PegoutId,
    ) -> Result<SigningReport, Error> {
        if !self.is_federator(federator) {
            warn!("Signature for {pegout_id} from {federator}, which is not a federator");
            return Ok(SigningReport::new(SigningOutcome::NotAFederator, vec![]));
        }

        let Some(entry) = pending.get(pegout_id) else {
            warn!("No release {pegout_id} is waiting for signatures");
            return Ok(SigningReport::new(SigningOutcome::UnknownTransaction, vec![]));
        };
        let tx = &entry.transaction;
        if entry.prevout_values.len() != tx.input.len() {
            return Err(Error::IllegalState(format!(
                "Release {pegout_id} has {} inputs but {} prevout values",
                tx.input.len(),
                entry.prevout_values.len()
            )));
        }

        if signatures.len() != tx.input.len() {
            warn!(
                "Expected {} signatures for {pegout_id}, got {}",
                tx.input.len(),
                signatures.len()
            );
            let reason = InvalidSignatureReason::CountMismatch {
                expected: tx.input.len(),
                found: signatures.len(),
            };
            return Ok(SigningReport::new(
                SigningOutcome::InvalidParameters(reason),
                vec![],
            ));
        }

        let idempotent = self
            .activations
            .is_active(ConsensusRule::AddSignatureIdempotence);
        let mut events = vec![];
        if !idempotent {
            events.push(BridgeEvent::AddSignature {
                pegout_id: *pegout_id,
                federator_key: *federator,
                raw_tx: serialize(tx),
            });
        }

        let mut inputs = Vec::with_capacity(tx.input.len());
        for (index, der) in signatures.iter().enumerate() {
            let signature = match Signature::from_der(der) {
                Ok(signature) => signature,
                Err(e) => {
                    warn!("Malformed signature for input {index} of {pegout_id}: {e}");
                    let reason = InvalidSignatureReason::MalformedDer { input: index };
                    return Ok(SigningReport::new(
                        SigningOutcome::InvalidParameters(reason),
                        events,
                    ));
                }
            };

            let mut normalized = signature;
            normalized.normalize_s();
            if normalized != signature {
                warn!("Signature for input {index} of {pegout_id} has a high S value");
                let reason = InvalidSignatureReason::HighS { input: index };
                return Ok(SigningReport::new(
                    SigningOutcome::InvalidParameters(reason),
                    events,
                ));
            }

            let spend = MultisigSpend::decode(&tx.input[index])?;
            let Some(key_index) = spend.info().key_index(federator) else {
                warn!("Federator {federator} does not sign input {index} of {pegout_id}");
                return Ok(SigningReport::new(
                    SigningOutcome::NotInSpendingFederation,
                    events,
                ));
            };

            let message = spend.signature_hash(tx, index, entry.prevout_values[index])?;
            if self
                .secp
                .verify_ecdsa(&message, &signature, &federator.inner)
                .is_err()
            {
                warn!("Signature for input {index} of {pegout_id} does not verify");
                let reason = InvalidSignatureReason::VerificationFailed { input: index };
                return Ok(SigningReport::new(
                    SigningOutcome::InvalidParameters(reason),
                    events,
                ));
            }

            let signer_indexes = self.signer_indexes(&spend, &message);
            let position = (!signer_indexes.contains(&key_index)).then(|| {
                signer_indexes
                    .iter()
                    .filter(|signer| **signer < key_index)
                    .count()
            });

            let mut signature = signature.serialize_der().to_vec();
            signature.push(EcdsaSighashType::All.to_u32() as u8);
            inputs.push(InputSigning {
                spend,
                signature,
                position,
            });
        }

        if inputs.iter().all(|input| input.position.is_none()) {
            debug!("Federator {federator} already signed {pegout_id}");
            let outcome = SigningOutcome::AlreadySigned;
            return Ok(SigningReport::new(outcome, events));
        }

        let mut signed = tx.clone();
        for (index, input) in inputs.into_iter().enumerate() {
            let Some(position) = input.position else {
                continue;
            };
            if input.spend.is_fully_signed() {
                continue;
            }
            let mut spend = input.spend;
            spend.insert_signature(position, input.signature)?;
            spend.apply(&mut signed.input[index])?;
        }

        if idempotent {
            events.push(BridgeEvent::AddSignature {
                pegout_id: *pegout_id,
                federator_key: *federator,
                raw_tx: serialize(&signed),
            });
        }

        let fully_signed = signed
            .input
            .iter()
            .map(MultisigSpend::decode)
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .all(MultisigSpend::is_fully_signed);

        if fully_signed {
            pending.remove(pegout_id);
            info!("Release {pegout_id} is fully signed, txid {}", signed.txid());
            events.push(BridgeEvent::ReleaseBtc {
                pegout_id: *pegout_id,
                raw_tx: serialize(&signed),
            });
            let outcome = SigningOutcome::FullySigned {
                transaction: signed,
            };
            return Ok(SigningReport::new(outcome, events));
        }

        if let Some(entry) = pending.get_mut(pegout_id) {
            entry.transaction = signed;
        }
        debug!("Added signature of {federator} to {pegout_id}");
        Ok(SigningReport::new(SigningOutcome::PartiallySigned, events))
    }

    /// Script positions of the keys behind the signatures already present.
    fn signer_indexes(&self, spend: &MultisigSpend, message: &Message) -> Vec<usize> {
        spend
            .signatures()
            .iter()
            .filter_map(|signature| {
                let (_, der) = signature.split_last()?;
                let signature = Signature::from_der(der).ok()?;
                spend.info().keys.iter().position(|key| {
                    self.secp
                        .verify_ecdsa(message, &signature, &key.inner)
                        .is_ok()
                })
            })
            .collect()
    }
}
