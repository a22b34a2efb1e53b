//! Spending data of federation inputs: where the signatures and the redeem script live and how
//! partially signed inputs are laid out.
//!
//! A P2SH input carries `OP_0 <sig or OP_0> x M [OP_0] <redeem script>` in its scriptSig, the
//! extra `OP_0` selecting the default branch of ERP scripts. A P2SH-P2WSH input carries the
//! same items in its witness, and pushes the witness program in its scriptSig.

use crate::activations::ForBlock;
use crate::federation::{Federation, FederationError};
use bitcoin::blockdata::script::Instruction;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::{all, All as Opcode};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{self, Message};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, Script, ScriptBuf, Transaction, TxIn, Witness};
use thiserror::Error;

/// Size given to placeholder signatures when estimating signed transaction sizes.
pub const PLACEHOLDER_SIGNATURE_SIZE: usize = 72;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpendingError {
    #[error("Script is not a federation redeem script: {0}")]
    UnsupportedRedeemScript(String),
    #[error("Malformed spending data: {0}")]
    MalformedSpendingData(String),
    #[error("Cannot place signature at position {position}, {signed} of {required} present")]
    InvalidSignaturePosition {
        position: usize,
        signed: usize,
        required: usize,
    },
    #[error("Sighash computation failed: {0}")]
    Sighash(String),
}

impl From<bitcoin::sighash::Error> for SpendingError {
    fn from(e: bitcoin::sighash::Error) -> Self {
        SpendingError::Sighash(e.to_string())
    }
}

impl From<secp256k1::Error> for SpendingError {
    fn from(e: secp256k1::Error) -> Self {
        SpendingError::Sighash(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptShape {
    Standard,
    /// Single `OP_CHECKMULTISIG` after `OP_ENDIF`.
    NonStandardErp,
    /// One `OP_CHECKMULTISIG` inside each branch.
    P2shErp,
}

impl ScriptShape {
    pub fn is_erp(&self) -> bool {
        !matches!(self, ScriptShape::Standard)
    }
}

/// What a federation redeem script commits to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemScriptInfo {
    pub shape: ScriptShape,
    pub threshold: usize,
    /// Default branch keys in script order.
    pub keys: Vec<PublicKey>,
    pub emergency_threshold: Option<usize>,
    pub emergency_keys: Vec<PublicKey>,
}

impl RedeemScriptInfo {
    pub fn parse(script: &Script) -> Result<Self, SpendingError> {
        let items = script
            .instructions()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SpendingError::UnsupportedRedeemScript(e.to_string()))?;

        match items.split_first() {
            Some((Instruction::Op(op), rest)) if *op == all::OP_NOTIF => Self::parse_erp(rest),
            _ => {
                let (threshold, keys, rest) = parse_multisig(&items)?;
                expect_ops(rest, &[all::OP_CHECKMULTISIG])?;
                Ok(Self {
                    shape: ScriptShape::Standard,
                    threshold,
                    keys,
                    emergency_threshold: None,
                    emergency_keys: vec![],
                })
            }
        }
    }

    fn parse_erp(items: &[Instruction<'_>]) -> Result<Self, SpendingError> {
        let (threshold, keys, rest) = parse_multisig(items)?;
        let (shape, rest) = match rest.split_first() {
            Some((Instruction::Op(op), rest)) if *op == all::OP_CHECKMULTISIG => {
                (ScriptShape::P2shErp, rest)
            }
            _ => (ScriptShape::NonStandardErp, rest),
        };

        let rest = expect_ops_prefix(rest, &[all::OP_ELSE])?;
        // the CSV value is either a data push or a small integer opcode
        let rest = match rest.split_first() {
            Some((Instruction::PushBytes(_), rest)) => rest,
            Some((Instruction::Op(op), rest)) if small_int(*op).is_some() => rest,
            _ => return Err(unsupported("missing CSV value")),
        };
        let rest = expect_ops_prefix(rest, &[all::OP_CSV, all::OP_DROP])?;

        let (emergency_threshold, emergency_keys, rest) = parse_multisig(rest)?;
        match shape {
            ScriptShape::P2shErp => {
                expect_ops(rest, &[all::OP_CHECKMULTISIG, all::OP_ENDIF])?
            }
            _ => expect_ops(rest, &[all::OP_ENDIF, all::OP_CHECKMULTISIG])?,
        }

        Ok(Self {
            shape,
            threshold,
            keys,
            emergency_threshold: Some(emergency_threshold),
            emergency_keys,
        })
    }

    /// Position of `key` among the default branch keys.
    pub fn key_index(&self, key: &PublicKey) -> Option<usize> {
        self.keys.iter().position(|candidate| candidate == key)
    }
}

fn unsupported(reason: &str) -> SpendingError {
    SpendingError::UnsupportedRedeemScript(reason.to_string())
}

fn small_int(op: Opcode) -> Option<usize> {
    let value = op.to_u8();
    let first = all::OP_PUSHNUM_1.to_u8();
    let last = all::OP_PUSHNUM_16.to_u8();
    (first..=last)
        .contains(&value)
        .then(|| (value - first + 1) as usize)
}

// Counts above 16 are pushed as little endian script numbers.
fn script_int(instruction: Option<&Instruction<'_>>) -> Option<usize> {
    match instruction? {
        Instruction::Op(op) => small_int(*op),
        Instruction::PushBytes(bytes) if (1..=2).contains(&bytes.len()) => {
            let bytes = bytes.as_bytes();
            if bytes[bytes.len() - 1] & 0x80 != 0 {
                return None;
            }
            Some(
                bytes
                    .iter()
                    .rev()
                    .fold(0usize, |value, byte| (value << 8) | *byte as usize),
            )
        }
        _ => None,
    }
}

fn is_key_push(instruction: &Instruction<'_>) -> bool {
    matches!(instruction, Instruction::PushBytes(bytes) if bytes.len() == 33 || bytes.len() == 65)
}

type Multisig<'a, 'b> = (usize, Vec<PublicKey>, &'b [Instruction<'a>]);

fn parse_multisig<'a, 'b>(items: &'b [Instruction<'a>]) -> Result<Multisig<'a, 'b>, SpendingError> {
    let threshold = script_int(items.first()).ok_or_else(|| unsupported("missing threshold"))?;
    let mut rest = &items[1..];

    let mut keys = vec![];
    while let Some((Instruction::PushBytes(bytes), next)) =
        rest.split_first().filter(|(item, _)| is_key_push(item))
    {
        let key = PublicKey::from_slice(bytes.as_bytes())
            .map_err(|e| SpendingError::UnsupportedRedeemScript(e.to_string()))?;
        keys.push(key);
        rest = next;
    }

    let count = script_int(rest.first()).ok_or_else(|| unsupported("missing key count"))?;
    if count != keys.len() || threshold == 0 || threshold > count {
        return Err(unsupported("inconsistent multisig threshold"));
    }

    Ok((threshold, keys, &rest[1..]))
}

fn expect_ops_prefix<'a, 'b>(
    items: &'b [Instruction<'a>],
    ops: &[Opcode],
) -> Result<&'b [Instruction<'a>], SpendingError> {
    if items.len() < ops.len() {
        return Err(unsupported("script ends early"));
    }
    let (head, rest) = items.split_at(ops.len());
    let matches = head
        .iter()
        .zip(ops)
        .all(|(item, op)| matches!(item, Instruction::Op(found) if found == op));
    if !matches {
        return Err(unsupported("unexpected opcode"));
    }
    Ok(rest)
}

fn expect_ops(items: &[Instruction<'_>], ops: &[Opcode]) -> Result<(), SpendingError> {
    let rest = expect_ops_prefix(items, ops)?;
    if !rest.is_empty() {
        return Err(unsupported("trailing data after script"));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpendLayout {
    P2sh,
    P2shP2wsh,
}

/// Spending data of one federation input.
///
/// Signatures are kept in the order of their signers' keys in the redeem script, which is the
/// order `OP_CHECKMULTISIG` consumes them in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigSpend {
    layout: SpendLayout,
    info: RedeemScriptInfo,
    redeem_script: ScriptBuf,
    signatures: Vec<Vec<u8>>,
}

impl MultisigSpend {
    pub fn new(redeem_script: ScriptBuf, layout: SpendLayout) -> Result<Self, SpendingError> {
        let info = RedeemScriptInfo::parse(&redeem_script)?;
        Ok(Self {
            layout,
            info,
            redeem_script,
            signatures: vec![],
        })
    }

    /// Unsigned spending data for an output of `federation`.
    pub fn unsigned(federation: &Federation, activations: &ForBlock) -> Result<Self, crate::Error> {
        let redeem_script = federation
            .redeem_script(activations)
            .map_err(FederationError::from)?;
        let layout = if federation.is_segwit() {
            SpendLayout::P2shP2wsh
        } else {
            SpendLayout::P2sh
        };
        Ok(Self::new(redeem_script, layout)?)
    }

    /// Reads the spending data back from an input built by [`MultisigSpend::apply`].
    pub fn decode(input: &TxIn) -> Result<Self, SpendingError> {
        let (layout, items) = if input.witness.is_empty() {
            let items = input
                .script_sig
                .instructions()
                .map(|instruction| match instruction {
                    Ok(Instruction::PushBytes(bytes)) => Ok(bytes.as_bytes().to_vec()),
                    Ok(Instruction::Op(op)) => Err(SpendingError::MalformedSpendingData(format!(
                        "unexpected opcode {op:?} in scriptSig"
                    ))),
                    Err(e) => Err(SpendingError::MalformedSpendingData(e.to_string())),
                })
                .collect::<Result<Vec<_>, _>>()?;
            (SpendLayout::P2sh, items)
        } else {
            (SpendLayout::P2shP2wsh, input.witness.to_vec())
        };

        let (redeem_script, items) = items
            .split_last()
            .ok_or_else(|| SpendingError::MalformedSpendingData("no redeem script".to_string()))?;
        let mut spend = Self::new(ScriptBuf::from(redeem_script.clone()), layout)?;

        let expected = 1 + spend.info.threshold + spend.info.shape.is_erp() as usize;
        if items.len() != expected || !items[0].is_empty() {
            return Err(SpendingError::MalformedSpendingData(format!(
                "expected {expected} items before the redeem script, found {}",
                items.len()
            )));
        }
        if spend.info.shape.is_erp() && !items[expected - 1].is_empty() {
            return Err(SpendingError::MalformedSpendingData(
                "default branch flag is not OP_0".to_string(),
            ));
        }

        let slots = &items[1..1 + spend.info.threshold];
        let signed = slots.iter().take_while(|slot| !slot.is_empty()).count();
        if slots[signed..].iter().any(|slot| !slot.is_empty()) {
            return Err(SpendingError::MalformedSpendingData(
                "signature after an empty slot".to_string(),
            ));
        }
        spend.signatures = slots[..signed].to_vec();
        Ok(spend)
    }

    pub fn layout(&self) -> SpendLayout {
        self.layout
    }

    pub fn info(&self) -> &RedeemScriptInfo {
        &self.info
    }

    pub fn redeem_script(&self) -> &Script {
        &self.redeem_script
    }

    /// Signatures present, each with its sighash type byte.
    pub fn signatures(&self) -> &[Vec<u8>] {
        &self.signatures
    }

    pub fn required_signatures(&self) -> usize {
        self.info.threshold
    }

    pub fn missing_signatures(&self) -> usize {
        self.info.threshold.saturating_sub(self.signatures.len())
    }

    pub fn is_fully_signed(&self) -> bool {
        self.missing_signatures() == 0
    }

    /// Inserts `signature` before the signature currently at `position`.
    pub fn insert_signature(
        &mut self,
        position: usize,
        signature: Vec<u8>,
    ) -> Result<(), SpendingError> {
        if position > self.signatures.len() || self.is_fully_signed() || signature.is_empty() {
            return Err(SpendingError::InvalidSignaturePosition {
                position,
                signed: self.signatures.len(),
                required: self.info.threshold,
            });
        }
        self.signatures.insert(position, signature);
        Ok(())
    }

    /// Same spending data with every missing signature filled by a placeholder of the size of
    /// a real one.
    pub fn with_placeholder_signatures(&self) -> Self {
        let mut spend = self.clone();
        spend
            .signatures
            .resize(self.info.threshold, vec![0u8; PLACEHOLDER_SIGNATURE_SIZE]);
        spend
    }

    fn items(&self) -> Vec<Vec<u8>> {
        let mut items = Vec::with_capacity(self.info.threshold + 3);
        items.push(vec![]);
        items.extend(self.signatures.iter().cloned());
        items.resize(1 + self.info.threshold, vec![]);
        if self.info.shape.is_erp() {
            items.push(vec![]);
        }
        items.push(self.redeem_script.to_bytes());
        items
    }

    pub fn script_sig(&self) -> Result<ScriptBuf, SpendingError> {
        match self.layout {
            SpendLayout::P2sh => self
                .items()
                .into_iter()
                .try_fold(Builder::new(), push_item)
                .map(Builder::into_script),
            SpendLayout::P2shP2wsh => {
                let program = ScriptBuf::new_v0_p2wsh(&self.redeem_script.wscript_hash());
                push_item(Builder::new(), program.into_bytes()).map(Builder::into_script)
            }
        }
    }

    pub fn witness(&self) -> Witness {
        match self.layout {
            SpendLayout::P2sh => Witness::default(),
            SpendLayout::P2shP2wsh => Witness::from_slice(&self.items()),
        }
    }

    pub fn apply(&self, input: &mut TxIn) -> Result<(), SpendingError> {
        input.script_sig = self.script_sig()?;
        input.witness = self.witness();
        Ok(())
    }

    /// Message federators sign for input `index` of `tx`. `value` is the amount of the spent
    /// output, only committed to by segwit inputs.
    pub fn signature_hash(
        &self,
        tx: &Transaction,
        index: usize,
        value: u64,
    ) -> Result<Message, SpendingError> {
        let mut cache = SighashCache::new(tx);
        let message = match self.layout {
            SpendLayout::P2sh => {
                let hash = cache.legacy_signature_hash(
                    index,
                    &self.redeem_script,
                    EcdsaSighashType::All.to_u32(),
                )?;
                Message::from_slice(&hash.as_byte_array()[..])?
            }
            SpendLayout::P2shP2wsh => {
                let hash = cache.segwit_signature_hash(
                    index,
                    &self.redeem_script,
                    value,
                    EcdsaSighashType::All,
                )?;
                Message::from_slice(&hash.as_byte_array()[..])?
            }
        };
        Ok(message)
    }
}

fn push_item(builder: Builder, item: Vec<u8>) -> Result<Builder, SpendingError> {
    if item.is_empty() {
        return Ok(builder.push_opcode(all::OP_PUSHBYTES_0));
    }
    let push = PushBytesBuf::try_from(item)
        .map_err(|e| SpendingError::MalformedSpendingData(e.to_string()))?;
    Ok(builder.push_slice(push))
}
