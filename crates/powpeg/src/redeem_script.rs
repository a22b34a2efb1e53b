//! Redeem script strategies for federation multisigs.
//!
//! Every builder is a pure function of its keys, thresholds and CSV value. Nodes must derive
//! byte-identical scripts from the same arguments, including the historical encodings kept
//! for federations created before the corresponding rules activated.

use crate::activations::{ConsensusRule, ForBlock};
use crate::{MAX_CSV_VALUE, MAX_SCRIPT_ELEMENT_SIZE, MAX_STANDARD_P2WSH_SCRIPT_SIZE};
use bitcoin::opcodes::all;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{PublicKey, ScriptBuf};
use thiserror::Error;
use tracing::debug;

/// Script deployed for the testnet ERP federation before `ErpTestnetScriptFix`. Its CSV push
/// (`0300cd50`) is the historical encoding and has to be reproduced as is.
const HARDCODED_TESTNET_ERP_SCRIPT: &str = "6453210208f40073a9e43b3e9103acec79767a6de9b0409749884e989960fee578012fce210225e892391625854128c5c4ea4340de0c2a70570f33db53426fc9c746597a03f42102afc230c2d355b1a577682b07bc2646041b5d0177af0f98395a46018da699b6da210344a3c38cd59afcba3edcebe143e025574594b001700dec41e59409bdbd0f2a0921039a060badbeb24bee49eb2063f616c0f0f0765d4ca646b20a88ce828f259fcdb955670300cd50b27552210216c23b2ea8e4f11c3f9e22711addb1d16a93964796913830856b568cc3ea21d3210275562901dd8faae20de0a4166362a4f82188db77dbed4ca887422ea1ec185f1421034db69f2112f4fb1bb6141bf6e2bd6631f0484d0bd95b16767902c9fe219d4a6f5368ae";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptCreationError {
    #[error("Invalid threshold {threshold} for {keys} keys")]
    InvalidThreshold { threshold: usize, keys: usize },
    #[error("Emergency keys are missing")]
    NullOrEmptyEmergencyKeys,
    #[error("Invalid CSV value {0}, it must be between 1 and {MAX_CSV_VALUE}")]
    InvalidCsvValue(u64),
    #[error("Redeem script of {size} bytes is above the maximum of {max} bytes")]
    AboveMaxScriptElementSize { size: usize, max: usize },
    #[error("Redeem script creation failed: {0}")]
    RedeemScriptCreationFailed(String),
}

/// Byte encoding of the CSV value pushed in the emergency branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CsvEncoding {
    /// Unsigned big endian padded to two bytes, used before `ErpCsvLittleEndian`.
    BigEndianFixed,
    /// Minimal signed little endian script number.
    SignedLittleEndian,
}

impl CsvEncoding {
    pub fn for_activations(activations: &ForBlock) -> Self {
        if activations.is_active(ConsensusRule::ErpCsvLittleEndian) {
            CsvEncoding::SignedLittleEndian
        } else {
            CsvEncoding::BigEndianFixed
        }
    }

    pub fn encode(&self, value: u64) -> Result<Vec<u8>, ScriptCreationError> {
        if value == 0 || value > MAX_CSV_VALUE {
            return Err(ScriptCreationError::InvalidCsvValue(value));
        }

        match self {
            CsvEncoding::BigEndianFixed => Ok((value as u16).to_be_bytes().to_vec()),
            CsvEncoding::SignedLittleEndian => {
                let mut bytes = value.to_le_bytes().to_vec();
                while bytes.last() == Some(&0) {
                    bytes.pop();
                }
                // the top bit is the sign bit of a script number
                if bytes.last().map_or(false, |byte| byte & 0x80 != 0) {
                    bytes.push(0);
                }
                Ok(bytes)
            }
        }
    }
}

/// Emergency branch of an ERP redeem script.
#[derive(Debug, Clone, Copy)]
pub struct EmergencyBranch<'a> {
    pub keys: &'a [PublicKey],
    pub threshold: usize,
    pub csv_value: u64,
}

/// Layout of a federation redeem script. A federation picks one per derivation, based on its
/// variant, its network and the rules active at that block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RedeemScriptBuilder {
    /// `OP_M <keys> OP_N OP_CHECKMULTISIG`
    Standard,
    /// `OP_NOTIF <M keys N> OP_ELSE <csv> OP_CSV OP_DROP <M keys N> OP_ENDIF OP_CHECKMULTISIG`,
    /// shared by legacy and non standard ERP federations.
    NonStandardErp(CsvEncoding),
    /// Fixed script of the testnet ERP federation before `ErpTestnetScriptFix`.
    HardcodedTestnetErp,
    /// ERP script with an `OP_CHECKMULTISIG` closing each branch.
    P2shErp,
    /// Same layout as `P2shErp`, used as a witness script.
    P2shP2wshErp,
}

impl RedeemScriptBuilder {
    pub fn max_script_size(&self) -> usize {
        match self {
            RedeemScriptBuilder::P2shP2wshErp => MAX_STANDARD_P2WSH_SCRIPT_SIZE,
            _ => MAX_SCRIPT_ELEMENT_SIZE,
        }
    }

    pub fn is_erp(&self) -> bool {
        !matches!(self, RedeemScriptBuilder::Standard)
    }

    pub fn build(
        &self,
        default_keys: &[PublicKey],
        default_threshold: usize,
        emergency: Option<&EmergencyBranch<'_>>,
    ) -> Result<ScriptBuf, ScriptCreationError> {
        let script = match self {
            RedeemScriptBuilder::Standard => {
                let keys = sorted_keys(default_keys);
                validate_threshold(default_threshold, keys.len())?;
                push_multisig(Builder::new(), &keys, default_threshold)
                    .push_opcode(all::OP_CHECKMULTISIG)
                    .into_script()
            }
            RedeemScriptBuilder::HardcodedTestnetErp => {
                let bytes = hex::decode(HARDCODED_TESTNET_ERP_SCRIPT).map_err(|e| {
                    ScriptCreationError::RedeemScriptCreationFailed(e.to_string())
                })?;
                ScriptBuf::from(bytes)
            }
            RedeemScriptBuilder::NonStandardErp(encoding) => {
                let erp = ErpScriptParts::new(default_keys, default_threshold, emergency, *encoding)?;
                let builder = push_multisig(
                    Builder::new().push_opcode(all::OP_NOTIF),
                    &erp.default_keys,
                    default_threshold,
                )
                .push_opcode(all::OP_ELSE);
                let builder = push_csv(builder, &erp.csv)?
                    .push_opcode(all::OP_CSV)
                    .push_opcode(all::OP_DROP);
                push_multisig(builder, &erp.emergency_keys, erp.emergency_threshold)
                    .push_opcode(all::OP_ENDIF)
                    .push_opcode(all::OP_CHECKMULTISIG)
                    .into_script()
            }
            RedeemScriptBuilder::P2shErp | RedeemScriptBuilder::P2shP2wshErp => {
                let erp = ErpScriptParts::new(
                    default_keys,
                    default_threshold,
                    emergency,
                    CsvEncoding::SignedLittleEndian,
                )?;
                let builder = push_multisig(
                    Builder::new().push_opcode(all::OP_NOTIF),
                    &erp.default_keys,
                    default_threshold,
                )
                .push_opcode(all::OP_CHECKMULTISIG)
                .push_opcode(all::OP_ELSE);
                let builder = push_csv(builder, &erp.csv)?
                    .push_opcode(all::OP_CSV)
                    .push_opcode(all::OP_DROP);
                push_multisig(builder, &erp.emergency_keys, erp.emergency_threshold)
                    .push_opcode(all::OP_CHECKMULTISIG)
                    .push_opcode(all::OP_ENDIF)
                    .into_script()
            }
        };

        let max = self.max_script_size();
        if script.len() > max {
            return Err(ScriptCreationError::AboveMaxScriptElementSize {
                size: script.len(),
                max,
            });
        }

        debug!("Built {self:?} redeem script of {} bytes", script.len());
        Ok(script)
    }
}

struct ErpScriptParts {
    default_keys: Vec<PublicKey>,
    emergency_keys: Vec<PublicKey>,
    emergency_threshold: usize,
    csv: Vec<u8>,
}

impl ErpScriptParts {
    fn new(
        default_keys: &[PublicKey],
        default_threshold: usize,
        emergency: Option<&EmergencyBranch<'_>>,
        encoding: CsvEncoding,
    ) -> Result<Self, ScriptCreationError> {
        let emergency = match emergency {
            Some(branch) if !branch.keys.is_empty() => branch,
            _ => return Err(ScriptCreationError::NullOrEmptyEmergencyKeys),
        };

        let default_keys = sorted_keys(default_keys);
        validate_threshold(default_threshold, default_keys.len())?;
        let emergency_keys = sorted_keys(emergency.keys);
        validate_threshold(emergency.threshold, emergency_keys.len())?;

        Ok(Self {
            default_keys,
            emergency_keys,
            emergency_threshold: emergency.threshold,
            csv: encoding.encode(emergency.csv_value)?,
        })
    }
}

/// Keys in script order: unsigned lexicographic order of their serialization, without repeats.
pub fn sorted_keys(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut keys = keys.to_vec();
    keys.sort_by_key(|key| key.to_bytes());
    keys.dedup_by_key(|key| key.to_bytes());
    keys
}

/// Signatures needed out of `keys`: a strict majority.
pub fn majority_threshold(keys: usize) -> usize {
    keys / 2 + 1
}

fn validate_threshold(threshold: usize, keys: usize) -> Result<(), ScriptCreationError> {
    if threshold == 0 || threshold > keys {
        return Err(ScriptCreationError::InvalidThreshold { threshold, keys });
    }
    Ok(())
}

fn push_multisig(builder: Builder, keys: &[PublicKey], threshold: usize) -> Builder {
    keys.iter()
        .fold(builder.push_int(threshold as i64), |builder, key| {
            builder.push_key(key)
        })
        .push_int(keys.len() as i64)
}

// Single byte values 1 to 16 go out as OP_1..OP_16, like any minimal push.
fn push_csv(builder: Builder, csv: &[u8]) -> Result<Builder, ScriptCreationError> {
    if let [value @ 1..=16] = csv {
        return Ok(builder.push_int(*value as i64));
    }
    let push = PushBytesBuf::try_from(csv.to_vec())
        .map_err(|e| ScriptCreationError::RedeemScriptCreationFailed(e.to_string()))?;
    Ok(builder.push_slice(push))
}
