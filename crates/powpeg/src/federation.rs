use crate::activations::{ConsensusRule, ForBlock};
use crate::redeem_script::{
    majority_threshold, sorted_keys, CsvEncoding, EmergencyBranch, RedeemScriptBuilder,
    ScriptCreationError,
};
use crate::MAX_CSV_VALUE;
use bitcoin::secp256k1;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Federation creation failed: {0}")]
    Creation(#[from] ScriptCreationError),
    #[error("Unable to derive the federation address: {0}")]
    Address(#[from] bitcoin::address::Error),
}

/// Identity of a federator on both sides of the peg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FederationMember {
    btc_public_key: PublicKey,
    rsk_public_key: secp256k1::PublicKey,
    mst_public_key: secp256k1::PublicKey,
}

impl FederationMember {
    pub fn new(
        btc_public_key: PublicKey,
        rsk_public_key: secp256k1::PublicKey,
        mst_public_key: secp256k1::PublicKey,
    ) -> Self {
        Self {
            btc_public_key,
            rsk_public_key,
            mst_public_key,
        }
    }

    /// Member that uses the same key on every chain.
    pub fn from_btc_key(key: PublicKey) -> Self {
        Self::new(key, key.inner, key.inner)
    }

    pub fn btc_public_key(&self) -> &PublicKey {
        &self.btc_public_key
    }

    pub fn rsk_public_key(&self) -> &secp256k1::PublicKey {
        &self.rsk_public_key
    }

    pub fn mst_public_key(&self) -> &secp256k1::PublicKey {
        &self.mst_public_key
    }
}

/// Fields shared by every federation variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FederationArgs {
    pub members: Vec<FederationMember>,
    /// Milliseconds since the Unix epoch.
    pub creation_time: u64,
    pub creation_block_number: u64,
    pub network: Network,
}

impl FederationArgs {
    pub fn new(
        members: Vec<FederationMember>,
        creation_time: u64,
        creation_block_number: u64,
        network: Network,
    ) -> Self {
        Self {
            members,
            creation_time,
            creation_block_number,
            network,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ErpParams {
    emergency_keys: Vec<PublicKey>,
    activation_delay: u64,
}

impl ErpParams {
    pub fn emergency_keys(&self) -> &[PublicKey] {
        &self.emergency_keys
    }

    pub fn activation_delay(&self) -> u64 {
        self.activation_delay
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FederationKind {
    Standard,
    LegacyErp(ErpParams),
    NonStandardErp(ErpParams),
    P2shErp(ErpParams),
    P2shP2wshErp(ErpParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatVersion {
    StandardMultisig = 1000,
    NonStandardErp = 2000,
    P2shErp = 3000,
    P2shP2wshErp = 4000,
}

impl FormatVersion {
    pub fn version(&self) -> u32 {
        *self as u32
    }
}

#[derive(Debug, Default)]
struct ScriptCache(RwLock<BTreeMap<RedeemScriptBuilder, ScriptBuf>>);

impl ScriptCache {
    fn get(&self, builder: &RedeemScriptBuilder) -> Option<ScriptBuf> {
        self.0.read().ok()?.get(builder).cloned()
    }

    fn insert(&self, builder: RedeemScriptBuilder, script: ScriptBuf) {
        if let Ok(mut scripts) = self.0.write() {
            scripts.insert(builder, script);
        }
    }
}

impl Clone for ScriptCache {
    fn clone(&self) -> Self {
        let scripts = self
            .0
            .read()
            .map(|scripts| scripts.clone())
            .unwrap_or_default();
        Self(RwLock::new(scripts))
    }
}

/// A federation of signers controlling the peg's Bitcoin funds.
///
/// Scripts and addresses are derived on demand for the rules active at a given block and
/// memoized per redeem script layout. The cache never takes part in equality.
#[derive(Debug, Clone)]
pub struct Federation {
    args: FederationArgs,
    kind: FederationKind,
    scripts: ScriptCache,
}

impl Federation {
    pub fn standard(args: FederationArgs) -> Result<Self, FederationError> {
        Self::new(args, FederationKind::Standard)
    }

    pub fn legacy_erp(
        args: FederationArgs,
        emergency_keys: Vec<PublicKey>,
        activation_delay: u64,
    ) -> Result<Self, FederationError> {
        let params = Self::erp_params(emergency_keys, activation_delay)?;
        Self::new(args, FederationKind::LegacyErp(params))
    }

    pub fn non_standard_erp(
        args: FederationArgs,
        emergency_keys: Vec<PublicKey>,
        activation_delay: u64,
    ) -> Result<Self, FederationError> {
        let params = Self::erp_params(emergency_keys, activation_delay)?;
        Self::new(args, FederationKind::NonStandardErp(params))
    }

    pub fn p2sh_erp(
        args: FederationArgs,
        emergency_keys: Vec<PublicKey>,
        activation_delay: u64,
    ) -> Result<Self, FederationError> {
        let params = Self::erp_params(emergency_keys, activation_delay)?;
        Self::new(args, FederationKind::P2shErp(params))
    }

    pub fn p2sh_p2wsh_erp(
        args: FederationArgs,
        emergency_keys: Vec<PublicKey>,
        activation_delay: u64,
    ) -> Result<Self, FederationError> {
        let params = Self::erp_params(emergency_keys, activation_delay)?;
        Self::new(args, FederationKind::P2shP2wshErp(params))
    }

    fn erp_params(
        emergency_keys: Vec<PublicKey>,
        activation_delay: u64,
    ) -> Result<ErpParams, ScriptCreationError> {
        if emergency_keys.is_empty() {
            return Err(ScriptCreationError::NullOrEmptyEmergencyKeys);
        }
        if activation_delay == 0 || activation_delay > MAX_CSV_VALUE {
            return Err(ScriptCreationError::InvalidCsvValue(activation_delay));
        }
        Ok(ErpParams {
            emergency_keys,
            activation_delay,
        })
    }

    // Builds the script under the latest rules so that a federation that cannot be scripted
    // is never handed out.
    fn new(args: FederationArgs, kind: FederationKind) -> Result<Self, FederationError> {
        let federation = Self {
            args,
            kind,
            scripts: ScriptCache::default(),
        };
        federation.redeem_script(&ForBlock::all_active(federation.args.creation_block_number))?;
        Ok(federation)
    }

    pub fn kind(&self) -> &FederationKind {
        &self.kind
    }

    pub fn members(&self) -> &[FederationMember] {
        &self.args.members
    }

    pub fn creation_time(&self) -> u64 {
        self.args.creation_time
    }

    pub fn creation_block_number(&self) -> u64 {
        self.args.creation_block_number
    }

    pub fn network(&self) -> Network {
        self.args.network
    }

    pub fn format_version(&self) -> FormatVersion {
        match self.kind {
            FederationKind::Standard => FormatVersion::StandardMultisig,
            FederationKind::LegacyErp(_) | FederationKind::NonStandardErp(_) => {
                FormatVersion::NonStandardErp
            }
            FederationKind::P2shErp(_) => FormatVersion::P2shErp,
            FederationKind::P2shP2wshErp(_) => FormatVersion::P2shP2wshErp,
        }
    }

    pub fn erp(&self) -> Option<&ErpParams> {
        match &self.kind {
            FederationKind::Standard => None,
            FederationKind::LegacyErp(params)
            | FederationKind::NonStandardErp(params)
            | FederationKind::P2shErp(params)
            | FederationKind::P2shP2wshErp(params) => Some(params),
        }
    }

    pub fn is_segwit(&self) -> bool {
        matches!(self.kind, FederationKind::P2shP2wshErp(_))
    }

    /// Distinct member keys in script order.
    pub fn btc_public_keys(&self) -> Vec<PublicKey> {
        let keys = self
            .args
            .members
            .iter()
            .map(|member| member.btc_public_key)
            .collect::<Vec<_>>();
        sorted_keys(&keys)
    }

    pub fn size(&self) -> usize {
        self.btc_public_keys().len()
    }

    pub fn number_of_signatures_required(&self) -> usize {
        majority_threshold(self.size())
    }

    pub fn btc_public_key_index(&self, key: &PublicKey) -> Option<usize> {
        self.btc_public_keys().iter().position(|member| member == key)
    }

    pub fn has_btc_public_key(&self, key: &PublicKey) -> bool {
        self.btc_public_key_index(key).is_some()
    }

    /// Matches on all three keys of the member.
    pub fn is_member(&self, member: &FederationMember) -> bool {
        self.args.members.contains(member)
    }

    pub fn member_by_btc_key(&self, key: &PublicKey) -> Option<&FederationMember> {
        self.args
            .members
            .iter()
            .find(|member| &member.btc_public_key == key)
    }

    pub fn redeem_script_builder(&self, activations: &ForBlock) -> RedeemScriptBuilder {
        match &self.kind {
            FederationKind::Standard => RedeemScriptBuilder::Standard,
            FederationKind::LegacyErp(_) | FederationKind::NonStandardErp(_) => {
                if self.args.network == Network::Testnet
                    && !activations.is_active(ConsensusRule::ErpTestnetScriptFix)
                {
                    RedeemScriptBuilder::HardcodedTestnetErp
                } else {
                    RedeemScriptBuilder::NonStandardErp(CsvEncoding::for_activations(activations))
                }
            }
            FederationKind::P2shErp(_) => RedeemScriptBuilder::P2shErp,
            FederationKind::P2shP2wshErp(_) => RedeemScriptBuilder::P2shP2wshErp,
        }
    }

    pub fn redeem_script(&self, activations: &ForBlock) -> Result<ScriptBuf, FederationError> {
        let builder = self.redeem_script_builder(activations);
        if let Some(script) = self.scripts.get(&builder) {
            return Ok(script);
        }

        let keys = self.btc_public_keys();
        let threshold = majority_threshold(keys.len());
        let script = match self.erp() {
            None => builder.build(&keys, threshold, None)?,
            Some(params) => {
                let branch = EmergencyBranch {
                    keys: &params.emergency_keys,
                    threshold: majority_threshold(sorted_keys(&params.emergency_keys).len()),
                    csv_value: params.activation_delay,
                };
                builder.build(&keys, threshold, Some(&branch))?
            }
        };

        debug!(
            "Derived {builder:?} redeem script for federation created at block {}",
            self.args.creation_block_number
        );
        self.scripts.insert(builder, script.clone());
        Ok(script)
    }

    /// Plain multisig of the member keys, without the emergency branch.
    pub fn default_redeem_script(&self) -> Result<ScriptBuf, FederationError> {
        let keys = self.btc_public_keys();
        Ok(RedeemScriptBuilder::Standard.build(&keys, majority_threshold(keys.len()), None)?)
    }

    /// Output script paying to the federation. For segwit federations this is the P2SH
    /// wrapping of the P2WSH program.
    pub fn p2sh_script(&self, activations: &ForBlock) -> Result<ScriptBuf, FederationError> {
        let redeem_script = self.redeem_script(activations)?;
        if self.is_segwit() {
            let witness_program = ScriptBuf::new_v0_p2wsh(&redeem_script.wscript_hash());
            Ok(ScriptBuf::new_p2sh(&witness_program.script_hash()))
        } else {
            Ok(ScriptBuf::new_p2sh(&redeem_script.script_hash()))
        }
    }

    pub fn address(&self, activations: &ForBlock) -> Result<Address, FederationError> {
        let script = self.p2sh_script(activations)?;
        Ok(Address::from_script(&script, self.args.network)?)
    }
}

impl PartialEq for Federation {
    fn eq(&self, other: &Self) -> bool {
        self.args == other.args && self.kind == other.kind
    }
}

impl Eq for Federation {}

impl Hash for Federation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.args.hash(state);
        self.kind.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        federation_args, hex_key, members_from_keys, public_keys, TESTNET_ERP_KEYS,
    };
    use std::collections::HashSet;

    const TESTNET_MEMBERS: [&str; 5] = [
        "0208f40073a9e43b3e9103acec79767a6de9b0409749884e989960fee578012fce",
        "0225e892391625854128c5c4ea4340de0c2a70570f33db53426fc9c746597a03f4",
        "025a2f522aea776fab5241ad72f7f05918e8606676461cb6ce38265a52d4ca9ed6",
        "02afc230c2d355b1a577682b07bc2646041b5d0177af0f98395a46018da699b6da",
        "0344a3c38cd59afcba3edcebe143e025574594b001700dec41e59409bdbd0f2a09",
    ];

    fn testnet_args() -> FederationArgs {
        let keys = TESTNET_MEMBERS.iter().map(|key| hex_key(key)).collect::<Vec<_>>();
        FederationArgs::new(members_from_keys(&keys), 0, 0, Network::Testnet)
    }

    fn testnet_erp_keys() -> Vec<PublicKey> {
        TESTNET_ERP_KEYS.iter().map(|key| hex_key(key)).collect()
    }

    #[test]
    fn test_standard_federation_accessors() {
        let keys = public_keys(9);
        let federation = Federation::standard(federation_args(&keys, Network::Regtest)).unwrap();

        assert_eq!(federation.size(), 9);
        assert_eq!(federation.number_of_signatures_required(), 5);
        assert_eq!(federation.format_version().version(), 1000);
        assert!(federation.erp().is_none());
        assert!(!federation.is_segwit());

        let sorted = federation.btc_public_keys();
        let mut expected = keys.clone();
        expected.sort_by_key(|key| key.to_bytes());
        assert_eq!(sorted, expected);

        for key in &keys {
            assert!(federation.has_btc_public_key(key));
            assert_eq!(federation.member_by_btc_key(key).unwrap().btc_public_key(), key);
        }
        let outsider = public_keys(10)[9];
        assert!(!federation.has_btc_public_key(&outsider));
        assert!(federation.member_by_btc_key(&outsider).is_none());

        let member = federation.members()[0].clone();
        assert!(federation.is_member(&member));
        let other_rsk_key = FederationMember::new(
            *member.btc_public_key(),
            outsider.inner,
            *member.mst_public_key(),
        );
        assert!(!federation.is_member(&other_rsk_key));
    }

    #[test]
    fn test_members_keep_their_original_order() {
        let mut keys = public_keys(4);
        keys.reverse();
        keys.push(keys[0]);
        let federation = Federation::standard(federation_args(&keys, Network::Regtest)).unwrap();

        assert_eq!(federation.members().len(), 5);
        assert_eq!(federation.members()[0].btc_public_key(), &keys[0]);
        assert_eq!(federation.size(), 4);
        assert_eq!(federation.number_of_signatures_required(), 3);
    }

    #[test]
    fn test_member_from_btc_key_reuses_the_key() {
        let key = public_keys(1)[0];
        let member = FederationMember::from_btc_key(key);
        assert_eq!(member.rsk_public_key(), &key.inner);
        assert_eq!(member.mst_public_key(), &key.inner);
    }

    #[test]
    fn test_empty_federation_is_rejected() {
        let result = Federation::standard(federation_args(&[], Network::Regtest));
        assert!(matches!(
            result,
            Err(FederationError::Creation(
                ScriptCreationError::InvalidThreshold { threshold: 1, keys: 0 }
            ))
        ));
    }

    #[test]
    fn test_erp_creation_failures() {
        let keys = public_keys(5);
        let args = federation_args(&keys, Network::Testnet);

        assert!(matches!(
            Federation::p2sh_erp(args.clone(), vec![], 52_560),
            Err(FederationError::Creation(
                ScriptCreationError::NullOrEmptyEmergencyKeys
            ))
        ));
        assert!(matches!(
            Federation::legacy_erp(args.clone(), testnet_erp_keys(), 0),
            Err(FederationError::Creation(ScriptCreationError::InvalidCsvValue(0)))
        ));
        assert!(matches!(
            Federation::non_standard_erp(args.clone(), testnet_erp_keys(), MAX_CSV_VALUE + 1),
            Err(FederationError::Creation(ScriptCreationError::InvalidCsvValue(_)))
        ));

        let too_many = federation_args(&public_keys(15), Network::Testnet);
        assert!(matches!(
            Federation::legacy_erp(too_many.clone(), testnet_erp_keys(), 52_560),
            Err(FederationError::Creation(
                ScriptCreationError::AboveMaxScriptElementSize { .. }
            ))
        ));
        assert!(Federation::p2sh_p2wsh_erp(too_many, testnet_erp_keys(), 52_560).is_ok());
    }

    #[test]
    fn test_legacy_erp_testnet_address_before_csv_fix() {
        let federation =
            Federation::legacy_erp(testnet_args(), testnet_erp_keys(), 52_560).unwrap();
        let activations = ForBlock::new(0, [ConsensusRule::ErpTestnetScriptFix]);

        assert_eq!(
            hex::encode(federation.p2sh_script(&activations).unwrap().as_bytes()),
            "a9148f38b3d8ec8816f7f58a390f306bb90bb178d6ac87"
        );
        assert_eq!(
            federation.address(&activations).unwrap().to_string(),
            "2N6JWYUb6Li4Kux6UB2eihT7n3rm3YX97uv"
        );
    }

    #[test]
    fn test_non_standard_erp_testnet_address_after_csv_fix() {
        let federation =
            Federation::non_standard_erp(testnet_args(), testnet_erp_keys(), 52_560).unwrap();
        let activations = ForBlock::all_active(0);

        assert_eq!(
            hex::encode(federation.p2sh_script(&activations).unwrap().as_bytes()),
            "a91412d5d2996618c8abcb1e6fc17be3cd8e2790c25f87"
        );
        assert_eq!(
            federation.address(&activations).unwrap().to_string(),
            "2MtxpJPt2xCa3AyFYUjTT7Aop9Z6gGf4rqA"
        );
    }

    #[test]
    fn test_testnet_erp_uses_fixed_script_before_fix() {
        let keys = public_keys(3);
        let args = federation_args(&keys, Network::Testnet);
        let before_fix = ForBlock::new(0, []);

        let legacy = Federation::legacy_erp(args.clone(), testnet_erp_keys(), 52_560).unwrap();
        let non_standard =
            Federation::non_standard_erp(args.clone(), testnet_erp_keys(), 52_560).unwrap();
        assert_eq!(
            legacy.redeem_script_builder(&before_fix),
            RedeemScriptBuilder::HardcodedTestnetErp
        );
        assert_eq!(
            legacy.redeem_script(&before_fix).unwrap(),
            non_standard.redeem_script(&before_fix).unwrap()
        );

        // other networks never used the fixed script
        let regtest = Federation::non_standard_erp(
            federation_args(&keys, Network::Regtest),
            testnet_erp_keys(),
            500,
        )
        .unwrap();
        assert_eq!(
            regtest.redeem_script_builder(&before_fix),
            RedeemScriptBuilder::NonStandardErp(CsvEncoding::BigEndianFixed)
        );

        // nor do P2SH federations
        let p2sh = Federation::p2sh_erp(args, testnet_erp_keys(), 52_560).unwrap();
        assert_eq!(
            p2sh.redeem_script_builder(&before_fix),
            RedeemScriptBuilder::P2shErp
        );
    }

    #[test]
    fn test_redeem_script_changes_with_csv_encoding() {
        let federation = Federation::non_standard_erp(
            federation_args(&public_keys(9), Network::Bitcoin),
            testnet_erp_keys(),
            52_560,
        )
        .unwrap();
        let before = ForBlock::new(10, [ConsensusRule::ErpTestnetScriptFix]);
        let after = ForBlock::all_active(20);

        let script_before = federation.redeem_script(&before).unwrap();
        let script_after = federation.redeem_script(&after).unwrap();
        assert_ne!(script_before, script_after);
        assert_eq!(script_before, federation.redeem_script(&before).unwrap());
        assert_eq!(script_after, federation.redeem_script(&after).unwrap());

        // a fresh federation with the same fields derives the same bytes
        let twin = Federation::non_standard_erp(
            federation_args(&public_keys(9), Network::Bitcoin),
            testnet_erp_keys(),
            52_560,
        )
        .unwrap();
        assert_eq!(twin.redeem_script(&before).unwrap(), script_before);
        assert_eq!(twin, federation);
    }

    #[test]
    fn test_segwit_federation_scripts() {
        let federation = Federation::p2sh_p2wsh_erp(
            federation_args(&public_keys(20), Network::Regtest),
            testnet_erp_keys(),
            500,
        )
        .unwrap();
        let activations = ForBlock::all_active(0);
        let redeem_script = federation.redeem_script(&activations).unwrap();

        let witness_program = ScriptBuf::new_v0_p2wsh(&redeem_script.wscript_hash());
        let expected = ScriptBuf::new_p2sh(&witness_program.script_hash());
        assert_eq!(federation.p2sh_script(&activations).unwrap(), expected);
        assert!(federation.p2sh_script(&activations).unwrap().is_p2sh());
        assert_eq!(federation.format_version(), FormatVersion::P2shP2wshErp);
        assert_eq!(
            federation.address(&activations).unwrap().script_pubkey(),
            expected
        );
    }

    #[test]
    fn test_default_redeem_script_ignores_emergency_branch() {
        let keys = public_keys(5);
        let erp = Federation::p2sh_erp(
            federation_args(&keys, Network::Regtest),
            testnet_erp_keys(),
            500,
        )
        .unwrap();
        let standard = Federation::standard(federation_args(&keys, Network::Regtest)).unwrap();

        assert_eq!(
            erp.default_redeem_script().unwrap(),
            standard.redeem_script(&ForBlock::all_active(0)).unwrap()
        );
    }

    #[test]
    fn test_equality_is_structural() {
        let keys = public_keys(5);
        let first = Federation::p2sh_erp(
            federation_args(&keys, Network::Regtest),
            testnet_erp_keys(),
            500,
        )
        .unwrap();
        let second = first.clone();
        // populating the cache of one side does not matter
        first.redeem_script(&ForBlock::new(0, [])).unwrap();
        assert_eq!(first, second);

        let other_delay = Federation::p2sh_erp(
            federation_args(&keys, Network::Regtest),
            testnet_erp_keys(),
            501,
        )
        .unwrap();
        assert_ne!(first, other_delay);

        let mut later_args = federation_args(&keys, Network::Regtest);
        later_args.creation_block_number = 42;
        let later = Federation::p2sh_erp(later_args, testnet_erp_keys(), 500).unwrap();
        assert_ne!(first, later);

        let set: HashSet<_> = [first, second, other_delay].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_erp_threshold_uses_emergency_majority() {
        let federation = Federation::p2sh_erp(
            federation_args(&public_keys(5), Network::Regtest),
            testnet_erp_keys(),
            500,
        )
        .unwrap();
        let script = federation.redeem_script(&ForBlock::all_active(0)).unwrap();
        let bytes = script.as_bytes();
        // three emergency keys need two signatures
        let emergency_start = bytes.len() - (1 + 3 * 34 + 1 + 1 + 1);
        assert_eq!(
            bytes[emergency_start],
            bitcoin::opcodes::all::OP_PUSHNUM_2.to_u8()
        );
    }
}
