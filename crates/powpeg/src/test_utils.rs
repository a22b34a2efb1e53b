//! Key, federation, UTXO and signing fixtures shared by the unit tests.

use crate::activations::ForBlock;
use crate::config::BridgeConstants;
use crate::federation::{Federation, FederationArgs, FederationMember};
use crate::spending::MultisigSpend;
use crate::wallet::{Utxo, UtxoProvider, UtxoProviderError};
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, Secp256k1, SecretKey};
use bitcoin::{
    Address, Network, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use std::str::FromStr;

pub const TESTNET_ERP_KEYS: [&str; 3] = [
    "0216c23b2ea8e4f11c3f9e22711addb1d16a93964796913830856b568cc3ea21d3",
    "034db69f2112f4fb1bb6141bf6e2bd6631f0484d0bd95b16767902c9fe219d4a6f",
    "0275562901dd8faae20de0a4166362a4f82188db77dbed4ca887422ea1ec185f14",
];

// Mainnet release 99ff14d8d0b339f6144291940c5f99e8fd4002fb300cebde963555fd395ee943, one
// input of a 5 of 9 P2SH ERP federation paying a user and the change.
pub const MAINNET_P2SH_ERP_RELEASE: &str = "0200000001188d5f9de5b8db6f4be05da4ae4a2d150112c333cee829b7f096feb1ebcb473401000000fd3703004730440220630a0c2fbe56cc78ff6506c64a8013b4fb703ade2c1c23c3a9973d6bf1d59ac802200aa28a08deb20ead5bd84ee003f5f17dfbf643f2e96079b878eba798f155191d01473044022043e2e3c82a74a817425de96e8e317e3f96e462b0e96441f4e301b1e6d2df4d7602206ee7d453f61cc55d0ad6530438876a21ed2e3b240cd487cf9ddf2ad17a40047d01483045022100c312a5c6f87d1903f89f158bdb3e8f3385a049ebedb7bb1d4753176881e2981502201eb50518f76f47587c6781c1b39f7ede1349df01b65036e7d80a09252149662d0147304402203370ab37f6b24d723ccc7a6b9cd4dfe9f30449a64effb47d1f5e1727a93afa5f022004733ecc46c19c762f0a4372b882fcec1209990f7bf1426f94f79b29534816700147304402203af20ed490bf6b140e2df8770025e333869fa6f54a6cf152e6666c1054eb3424022023f255af0855464f26165a026ede6d6db7475c7442353a3dcd17dc4bc61fb14201004dc901645521020ace50bab1230f8002a0bfe619482af74b338cc9e4c956add228df47e6adae1c21025093f439fb8006fd29ab56605ffec9cdc840d16d2361004e1337a2f86d8bd2db21026b472f7d59d201ff1f540f111b6eb329e071c30a9d23e3d2bcd128fe73dc254c210275d473555de2733c47125f9702b0f870df1d817379f5587f09b6c40ed2c6c9492102a95f095d0ce8cb3b9bf70cc837e3ebe1d107959b1fa3f9b2d8f33446f9c8cbdb2103250c11be0561b1d7ae168b1f59e39cbc1fd1ba3cf4d2140c1a365b2723a2bf9321034851379ec6b8a701bd3eef8a0e2b119abb4bdde7532a3d6bcbff291b0daf3f252103b58a5da144f5abab2e03e414ad044b732300de52fa25c672a7f7b358887719062103e05bf6002b62651378b1954820539c36ca405cbb778c225395dd9ebff678029959ae670350cd00b275532102370a9838e4d15708ad14a104ee5606b36caaaaf739d833e67770ce9fd9b3ec80210257c293086c4d4fe8943deda5f890a37d11bebd140e220faa76258a41d077b4d42103c2660a46aa73078ee6016dee953488566426cf55fc8011edd0085634d75395f92103cd3e383ec6e12719a6c69515e5559bcbe037d0aa24c187e1e26ce932e22ad7b354ae68ffffffff0281c00e00000000001976a9140ab5592fc4c28f2301014da9981a3f1d7ad3d4af88ac597ebc2d4900000017a914056d0d9c5b14dd720d9f61fdb3f557c074f95cef8700000000";

// Order of the secp256k1 group.
const CURVE_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

pub fn hex_key(hex: &str) -> PublicKey {
    PublicKey::from_str(hex).unwrap()
}

pub fn secret_key(index: usize) -> SecretKey {
    let mut bytes = [0u8; 32];
    bytes[0] = 0x01;
    bytes[24..].copy_from_slice(&(index as u64).to_be_bytes());
    SecretKey::from_slice(&bytes).unwrap()
}

/// Secret keys `1..=count`. Federations built by this module use the matching public keys.
pub fn secret_keys(count: usize) -> Vec<SecretKey> {
    (1..=count).map(secret_key).collect()
}

pub fn public_key(secret: &SecretKey) -> PublicKey {
    PublicKey::new(secret.public_key(&Secp256k1::signing_only()))
}

pub fn public_keys(count: usize) -> Vec<PublicKey> {
    secret_keys(count).iter().map(public_key).collect()
}

pub fn members_from_keys(keys: &[PublicKey]) -> Vec<FederationMember> {
    keys.iter().copied().map(FederationMember::from_btc_key).collect()
}

pub fn federation_args(keys: &[PublicKey], network: Network) -> FederationArgs {
    FederationArgs::new(members_from_keys(keys), 1_700_000_000_000, 1, network)
}

fn erp_constants(network: Network) -> BridgeConstants {
    BridgeConstants::for_network(network).unwrap()
}

pub fn standard_federation(members: usize, network: Network) -> Federation {
    Federation::standard(federation_args(&public_keys(members), network)).unwrap()
}

pub fn non_standard_erp_federation(members: usize, network: Network) -> Federation {
    let constants = erp_constants(network);
    Federation::non_standard_erp(
        federation_args(&public_keys(members), network),
        constants.erp_fed_pubkeys,
        constants.erp_fed_activation_delay,
    )
    .unwrap()
}

pub fn p2sh_erp_federation(members: usize, network: Network) -> Federation {
    let constants = erp_constants(network);
    Federation::p2sh_erp(
        federation_args(&public_keys(members), network),
        constants.erp_fed_pubkeys,
        constants.erp_fed_activation_delay,
    )
    .unwrap()
}

pub fn p2sh_p2wsh_erp_federation(members: usize, network: Network) -> Federation {
    let constants = erp_constants(network);
    Federation::p2sh_p2wsh_erp(
        federation_args(&public_keys(members), network),
        constants.erp_fed_pubkeys,
        constants.erp_fed_activation_delay,
    )
    .unwrap()
}

pub fn txid(seed: u32) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&seed.to_be_bytes());
    bytes[31] = 0xaa;
    Txid::from_byte_array(bytes)
}

pub fn utxo(seed: u32, vout: u32, value: u64, script_pubkey: &ScriptBuf) -> Utxo {
    Utxo {
        outpoint: OutPoint {
            txid: txid(seed),
            vout,
        },
        value,
        script_pubkey: script_pubkey.clone(),
        confirmations: 100,
    }
}

/// One UTXO per value, paying to `federation`, with seeds starting at 1.
pub fn federation_utxos(
    federation: &Federation,
    activations: &ForBlock,
    values: &[u64],
) -> Vec<Utxo> {
    let script = federation.p2sh_script(activations).unwrap();
    values
        .iter()
        .enumerate()
        .map(|(index, value)| utxo(index as u32 + 1, 0, *value, &script))
        .collect()
}

pub fn unsigned_input(seed: u32, vout: u32) -> TxIn {
    TxIn {
        previous_output: OutPoint {
            txid: txid(seed),
            vout,
        },
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::default(),
    }
}

pub fn p2pkh_address(seed: usize, network: Network) -> Address {
    Address::p2pkh(&public_key(&secret_key(10_000 + seed)), network)
}

pub struct FailingProvider;

impl UtxoProvider for FailingProvider {
    fn utxos(&self) -> Result<Vec<Utxo>, UtxoProviderError> {
        Err(UtxoProviderError::Unavailable("connection refused".to_string()))
    }
}

/// Unsigned transaction spending `inputs` federation outputs of 100_000 satoshis each into
/// `outputs` P2PKH outputs. Returns the spent values along with it.
pub fn unsigned_release(
    federation: &Federation,
    activations: &ForBlock,
    inputs: usize,
    outputs: usize,
) -> (Transaction, Vec<u64>) {
    let spend = MultisigSpend::unsigned(federation, activations).unwrap();
    let input = (0..inputs)
        .map(|index| {
            let mut input = unsigned_input(index as u32 + 1, 0);
            spend.apply(&mut input).unwrap();
            input
        })
        .collect();
    let output = (0..outputs)
        .map(|index| TxOut {
            value: 10_000,
            script_pubkey: p2pkh_address(index, federation.network()).script_pubkey(),
        })
        .collect();
    let tx = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input,
        output,
    };
    (tx, vec![100_000; inputs])
}

/// DER signature of input `index`, without the sighash type byte.
pub fn sign_input(tx: &Transaction, index: usize, value: u64, secret: &SecretKey) -> Vec<u8> {
    let spend = MultisigSpend::decode(&tx.input[index]).unwrap();
    let message = spend.signature_hash(tx, index, value).unwrap();
    Secp256k1::signing_only()
        .sign_ecdsa(&message, secret)
        .serialize_der()
        .to_vec()
}

/// One signature per input, as a federator submits them.
pub fn sign_inputs(tx: &Transaction, values: &[u64], secret: &SecretKey) -> Vec<Vec<u8>> {
    (0..tx.input.len())
        .map(|index| sign_input(tx, index, values[index], secret))
        .collect()
}

/// Fills every input of `tx` with the signatures of the first federators, secret keys
/// `1..=members`, in redeem script order.
pub fn sign_all_inputs(tx: &mut Transaction, values: &[u64], members: usize) {
    let secp = Secp256k1::signing_only();
    for index in 0..tx.input.len() {
        let mut spend = MultisigSpend::decode(&tx.input[index]).unwrap();
        let message = spend.signature_hash(tx, index, values[index]).unwrap();

        let mut signers = secret_keys(members)
            .into_iter()
            .filter_map(|secret| {
                spend
                    .info()
                    .key_index(&public_key(&secret))
                    .map(|key_index| (key_index, secret))
            })
            .collect::<Vec<_>>();
        signers.sort_by_key(|(key_index, _)| *key_index);

        let required = spend.required_signatures();
        for (position, (_, secret)) in signers.into_iter().take(required).enumerate() {
            let mut signature = secp.sign_ecdsa(&message, &secret).serialize_der().to_vec();
            signature.push(0x01);
            spend.insert_signature(position, signature).unwrap();
        }
        spend.apply(&mut tx.input[index]).unwrap();
    }
}

/// Same signature with `s` replaced by `n - s`.
pub fn high_s(der: &[u8]) -> Vec<u8> {
    let compact = Signature::from_der(der).unwrap().serialize_compact();
    let (r, s) = compact.split_at(32);

    let mut negated = [0u8; 32];
    let mut borrow = 0i16;
    for index in (0..32).rev() {
        let mut digit = CURVE_ORDER[index] as i16 - s[index] as i16 - borrow;
        borrow = 0;
        if digit < 0 {
            digit += 256;
            borrow = 1;
        }
        negated[index] = digit as u8;
    }

    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(r);
    bytes[32..].copy_from_slice(&negated);
    Signature::from_compact(&bytes)
        .unwrap()
        .serialize_der()
        .to_vec()
}
