//! Output script and address construction.
//!
//! Multisig scripts use BIP-67 ordering: public keys are sorted by their
//! compressed serialization at build time, never at storage time, so every
//! co-signer derives the byte-identical script regardless of the order in
//! which xpubs were imported.

use bitcoin::address::NetworkUnchecked;
use bitcoin::bip32::Xpub;
use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{Address, CompressedPublicKey, Network, NetworkKind, PublicKey, Script, ScriptBuf};

use crate::constants::{MAX_REDEEM_SCRIPT_SIZE, MAX_WITNESS_SCRIPT_SIZE};
use crate::derivation::derive_address_pubkey;
use crate::error::{SigilError, ValidationError};
use crate::types::{AddressType, Chain};

/// Opcode value of `OP_PUSHNUM_1`; `OP_PUSHNUM_n` is this plus `n - 1`.
const OP_PUSHNUM_BASE: u8 = 0x50;

/// Single-key output: the scriptPubKey, the P2SH redeem script for wrapped
/// segwit, and the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleSigScript {
    pub script_pubkey: ScriptBuf,
    pub redeem_script: Option<ScriptBuf>,
    pub address: Address,
}

/// Multisig output with its redeem and/or witness script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigScript {
    pub threshold: usize,
    /// Keys in script order (sorted).
    pub keys: Vec<PublicKey>,
    /// P2SH redeem script (`Legacy` and `WrappedSegwit`).
    pub redeem_script: Option<ScriptBuf>,
    /// P2WSH witness script (`WrappedSegwit` and `NativeSegwit`).
    pub witness_script: Option<ScriptBuf>,
    pub script_pubkey: ScriptBuf,
    pub address: Address,
}

impl MultisigScript {
    /// The bare `OP_CHECKMULTISIG` script, whichever wrapper carries it.
    pub fn multisig_script(&self) -> &ScriptBuf {
        match (&self.witness_script, &self.redeem_script) {
            (Some(ws), _) => ws,
            (None, Some(rs)) => rs,
            (None, None) => &self.script_pubkey,
        }
    }
}

pub fn build_single_sig_script(
    pubkey: &CompressedPublicKey,
    address_type: AddressType,
    network: Network,
) -> SingleSigScript {
    let (address, redeem_script) = match address_type {
        AddressType::Legacy => (Address::p2pkh(pubkey.pubkey_hash(), network), None),
        AddressType::WrappedSegwit => (
            Address::p2shwpkh(pubkey, network),
            Some(ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash())),
        ),
        AddressType::NativeSegwit => (Address::p2wpkh(pubkey, network), None),
    };
    SingleSigScript {
        script_pubkey: address.script_pubkey(),
        redeem_script,
        address,
    }
}

/// Sort keys into canonical BIP-67 order.
pub fn sort_keys(keys: &[PublicKey]) -> Vec<PublicKey> {
    let mut sorted = keys.to_vec();
    sorted.sort_by_key(|k| k.to_bytes());
    sorted
}

/// Build an m-of-n multisig output from raw public keys.
///
/// Rejects an empty key set, `m == 0`, `m > n`, `n > max_keys`,
/// uncompressed and duplicate keys, and scripts over the size limit of
/// their wrapper.
pub fn build_multisig_script(
    pubkeys: &[PublicKey],
    m: usize,
    address_type: AddressType,
    network: Network,
    max_keys: usize,
) -> Result<MultisigScript, ValidationError> {
    let n = pubkeys.len();
    if n == 0 || m == 0 || m > n {
        return Err(ValidationError::InvalidThreshold { m, n });
    }
    if n > max_keys {
        return Err(ValidationError::TooManyCosigners { n, max: max_keys });
    }
    if pubkeys.iter().any(|k| !k.compressed) {
        return Err(ValidationError::UncompressedKey);
    }

    let keys = sort_keys(pubkeys);
    if let Some(pair) = keys.windows(2).find(|w| w[0] == w[1]) {
        return Err(ValidationError::DuplicateKey(pair[0].to_string()));
    }

    let mut builder = Builder::new().push_int(m as i64);
    for key in &keys {
        builder = builder.push_key(key);
    }
    let script = builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();

    let (address, redeem_script, witness_script) = match address_type {
        AddressType::Legacy => {
            check_size(&script, MAX_REDEEM_SCRIPT_SIZE)?;
            let address = Address::p2sh(&script, network)
                .map_err(|e| ValidationError::InvalidAddress(e.to_string()))?;
            (address, Some(script), None)
        }
        AddressType::WrappedSegwit => {
            check_size(&script, MAX_WITNESS_SCRIPT_SIZE)?;
            let address = Address::p2shwsh(&script, network);
            let redeem = ScriptBuf::new_p2wsh(&script.wscript_hash());
            (address, Some(redeem), Some(script))
        }
        AddressType::NativeSegwit => {
            check_size(&script, MAX_WITNESS_SCRIPT_SIZE)?;
            (Address::p2wsh(&script, network), None, Some(script))
        }
    };

    Ok(MultisigScript {
        threshold: m,
        keys,
        redeem_script,
        witness_script,
        script_pubkey: address.script_pubkey(),
        address,
    })
}

/// Derive every cosigner's `chain/index` key and build the multisig output.
///
/// Each xpub must carry the version bytes of `network`.
pub fn build_multisig_from_xpubs(
    xpubs: &[Xpub],
    m: usize,
    chain: Chain,
    index: u32,
    address_type: AddressType,
    network: Network,
    max_keys: usize,
) -> Result<MultisigScript, SigilError> {
    let expected = NetworkKind::from(network);
    let mut pubkeys = Vec::with_capacity(xpubs.len());
    for xpub in xpubs {
        if xpub.network != expected {
            return Err(ValidationError::NetworkMismatch {
                expected: format!("{expected:?}"),
                found: format!("{:?}", xpub.network),
            }
            .into());
        }
        pubkeys.push(PublicKey::from(derive_address_pubkey(xpub, chain, index)?));
    }
    Ok(build_multisig_script(&pubkeys, m, address_type, network, max_keys)?)
}

/// Parse the threshold and key list of a bare `OP_CHECKMULTISIG` script.
pub fn parse_multisig(script: &Script) -> Option<(usize, Vec<PublicKey>)> {
    let mut instructions = script.instructions();

    let m = match instructions.next()?.ok()? {
        Instruction::Op(op) => small_int(op.to_u8())?,
        Instruction::PushBytes(_) => return None,
    };

    let mut keys = Vec::new();
    let mut n = None;
    for instruction in instructions.by_ref() {
        match instruction.ok()? {
            Instruction::PushBytes(bytes) => keys.push(PublicKey::from_slice(bytes.as_bytes()).ok()?),
            Instruction::Op(op) => {
                n = Some(small_int(op.to_u8())?);
                break;
            }
        }
    }

    match instructions.next()?.ok()? {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
        _ => return None,
    }
    if instructions.next().is_some() || n? != keys.len() || m > keys.len() {
        return None;
    }
    Some((m, keys))
}

/// Parse and network-check a recipient address string.
pub fn parse_address(s: &str, network: Network) -> Result<Address, ValidationError> {
    let unchecked: Address<NetworkUnchecked> = s
        .trim()
        .parse()
        .map_err(|e: bitcoin::address::ParseError| ValidationError::InvalidAddress(e.to_string()))?;
    if !unchecked.is_valid_for_network(network) {
        return Err(ValidationError::NetworkMismatch {
            expected: network.to_string(),
            found: s.trim().to_string(),
        });
    }
    Ok(unchecked.assume_checked())
}

fn small_int(opcode: u8) -> Option<usize> {
    match opcode {
        0x51..=0x60 => Some((opcode - OP_PUSHNUM_BASE) as usize),
        _ => None,
    }
}

fn check_size(script: &Script, max: usize) -> Result<(), ValidationError> {
    if script.len() > max {
        return Err(ValidationError::ScriptTooLarge {
            size: script.len(),
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_COSIGNERS;
    use crate::derivation::{Purpose, Seed, derive_account_key};
    use std::str::FromStr;

    fn key(byte: u8) -> PublicKey {
        let secret = bitcoin::secp256k1::SecretKey::from_slice(&[byte; 32]).unwrap();
        PublicKey::new(secret.public_key(crate::derivation::secp()))
    }

    fn three_keys() -> Vec<PublicKey> {
        vec![key(1), key(2), key(3)]
    }

    #[test]
    fn single_sig_address_prefixes() {
        let pk = CompressedPublicKey::try_from(key(9)).unwrap();
        let legacy = build_single_sig_script(&pk, AddressType::Legacy, Network::Bitcoin);
        assert!(legacy.address.to_string().starts_with('1'));
        assert!(legacy.redeem_script.is_none());

        let wrapped = build_single_sig_script(&pk, AddressType::WrappedSegwit, Network::Bitcoin);
        assert!(wrapped.address.to_string().starts_with('3'));
        assert!(wrapped.redeem_script.as_ref().unwrap().is_p2wpkh());

        let native = build_single_sig_script(&pk, AddressType::NativeSegwit, Network::Testnet);
        assert!(native.address.to_string().starts_with("tb1q"));
        assert!(native.script_pubkey.is_p2wpkh());
    }

    #[test]
    fn bip84_reference_address() {
        // BIP-84 test vector: "abandon ... about", m/84'/0'/0'/0/0.
        let mnemonic = bip39_vector_seed();
        let account = derive_account_key(&mnemonic, Network::Bitcoin, Purpose::Bip84, 0, 0, AddressType::NativeSegwit).unwrap();
        let key = crate::derivation::derive_address_key(&account, Chain::External, 0).unwrap();
        let script = build_single_sig_script(&key.public_key, AddressType::NativeSegwit, Network::Bitcoin);
        assert_eq!(script.address.to_string(), "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu");
    }

    fn bip39_vector_seed() -> Seed {
        // PBKDF2 output of the all-"abandon" mnemonic ending in "about", empty passphrase.
        Seed::from_bytes(&hex::decode(
            "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc19a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4",
        ).unwrap()).unwrap()
    }

    #[test]
    fn multisig_order_independent() {
        let keys = three_keys();
        let a = build_multisig_script(&keys, 2, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap();
        let reversed: Vec<_> = keys.iter().rev().cloned().collect();
        let b = build_multisig_script(&reversed, 2, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap();
        assert_eq!(a.witness_script, b.witness_script);
        assert_eq!(a.address, b.address);
        assert_eq!(a.keys, sort_keys(&keys));
    }

    #[test]
    fn multisig_wrappers() {
        let keys = three_keys();
        let legacy = build_multisig_script(&keys, 2, AddressType::Legacy, Network::Bitcoin, MAX_COSIGNERS).unwrap();
        assert!(legacy.script_pubkey.is_p2sh());
        assert!(legacy.witness_script.is_none());

        let wrapped = build_multisig_script(&keys, 2, AddressType::WrappedSegwit, Network::Bitcoin, MAX_COSIGNERS).unwrap();
        assert!(wrapped.script_pubkey.is_p2sh());
        assert!(wrapped.redeem_script.as_ref().unwrap().is_p2wsh());

        let native = build_multisig_script(&keys, 2, AddressType::NativeSegwit, Network::Bitcoin, MAX_COSIGNERS).unwrap();
        assert!(native.script_pubkey.is_p2wsh());
        assert!(native.redeem_script.is_none());
        assert_eq!(native.multisig_script(), wrapped.witness_script.as_ref().unwrap());
    }

    #[test]
    fn multisig_rejects_bad_thresholds() {
        let keys = three_keys();
        for m in [0, 4] {
            let err = build_multisig_script(&keys, m, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap_err();
            assert_eq!(err, ValidationError::InvalidThreshold { m, n: 3 });
        }
    }

    #[test]
    fn multisig_rejects_duplicates() {
        let keys = vec![key(1), key(2), key(1)];
        let err = build_multisig_script(&keys, 2, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap_err();
        assert!(matches!(err, ValidationError::DuplicateKey(_)));
    }

    #[test]
    fn multisig_rejects_over_cap() {
        let keys: Vec<_> = (1..=4).map(key).collect();
        let err = build_multisig_script(&keys, 2, AddressType::NativeSegwit, Network::Testnet, 3).unwrap_err();
        assert_eq!(err, ValidationError::TooManyCosigners { n: 4, max: 3 });
    }

    #[test]
    fn multisig_rejects_uncompressed() {
        let mut keys = three_keys();
        keys[0].compressed = false;
        let err = build_multisig_script(&keys, 2, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap_err();
        assert_eq!(err, ValidationError::UncompressedKey);
    }

    #[test]
    fn xpub_network_mismatch_rejected() {
        let seed = Seed::from_bytes(&[7u8; 32]).unwrap();
        let main = derive_account_key(&seed, Network::Bitcoin, Purpose::Bip48, 0, 0, AddressType::NativeSegwit).unwrap().xpub();
        let test = derive_account_key(&seed, Network::Testnet, Purpose::Bip48, 1, 0, AddressType::NativeSegwit).unwrap().xpub();
        let err = build_multisig_from_xpubs(&[main, test], 1, Chain::External, 0, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap_err();
        assert!(matches!(err, SigilError::Validation(ValidationError::NetworkMismatch { .. })));
    }

    #[test]
    fn parse_multisig_roundtrip() {
        let keys = three_keys();
        let ms = build_multisig_script(&keys, 2, AddressType::NativeSegwit, Network::Testnet, MAX_COSIGNERS).unwrap();
        let (m, parsed) = parse_multisig(ms.multisig_script()).unwrap();
        assert_eq!(m, 2);
        assert_eq!(parsed, ms.keys);
        assert!(parse_multisig(&ms.script_pubkey).is_none());
    }

    #[test]
    fn parse_address_checks_network() {
        let addr = parse_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Bitcoin).unwrap();
        assert_eq!(addr, Address::from_str("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu").unwrap().assume_checked());

        let err = parse_address("bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", Network::Testnet).unwrap_err();
        assert!(matches!(err, ValidationError::NetworkMismatch { .. }));

        let err = parse_address("not-an-address", Network::Bitcoin).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAddress(_)));
    }
}
