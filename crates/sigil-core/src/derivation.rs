//! Seed management and deterministic BIP-32 key derivation.
//!
//! Account keys follow the standard hardened account-path conventions:
//!
//! | policy      | family          | path                            |
//! |-------------|-----------------|---------------------------------|
//! | single-sig  | legacy          | `m/44'/coin'/account'`          |
//! | single-sig  | wrapped segwit  | `m/49'/coin'/account'`          |
//! | single-sig  | native segwit   | `m/84'/coin'/account'`          |
//! | multisig    | legacy          | `m/45'/coin'/account'`          |
//! | multisig    | wrapped segwit  | `m/48'/coin'/account'/1'`       |
//! | multisig    | native segwit   | `m/48'/coin'/account'/2'`       |
//!
//! Address keys hang below the account key at `chain/index` (both
//! non-hardened) so that co-signers can derive each other's address keys
//! from exported xpubs alone.

use std::fmt;
use std::sync::OnceLock;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{CompressedPublicKey, Network, PrivateKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{HARDENED_OFFSET, MAX_SEED_LEN, MIN_SEED_LEN};
use crate::error::{SigilError, ValidationError};
use crate::types::{AddressType, Chain};

/// Shared verification/signing context. Immutable once built.
pub fn secp() -> &'static Secp256k1<All> {
    static SECP: OnceLock<Secp256k1<All>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::new)
}

/// Root seed bytes (16 to 64 bytes) from which every wallet key derives.
///
/// Secret material is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: Vec<u8>,
}

impl Seed {
    /// Generate a random 64-byte seed from the OS cryptographic RNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = vec![0u8; MAX_SEED_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wrap raw seed bytes, rejecting lengths outside the BIP-32 bounds.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        if !(MIN_SEED_LEN..=MAX_SEED_LEN).contains(&bytes.len()) {
            return Err(ValidationError::InvalidSeed(format!(
                "seed must be {MIN_SEED_LEN}..={MAX_SEED_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Get the raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Clone for Seed {
    fn clone(&self) -> Self {
        Self {
            bytes: self.bytes.clone(),
        }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// BIP-43 purpose code of an account path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Purpose {
    /// BIP-44: single-sig P2PKH.
    Bip44,
    /// BIP-45: legacy P2SH multisig.
    Bip45,
    /// BIP-48: segwit multisig, with a script-type suffix.
    Bip48,
    /// BIP-49: single-sig P2SH-P2WPKH.
    Bip49,
    /// BIP-84: single-sig P2WPKH.
    Bip84,
}

impl Purpose {
    pub fn single_sig(address_type: AddressType) -> Self {
        match address_type {
            AddressType::Legacy => Purpose::Bip44,
            AddressType::WrappedSegwit => Purpose::Bip49,
            AddressType::NativeSegwit => Purpose::Bip84,
        }
    }

    pub fn multisig(address_type: AddressType) -> Self {
        match address_type {
            AddressType::Legacy => Purpose::Bip45,
            AddressType::WrappedSegwit | AddressType::NativeSegwit => Purpose::Bip48,
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Purpose::Bip44 => 44,
            Purpose::Bip45 => 45,
            Purpose::Bip48 => 48,
            Purpose::Bip49 => 49,
            Purpose::Bip84 => 84,
        }
    }
}

/// An account-level extended private key together with its origin.
#[derive(Clone)]
pub struct AccountKey {
    pub xpriv: Xpriv,
    pub master_fingerprint: Fingerprint,
    /// Full path from the master key to this account key.
    pub path: DerivationPath,
}

impl AccountKey {
    pub fn xpub(&self) -> Xpub {
        Xpub::from_priv(secp(), &self.xpriv)
    }

    /// BIP-32 origin of the account key: master fingerprint and path.
    pub fn key_source(&self) -> KeySource {
        (self.master_fingerprint, self.path.clone())
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey")
            .field("master_fingerprint", &self.master_fingerprint)
            .field("path", &self.path.to_string())
            .finish_non_exhaustive()
    }
}

/// Key material for one address: the keypair and its full derivation path.
#[derive(Clone)]
pub struct DerivedKey {
    pub path: DerivationPath,
    pub master_fingerprint: Fingerprint,
    pub private_key: PrivateKey,
    pub public_key: CompressedPublicKey,
}

impl DerivedKey {
    pub fn key_source(&self) -> KeySource {
        (self.master_fingerprint, self.path.clone())
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("path", &self.path.to_string())
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn hardened(index: u32) -> Result<ChildNumber, ValidationError> {
    if index >= HARDENED_OFFSET {
        return Err(ValidationError::DerivationOverflow { index });
    }
    ChildNumber::from_hardened_idx(index).map_err(|_| ValidationError::DerivationOverflow { index })
}

fn normal(index: u32) -> Result<ChildNumber, ValidationError> {
    if index >= HARDENED_OFFSET {
        return Err(ValidationError::DerivationOverflow { index });
    }
    ChildNumber::from_normal_idx(index).map_err(|_| ValidationError::DerivationOverflow { index })
}

/// The hardened account path for a purpose/coin/account triple.
pub fn account_path(
    purpose: Purpose,
    coin_type: u32,
    account_index: u32,
    address_type: AddressType,
) -> Result<DerivationPath, ValidationError> {
    let mut path = vec![
        hardened(purpose.code())?,
        hardened(coin_type)?,
        hardened(account_index)?,
    ];
    if purpose == Purpose::Bip48 {
        let script_type = match address_type {
            AddressType::WrappedSegwit => 1,
            AddressType::NativeSegwit => 2,
            AddressType::Legacy => {
                return Err(ValidationError::InvalidConfig(
                    "BIP-48 paths have no legacy script type".into(),
                ))
            }
        };
        path.push(hardened(script_type)?);
    }
    Ok(DerivationPath::from(path))
}

/// Relative `chain/index` path below an account key.
pub fn chain_path(chain: Chain, index: u32) -> Result<DerivationPath, ValidationError> {
    Ok(DerivationPath::from(vec![normal(chain.index())?, normal(index)?]))
}

/// The BIP-32 master key for a seed.
pub fn master_key(seed: &Seed, network: Network) -> Result<Xpriv, SigilError> {
    Ok(Xpriv::new_master(network, seed.as_bytes())?)
}

/// Fingerprint of the master key: the first four bytes of HASH160(master pubkey).
pub fn master_fingerprint(seed: &Seed, network: Network) -> Result<Fingerprint, SigilError> {
    Ok(master_key(seed, network)?.fingerprint(secp()))
}

/// Derive the account extended key along the hardened account path.
pub fn derive_account_key(
    seed: &Seed,
    network: Network,
    purpose: Purpose,
    coin_type: u32,
    account_index: u32,
    address_type: AddressType,
) -> Result<AccountKey, SigilError> {
    let master = master_key(seed, network)?;
    derive_account_from_master(&master, purpose, coin_type, account_index, address_type)
}

/// Derive the account extended key from an already-built master key, as
/// for an imported extended private key.
pub fn derive_account_from_master(
    master: &Xpriv,
    purpose: Purpose,
    coin_type: u32,
    account_index: u32,
    address_type: AddressType,
) -> Result<AccountKey, SigilError> {
    let path = account_path(purpose, coin_type, account_index, address_type)?;
    let xpriv = master.derive_priv(secp(), &path)?;
    Ok(AccountKey {
        xpriv,
        master_fingerprint: master.fingerprint(secp()),
        path,
    })
}

/// The account xpub, for export to co-signers or watch-only hosts.
pub fn derive_account_xpub(
    seed: &Seed,
    network: Network,
    purpose: Purpose,
    coin_type: u32,
    account_index: u32,
    address_type: AddressType,
) -> Result<Xpub, SigilError> {
    Ok(derive_account_key(seed, network, purpose, coin_type, account_index, address_type)?.xpub())
}

/// Derive the keypair for `chain/index` under an account key.
pub fn derive_address_key(
    account: &AccountKey,
    chain: Chain,
    index: u32,
) -> Result<DerivedKey, SigilError> {
    let relative = chain_path(chain, index)?;
    let child = account.xpriv.derive_priv(secp(), &relative)?;
    let private_key = child.to_priv();
    let public_key = CompressedPublicKey(child.private_key.public_key(secp()));
    Ok(DerivedKey {
        path: account.path.extend(&relative),
        master_fingerprint: account.master_fingerprint,
        private_key,
        public_key,
    })
}

/// Derive the public key for `chain/index` from an account xpub.
pub fn derive_address_pubkey(
    account_xpub: &Xpub,
    chain: Chain,
    index: u32,
) -> Result<CompressedPublicKey, SigilError> {
    let relative = chain_path(chain, index)?;
    let child = account_xpub.derive_pub(secp(), &relative)?;
    Ok(CompressedPublicKey(child.public_key))
}

/// The part of `full` below `prefix`, if `full` starts with `prefix`.
pub fn relative_path(full: &DerivationPath, prefix: &DerivationPath) -> Option<DerivationPath> {
    let full: &[ChildNumber] = full.as_ref();
    let prefix: &[ChildNumber] = prefix.as_ref();
    if full.len() < prefix.len() || &full[..prefix.len()] != prefix {
        return None;
    }
    Some(DerivationPath::from(full[prefix.len()..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    // BIP-32 test vector 1 seed.
    const VECTOR1_SEED: &str = "000102030405060708090a0b0c0d0e0f";

    fn test_seed() -> Seed {
        Seed::from_bytes(&hex::decode(VECTOR1_SEED).unwrap()).unwrap()
    }

    #[test]
    fn seed_length_bounds() {
        assert!(Seed::from_bytes(&[0u8; 15]).is_err());
        assert!(Seed::from_bytes(&[0u8; 16]).is_ok());
        assert!(Seed::from_bytes(&[0u8; 64]).is_ok());
        let err = Seed::from_bytes(&[0u8; 65]).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSeed(_)));
    }

    #[test]
    fn seed_debug_hides_bytes() {
        let seed = Seed::from_bytes(&[0xAB; 32]).unwrap();
        let debug = format!("{seed:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("ab"));
    }

    #[test]
    fn seed_generate_unique() {
        assert_ne!(Seed::generate().as_bytes(), Seed::generate().as_bytes());
    }

    #[test]
    fn master_matches_bip32_vector() {
        let master = master_key(&test_seed(), Network::Bitcoin).unwrap();
        assert_eq!(
            master.to_string(),
            "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi"
        );
        assert_eq!(
            master_fingerprint(&test_seed(), Network::Bitcoin).unwrap().to_string(),
            "3442193e"
        );
    }

    #[test]
    fn account_paths_per_purpose() {
        let p = account_path(Purpose::Bip84, 0, 0, AddressType::NativeSegwit).unwrap();
        assert_eq!(p, DerivationPath::from_str("m/84'/0'/0'").unwrap());

        let p = account_path(Purpose::Bip48, 1, 3, AddressType::NativeSegwit).unwrap();
        assert_eq!(p, DerivationPath::from_str("m/48'/1'/3'/2'").unwrap());

        let p = account_path(Purpose::Bip48, 1, 0, AddressType::WrappedSegwit).unwrap();
        assert_eq!(p, DerivationPath::from_str("m/48'/1'/0'/1'").unwrap());

        let p = account_path(Purpose::Bip45, 0, 0, AddressType::Legacy).unwrap();
        assert_eq!(p, DerivationPath::from_str("m/45'/0'/0'").unwrap());
    }

    #[test]
    fn bip48_legacy_rejected() {
        let err = account_path(Purpose::Bip48, 0, 0, AddressType::Legacy).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidConfig(_)));
    }

    #[test]
    fn hardened_overflow_rejected() {
        let err = derive_account_key(
            &test_seed(),
            Network::Testnet,
            Purpose::Bip84,
            1,
            HARDENED_OFFSET,
            AddressType::NativeSegwit,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SigilError::Validation(ValidationError::DerivationOverflow { index: HARDENED_OFFSET })
        );
    }

    #[test]
    fn address_index_overflow_rejected() {
        let account = derive_account_key(
            &test_seed(),
            Network::Testnet,
            Purpose::Bip84,
            1,
            0,
            AddressType::NativeSegwit,
        )
        .unwrap();
        let err = derive_address_key(&account, Chain::External, u32::MAX).unwrap_err();
        assert!(matches!(
            err,
            SigilError::Validation(ValidationError::DerivationOverflow { .. })
        ));
    }

    #[test]
    fn derivation_is_deterministic() {
        let seed = test_seed();
        let a = derive_account_key(&seed, Network::Testnet, Purpose::Bip84, 1, 0, AddressType::NativeSegwit).unwrap();
        let b = derive_account_key(&seed.clone(), Network::Testnet, Purpose::Bip84, 1, 0, AddressType::NativeSegwit).unwrap();
        let ka = derive_address_key(&a, Chain::External, 7).unwrap();
        let kb = derive_address_key(&b, Chain::External, 7).unwrap();
        assert_eq!(ka.public_key, kb.public_key);
        assert_eq!(ka.private_key, kb.private_key);
        assert_eq!(ka.path, DerivationPath::from_str("m/84'/1'/0'/0/7").unwrap());
    }

    #[test]
    fn xpub_derivation_matches_private() {
        let account = derive_account_key(&test_seed(), Network::Testnet, Purpose::Bip48, 1, 0, AddressType::NativeSegwit).unwrap();
        let xpub = account.xpub();
        for index in 0..5 {
            let private = derive_address_key(&account, Chain::Internal, index).unwrap();
            let public = derive_address_pubkey(&xpub, Chain::Internal, index).unwrap();
            assert_eq!(private.public_key, public);
        }
    }

    #[test]
    fn chains_produce_distinct_keys() {
        let account = derive_account_key(&test_seed(), Network::Testnet, Purpose::Bip84, 1, 0, AddressType::NativeSegwit).unwrap();
        let ext = derive_address_key(&account, Chain::External, 0).unwrap();
        let int = derive_address_key(&account, Chain::Internal, 0).unwrap();
        assert_ne!(ext.public_key, int.public_key);
    }

    #[test]
    fn relative_path_strips_prefix() {
        let full = DerivationPath::from_str("m/48'/1'/0'/2'/0/5").unwrap();
        let prefix = DerivationPath::from_str("m/48'/1'/0'/2'").unwrap();
        assert_eq!(
            relative_path(&full, &prefix),
            Some(DerivationPath::from_str("m/0/5").unwrap())
        );
        let other = DerivationPath::from_str("m/84'/1'/0'").unwrap();
        assert_eq!(relative_path(&full, &other), None);
    }
}
