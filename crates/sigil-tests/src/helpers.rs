//! Shared helpers for the integration tests.

use std::path::Path;

use bitcoin::hashes::Hash;
use bitcoin::{Address, Amount, Network, OutPoint, TxOut, Txid};
use sigil_core::derivation::{derive_account_key, derive_address_key};
use sigil_core::{AddressType, Chain, Purpose, Seed, Utxo};
use sigil_wallet::{
    AccountConfig, AccountId, AddressInfo, EngineConfig, KdfParams, SetupProgress, WalletEngine, XpubExport,
};
use tempfile::TempDir;

/// BIP-39 test-vector mnemonics, one per simulated cosigner.
pub const PHRASES: [&str; 4] = [
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about",
    "legal winner thank year wave sausage worth useful legal winner thank yellow",
    "letter advice cage absurd amount doctor acoustic avoid letter advice cage above",
    "zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo zoo wrong",
];

pub const PASSWORD: &[u8] = b"correct horse battery staple";

pub const NETWORK: Network = Network::Regtest;

/// Regtest config rooted at `dir` with a cheap KDF.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        network: NETWORK,
        kdf: KdfParams::light(),
        data_dir: dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

/// A fresh wallet restored from `phrase`, unlocked.
pub fn wallet(dir: &Path, phrase: &str) -> WalletEngine {
    WalletEngine::restore(test_config(dir), PASSWORD, phrase, "").unwrap()
}

/// Several independent wallets sharing one multisig account.
pub struct Cosigners {
    pub engines: Vec<WalletEngine>,
    /// The shared account's id in each wallet.
    pub accounts: Vec<AccountId>,
    pub exports: Vec<XpubExport>,
    _dirs: Vec<TempDir>,
}

/// Set up an `m`-of-`n` account across `n` wallets by exchanging xpub
/// exports, the way co-signers would out of band.
pub fn multisig_wallets(m: usize, n: usize, address_type: AddressType) -> Cosigners {
    assert!(n <= PHRASES.len());
    let dirs: Vec<TempDir> = (0..n).map(|_| tempfile::tempdir().unwrap()).collect();
    let engines: Vec<WalletEngine> = dirs.iter().zip(PHRASES).map(|(d, p)| wallet(d.path(), p)).collect();
    let config = AccountConfig::multisig("shared", address_type, m, n);

    let mut accounts = Vec::new();
    let mut exports = Vec::new();
    for engine in &engines {
        match engine.create_account(&config).unwrap() {
            SetupProgress::Pending { id, export: Some(export), .. } => {
                accounts.push(id);
                exports.push(export);
            }
            other => panic!("expected pending setup, got {other:?}"),
        }
    }

    for (i, engine) in engines.iter().enumerate() {
        let mut last = None;
        for (j, export) in exports.iter().enumerate() {
            if i != j {
                last = Some(engine.import_cosigner_xpub(accounts[i], export).unwrap());
            }
        }
        assert!(matches!(last, Some(SetupProgress::Complete(_))));
    }

    Cosigners {
        engines,
        accounts,
        exports,
        _dirs: dirs,
    }
}

/// A confirmed coin of `value` sats paying `address`.
pub fn coin(n: u8, address: &AddressInfo, value: u64) -> Utxo {
    Utxo::new(
        OutPoint::new(Txid::from_byte_array([n; 32]), 0),
        TxOut {
            value: Amount::from_sat(value),
            script_pubkey: address.script_pubkey.clone(),
        },
        6,
    )
}

/// An address outside every test wallet.
pub fn payee() -> Address {
    let seed = Seed::from_bytes(&[0x5a; 32]).unwrap();
    let key = derive_account_key(&seed, NETWORK, Purpose::Bip84, 1, 0, AddressType::NativeSegwit).unwrap();
    let child = derive_address_key(&key, Chain::External, 0).unwrap();
    Address::p2wpkh(&child.public_key, NETWORK)
}
