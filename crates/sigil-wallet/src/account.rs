//! Account model: derivation identity, cosigners, per-chain index state.
//!
//! An account's cryptographic identity (network, address type, keys and
//! threshold) is fixed at creation. Only the display name and the address
//! counters change afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, KeySource, Xpub};
use bitcoin::secp256k1;
use bitcoin::{Address, Network, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};

use sigil_core::derivation::{chain_path, derive_address_pubkey};
use sigil_core::error::{SigilError, ValidationError};
use sigil_core::script::{build_multisig_script, build_single_sig_script};
use sigil_core::weight::{script_pubkey_len, InputShape};
use sigil_core::{AddressType, Chain, PolicyId};

pub type AccountId = u32;

/// Where the private key of an account's local signer lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignerSource {
    /// Derived from the wallet's own seed.
    WalletSeed,
    /// Imported mnemonic, by vault secret id.
    ImportedMnemonic(u32),
    /// Imported extended private key, by vault secret id.
    ImportedXpriv(u32),
    /// No private key held.
    WatchOnly,
}

/// An extended public key with its BIP-32 origin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cosigner {
    pub xpub: Xpub,
    /// Fingerprint of the master key the xpub descends from.
    pub fingerprint: Fingerprint,
    /// Path from that master key to the xpub.
    pub origin: DerivationPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Cosigner {
    /// Output-descriptor key expression: `[fp/origin]xpub/<0;1>/*`.
    pub fn descriptor_key(&self) -> String {
        let steps: &[ChildNumber] = self.origin.as_ref();
        let mut key = format!("[{}", self.fingerprint);
        for step in steps {
            key.push('/');
            key.push_str(&step.to_string());
        }
        key.push(']');
        key.push_str(&self.xpub.to_string());
        key.push_str("/<0;1>/*");
        key
    }

    pub fn key_source(&self) -> KeySource {
        (self.fingerprint, self.origin.clone())
    }
}

/// Origin of the key this wallet signs with inside an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOrigin {
    pub fingerprint: Fingerprint,
    pub path: DerivationPath,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AccountKind {
    SingleSig { key: Cosigner },
    Multisig { threshold: usize, cosigners: Vec<Cosigner> },
}

/// Requested policy at account creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyConfig {
    SingleSig,
    Multisig { threshold: usize, cosigners: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountConfig {
    pub name: String,
    pub address_type: AddressType,
    pub policy: PolicyConfig,
}

impl AccountConfig {
    pub fn single_sig(name: impl Into<String>, address_type: AddressType) -> Self {
        Self {
            name: name.into(),
            address_type,
            policy: PolicyConfig::SingleSig,
        }
    }

    pub fn multisig(name: impl Into<String>, address_type: AddressType, threshold: usize, cosigners: usize) -> Self {
        Self {
            name: name.into(),
            address_type,
            policy: PolicyConfig::Multisig { threshold, cosigners },
        }
    }
}

/// Risk signal attached to a newly created multisig account. The engine
/// reports these; whether to block is the host's decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyRisk {
    /// Every key is required: losing any one strands the funds.
    NoKeyRedundancy { m: usize, n: usize },
    /// Any single key can spend alone.
    SingleKeySpend { n: usize },
}

impl fmt::Display for PolicyRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyRisk::NoKeyRedundancy { m, n } => {
                write!(f, "{m}-of-{n}: losing any one key permanently locks the funds")
            }
            PolicyRisk::SingleKeySpend { n } => {
                write!(f, "1-of-{n}: any single compromised key can spend")
            }
        }
    }
}

pub fn assess_policy(m: usize, n: usize) -> Vec<PolicyRisk> {
    let mut risks = Vec::new();
    if m == n {
        risks.push(PolicyRisk::NoKeyRedundancy { m, n });
    }
    if m == 1 && n > 1 {
        risks.push(PolicyRisk::SingleKeySpend { n });
    }
    risks
}

/// Address-index bookkeeping for one chain of one account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainState {
    /// Next index to issue. Indices below it have been handed out.
    pub next_index: u32,
    /// Indices with evidence of use (on-chain or reserved as change).
    #[serde(default)]
    pub used: BTreeSet<u32>,
}

impl ChainState {
    /// Issued addresses after the last used one.
    pub fn unused_tail(&self) -> u32 {
        let start = self.used.iter().next_back().map_or(0, |i| i + 1);
        self.next_index.saturating_sub(start)
    }

    /// Hand out the next index, skipping any already marked used.
    pub fn issue(&mut self) -> u32 {
        while self.used.contains(&self.next_index) {
            self.next_index += 1;
        }
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Record use of `index`. The counter never falls behind a used index.
    pub fn mark_used(&mut self, index: u32) -> bool {
        if index >= self.next_index {
            self.next_index = index + 1;
        }
        self.used.insert(index)
    }

    pub fn is_used(&self, index: u32) -> bool {
        self.used.contains(&index)
    }
}

/// A wallet account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub network: Network,
    pub address_type: AddressType,
    pub source: SignerSource,
    pub kind: AccountKind,
    /// The local signer's key origin, absent for watch-only accounts.
    pub local: Option<KeyOrigin>,
    pub external: ChainState,
    pub internal: ChainState,
}

/// A derived address with everything a PSBT needs to spend from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressInfo {
    pub account: AccountId,
    pub chain: Chain,
    pub index: u32,
    pub address: Address,
    pub script_pubkey: ScriptBuf,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    /// Every key that can sign for this script, with its origin.
    pub derivations: BTreeMap<secp256k1::PublicKey, KeySource>,
}

/// What a co-signer needs to add this wallet's key to a shared account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct XpubExport {
    pub xpub: Xpub,
    pub master_fingerprint: Fingerprint,
    pub origin: DerivationPath,
    pub address_type: AddressType,
    pub network: Network,
    /// `(m, n)` when exported for a multisig setup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<(usize, usize)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl XpubExport {
    pub fn to_cosigner(&self) -> Cosigner {
        Cosigner {
            xpub: self.xpub,
            fingerprint: self.master_fingerprint,
            origin: self.origin.clone(),
            label: self.label.clone(),
        }
    }
}

impl Account {
    pub fn is_multisig(&self) -> bool {
        matches!(self.kind, AccountKind::Multisig { .. })
    }

    pub fn is_watch_only(&self) -> bool {
        self.source == SignerSource::WatchOnly || self.local.is_none()
    }

    /// Signatures needed to spend one of this account's coins.
    pub fn required_signatures(&self) -> usize {
        match &self.kind {
            AccountKind::SingleSig { .. } => 1,
            AccountKind::Multisig { threshold, .. } => *threshold,
        }
    }

    pub fn cosigners(&self) -> Vec<&Cosigner> {
        match &self.kind {
            AccountKind::SingleSig { key } => vec![key],
            AccountKind::Multisig { cosigners, .. } => cosigners.iter().collect(),
        }
    }

    pub fn chain(&self, chain: Chain) -> &ChainState {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    /// Canonical output descriptor of the account. Multisig keys are sorted
    /// so every co-signer computes the same string.
    pub fn descriptor(&self) -> String {
        match &self.kind {
            AccountKind::SingleSig { key } => {
                let k = key.descriptor_key();
                match self.address_type {
                    AddressType::Legacy => format!("pkh({k})"),
                    AddressType::WrappedSegwit => format!("sh(wpkh({k}))"),
                    AddressType::NativeSegwit => format!("wpkh({k})"),
                }
            }
            AccountKind::Multisig { threshold, cosigners } => {
                let mut keys: Vec<String> = cosigners.iter().map(Cosigner::descriptor_key).collect();
                keys.sort();
                let inner = format!("sortedmulti({threshold},{})", keys.join(","));
                match self.address_type {
                    AddressType::Legacy => format!("sh({inner})"),
                    AddressType::WrappedSegwit => format!("sh(wsh({inner}))"),
                    AddressType::NativeSegwit => format!("wsh({inner})"),
                }
            }
        }
    }

    /// Identity of the spending policy, bound into every PSBT built for it.
    pub fn policy_id(&self) -> PolicyId {
        PolicyId::from_descriptor(&format!("{}#{}", self.descriptor(), self.network))
    }

    pub fn input_shape(&self) -> InputShape {
        match &self.kind {
            AccountKind::SingleSig { .. } => InputShape::SingleSig(self.address_type),
            AccountKind::Multisig { threshold, cosigners } => InputShape::Multisig {
                address_type: self.address_type,
                m: *threshold,
                n: cosigners.len(),
            },
        }
    }

    /// Length of this account's scriptPubKeys, for change-output sizing.
    pub fn script_pubkey_len(&self) -> usize {
        script_pubkey_len(self.address_type, self.is_multisig())
    }

    /// Derive the address at `chain/index`.
    pub fn address_at(&self, chain: Chain, index: u32, max_cosigners: usize) -> Result<AddressInfo, SigilError> {
        let relative = chain_path(chain, index)?;
        let mut derivations = BTreeMap::new();
        let mut pubkeys = Vec::new();
        for cosigner in self.cosigners() {
            let pk = derive_address_pubkey(&cosigner.xpub, chain, index)?;
            derivations.insert(pk.0, (cosigner.fingerprint, cosigner.origin.extend(&relative)));
            pubkeys.push(pk);
        }

        let (address, script_pubkey, redeem_script, witness_script) = match &self.kind {
            AccountKind::SingleSig { .. } => {
                let pk = pubkeys
                    .first()
                    .ok_or_else(|| ValidationError::InvalidConfig("account has no key".into()))?;
                let s = build_single_sig_script(pk, self.address_type, self.network);
                (s.address, s.script_pubkey, s.redeem_script, None)
            }
            AccountKind::Multisig { threshold, .. } => {
                let keys: Vec<PublicKey> = pubkeys.into_iter().map(PublicKey::from).collect();
                let s = build_multisig_script(&keys, *threshold, self.address_type, self.network, max_cosigners)?;
                (s.address, s.script_pubkey, s.redeem_script, s.witness_script)
            }
        };

        Ok(AddressInfo {
            account: self.id,
            chain,
            index,
            address,
            script_pubkey,
            redeem_script,
            witness_script,
            derivations,
        })
    }

    /// Export record for the local key.
    pub fn export(&self) -> Option<XpubExport> {
        let local = self.local.as_ref()?;
        let key = self
            .cosigners()
            .into_iter()
            .find(|c| c.fingerprint == local.fingerprint && c.origin == local.path)?;
        let threshold = match &self.kind {
            AccountKind::SingleSig { .. } => None,
            AccountKind::Multisig { threshold, cosigners } => Some((*threshold, cosigners.len())),
        };
        Some(XpubExport {
            xpub: key.xpub,
            master_fingerprint: key.fingerprint,
            origin: key.origin.clone(),
            address_type: self.address_type,
            network: self.network,
            threshold,
            label: Some(self.name.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sigil_core::constants::MAX_COSIGNERS;
    use sigil_core::derivation::{derive_account_key, Purpose};
    use sigil_core::Seed;

    fn cosigner(seed_byte: u8, account_index: u32) -> Cosigner {
        let seed = Seed::from_bytes(&[seed_byte; 32]).unwrap();
        let key = derive_account_key(&seed, Network::Testnet, Purpose::Bip48, 1, account_index, AddressType::NativeSegwit).unwrap();
        Cosigner {
            xpub: key.xpub(),
            fingerprint: key.master_fingerprint,
            origin: key.path.clone(),
            label: None,
        }
    }

    fn multisig_account(cosigners: Vec<Cosigner>) -> Account {
        let local = KeyOrigin {
            fingerprint: cosigners[0].fingerprint,
            path: cosigners[0].origin.clone(),
        };
        Account {
            id: 1,
            name: "vault".into(),
            network: Network::Testnet,
            address_type: AddressType::NativeSegwit,
            source: SignerSource::WalletSeed,
            kind: AccountKind::Multisig { threshold: 2, cosigners },
            local: Some(local),
            external: ChainState::default(),
            internal: ChainState::default(),
        }
    }

    #[test]
    fn chain_state_issue_and_gap() {
        let mut state = ChainState::default();
        assert_eq!(state.issue(), 0);
        assert_eq!(state.issue(), 1);
        assert_eq!(state.unused_tail(), 2);
        state.mark_used(1);
        assert_eq!(state.unused_tail(), 0);
        assert_eq!(state.issue(), 2);
    }

    #[test]
    fn mark_used_ahead_advances_counter() {
        let mut state = ChainState::default();
        state.mark_used(9);
        assert_eq!(state.next_index, 10);
        assert_eq!(state.issue(), 10);
        assert!(!state.mark_used(9));
    }

    #[test]
    fn policy_risks() {
        assert_eq!(assess_policy(2, 2), vec![PolicyRisk::NoKeyRedundancy { m: 2, n: 2 }]);
        assert_eq!(assess_policy(1, 3), vec![PolicyRisk::SingleKeySpend { n: 3 }]);
        assert!(assess_policy(2, 3).is_empty());
    }

    #[test]
    fn policy_id_ignores_cosigner_order() {
        let keys = vec![cosigner(1, 0), cosigner(2, 0), cosigner(3, 0)];
        let mut reversed = keys.clone();
        reversed.reverse();
        let a = multisig_account(keys);
        let b = multisig_account(reversed);
        assert_eq!(a.policy_id(), b.policy_id());
        assert_eq!(a.descriptor(), b.descriptor());
        assert!(a.descriptor().starts_with("wsh(sortedmulti(2,["));
    }

    #[test]
    fn multisig_address_matches_across_cosigner_order() {
        let keys = vec![cosigner(1, 0), cosigner(2, 0), cosigner(3, 0)];
        let mut reversed = keys.clone();
        reversed.reverse();
        let a = multisig_account(keys).address_at(Chain::External, 4, MAX_COSIGNERS).unwrap();
        let b = multisig_account(reversed).address_at(Chain::External, 4, MAX_COSIGNERS).unwrap();
        assert_eq!(a.address, b.address);
        assert_eq!(a.derivations.len(), 3);
        assert!(a.witness_script.is_some());
        assert!(a.script_pubkey.is_p2wsh());
    }

    #[test]
    fn derivations_carry_full_paths() {
        let account = multisig_account(vec![cosigner(1, 0), cosigner(2, 0)]);
        let info = account.address_at(Chain::Internal, 3, MAX_COSIGNERS).unwrap();
        for (_, (_, path)) in info.derivations {
            assert_eq!(path.to_string().trim_start_matches("m/"), "48'/1'/0'/2'/1/3");
        }
    }

    #[test]
    fn export_carries_threshold() {
        let account = multisig_account(vec![cosigner(1, 0), cosigner(2, 0), cosigner(3, 0)]);
        let export = account.export().unwrap();
        assert_eq!(export.threshold, Some((2, 3)));
        assert_eq!(export.to_cosigner().xpub, account.cosigners()[0].xpub);
    }

    #[test]
    fn descriptor_key_format() {
        let c = cosigner(1, 0);
        let key = c.descriptor_key();
        assert!(key.starts_with(&format!("[{}/48'/1'/0'/2']tpub", c.fingerprint)));
        assert!(key.ends_with("/<0;1>/*"));
    }
}
