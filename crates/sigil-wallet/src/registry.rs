//! AccountRegistry: the set of accounts, staged multisig setups and
//! address-index bookkeeping.
//!
//! Each account holds one mutex per chain. Every address issued on a chain
//! is handed out under that chain's lock, so concurrent callers never
//! receive the same index. Account creation is serialized by the setup lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bitcoin::bip32::{ChildNumber, Xpriv};
use bitcoin::{Network, NetworkKind, Script, ScriptBuf};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use sigil_core::constants::coin_type;
use sigil_core::derivation::{derive_account_from_master, derive_account_key, master_key, secp, AccountKey, Purpose};
use sigil_core::error::{CryptoError, ResourceError, SigilError, StateError, ValidationError};
use sigil_core::{AddressType, Chain, Seed};

use crate::account::{
    assess_policy, Account, AccountConfig, AccountId, AccountKind, AddressInfo, ChainState, Cosigner,
    KeyOrigin, PolicyConfig, PolicyRisk, SignerSource, XpubExport,
};

/// External evidence of address use, supplied by the chain-data
/// collaborator.
#[cfg_attr(test, mockall::automock)]
pub trait UsageOracle {
    fn is_used(&self, script_pubkey: &Script) -> bool;
}

/// Private key material an account can be derived from.
pub enum KeyMaterial<'a> {
    Seed(&'a Seed),
    /// Master or account-level extended private key.
    Xpriv(&'a Xpriv),
}

impl KeyMaterial<'_> {
    /// Rebuild the account key recorded as `origin` from this material.
    pub fn account_key(&self, origin: &KeyOrigin, network: Network) -> Result<AccountKey, SigilError> {
        let root = match self {
            KeyMaterial::Seed(seed) => master_key(seed, network)?,
            KeyMaterial::Xpriv(xpriv) => **xpriv,
        };
        let fingerprint = root.fingerprint(secp());
        if fingerprint != origin.fingerprint {
            return Err(CryptoError::KeyDerivation(format!(
                "key {fingerprint} does not match account key {}",
                origin.fingerprint
            ))
            .into());
        }
        let xpriv = if root.depth == 0 { root.derive_priv(secp(), &origin.path)? } else { root };
        Ok(AccountKey {
            xpriv,
            master_fingerprint: origin.fingerprint,
            path: origin.path.clone(),
        })
    }
}

/// Where a script lives in the wallet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScriptOwner {
    pub account: AccountId,
    pub chain: Chain,
    pub index: u32,
}

/// A multisig account awaiting cosigner xpubs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultisigSetup {
    pub id: AccountId,
    pub name: String,
    pub network: Network,
    pub address_type: AddressType,
    pub threshold: usize,
    pub total: usize,
    pub source: SignerSource,
    pub local: Option<KeyOrigin>,
    pub cosigners: Vec<Cosigner>,
}

impl MultisigSetup {
    fn export(&self) -> Option<XpubExport> {
        let local = self.local.as_ref()?;
        let key = self
            .cosigners
            .iter()
            .find(|c| c.fingerprint == local.fingerprint && c.origin == local.path)?;
        Some(XpubExport {
            xpub: key.xpub,
            master_fingerprint: key.fingerprint,
            origin: key.origin.clone(),
            address_type: self.address_type,
            network: self.network,
            threshold: Some((self.threshold, self.total)),
            label: Some(self.name.clone()),
        })
    }
}

/// A newly created account with its first receive address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountCreated {
    pub account: Account,
    pub first_address: AddressInfo,
    pub risks: Vec<PolicyRisk>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetupProgress {
    /// Waiting for more cosigners. `export` is the local key to share.
    Pending {
        id: AccountId,
        have: usize,
        need: usize,
        export: Option<XpubExport>,
    },
    Complete(AccountCreated),
}

/// Result of a discovery scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub external_used: Vec<u32>,
    pub internal_used: Vec<u32>,
}

/// Persisted registry state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub accounts: Vec<Account>,
    pub setups: Vec<MultisigSetup>,
}

struct AccountEntry {
    account: RwLock<Account>,
    external: Mutex<ChainState>,
    internal: Mutex<ChainState>,
}

impl AccountEntry {
    fn new(account: Account) -> Self {
        Self {
            external: Mutex::new(account.external.clone()),
            internal: Mutex::new(account.internal.clone()),
            account: RwLock::new(account),
        }
    }

    fn chain(&self, chain: Chain) -> &Mutex<ChainState> {
        match chain {
            Chain::External => &self.external,
            Chain::Internal => &self.internal,
        }
    }

    fn snapshot(&self) -> Account {
        let mut account = self.account.read().clone();
        account.external = self.external.lock().clone();
        account.internal = self.internal.lock().clone();
        account
    }
}

pub struct AccountRegistry {
    network: Network,
    gap_limit: u32,
    max_cosigners: usize,
    accounts: RwLock<BTreeMap<AccountId, Arc<AccountEntry>>>,
    setups: Mutex<BTreeMap<AccountId, MultisigSetup>>,
    owners: RwLock<HashMap<ScriptBuf, ScriptOwner>>,
}

impl AccountRegistry {
    pub fn new(network: Network, gap_limit: u32, max_cosigners: usize) -> Self {
        Self {
            network,
            gap_limit,
            max_cosigners,
            accounts: RwLock::new(BTreeMap::new()),
            setups: Mutex::new(BTreeMap::new()),
            owners: RwLock::new(HashMap::new()),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn gap_limit(&self) -> u32 {
        self.gap_limit
    }

    pub fn max_cosigners(&self) -> usize {
        self.max_cosigners
    }

    /// Create an account from private key material.
    ///
    /// Single-sig accounts are created immediately. Multisig accounts start a
    /// setup that completes once every cosigner xpub has been imported.
    pub fn create_account(
        &self,
        config: &AccountConfig,
        material: KeyMaterial<'_>,
        source: SignerSource,
    ) -> Result<SetupProgress, SigilError> {
        let mut setups = self.setups.lock();
        let id = self.next_id(&setups);

        match config.policy {
            PolicyConfig::SingleSig => {
                let purpose = Purpose::single_sig(config.address_type);
                let index = self.next_account_index(&setups, purpose, source);
                let key = self.derive_account(&material, purpose, index, config.address_type)?;
                let account = Account {
                    id,
                    name: config.name.clone(),
                    network: self.network,
                    address_type: config.address_type,
                    source,
                    kind: AccountKind::SingleSig { key: cosigner_of(&key) },
                    local: Some(origin_of(&key)),
                    external: ChainState::default(),
                    internal: ChainState::default(),
                };
                Ok(SetupProgress::Complete(self.insert(account, Vec::new())?))
            }
            PolicyConfig::Multisig { threshold, cosigners } => {
                self.check_threshold(threshold, cosigners)?;
                let purpose = Purpose::multisig(config.address_type);
                let index = self.next_account_index(&setups, purpose, source);
                let key = self.derive_account(&material, purpose, index, config.address_type)?;
                let setup = MultisigSetup {
                    id,
                    name: config.name.clone(),
                    network: self.network,
                    address_type: config.address_type,
                    threshold,
                    total: cosigners,
                    source,
                    local: Some(origin_of(&key)),
                    cosigners: vec![cosigner_of(&key)],
                };
                info!(account = id, threshold, cosigners, "registry: multisig setup started");
                self.advance_setup(&mut setups, setup)
            }
        }
    }

    /// Import a watch-only account from exported xpubs: one for single-sig,
    /// all `n` for multisig.
    pub fn import_watch_only(
        &self,
        config: &AccountConfig,
        exports: &[XpubExport],
    ) -> Result<SetupProgress, SigilError> {
        let mut setups = self.setups.lock();
        let id = self.next_id(&setups);

        match config.policy {
            PolicyConfig::SingleSig => {
                let [export] = exports else {
                    return Err(ValidationError::InvalidConfig(format!(
                        "single-sig import takes one xpub, got {}",
                        exports.len()
                    ))
                    .into());
                };
                self.check_export(export, config.address_type, None)?;
                let account = Account {
                    id,
                    name: config.name.clone(),
                    network: self.network,
                    address_type: config.address_type,
                    source: SignerSource::WatchOnly,
                    kind: AccountKind::SingleSig { key: export.to_cosigner() },
                    local: None,
                    external: ChainState::default(),
                    internal: ChainState::default(),
                };
                Ok(SetupProgress::Complete(self.insert(account, Vec::new())?))
            }
            PolicyConfig::Multisig { threshold, cosigners } => {
                self.check_threshold(threshold, cosigners)?;
                let mut setup = MultisigSetup {
                    id,
                    name: config.name.clone(),
                    network: self.network,
                    address_type: config.address_type,
                    threshold,
                    total: cosigners,
                    source: SignerSource::WatchOnly,
                    local: None,
                    cosigners: Vec::new(),
                };
                for export in exports {
                    self.add_cosigner(&mut setup, export)?;
                }
                self.advance_setup(&mut setups, setup)
            }
        }
    }

    /// Add a cosigner's xpub to a pending multisig setup. The account is
    /// created once all `n` cosigners are present.
    pub fn import_cosigner_xpub(&self, id: AccountId, export: &XpubExport) -> Result<SetupProgress, SigilError> {
        let mut setups = self.setups.lock();
        let Some(mut setup) = setups.get(&id).cloned() else {
            if self.accounts.read().contains_key(&id) {
                return Err(ValidationError::ConfigMismatch(format!("account {id} already has all cosigners")).into());
            }
            return Err(ValidationError::UnknownAccount(id).into());
        };
        self.add_cosigner(&mut setup, export)?;
        info!(
            account = id,
            fingerprint = %export.master_fingerprint,
            have = setup.cosigners.len(),
            need = setup.total,
            "registry: cosigner imported"
        );
        self.advance_setup(&mut setups, setup)
    }

    /// Issue the next address on `chain`.
    ///
    /// Internal-chain addresses are change outputs and are marked used on
    /// issue. On the external chain, issuing fails once `gap_limit` issued
    /// addresses in a row remain unused.
    pub fn next_address(&self, id: AccountId, chain: Chain) -> Result<AddressInfo, SigilError> {
        self.check_not_pending(id)?;
        let entry = self.entry(id)?;
        let account = entry.account.read().clone();

        let mut state = entry.chain(chain).lock();
        if chain == Chain::External && state.unused_tail() >= self.gap_limit {
            warn!(account = id, limit = self.gap_limit, "registry: gap limit reached");
            return Err(ResourceError::GapLimitExceeded { limit: self.gap_limit }.into());
        }

        let mut next = state.clone();
        let index = next.issue();
        let info = account.address_at(chain, index, self.max_cosigners)?;
        if chain == Chain::Internal {
            next.mark_used(index);
        }
        *state = next;
        drop(state);

        self.register(&info);
        debug!(account = id, %chain, index, address = %info.address, "registry: address issued");
        Ok(info)
    }

    /// Fresh change address from the internal chain.
    pub fn change_address(&self, id: AccountId) -> Result<AddressInfo, SigilError> {
        self.next_address(id, Chain::Internal)
    }

    /// Re-derive an already issued address.
    pub fn address_at(&self, id: AccountId, chain: Chain, index: u32) -> Result<AddressInfo, SigilError> {
        let entry = self.entry(id)?;
        let account = entry.account.read().clone();
        account.address_at(chain, index, self.max_cosigners)
    }

    /// Scan both chains from index 0 until `gap_limit` consecutive addresses
    /// show no use, marking every used address found.
    pub fn discover(&self, id: AccountId, oracle: &dyn UsageOracle) -> Result<DiscoveryReport, SigilError> {
        self.check_not_pending(id)?;
        let entry = self.entry(id)?;
        let account = entry.account.read().clone();
        let mut report = DiscoveryReport::default();

        for chain in [Chain::External, Chain::Internal] {
            let mut state = entry.chain(chain).lock();
            let mut found = Vec::new();
            let mut gap = 0;
            let mut index = 0u32;
            while gap < self.gap_limit {
                let info = account.address_at(chain, index, self.max_cosigners)?;
                if oracle.is_used(&info.script_pubkey) {
                    state.mark_used(index);
                    self.register(&info);
                    found.push(index);
                    gap = 0;
                } else {
                    gap += 1;
                }
                index += 1;
            }
            debug!(account = id, %chain, scanned = index, used = found.len(), "registry: discovery done");
            match chain {
                Chain::External => report.external_used = found,
                Chain::Internal => report.internal_used = found,
            }
        }
        Ok(report)
    }

    /// Apply external evidence that `script_pubkey` has been used.
    /// Returns `None` if the script is not ours.
    pub fn mark_used(&self, script_pubkey: &Script) -> Result<Option<ScriptOwner>, SigilError> {
        let Some(owner) = self.owner_of(script_pubkey) else {
            return Ok(None);
        };
        self.mark_used_index(owner.account, owner.chain, owner.index)?;
        Ok(Some(owner))
    }

    pub fn mark_used_index(&self, id: AccountId, chain: Chain, index: u32) -> Result<(), SigilError> {
        let entry = self.entry(id)?;
        let account = entry.account.read().clone();
        let info = account.address_at(chain, index, self.max_cosigners)?;
        if entry.chain(chain).lock().mark_used(index) {
            debug!(account = id, %chain, index, "registry: address marked used");
        }
        self.register(&info);
        Ok(())
    }

    pub fn owner_of(&self, script_pubkey: &Script) -> Option<ScriptOwner> {
        self.owners.read().get(script_pubkey).copied()
    }

    pub fn export_xpub(&self, id: AccountId) -> Result<XpubExport, SigilError> {
        if let Some(setup) = self.setups.lock().get(&id) {
            return setup.export().ok_or_else(|| StateError::WatchOnly(id).into());
        }
        self.entry(id)?
            .account
            .read()
            .export()
            .ok_or_else(|| StateError::WatchOnly(id).into())
    }

    pub fn rename_account(&self, id: AccountId, name: &str) -> Result<(), SigilError> {
        if let Some(setup) = self.setups.lock().get_mut(&id) {
            setup.name = name.to_string();
            return Ok(());
        }
        self.entry(id)?.account.write().name = name.to_string();
        Ok(())
    }

    pub fn account(&self, id: AccountId) -> Result<Account, SigilError> {
        Ok(self.entry(id)?.snapshot())
    }

    pub fn accounts(&self) -> Vec<Account> {
        self.accounts.read().values().map(|e| e.snapshot()).collect()
    }

    pub fn setup(&self, id: AccountId) -> Option<MultisigSetup> {
        self.setups.lock().get(&id).cloned()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            accounts: self.accounts(),
            setups: self.setups.lock().values().cloned().collect(),
        }
    }

    /// Replace all state with `snapshot` and rebuild the script index.
    pub fn load(&self, snapshot: RegistrySnapshot) -> Result<(), SigilError> {
        let mut owners = HashMap::new();
        let mut accounts = BTreeMap::new();
        for account in snapshot.accounts {
            if account.network != self.network {
                return Err(ValidationError::NetworkMismatch {
                    expected: self.network.to_string(),
                    found: account.network.to_string(),
                }
                .into());
            }
            for chain in [Chain::External, Chain::Internal] {
                for index in 0..account.chain(chain).next_index {
                    let info = account.address_at(chain, index, self.max_cosigners)?;
                    owners.insert(info.script_pubkey, ScriptOwner { account: account.id, chain, index });
                }
            }
            accounts.insert(account.id, Arc::new(AccountEntry::new(account)));
        }
        let setups = snapshot.setups.into_iter().map(|s| (s.id, s)).collect();

        *self.accounts.write() = accounts;
        *self.setups.lock() = setups;
        *self.owners.write() = owners;
        Ok(())
    }

    /// Drop all in-memory account state.
    pub fn clear(&self) {
        self.accounts.write().clear();
        self.setups.lock().clear();
        self.owners.write().clear();
    }

    fn entry(&self, id: AccountId) -> Result<Arc<AccountEntry>, SigilError> {
        self.accounts
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownAccount(id).into())
    }

    fn check_not_pending(&self, id: AccountId) -> Result<(), SigilError> {
        match self.setups.lock().get(&id) {
            Some(setup) => Err(StateError::SetupIncomplete {
                have: setup.cosigners.len(),
                need: setup.total,
            }
            .into()),
            None => Ok(()),
        }
    }

    fn register(&self, info: &AddressInfo) {
        self.owners.write().insert(
            info.script_pubkey.clone(),
            ScriptOwner { account: info.account, chain: info.chain, index: info.index },
        );
    }

    fn next_id(&self, setups: &BTreeMap<AccountId, MultisigSetup>) -> AccountId {
        let accounts = self.accounts.read();
        accounts
            .keys()
            .chain(setups.keys())
            .max()
            .map_or(0, |id| id + 1)
    }

    /// Next unused BIP-44 account index for this purpose and key source.
    fn next_account_index(
        &self,
        setups: &BTreeMap<AccountId, MultisigSetup>,
        purpose: Purpose,
        source: SignerSource,
    ) -> u32 {
        let purpose = ChildNumber::Hardened { index: purpose.code() };
        let accounts = self.accounts.read();
        let in_accounts = accounts.values().filter_map(|e| {
            let a = e.account.read();
            (a.source == source).then(|| a.local.clone()).flatten()
        });
        let in_setups = setups
            .values()
            .filter(|s| s.source == source)
            .filter_map(|s| s.local.clone());

        in_accounts
            .chain(in_setups)
            .filter_map(|origin| {
                let path: &[ChildNumber] = origin.path.as_ref();
                match path {
                    [p, _, ChildNumber::Hardened { index }, ..] if *p == purpose => Some(*index + 1),
                    _ => None,
                }
            })
            .max()
            .unwrap_or(0)
    }

    fn derive_account(
        &self,
        material: &KeyMaterial<'_>,
        purpose: Purpose,
        account_index: u32,
        address_type: AddressType,
    ) -> Result<AccountKey, SigilError> {
        let coin = coin_type(self.network);
        match material {
            KeyMaterial::Seed(seed) => {
                derive_account_key(seed, self.network, purpose, coin, account_index, address_type)
            }
            KeyMaterial::Xpriv(xpriv) if xpriv.depth == 0 => {
                derive_account_from_master(xpriv, purpose, coin, account_index, address_type)
            }
            KeyMaterial::Xpriv(xpriv) => Ok(AccountKey {
                xpriv: **xpriv,
                master_fingerprint: xpriv.fingerprint(secp()),
                path: bitcoin::bip32::DerivationPath::master(),
            }),
        }
    }

    fn check_threshold(&self, m: usize, n: usize) -> Result<(), SigilError> {
        if n == 0 || m == 0 || m > n {
            return Err(ValidationError::InvalidThreshold { m, n }.into());
        }
        if n > self.max_cosigners {
            return Err(ValidationError::TooManyCosigners { n, max: self.max_cosigners }.into());
        }
        Ok(())
    }

    fn check_export(
        &self,
        export: &XpubExport,
        address_type: AddressType,
        threshold: Option<(usize, usize)>,
    ) -> Result<(), SigilError> {
        if export.network != self.network {
            return Err(ValidationError::ConfigMismatch(format!(
                "cosigner network {} differs from {}",
                export.network, self.network
            ))
            .into());
        }
        if export.xpub.network != NetworkKind::from(self.network) {
            return Err(ValidationError::NetworkMismatch {
                expected: format!("{:?}", NetworkKind::from(self.network)),
                found: format!("{:?}", export.xpub.network),
            }
            .into());
        }
        if export.address_type != address_type {
            return Err(ValidationError::ConfigMismatch(format!(
                "cosigner address type {} differs from {address_type}",
                export.address_type
            ))
            .into());
        }
        if let (Some(theirs), Some(ours)) = (export.threshold, threshold) {
            if theirs != ours {
                return Err(ValidationError::ConfigMismatch(format!(
                    "cosigner expects {}-of-{}, account is {}-of-{}",
                    theirs.0, theirs.1, ours.0, ours.1
                ))
                .into());
            }
        }
        Ok(())
    }

    fn add_cosigner(&self, setup: &mut MultisigSetup, export: &XpubExport) -> Result<(), SigilError> {
        self.check_export(export, setup.address_type, Some((setup.threshold, setup.total)))?;
        if setup.cosigners.iter().any(|c| c.xpub == export.xpub) {
            return Err(ValidationError::DuplicateKey(export.xpub.to_string()).into());
        }
        if setup.cosigners.len() >= setup.total {
            return Err(ValidationError::ConfigMismatch(format!(
                "setup already has all {} cosigners",
                setup.total
            ))
            .into());
        }
        setup.cosigners.push(export.to_cosigner());
        Ok(())
    }

    /// Store a setup, or turn it into an account once all cosigners are in.
    fn advance_setup(
        &self,
        setups: &mut BTreeMap<AccountId, MultisigSetup>,
        setup: MultisigSetup,
    ) -> Result<SetupProgress, SigilError> {
        if setup.cosigners.len() < setup.total {
            let progress = SetupProgress::Pending {
                id: setup.id,
                have: setup.cosigners.len(),
                need: setup.total,
                export: setup.export(),
            };
            setups.insert(setup.id, setup);
            return Ok(progress);
        }

        let account = Account {
            id: setup.id,
            name: setup.name.clone(),
            network: setup.network,
            address_type: setup.address_type,
            source: setup.source,
            kind: AccountKind::Multisig {
                threshold: setup.threshold,
                cosigners: setup.cosigners.clone(),
            },
            local: setup.local.clone(),
            external: ChainState::default(),
            internal: ChainState::default(),
        };
        let risks = assess_policy(setup.threshold, setup.total);
        let created = self.insert(account, risks)?;
        setups.remove(&setup.id);
        Ok(SetupProgress::Complete(created))
    }

    /// Insert a fully specified account and issue its first receive address.
    /// Nothing is stored if the first address cannot be derived.
    fn insert(&self, mut account: Account, risks: Vec<PolicyRisk>) -> Result<AccountCreated, SigilError> {
        let first_address = account.address_at(Chain::External, 0, self.max_cosigners)?;
        account.external.issue();

        for risk in &risks {
            warn!(account = account.id, %risk, "registry: policy risk");
        }
        info!(
            account = account.id,
            name = %account.name,
            address_type = %account.address_type,
            policy = %account.policy_id().short(),
            "registry: account created"
        );

        self.register(&first_address);
        self.accounts
            .write()
            .insert(account.id, Arc::new(AccountEntry::new(account.clone())));
        Ok(AccountCreated {
            account,
            first_address,
            risks,
        })
    }
}

fn cosigner_of(key: &AccountKey) -> Cosigner {
    Cosigner {
        xpub: key.xpub(),
        fingerprint: key.master_fingerprint,
        origin: key.path.clone(),
        label: None,
    }
}

fn origin_of(key: &AccountKey) -> KeyOrigin {
    KeyOrigin {
        fingerprint: key.master_fingerprint,
        path: key.path.clone(),
    }
}
