//! WalletEngine: the command surface a host drives.
//!
//! The engine ties the vault, the account registry, the coin selector and
//! the PSBT coordinator together. Every mutating command runs under one
//! write lock and is persisted before it returns. If the command or the
//! write fails, the in-memory state is rolled back to what it was before.

use std::collections::BTreeMap;
use std::time::Instant;

use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, Network, OutPoint, Script, Txid};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use sigil_core::derivation::master_fingerprint;
use sigil_core::error::{ConcurrencyError, SigilError, StateError, ValidationError};
use sigil_core::{Chain, FeeRate, Recipient, Utxo};

use crate::account::{Account, AccountConfig, AccountId, AddressInfo, SignerSource, XpubExport};
use crate::coin_selection::{CoinSelection, CostModel, ReservationId, UtxoSelector};
use crate::config::EngineConfig;
use crate::coordinator::{self, FinalizedTransaction, FundingInput, PsbtContext, PsbtSummary};
use crate::mnemonic::{MnemonicSecret, WordCount};
use crate::psbt::{self as fields, PsbtStatus};
use crate::registry::{
    AccountRegistry, DiscoveryReport, KeyMaterial, MultisigSetup, ScriptOwner, SetupProgress, UsageOracle,
};
use crate::session::SessionState;
use crate::vault::{ImportedSecret, PendingTransaction, VaultSecrets, WalletState, WalletVault, XprivSecret};

/// Key material for `import_account`.
pub enum AccountImport {
    Mnemonic { phrase: Zeroizing<String>, passphrase: Zeroizing<String> },
    /// Base58 master or account-level extended private key.
    Xpriv(Zeroizing<String>),
    /// Watch-only: one export for single-sig, all `n` for multisig.
    Xpubs(Vec<XpubExport>),
}

#[derive(Clone, Debug)]
pub struct TransactionRequest {
    pub account: AccountId,
    pub recipients: Vec<Recipient>,
    pub fee_rate: FeeRate,
    /// Coins reported by the chain-data collaborator. Coins not owned by
    /// the account are ignored.
    pub utxos: Vec<Utxo>,
    /// Coin control: spend only from these outpoints.
    pub coins: Option<Vec<OutPoint>>,
    /// Send everything to the single recipient. Its amount is ignored.
    pub send_max: bool,
}

#[derive(Clone, Debug)]
pub enum BuiltTransaction {
    /// Signed and finalized, ready for broadcast.
    Final(FinalizedTransaction),
    /// Needs cosigner or external signatures.
    Psbt(Psbt),
}

#[derive(Clone, Debug)]
pub struct TransactionDraft {
    /// Txid of the unsigned transaction; the handle for `abandon`.
    pub txid: Txid,
    pub fee: u64,
    pub vsize: u64,
    pub change: Option<AddressInfo>,
    pub built: BuiltTransaction,
    pub summary: PsbtSummary,
}

#[derive(Clone, Debug)]
struct PendingEntry {
    record: PendingTransaction,
    reservation: Option<ReservationId>,
}

pub struct WalletEngine {
    config: EngineConfig,
    vault: WalletVault,
    registry: AccountRegistry,
    selector: UtxoSelector,
    pending: Mutex<BTreeMap<Txid, PendingEntry>>,
    write: Mutex<()>,
}

impl WalletEngine {
    /// Create a new wallet with a fresh mnemonic. Returns the engine,
    /// unlocked, and the phrase for the user to back up.
    pub fn create(config: EngineConfig, password: &[u8], words: WordCount) -> Result<(Self, Zeroizing<String>), SigilError> {
        let secret = MnemonicSecret::generate(words);
        let phrase = secret.phrase()?;
        Ok((Self::init(config, password, secret)?, phrase))
    }

    /// Create a wallet file from an existing mnemonic.
    pub fn restore(config: EngineConfig, password: &[u8], phrase: &str, passphrase: &str) -> Result<Self, SigilError> {
        let secret = MnemonicSecret::from_phrase(phrase, passphrase)?;
        Self::init(config, password, secret)
    }

    /// Open the configured wallet file, locked.
    pub fn open(config: EngineConfig) -> Result<Self, SigilError> {
        config.validate()?;
        let vault = WalletVault::open(&config.wallet_path())?;
        Ok(Self::assemble(config, vault))
    }

    fn init(config: EngineConfig, password: &[u8], secret: MnemonicSecret) -> Result<Self, SigilError> {
        config.validate()?;
        let vault = WalletVault::create(
            &config.wallet_path(),
            password,
            VaultSecrets::new(secret),
            &WalletState::default(),
            config.kdf,
        )?;
        let fingerprint = vault.with_seed(|seed| master_fingerprint(seed, config.network))?;
        info!(network = %config.network, %fingerprint, "engine: wallet created");
        Ok(Self::assemble(config, vault))
    }

    fn assemble(config: EngineConfig, vault: WalletVault) -> Self {
        let registry = AccountRegistry::new(config.network, config.gap_limit, config.max_cosigners);
        Self {
            config,
            vault,
            registry,
            selector: UtxoSelector::new(),
            pending: Mutex::new(BTreeMap::new()),
            write: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn network(&self) -> Network {
        self.config.network
    }

    // -- lifecycle --

    pub fn is_locked(&self) -> bool {
        self.vault.is_locked()
    }

    /// Decrypt the wallet and load accounts and pending transactions. Coins
    /// of pending transactions are reserved again.
    pub fn unlock(&self, password: &[u8]) -> Result<(), SigilError> {
        let _guard = self.write.lock();
        let state = self.vault.unlock(password)?;
        if let Err(e) = self.restore_state(state) {
            self.clear_memory();
            return Err(e);
        }
        info!(
            accounts = self.registry.accounts().len(),
            pending = self.pending.lock().len(),
            "engine: unlocked"
        );
        Ok(())
    }

    pub fn lock(&self) {
        let _guard = self.write.lock();
        self.clear_memory();
    }

    /// Lock if the host's session has been idle past its timeout.
    pub fn enforce_idle_lock(&self, session: &SessionState, now: Instant) -> bool {
        if self.is_locked() || !session.is_idle(now) {
            return false;
        }
        info!(idle_secs = session.idle_timeout().as_secs(), "engine: idle timeout");
        self.lock();
        true
    }

    pub fn change_password(&self, old: &[u8], new: &[u8]) -> Result<(), SigilError> {
        let _guard = self.write.lock();
        self.ensure_unlocked()?;
        self.vault.change_password(old, new, &self.state())
    }

    pub fn reveal_mnemonic(&self) -> Result<Zeroizing<String>, SigilError> {
        self.vault.reveal_mnemonic()
    }

    // -- accounts --

    pub fn create_account(&self, config: &AccountConfig) -> Result<SetupProgress, SigilError> {
        self.commit(|| {
            self.vault.with_signer(SignerSource::WalletSeed, |material| {
                self.registry.create_account(config, material, SignerSource::WalletSeed)
            })
        })
    }

    pub fn import_account(&self, import: AccountImport, config: &AccountConfig) -> Result<SetupProgress, SigilError> {
        match import {
            AccountImport::Xpubs(exports) => self.commit(|| self.registry.import_watch_only(config, &exports)),
            AccountImport::Mnemonic { phrase, passphrase } => {
                let secret = MnemonicSecret::from_phrase(&phrase, &passphrase)?;
                self.import_secret(config, |id| ImportedSecret::Mnemonic { id, secret })
            }
            AccountImport::Xpriv(encoded) => {
                let secret = XprivSecret::new(&encoded)?;
                self.import_secret(config, |id| ImportedSecret::Xpriv { id, secret })
            }
        }
    }

    fn import_secret(
        &self,
        config: &AccountConfig,
        make: impl FnOnce(u32) -> ImportedSecret,
    ) -> Result<SetupProgress, SigilError> {
        let (progress, _) = self.commit_with(
            || {
                let secret = make(self.vault.next_imported_id()?);
                let source = secret.source();
                let progress = match &secret {
                    ImportedSecret::Mnemonic { secret: mnemonic, .. } => {
                        let seed = mnemonic.to_seed()?;
                        self.registry.create_account(config, KeyMaterial::Seed(&seed), source)?
                    }
                    ImportedSecret::Xpriv { secret: encoded, .. } => {
                        let xpriv = encoded.xpriv()?;
                        self.registry.create_account(config, KeyMaterial::Xpriv(&xpriv), source)?
                    }
                };
                Ok((progress, secret))
            },
            |state, (_, secret)| self.vault.add_imported(secret.clone(), state).map(|_| ()),
        )?;
        Ok(progress)
    }

    pub fn get_next_address(&self, id: AccountId, chain: Chain) -> Result<AddressInfo, SigilError> {
        self.commit(|| self.registry.next_address(id, chain))
    }

    pub fn export_xpub(&self, id: AccountId) -> Result<XpubExport, SigilError> {
        self.ensure_unlocked()?;
        self.registry.export_xpub(id)
    }

    pub fn import_cosigner_xpub(&self, id: AccountId, export: &XpubExport) -> Result<SetupProgress, SigilError> {
        self.commit(|| self.registry.import_cosigner_xpub(id, export))
    }

    pub fn discover_addresses(&self, id: AccountId, oracle: &dyn UsageOracle) -> Result<DiscoveryReport, SigilError> {
        self.commit(|| self.registry.discover(id, oracle))
    }

    pub fn rename_account(&self, id: AccountId, name: &str) -> Result<(), SigilError> {
        self.commit(|| self.registry.rename_account(id, name))
    }

    /// Record on-chain use of one of the wallet's scripts.
    pub fn mark_used(&self, script_pubkey: &Script) -> Result<Option<ScriptOwner>, SigilError> {
        self.commit(|| self.registry.mark_used(script_pubkey))
    }

    pub fn account(&self, id: AccountId) -> Result<Account, SigilError> {
        self.ensure_unlocked()?;
        self.registry.account(id)
    }

    pub fn accounts(&self) -> Result<Vec<Account>, SigilError> {
        self.ensure_unlocked()?;
        Ok(self.registry.accounts())
    }

    pub fn setup(&self, id: AccountId) -> Result<Option<MultisigSetup>, SigilError> {
        self.ensure_unlocked()?;
        Ok(self.registry.setup(id))
    }

    // -- transactions --

    /// Select coins, build the PSBT and reserve the coins until the
    /// transaction is broadcast or abandoned. Single-sig accounts with a
    /// local key get a signed, finalized transaction back.
    pub fn build_transaction(&self, request: &TransactionRequest) -> Result<TransactionDraft, SigilError> {
        self.ensure_unlocked()?;
        let account = self.registry.account(request.account)?;
        self.check_recipients(&account, request)?;

        let owned = self.owned_coins(&account, &request.utxos, request.coins.as_deref())?;
        let coins: Vec<Utxo> = owned.values().map(|f| f.utxo.clone()).collect();
        let cost = CostModel {
            input: account.input_shape(),
            outputs: request.recipients.iter().map(|r| r.address.script_pubkey().len()).collect(),
            change: account.script_pubkey_len(),
        };
        let policy = self.config.selection_policy();

        let mut recipients = request.recipients.clone();
        let (reservation, selection) = if request.send_max {
            let (reservation, selection) = self.selector.select_max(&coins, request.fee_rate, &cost, &policy)?;
            recipients[0].amount = Amount::from_sat(selection.target);
            (reservation, selection)
        } else {
            let target = recipients
                .iter()
                .try_fold(0u64, |acc, r| acc.checked_add(r.amount.to_sat()))
                .ok_or_else(|| ValidationError::InvalidAmount("recipient total overflows".into()))?;
            self.selector.select_inputs(&coins, target, request.fee_rate, &cost, &policy)?
        };

        let result = self.commit(|| self.draft(&account, &owned, &recipients, &selection, request.fee_rate, reservation));
        if result.is_err() {
            self.selector.release(reservation);
        }
        result
    }

    fn draft(
        &self,
        account: &Account,
        owned: &BTreeMap<OutPoint, FundingInput>,
        recipients: &[Recipient],
        selection: &CoinSelection,
        fee_rate: FeeRate,
        reservation: ReservationId,
    ) -> Result<TransactionDraft, SigilError> {
        let inputs = selection
            .chosen
            .iter()
            .map(|u| {
                owned
                    .get(&u.outpoint)
                    .cloned()
                    .ok_or_else(|| SigilError::from(ValidationError::InvalidConfig(format!("unknown coin {}", u.outpoint))))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let change = match selection.has_change() {
            true => Some(self.registry.change_address(account.id)?),
            false => None,
        };

        let psbt = coordinator::build_unsigned(
            account,
            &inputs,
            recipients,
            change.as_ref().map(|c| (c, Amount::from_sat(selection.change))),
            fee_rate,
        )?;
        let txid = psbt.unsigned_tx.compute_txid();
        let skeleton = fields::skeleton_hash(&psbt)?;

        let built = if account.is_multisig() || account.is_watch_only() {
            BuiltTransaction::Psbt(psbt)
        } else {
            let signed = self.sign_local(account, &psbt)?;
            BuiltTransaction::Final(coordinator::finalize(&signed, &PsbtContext::for_account(account))?)
        };
        let latest = match &built {
            BuiltTransaction::Final(done) => &done.psbt,
            BuiltTransaction::Psbt(psbt) => psbt,
        };
        let summary = coordinator::summarize(latest, account.network)?;

        self.pending.lock().insert(
            txid,
            PendingEntry {
                record: PendingTransaction {
                    txid,
                    account: account.id,
                    psbt: fields::to_base64(latest),
                    skeleton,
                    outpoints: selection.outpoints(),
                    created_at: Utc::now(),
                },
                reservation: Some(reservation),
            },
        );
        info!(
            account = account.id,
            %txid,
            %reservation,
            inputs = selection.chosen.len(),
            fee = selection.fee,
            status = %summary.status,
            "engine: transaction built"
        );
        Ok(TransactionDraft {
            txid,
            fee: selection.fee,
            vsize: selection.vsize,
            change,
            built,
            summary,
        })
    }

    /// Add this wallet's signatures for account `id`.
    pub fn sign_transaction(&self, id: AccountId, psbt: &Psbt) -> Result<Psbt, SigilError> {
        self.commit(|| {
            let account = self.registry.account(id)?;
            if account.is_watch_only() {
                return Err(StateError::WatchOnly(id).into());
            }
            self.check_tracked(psbt)?;
            let signed = self.sign_local(&account, psbt)?;
            self.record_progress(&PsbtContext::for_account(&account), &signed)?;
            Ok(signed)
        })
    }

    pub fn merge_signatures(&self, id: AccountId, a: &Psbt, b: &Psbt) -> Result<Psbt, SigilError> {
        self.commit(|| {
            let ctx = PsbtContext::for_account(&self.registry.account(id)?);
            self.check_tracked(a)?;
            self.check_tracked(b)?;
            let merged = coordinator::merge(a, b, &ctx)?;
            self.record_progress(&ctx, &merged)?;
            Ok(merged)
        })
    }

    pub fn finalize_transaction(&self, id: AccountId, psbt: &Psbt) -> Result<FinalizedTransaction, SigilError> {
        self.commit(|| {
            let ctx = PsbtContext::for_account(&self.registry.account(id)?);
            self.check_tracked(psbt)?;
            let done = coordinator::finalize(psbt, &ctx)?;
            self.record_progress(&ctx, &done.psbt)?;
            Ok(done)
        })
    }

    /// Record that the finalized transaction was handed to the network.
    /// Its coins leave the reservation set for good and the wallet's own
    /// outputs count as used.
    pub fn mark_broadcast(&self, id: AccountId, psbt: &Psbt) -> Result<Psbt, SigilError> {
        let (sent, entry) = self.commit(|| {
            let ctx = PsbtContext::for_account(&self.registry.account(id)?);
            coordinator::check_context(psbt, &ctx)?;
            self.check_tracked(psbt)?;
            let sent = coordinator::mark_broadcast(psbt)?;
            for output in &sent.unsigned_tx.output {
                self.registry.mark_used(&output.script_pubkey)?;
            }
            let entry = self.pending.lock().remove(&sent.unsigned_tx.compute_txid());
            Ok((sent, entry))
        })?;
        if let Some(reservation) = entry.and_then(|e| e.reservation) {
            self.selector.settle(reservation);
        }
        info!(account = id, txid = %sent.unsigned_tx.compute_txid(), "engine: transaction broadcast");
        Ok(sent)
    }

    /// Drop a pending transaction and release its coins.
    pub fn abandon(&self, txid: Txid) -> Result<(), SigilError> {
        let entry = self.commit(|| {
            self.pending
                .lock()
                .remove(&txid)
                .ok_or_else(|| ConcurrencyError::UnknownReservation(txid.to_string()).into())
        })?;
        if let Some(reservation) = entry.reservation {
            self.selector.release(reservation);
        }
        info!(%txid, "engine: transaction abandoned");
        Ok(())
    }

    pub fn pending_transactions(&self) -> Result<Vec<PendingTransaction>, SigilError> {
        self.ensure_unlocked()?;
        let mut records: Vec<PendingTransaction> = self.pending.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Latest stored copy of a pending PSBT.
    pub fn pending_psbt(&self, txid: Txid) -> Result<Psbt, SigilError> {
        self.ensure_unlocked()?;
        let pending = self.pending.lock();
        let entry = pending
            .get(&txid)
            .ok_or_else(|| ConcurrencyError::UnknownReservation(txid.to_string()))?;
        fields::from_base64(&entry.record.psbt)
    }

    pub fn summarize(&self, psbt: &Psbt) -> Result<PsbtSummary, SigilError> {
        coordinator::summarize(psbt, self.config.network)
    }

    // -- internals --

    fn ensure_unlocked(&self) -> Result<(), SigilError> {
        if self.vault.is_locked() {
            return Err(StateError::VaultLocked.into());
        }
        Ok(())
    }

    fn clear_memory(&self) {
        self.vault.lock();
        self.registry.clear();
        self.selector.clear();
        self.pending.lock().clear();
    }

    fn state(&self) -> WalletState {
        let mut pending: Vec<PendingTransaction> = self.pending.lock().values().map(|e| e.record.clone()).collect();
        pending.sort_by_key(|r| r.created_at);
        WalletState {
            registry: self.registry.snapshot(),
            pending,
        }
    }

    fn restore_state(&self, state: WalletState) -> Result<(), SigilError> {
        self.registry.load(state.registry)?;
        self.selector.clear();
        let mut pending = BTreeMap::new();
        for record in state.pending {
            let reservation = match self.selector.reserve_specific(&record.outpoints) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(txid = %record.txid, error = %e, "engine: coins of pending transaction not reserved");
                    None
                }
            };
            pending.insert(record.txid, PendingEntry { record, reservation });
        }
        *self.pending.lock() = pending;
        Ok(())
    }

    fn commit<T>(&self, op: impl FnOnce() -> Result<T, SigilError>) -> Result<T, SigilError> {
        self.commit_with(op, |state, _| self.vault.persist(state))
    }

    /// Run `op`, then `persist` the resulting state. Any failure restores
    /// the registry and pending set as they were.
    fn commit_with<T>(
        &self,
        op: impl FnOnce() -> Result<T, SigilError>,
        persist: impl FnOnce(&WalletState, &T) -> Result<(), SigilError>,
    ) -> Result<T, SigilError> {
        let _guard = self.write.lock();
        self.ensure_unlocked()?;
        let registry_before = self.registry.snapshot();
        let pending_before = self.pending.lock().clone();

        let result = op().and_then(|value| {
            persist(&self.state(), &value)?;
            Ok(value)
        });
        if let Err(e) = &result {
            debug!(error = %e, "engine: rolling back");
            if let Err(reload) = self.registry.load(registry_before) {
                warn!(error = %reload, "engine: registry rollback failed");
            }
            *self.pending.lock() = pending_before;
        }
        result
    }

    fn check_recipients(&self, account: &Account, request: &TransactionRequest) -> Result<(), SigilError> {
        if request.recipients.is_empty() {
            return Err(ValidationError::InvalidConfig("no recipients".into()).into());
        }
        if request.send_max && request.recipients.len() != 1 {
            return Err(ValidationError::InvalidConfig("send-max takes exactly one recipient".into()).into());
        }
        for r in &request.recipients {
            let same_network = Address::from_script(&r.address.script_pubkey(), account.network)
                .is_ok_and(|a| a == r.address);
            if !same_network {
                return Err(ValidationError::NetworkMismatch {
                    expected: account.network.to_string(),
                    found: r.address.to_string(),
                }
                .into());
            }
            if !request.send_max && r.amount.to_sat() < self.config.dust_limit {
                return Err(ValidationError::InvalidAmount(format!("{} is below the dust limit", r.amount)).into());
            }
        }
        Ok(())
    }

    /// The account's coins among `utxos`, with the derivation data of the
    /// address each one sits on.
    fn owned_coins(
        &self,
        account: &Account,
        utxos: &[Utxo],
        only: Option<&[OutPoint]>,
    ) -> Result<BTreeMap<OutPoint, FundingInput>, SigilError> {
        let mut owned = BTreeMap::new();
        for utxo in utxos {
            if only.is_some_and(|set| !set.contains(&utxo.outpoint)) {
                continue;
            }
            match self.registry.owner_of(&utxo.txout.script_pubkey) {
                Some(owner) if owner.account == account.id => {
                    let address = self.registry.address_at(account.id, owner.chain, owner.index)?;
                    owned.insert(utxo.outpoint, FundingInput { utxo: utxo.clone(), address });
                }
                _ => debug!(outpoint = %utxo.outpoint, "engine: coin not held by account, skipped"),
            }
        }
        if let Some(set) = only {
            if let Some(missing) = set.iter().find(|op| !owned.contains_key(op)) {
                return Err(ValidationError::InvalidConfig(format!("coin {missing} is not spendable by this account")).into());
            }
        }
        Ok(owned)
    }

    fn sign_local(&self, account: &Account, psbt: &Psbt) -> Result<Psbt, SigilError> {
        let origin = account.local.as_ref().ok_or(StateError::WatchOnly(account.id))?;
        let ctx = PsbtContext::for_account(account);
        self.vault.with_signer(account.source, |material| {
            let key = material.account_key(origin, account.network)?;
            coordinator::sign(psbt, &key, &ctx)
        })
    }

    /// A PSBT for a transaction this wallet built must carry the skeleton
    /// recorded at build time, and no other PSBT may spend its coins.
    fn check_tracked(&self, psbt: &Psbt) -> Result<(), SigilError> {
        let txid = psbt.unsigned_tx.compute_txid();
        let pending = self.pending.lock();
        if let Some(entry) = pending.get(&txid) {
            if fields::stored_skeleton_hash(psbt) != Some(entry.record.skeleton) {
                warn!(%txid, "engine: skeleton differs from the one recorded at build time");
                return Err(StateError::TamperedTransaction.into());
            }
            return Ok(());
        }
        for input in &psbt.unsigned_tx.input {
            if let Some(other) = pending.values().find(|e| e.record.outpoints.contains(&input.previous_output)) {
                // Same build record or same policy, different transaction:
                // modified in transit.
                let ours = fields::stored_skeleton_hash(psbt) == Some(other.record.skeleton)
                    || self
                        .registry
                        .account(other.record.account)
                        .is_ok_and(|a| fields::policy_id(psbt) == Some(a.policy_id()));
                if ours {
                    warn!(%txid, pending = %other.record.txid, "engine: pending transaction was modified");
                    return Err(StateError::TamperedTransaction.into());
                }
                warn!(%txid, pending = %other.record.txid, "engine: psbt spends coins of a pending transaction");
                return Err(ConcurrencyError::AlreadyReserved {
                    outpoint: input.previous_output.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Fold a newer copy of a tracked PSBT into the stored one.
    fn record_progress(&self, ctx: &PsbtContext, psbt: &Psbt) -> Result<(), SigilError> {
        let txid = psbt.unsigned_tx.compute_txid();
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&txid) else {
            return Ok(());
        };
        let stored = fields::from_base64(&entry.record.psbt)?;
        let (old, new) = (fields::status(&stored), fields::status(psbt));
        let latest = if old < PsbtStatus::Finalized && new < PsbtStatus::Finalized {
            coordinator::merge(&stored, psbt, ctx)?
        } else if new >= old {
            psbt.clone()
        } else {
            stored
        };
        entry.record.psbt = fields::to_base64(&latest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountConfig;
    use crate::encryption::KdfParams;
    use bitcoin::hashes::Hash;
    use bitcoin::TxOut;
    use sigil_core::derivation::{derive_account_key, derive_address_key, Purpose};
    use sigil_core::{AddressType, Seed};
    use std::path::Path;
    use std::time::Duration;

    const PHRASE: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn config(dir: &Path) -> EngineConfig {
        EngineConfig {
            network: Network::Regtest,
            kdf: KdfParams::light(),
            data_dir: dir.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    fn engine(dir: &Path) -> WalletEngine {
        WalletEngine::restore(config(dir), b"pw", PHRASE, "").unwrap()
    }

    fn single_sig(engine: &WalletEngine) -> (Account, AddressInfo) {
        match engine
            .create_account(&AccountConfig::single_sig("spend", AddressType::NativeSegwit))
            .unwrap()
        {
            SetupProgress::Complete(c) => (c.account, c.first_address),
            other => panic!("expected account, got {other:?}"),
        }
    }

    fn payee(network: Network) -> Address {
        let seed = Seed::from_bytes(&[9; 32]).unwrap();
        let key = derive_account_key(&seed, network, Purpose::Bip84, 1, 0, AddressType::NativeSegwit).unwrap();
        let child = derive_address_key(&key, Chain::External, 0).unwrap();
        Address::p2wpkh(&child.public_key, network)
    }

    fn coin(n: u8, address: &AddressInfo, value: u64) -> Utxo {
        Utxo::new(
            OutPoint::new(Txid::from_byte_array([n; 32]), 0),
            TxOut { value: Amount::from_sat(value), script_pubkey: address.script_pubkey.clone() },
            6,
        )
    }

    fn request(account: AccountId, utxos: Vec<Utxo>, amount: u64) -> TransactionRequest {
        TransactionRequest {
            account,
            recipients: vec![Recipient::new(payee(Network::Regtest), Amount::from_sat(amount))],
            fee_rate: FeeRate::from_sat_per_vb(5).unwrap(),
            utxos,
            coins: None,
            send_max: false,
        }
    }

    #[test]
    fn locked_engine_refuses_commands() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, _) = single_sig(&engine);
        engine.lock();
        assert!(engine.is_locked());
        for err in [
            engine.get_next_address(account.id, Chain::External).unwrap_err(),
            engine.export_xpub(account.id).unwrap_err(),
            engine.accounts().unwrap_err(),
            engine.create_account(&AccountConfig::single_sig("x", AddressType::Legacy)).unwrap_err(),
        ] {
            assert_eq!(err, SigilError::State(StateError::VaultLocked));
        }
    }

    #[test]
    fn unlock_restores_accounts_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, first) = single_sig(&engine);
        let second = engine.get_next_address(account.id, Chain::External).unwrap();
        assert_eq!(second.index, 1);
        engine.rename_account(account.id, "daily").unwrap();
        engine.lock();

        let reopened = WalletEngine::open(config(dir.path())).unwrap();
        assert!(reopened.is_locked());
        reopened.unlock(b"pw").unwrap();
        let restored = reopened.account(account.id).unwrap();
        assert_eq!(restored.name, "daily");
        assert_eq!(reopened.get_next_address(account.id, Chain::External).unwrap().index, 2);
        assert_eq!(reopened.account(account.id).unwrap().address_at(Chain::External, 0, 15).unwrap(), first);
    }

    #[test]
    fn restore_derives_same_addresses() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let (_, first_a) = single_sig(&engine(a.path()));
        let (_, first_b) = single_sig(&engine(b.path()));
        assert_eq!(first_a.address, first_b.address);
    }

    #[test]
    fn single_sig_build_is_signed_and_reserves_coins() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, address) = single_sig(&engine);
        let utxos = vec![coin(1, &address, 100_000)];

        let draft = engine.build_transaction(&request(account.id, utxos.clone(), 50_000)).unwrap();
        let BuiltTransaction::Final(done) = &draft.built else {
            panic!("single-sig build should be final");
        };
        assert_eq!(done.tx.input.len(), 1);
        assert_eq!(done.tx.input[0].witness.len(), 2);
        assert_eq!(draft.fee, FeeRate::from_sat_per_vb(5).unwrap().fee_for(draft.vsize));
        assert_eq!(draft.change.as_ref().unwrap().chain, Chain::Internal);
        assert_eq!(draft.summary.status, PsbtStatus::Finalized);

        let err = engine.build_transaction(&request(account.id, utxos.clone(), 10_000)).unwrap_err();
        assert!(matches!(err, SigilError::Concurrency(ConcurrencyError::FundsReserved { .. })));

        engine.abandon(draft.txid).unwrap();
        assert!(engine.build_transaction(&request(account.id, utxos, 10_000)).is_ok());
    }

    #[test]
    fn pending_reservations_survive_relock() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, address) = single_sig(&engine);
        let utxos = vec![coin(1, &address, 100_000)];
        let draft = engine.build_transaction(&request(account.id, utxos.clone(), 50_000)).unwrap();

        engine.lock();
        engine.unlock(b"pw").unwrap();
        assert_eq!(engine.pending_transactions().unwrap().len(), 1);
        assert_eq!(
            fields::status(&engine.pending_psbt(draft.txid).unwrap()),
            PsbtStatus::Finalized
        );
        assert!(matches!(
            engine.build_transaction(&request(account.id, utxos, 10_000)).unwrap_err(),
            SigilError::Concurrency(ConcurrencyError::FundsReserved { .. })
        ));
    }

    #[test]
    fn broadcast_settles_and_marks_change_used() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, address) = single_sig(&engine);
        let draft = engine
            .build_transaction(&request(account.id, vec![coin(1, &address, 100_000)], 50_000))
            .unwrap();
        let BuiltTransaction::Final(done) = draft.built else {
            panic!("expected final transaction");
        };

        let sent = engine.mark_broadcast(account.id, &done.psbt).unwrap();
        assert_eq!(fields::status(&sent), PsbtStatus::Broadcast);
        assert!(engine.pending_transactions().unwrap().is_empty());
        assert!(engine.account(account.id).unwrap().internal.is_used(0));
        assert!(matches!(
            engine.abandon(draft.txid).unwrap_err(),
            SigilError::Concurrency(ConcurrencyError::UnknownReservation(_))
        ));
    }

    #[test]
    fn foreign_coins_and_wrong_network_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, _) = single_sig(&engine);

        let stranger = Utxo::new(
            OutPoint::new(Txid::from_byte_array([2; 32]), 0),
            TxOut { value: Amount::from_sat(100_000), script_pubkey: payee(Network::Regtest).script_pubkey() },
            6,
        );
        assert!(matches!(
            engine.build_transaction(&request(account.id, vec![stranger], 10_000)).unwrap_err(),
            SigilError::Resource(_)
        ));

        let mut mainnet = request(account.id, Vec::new(), 10_000);
        mainnet.recipients[0].address = payee(Network::Bitcoin);
        assert!(matches!(
            engine.build_transaction(&mainnet).unwrap_err(),
            SigilError::Validation(ValidationError::NetworkMismatch { .. })
        ));

        let dust = request(account.id, Vec::new(), 100);
        assert!(matches!(
            engine.build_transaction(&dust).unwrap_err(),
            SigilError::Validation(ValidationError::InvalidAmount(_))
        ));
    }

    #[test]
    fn send_max_spends_everything() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, address) = single_sig(&engine);
        let mut req = request(account.id, vec![coin(1, &address, 60_000), coin(2, &address, 40_000)], 0);
        req.send_max = true;

        let draft = engine.build_transaction(&req).unwrap();
        assert!(draft.change.is_none());
        assert_eq!(draft.summary.outputs.len(), 1);
        assert_eq!(draft.summary.outputs[0].value + draft.fee, 100_000);
    }

    #[test]
    fn coin_control_limits_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (account, address) = single_sig(&engine);
        let big = coin(1, &address, 500_000);
        let small = coin(2, &address, 80_000);
        let mut req = request(account.id, vec![big, small.clone()], 50_000);
        req.coins = Some(vec![small.outpoint]);

        let draft = engine.build_transaction(&req).unwrap();
        assert_eq!(draft.summary.inputs.len(), 1);
        assert_eq!(draft.summary.inputs[0].outpoint, small.outpoint);
    }

    #[test]
    fn imported_xpriv_account_signs() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let master = sigil_core::derivation::master_key(&Seed::from_bytes(&[7; 32]).unwrap(), Network::Regtest).unwrap();
        let progress = engine
            .import_account(
                AccountImport::Xpriv(Zeroizing::new(master.to_string())),
                &AccountConfig::single_sig("imported", AddressType::WrappedSegwit),
            )
            .unwrap();
        let SetupProgress::Complete(created) = progress else {
            panic!("expected account");
        };
        assert_eq!(created.account.source, SignerSource::ImportedXpriv(1));

        let draft = engine
            .build_transaction(&request(created.account.id, vec![coin(3, &created.first_address, 90_000)], 20_000))
            .unwrap();
        assert!(matches!(draft.built, BuiltTransaction::Final(_)));

        // Survives a relock.
        engine.lock();
        engine.unlock(b"pw").unwrap();
        assert_eq!(engine.account(created.account.id).unwrap().source, SignerSource::ImportedXpriv(1));
    }

    #[test]
    fn idle_session_locks() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let session = SessionState::new(Duration::from_secs(60));
        let start = session.last_activity();
        assert!(!engine.enforce_idle_lock(&session, start + Duration::from_secs(10)));
        assert!(!engine.is_locked());
        assert!(engine.enforce_idle_lock(&session, start + Duration::from_secs(61)));
        assert!(engine.is_locked());
    }

    #[test]
    fn change_password_then_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        single_sig(&engine);
        engine.change_password(b"pw", b"better").unwrap();
        engine.lock();
        assert!(engine.unlock(b"pw").is_err());
        engine.unlock(b"better").unwrap();
        assert_eq!(engine.accounts().unwrap().len(), 1);
        assert_eq!(engine.reveal_mnemonic().unwrap().as_str(), PHRASE);
    }
}
