//! WalletVault: the encrypted wallet file and the lock gate in front of the
//! secrets it holds.
//!
//! The vault is either locked (no secret in memory) or unlocked (the derived
//! file key, the decrypted secrets and the root seed are held). The two
//! states swap under a write lock, so a reader inside [`WalletVault::with_seed`]
//! always sees a whole seed and `lock` waits for it to finish.
//!
//! The wallet file holds one encrypted JSON document: the secrets plus the
//! non-secret [`WalletState`] (accounts, cosigner setups, pending PSBTs).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use bitcoin::bip32::Xpriv;
use bitcoin::{OutPoint, Txid};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use sigil_core::error::{SigilError, StateError, ValidationError};
use sigil_core::Seed;

use crate::account::{AccountId, SignerSource};
use crate::encryption::{self, KdfParams, VaultKey, SALT_LEN};
use crate::mnemonic::MnemonicSecret;
use crate::registry::{KeyMaterial, RegistrySnapshot};
use crate::store;

/// A base58 extended private key imported by the user.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct XprivSecret(String);

impl XprivSecret {
    pub fn new(encoded: &str) -> Result<Self, ValidationError> {
        let encoded = encoded.trim();
        Xpriv::from_str(encoded).map_err(|e| ValidationError::InvalidKey(e.to_string()))?;
        Ok(Self(encoded.to_string()))
    }

    pub fn xpriv(&self) -> Result<Xpriv, ValidationError> {
        Xpriv::from_str(&self.0).map_err(|e| ValidationError::InvalidKey(e.to_string()))
    }
}

impl fmt::Debug for XprivSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("XprivSecret([REDACTED])")
    }
}

/// Key material imported alongside the wallet's own seed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ImportedSecret {
    Mnemonic { id: u32, secret: MnemonicSecret },
    Xpriv { id: u32, secret: XprivSecret },
}

impl ImportedSecret {
    pub fn id(&self) -> u32 {
        match self {
            ImportedSecret::Mnemonic { id, .. } | ImportedSecret::Xpriv { id, .. } => *id,
        }
    }

    pub fn source(&self) -> SignerSource {
        match self {
            ImportedSecret::Mnemonic { id, .. } => SignerSource::ImportedMnemonic(*id),
            ImportedSecret::Xpriv { id, .. } => SignerSource::ImportedXpriv(*id),
        }
    }
}

/// Everything secret in the wallet file.
#[derive(Clone, Serialize, Deserialize)]
pub struct VaultSecrets {
    pub root: MnemonicSecret,
    #[serde(default)]
    pub imported: Vec<ImportedSecret>,
}

impl VaultSecrets {
    pub fn new(root: MnemonicSecret) -> Self {
        Self {
            root,
            imported: Vec::new(),
        }
    }

    fn next_imported_id(&self) -> u32 {
        self.imported.iter().map(ImportedSecret::id).max().map_or(1, |m| m + 1)
    }
}

impl fmt::Debug for VaultSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultSecrets")
            .field("root", &self.root)
            .field("imported", &self.imported.len())
            .finish()
    }
}

/// A transaction built by this wallet and not yet broadcast or abandoned.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Txid of the unsigned transaction.
    pub txid: Txid,
    pub account: AccountId,
    /// Latest known copy, base64 BIP-174.
    pub psbt: String,
    /// Skeleton hash recorded when the PSBT was built.
    #[serde(with = "hex::serde")]
    pub skeleton: [u8; 32],
    /// Coins reserved for it.
    pub outpoints: Vec<OutPoint>,
    pub created_at: DateTime<Utc>,
}

/// Non-secret wallet state, persisted encrypted with the secrets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    pub registry: RegistrySnapshot,
    #[serde(default)]
    pub pending: Vec<PendingTransaction>,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    secrets: &'a VaultSecrets,
    state: &'a WalletState,
}

#[derive(Deserialize)]
struct Payload {
    secrets: VaultSecrets,
    state: WalletState,
}

fn encode_payload(secrets: &VaultSecrets, state: &WalletState) -> Result<Zeroizing<Vec<u8>>, SigilError> {
    serde_json::to_vec(&PayloadRef { secrets, state })
        .map(Zeroizing::new)
        .map_err(|e| SigilError::Serialization(e.to_string()))
}

struct Unlocked {
    key: VaultKey,
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
    secrets: VaultSecrets,
    seed: Seed,
}

impl Unlocked {
    fn write(&self, path: &Path, secrets: &VaultSecrets, state: &WalletState) -> Result<(), SigilError> {
        let plaintext = encode_payload(secrets, state)?;
        let blob = encryption::seal(&plaintext, &self.key, self.salt, self.kdf)?;
        store::write_blob(path, &blob)
    }
}

pub struct WalletVault {
    path: PathBuf,
    unlocked: RwLock<Option<Unlocked>>,
}

impl WalletVault {
    /// Write a new wallet file and return the vault unlocked.
    pub fn create(
        path: &Path,
        password: &[u8],
        secrets: VaultSecrets,
        state: &WalletState,
        kdf: KdfParams,
    ) -> Result<Self, SigilError> {
        if path.exists() {
            return Err(SigilError::Storage(format!("wallet file already exists: {}", path.display())));
        }
        let seed = secrets.root.to_seed()?;
        let plaintext = encode_payload(&secrets, state)?;
        let (blob, key) = encryption::encrypt(&plaintext, password, kdf)?;
        store::write_blob(path, &blob)?;

        info!(path = %path.display(), "vault: wallet created");
        Ok(Self {
            path: path.to_path_buf(),
            unlocked: RwLock::new(Some(Unlocked {
                key,
                salt: blob.salt,
                kdf,
                secrets,
                seed,
            })),
        })
    }

    /// Open an existing wallet file, locked.
    pub fn open(path: &Path) -> Result<Self, SigilError> {
        store::read_blob(path)?;
        debug!(path = %path.display(), "vault: wallet opened");
        Ok(Self {
            path: path.to_path_buf(),
            unlocked: RwLock::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.unlocked.read().is_none()
    }

    /// Decrypt the wallet file. Slow by construction (argon2id).
    ///
    /// On failure the vault stays as it was.
    pub fn unlock(&self, password: &[u8]) -> Result<WalletState, SigilError> {
        let blob = store::read_blob(&self.path)?;
        let (plaintext, key) = encryption::decrypt(&blob, password).inspect_err(|_| {
            warn!(path = %self.path.display(), "vault: unlock failed");
        })?;
        let payload: Payload = serde_json::from_slice(&plaintext)
            .map_err(|e| SigilError::CorruptedFile(format!("invalid payload: {e}")))?;
        let seed = payload.secrets.root.to_seed()?;

        *self.unlocked.write() = Some(Unlocked {
            key,
            salt: blob.salt,
            kdf: blob.kdf,
            secrets: payload.secrets,
            seed,
        });
        info!(path = %self.path.display(), "vault: unlocked");
        Ok(payload.state)
    }

    /// Drop every secret held in memory. Returns whether the vault was
    /// unlocked.
    pub fn lock(&self) -> bool {
        let previous = self.unlocked.write().take();
        let was_unlocked = previous.is_some();
        drop(previous);
        if was_unlocked {
            info!(path = %self.path.display(), "vault: locked");
        }
        was_unlocked
    }

    pub fn with_seed<T>(&self, f: impl FnOnce(&Seed) -> Result<T, SigilError>) -> Result<T, SigilError> {
        let guard = self.unlocked.read();
        let unlocked = guard.as_ref().ok_or(StateError::VaultLocked)?;
        f(&unlocked.seed)
    }

    /// Run `f` with the private key material behind `source`.
    pub fn with_signer<T>(
        &self,
        source: SignerSource,
        f: impl FnOnce(KeyMaterial<'_>) -> Result<T, SigilError>,
    ) -> Result<T, SigilError> {
        let guard = self.unlocked.read();
        let unlocked = guard.as_ref().ok_or(StateError::VaultLocked)?;
        match source {
            SignerSource::WalletSeed => f(KeyMaterial::Seed(&unlocked.seed)),
            SignerSource::ImportedMnemonic(id) => {
                let secret = unlocked.secrets.imported.iter().find_map(|s| match s {
                    ImportedSecret::Mnemonic { id: sid, secret } if *sid == id => Some(secret),
                    _ => None,
                });
                let secret = secret.ok_or_else(|| missing_secret(source))?;
                let seed = secret.to_seed()?;
                f(KeyMaterial::Seed(&seed))
            }
            SignerSource::ImportedXpriv(id) => {
                let secret = unlocked.secrets.imported.iter().find_map(|s| match s {
                    ImportedSecret::Xpriv { id: sid, secret } if *sid == id => Some(secret),
                    _ => None,
                });
                let xpriv = secret.ok_or_else(|| missing_secret(source))?.xpriv()?;
                f(KeyMaterial::Xpriv(&xpriv))
            }
            SignerSource::WatchOnly => Err(ValidationError::InvalidConfig("watch-only accounts hold no private key".into()).into()),
        }
    }

    /// Id the next imported secret will get.
    pub fn next_imported_id(&self) -> Result<u32, SigilError> {
        let guard = self.unlocked.read();
        let unlocked = guard.as_ref().ok_or(StateError::VaultLocked)?;
        Ok(unlocked.secrets.next_imported_id())
    }

    /// Add an imported secret and persist it together with `state`. The
    /// in-memory secrets change only once the file write succeeded.
    pub fn add_imported(&self, secret: ImportedSecret, state: &WalletState) -> Result<SignerSource, SigilError> {
        let mut guard = self.unlocked.write();
        let unlocked = guard.as_mut().ok_or(StateError::VaultLocked)?;
        if unlocked.secrets.imported.iter().any(|s| s.id() == secret.id()) {
            return Err(ValidationError::DuplicateKey(format!("imported secret {}", secret.id())).into());
        }

        let source = secret.source();
        let mut secrets = unlocked.secrets.clone();
        secrets.imported.push(secret);
        unlocked.write(&self.path, &secrets, state)?;
        unlocked.secrets = secrets;
        info!(?source, "vault: secret imported");
        Ok(source)
    }

    /// Re-encrypt the file with the current key and a fresh nonce.
    pub fn persist(&self, state: &WalletState) -> Result<(), SigilError> {
        let guard = self.unlocked.read();
        let unlocked = guard.as_ref().ok_or(StateError::VaultLocked)?;
        unlocked.write(&self.path, &unlocked.secrets, state)
    }

    /// Re-key the wallet file under `new` with a fresh salt. `old` must
    /// decrypt the file as it is on disk.
    pub fn change_password(&self, old: &[u8], new: &[u8], state: &WalletState) -> Result<(), SigilError> {
        let mut guard = self.unlocked.write();
        let unlocked = guard.as_mut().ok_or(StateError::VaultLocked)?;

        let blob = store::read_blob(&self.path)?;
        encryption::decrypt(&blob, old)?;

        let salt = encryption::random_salt();
        let key = encryption::derive_key(new, &salt, &unlocked.kdf)?;
        let plaintext = encode_payload(&unlocked.secrets, state)?;
        let blob = encryption::seal(&plaintext, &key, salt, unlocked.kdf)?;
        store::write_blob(&self.path, &blob)?;

        unlocked.key = key;
        unlocked.salt = salt;
        info!(path = %self.path.display(), "vault: password changed");
        Ok(())
    }

    /// The root mnemonic phrase, for backup.
    pub fn reveal_mnemonic(&self) -> Result<Zeroizing<String>, SigilError> {
        let guard = self.unlocked.read();
        let unlocked = guard.as_ref().ok_or(StateError::VaultLocked)?;
        Ok(unlocked.secrets.root.phrase()?)
    }
}

fn missing_secret(source: SignerSource) -> SigilError {
    SigilError::CorruptedFile(format!("no vault secret for {source:?}"))
}

impl fmt::Debug for WalletVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletVault")
            .field("path", &self.path)
            .field("locked", &self.is_locked())
            .finish()
    }
}
