//! Password-based AES-256-GCM encryption of the vault payload.
//!
//! The encryption key is derived from the password with argon2id and a
//! per-wallet random salt. The GCM authentication tag is the only check of
//! password correctness: a wrong password and a tampered blob both surface
//! as [`CryptoError::WrongPassword`].

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use sigil_core::error::CryptoError;

/// Salt length in bytes.
pub const SALT_LEN: usize = 32;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// A derived 256-bit encryption key, wiped on drop.
pub type VaultKey = Zeroizing<[u8; 32]>;

/// argon2id cost parameters, stored alongside every blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and throwaway regtest wallets.
    pub fn light() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Everything persisted for one encrypted payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBlob {
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
    /// Ciphertext with the GCM tag appended.
    pub ciphertext: Vec<u8>,
}

/// Fresh random salt from the OS RNG.
pub fn random_salt() -> [u8; SALT_LEN] {
    use rand::RngCore;
    let mut salt = [0u8; SALT_LEN];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive the encryption key for `password` and `salt` with argon2id.
pub fn derive_key(password: &[u8], salt: &[u8], kdf: &KdfParams) -> Result<VaultKey, CryptoError> {
    let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(32))
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = Zeroizing::new([0u8; 32]);
    argon
        .hash_password_into(password, salt, &mut key[..])
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under an already-derived key with a fresh nonce.
pub fn seal(
    plaintext: &[u8],
    key: &VaultKey,
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
) -> Result<EncryptedBlob, CryptoError> {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    Ok(EncryptedBlob {
        kdf,
        salt,
        nonce,
        ciphertext,
    })
}

/// Decrypt a blob with an already-derived key.
pub fn open(blob: &EncryptedBlob, key: &VaultKey) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(&blob.nonce), blob.ciphertext.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::WrongPassword)
}

/// Derive a key with a fresh salt and encrypt. Returns the blob and the key
/// so the caller can re-seal later without the password.
pub fn encrypt(
    plaintext: &[u8],
    password: &[u8],
    kdf: KdfParams,
) -> Result<(EncryptedBlob, VaultKey), CryptoError> {
    let salt = random_salt();
    let key = derive_key(password, &salt, &kdf)?;
    let blob = seal(plaintext, &key, salt, kdf)?;
    Ok((blob, key))
}

/// Derive the key from the blob's stored salt and parameters and decrypt.
pub fn decrypt(
    blob: &EncryptedBlob,
    password: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, VaultKey), CryptoError> {
    let key = derive_key(password, &blob.salt, &blob.kdf)?;
    let plaintext = open(blob, &key)?;
    Ok((plaintext, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (blob, _) = encrypt(b"secret wallet data", b"correct horse", KdfParams::light()).unwrap();
        let (plain, _) = decrypt(&blob, b"correct horse").unwrap();
        assert_eq!(plain.as_slice(), b"secret wallet data");
    }

    #[test]
    fn wrong_password_fails() {
        let (blob, _) = encrypt(b"secret", b"correct", KdfParams::light()).unwrap();
        assert_eq!(decrypt(&blob, b"wrong").unwrap_err(), CryptoError::WrongPassword);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (mut blob, _) = encrypt(b"secret data", b"password", KdfParams::light()).unwrap();
        let last = blob.ciphertext.len() - 1;
        blob.ciphertext[last] ^= 0xFF;
        assert_eq!(decrypt(&blob, b"password").unwrap_err(), CryptoError::WrongPassword);
    }

    #[test]
    fn tampered_salt_fails() {
        let (mut blob, _) = encrypt(b"secret", b"password", KdfParams::light()).unwrap();
        blob.salt[0] ^= 0xFF;
        assert_eq!(decrypt(&blob, b"password").unwrap_err(), CryptoError::WrongPassword);
    }

    #[test]
    fn tampered_nonce_fails() {
        let (mut blob, _) = encrypt(b"secret", b"password", KdfParams::light()).unwrap();
        blob.nonce[0] ^= 0xFF;
        assert_eq!(decrypt(&blob, b"password").unwrap_err(), CryptoError::WrongPassword);
    }

    #[test]
    fn reseal_uses_fresh_nonce() {
        let (blob, key) = encrypt(b"payload", b"password", KdfParams::light()).unwrap();
        let resealed = seal(b"payload", &key, blob.salt, blob.kdf).unwrap();
        assert_ne!(blob.nonce, resealed.nonce);
        assert_eq!(open(&resealed, &key).unwrap().as_slice(), b"payload");
    }

    #[test]
    fn derive_key_deterministic() {
        let kdf = KdfParams::light();
        let a = derive_key(b"password", b"saltsaltsalt", &kdf).unwrap();
        let b = derive_key(b"password", b"saltsaltsalt", &kdf).unwrap();
        let c = derive_key(b"password2", b"saltsaltsalt", &kdf).unwrap();
        assert_eq!(*a, *b);
        assert_ne!(*a, *c);
    }

    #[test]
    fn invalid_params_rejected() {
        let kdf = KdfParams { memory_kib: 1, iterations: 1, parallelism: 1 };
        assert!(matches!(
            derive_key(b"pw", &random_salt(), &kdf).unwrap_err(),
            CryptoError::KeyDerivation(_)
        ));
    }

    #[test]
    fn ciphertext_overhead_is_tag() {
        let (blob, _) = encrypt(b"hello", b"password", KdfParams::light()).unwrap();
        assert_eq!(blob.ciphertext.len(), 5 + TAG_LEN);
    }
}
