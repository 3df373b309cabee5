//! Wallet file format and atomic persistence.
//!
//! # File format
//! ```text
//! header_len (4 bytes LE) || header_json || ciphertext + auth_tag
//! ```
//! The header is plaintext JSON carrying the magic, format version, KDF
//! parameters, salt and nonce. Everything else is inside the ciphertext.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use sigil_core::error::SigilError;

use crate::encryption::{EncryptedBlob, KdfParams, NONCE_LEN, SALT_LEN, TAG_LEN};

/// Magic bytes identifying a Sigil wallet file.
pub const WALLET_MAGIC: &str = "SGWL";

/// Current wallet file format version.
pub const WALLET_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct WalletFileHeader {
    magic: String,
    version: u32,
    kdf: KdfParams,
    #[serde(with = "hex::serde")]
    salt: [u8; SALT_LEN],
    #[serde(with = "hex::serde")]
    nonce: [u8; NONCE_LEN],
}

/// Encode a blob into the on-disk byte layout.
pub fn encode(blob: &EncryptedBlob) -> Result<Vec<u8>, SigilError> {
    let header = WalletFileHeader {
        magic: WALLET_MAGIC.to_string(),
        version: WALLET_VERSION,
        kdf: blob.kdf,
        salt: blob.salt,
        nonce: blob.nonce,
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| SigilError::Serialization(e.to_string()))?;

    let header_len = u32::try_from(header_json.len())
        .map_err(|_| SigilError::Serialization("header too large".into()))?;
    let mut data = Vec::with_capacity(4 + header_json.len() + blob.ciphertext.len());
    data.extend_from_slice(&header_len.to_le_bytes());
    data.extend_from_slice(&header_json);
    data.extend_from_slice(&blob.ciphertext);
    Ok(data)
}

/// Decode the on-disk byte layout. Checks structure only; the ciphertext is
/// authenticated at decryption time.
pub fn decode(data: &[u8]) -> Result<EncryptedBlob, SigilError> {
    let len_bytes: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SigilError::CorruptedFile("file too short".into()))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_json = data
        .get(4..4 + header_len)
        .ok_or_else(|| SigilError::CorruptedFile("header truncated".into()))?;
    let header: WalletFileHeader = serde_json::from_slice(header_json)
        .map_err(|e| SigilError::CorruptedFile(format!("invalid header: {e}")))?;

    if header.magic != WALLET_MAGIC {
        return Err(SigilError::CorruptedFile("invalid magic bytes".into()));
    }
    if header.version != WALLET_VERSION {
        return Err(SigilError::CorruptedFile(format!(
            "unsupported version: {}",
            header.version
        )));
    }

    let ciphertext = &data[4 + header_len..];
    if ciphertext.len() < TAG_LEN {
        return Err(SigilError::CorruptedFile("ciphertext truncated".into()));
    }

    Ok(EncryptedBlob {
        kdf: header.kdf,
        salt: header.salt,
        nonce: header.nonce,
        ciphertext: ciphertext.to_vec(),
    })
}

pub fn read_blob(path: &Path) -> Result<EncryptedBlob, SigilError> {
    let data = std::fs::read(path).map_err(|e| SigilError::Storage(format!("{}: {e}", path.display())))?;
    decode(&data)
}

/// Write `blob` to `path` atomically: a sibling temp file is written and
/// synced, then renamed over the target. A crash at any point leaves either
/// the old file or the new one, never a mix.
pub fn write_blob(path: &Path, blob: &EncryptedBlob) -> Result<(), SigilError> {
    let data = encode(blob)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(|e| SigilError::Storage(e.to_string()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| SigilError::Storage(e.to_string()))?;
    tmp.write_all(&data).map_err(|e| SigilError::Storage(e.to_string()))?;
    tmp.as_file().sync_all().map_err(|e| SigilError::Storage(e.to_string()))?;
    tmp.persist(path).map_err(|e| SigilError::Storage(e.error.to_string()))?;

    debug!(path = %path.display(), bytes = data.len(), "store: wallet file written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption;

    fn sample_blob() -> EncryptedBlob {
        encryption::encrypt(b"payload", b"password", KdfParams::light()).unwrap().0
    }

    #[test]
    fn encode_decode_roundtrip() {
        let blob = sample_blob();
        assert_eq!(decode(&encode(&blob).unwrap()).unwrap(), blob);
    }

    #[test]
    fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("wallet.sigil");
        let blob = sample_blob();
        write_blob(&path, &blob).unwrap();
        assert_eq!(read_blob(&path).unwrap(), blob);
    }

    #[test]
    fn overwrite_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.sigil");
        write_blob(&path, &sample_blob()).unwrap();
        let second = sample_blob();
        write_blob(&path, &second).unwrap();
        assert_eq!(read_blob(&path).unwrap(), second);
        // No temp files left behind.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn garbage_is_corrupted() {
        assert!(matches!(decode(b"garbage").unwrap_err(), SigilError::CorruptedFile(_)));
        assert!(matches!(decode(&[0u8; 2]).unwrap_err(), SigilError::CorruptedFile(_)));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data = encode(&sample_blob()).unwrap();
        let pos = data.windows(4).position(|w| w == b"SGWL").unwrap();
        data[pos..pos + 4].copy_from_slice(b"XXXX");
        let err = decode(&data).unwrap_err();
        assert_eq!(err, SigilError::CorruptedFile("invalid magic bytes".into()));
    }

    #[test]
    fn truncated_ciphertext_rejected() {
        let data = encode(&sample_blob()).unwrap();
        let err = decode(&data[..data.len() - 20]).unwrap_err();
        assert!(matches!(err, SigilError::CorruptedFile(_)));
    }

    #[test]
    fn missing_file_is_storage_error() {
        let err = read_blob(Path::new("/nonexistent/sigil/wallet")).unwrap_err();
        assert!(matches!(err, SigilError::Storage(_)));
    }
}
