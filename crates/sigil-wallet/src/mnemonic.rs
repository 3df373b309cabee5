//! BIP-39 mnemonic backup and restoration.
//!
//! The vault persists mnemonic *entropy* plus the optional passphrase; the
//! 64-byte BIP-32 seed is re-derived with PBKDF2 on every unlock.

use bip39::{Language, Mnemonic};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use sigil_core::error::ValidationError;
use sigil_core::Seed;

/// Mnemonic length offered at wallet creation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WordCount {
    Twelve,
    #[default]
    TwentyFour,
}

impl WordCount {
    fn entropy_len(self) -> usize {
        match self {
            WordCount::Twelve => 16,
            WordCount::TwentyFour => 32,
        }
    }
}

/// Mnemonic entropy and BIP-39 passphrase: everything needed to rebuild a
/// seed. Zeroized on drop.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct MnemonicSecret {
    #[serde(with = "hex::serde")]
    entropy: Vec<u8>,
    #[serde(default)]
    passphrase: String,
}

impl MnemonicSecret {
    /// Fresh random entropy from the OS RNG.
    pub fn generate(words: WordCount) -> Self {
        use rand::RngCore;
        let mut entropy = vec![0u8; words.entropy_len()];
        rand::rngs::OsRng.fill_bytes(&mut entropy);
        Self {
            entropy,
            passphrase: String::new(),
        }
    }

    /// Parse a phrase. Whitespace and case are normalized before parsing.
    pub fn from_phrase(phrase: &str, passphrase: &str) -> Result<Self, ValidationError> {
        let mnemonic = parse_mnemonic(phrase)?;
        Ok(Self {
            entropy: mnemonic.to_entropy(),
            passphrase: passphrase.to_string(),
        })
    }

    pub fn mnemonic(&self) -> Result<Mnemonic, ValidationError> {
        Mnemonic::from_entropy_in(Language::English, &self.entropy)
            .map_err(|e| ValidationError::InvalidMnemonic(e.to_string()))
    }

    /// The phrase words, space separated. Handle with care.
    pub fn phrase(&self) -> Result<Zeroizing<String>, ValidationError> {
        Ok(Zeroizing::new(self.mnemonic()?.to_string()))
    }

    /// BIP-39 seed: PBKDF2-HMAC-SHA512 over the phrase and passphrase.
    pub fn to_seed(&self) -> Result<Seed, ValidationError> {
        let seed = Zeroizing::new(self.mnemonic()?.to_seed(&self.passphrase));
        Seed::from_bytes(seed.as_ref())
    }

    pub fn word_count(&self) -> usize {
        self.entropy.len() * 3 / 4
    }
}

impl std::fmt::Debug for MnemonicSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MnemonicSecret")
            .field("words", &self.word_count())
            .field("passphrase", &!self.passphrase.is_empty())
            .finish()
    }
}

/// Parse a BIP-39 English phrase after normalizing whitespace and case.
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, ValidationError> {
    let normalized = Zeroizing::new(
        phrase
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase(),
    );
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|e| ValidationError::InvalidMnemonic(e.to_string()))
}

/// Seed for `phrase` and `passphrase` in one step.
pub fn mnemonic_to_seed(phrase: &str, passphrase: &str) -> Result<Seed, ValidationError> {
    MnemonicSecret::from_phrase(phrase, passphrase)?.to_seed()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON_ABOUT: &str = "abandon abandon abandon abandon abandon abandon \
                                 abandon abandon abandon abandon abandon about";

    #[test]
    fn bip39_reference_seed() {
        let seed = mnemonic_to_seed(ABANDON_ABOUT, "TREZOR").unwrap();
        assert_eq!(
            hex::encode(seed.as_bytes()),
            "c55257c360c07c72029aebc1b53c05ed0362ada38ead3e3e9efa3708e5349553\
             1f09a6987599d18264c1e1c92f2cf141630c7a3c4ab7c81b2f001698e7463b04"
        );
    }

    #[test]
    fn roundtrip_generate() {
        for words in [WordCount::Twelve, WordCount::TwentyFour] {
            let secret = MnemonicSecret::generate(words);
            let phrase = secret.phrase().unwrap();
            let restored = MnemonicSecret::from_phrase(&phrase, "").unwrap();
            assert_eq!(
                secret.to_seed().unwrap().as_bytes(),
                restored.to_seed().unwrap().as_bytes()
            );
        }
    }

    #[test]
    fn word_counts() {
        assert_eq!(MnemonicSecret::generate(WordCount::Twelve).phrase().unwrap().split_whitespace().count(), 12);
        assert_eq!(MnemonicSecret::generate(WordCount::TwentyFour).word_count(), 24);
    }

    #[test]
    fn passphrase_changes_seed() {
        let a = mnemonic_to_seed(ABANDON_ABOUT, "").unwrap();
        let b = mnemonic_to_seed(ABANDON_ABOUT, "extra").unwrap();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn whitespace_and_case_normalized() {
        let messy = format!("  {}\t", ABANDON_ABOUT.to_uppercase().replace(' ', "   "));
        let a = mnemonic_to_seed(&messy, "").unwrap();
        let b = mnemonic_to_seed(ABANDON_ABOUT, "").unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn invalid_word_rejected() {
        let err = parse_mnemonic("abandon abandon abandon invalidword").unwrap_err();
        assert!(err.to_string().contains("invalid mnemonic"));
    }

    #[test]
    fn bad_checksum_rejected() {
        let phrase = format!("{} zoo", vec!["abandon"; 11].join(" "));
        assert!(parse_mnemonic(&phrase).is_err());
    }

    #[test]
    fn debug_redacts() {
        let secret = MnemonicSecret::from_phrase(ABANDON_ABOUT, "pw").unwrap();
        let debug = format!("{secret:?}");
        assert!(!debug.contains("abandon"));
        assert!(!debug.contains("pw"));
    }
}
