//! Error taxonomy for the Sigil wallet engine.
//!
//! Every operation either fully succeeds or fails with one of these typed
//! errors and leaves prior state untouched.
use thiserror::Error;

/// Malformed input: addresses, amounts, seeds, configurations, PSBT bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid seed: {0}")] InvalidSeed(String),
    #[error("derivation index {index} exceeds the hardened range")] DerivationOverflow { index: u32 },
    #[error("invalid address: {0}")] InvalidAddress(String),
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("invalid config: {0}")] InvalidConfig(String),
    #[error("cosigner configuration mismatch: {0}")] ConfigMismatch(String),
    #[error("duplicate key: {0}")] DuplicateKey(String),
    #[error("invalid threshold: {m}-of-{n}")] InvalidThreshold { m: usize, n: usize },
    #[error("too many cosigners: {n} > {max}")] TooManyCosigners { n: usize, max: usize },
    #[error("network mismatch: expected {expected}, found {found}")] NetworkMismatch { expected: String, found: String },
    #[error("uncompressed public key not allowed")] UncompressedKey,
    #[error("script too large: {size} > {max}")] ScriptTooLarge { size: usize, max: usize },
    #[error("invalid key: {0}")] InvalidKey(String),
    #[error("invalid mnemonic: {0}")] InvalidMnemonic(String),
    #[error("malformed PSBT: {0}")] MalformedPsbt(String),
    #[error("unknown account: {0}")] UnknownAccount(u32),
}

/// Decryption, signing and password failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("wrong password")] WrongPassword,
    #[error("encryption: {0}")] Encryption(String),
    #[error("key derivation: {0}")] KeyDerivation(String),
    #[error("signing: {0}")] Signing(String),
    #[error("invalid signature on input {input}")] InvalidSignature { input: usize },
}

/// Illegal transitions of the vault or the PSBT state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("vault is locked")] VaultLocked,
    #[error("unsigned transaction changed since it was built")] TamperedTransaction,
    #[error("incomplete PSBT: input {input} has {have} of {need} signatures")] IncompletePsbt { input: usize, have: usize, need: usize },
    #[error("illegal PSBT transition: {from} -> {to}")] IllegalTransition { from: String, to: String },
    #[error("PSBT belongs to a different wallet: {0}")] ForeignPsbt(String),
    #[error("signer controls no input of this PSBT")] SignerNotInvolved,
    #[error("account {0} is watch-only")] WatchOnly(u32),
    #[error("multisig setup incomplete: {have} of {need} cosigners")] SetupIncomplete { have: usize, need: usize },
}

/// Funds, address space or time budget exhausted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("insufficient funds: have {have}, need {need}")] InsufficientFunds { have: u64, need: u64 },
    #[error("no UTXOs available")] NoUtxos,
    #[error("gap limit of {limit} unused addresses reached")] GapLimitExceeded { limit: u32 },
    #[error("timed out: {0}")] Timeout(String),
}

/// Stale or double UTXO reservation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    #[error("UTXO already reserved by a pending transaction: {outpoint}")] AlreadyReserved { outpoint: String },
    #[error("funds held by pending transactions: {available} spendable, {reserved} reserved")] FundsReserved { available: u64, reserved: u64 },
    #[error("unknown reservation: {0}")] UnknownReservation(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigilError {
    #[error(transparent)] Validation(#[from] ValidationError),
    #[error(transparent)] Crypto(#[from] CryptoError),
    #[error(transparent)] State(#[from] StateError),
    #[error(transparent)] Resource(#[from] ResourceError),
    #[error(transparent)] Concurrency(#[from] ConcurrencyError),
    #[error("storage: {0}")] Storage(String),
    #[error("corrupted file: {0}")] CorruptedFile(String),
    #[error("serialization: {0}")] Serialization(String),
}

impl From<bitcoin::bip32::Error> for CryptoError {
    fn from(e: bitcoin::bip32::Error) -> Self {
        CryptoError::KeyDerivation(e.to_string())
    }
}

impl From<bitcoin::bip32::Error> for SigilError {
    fn from(e: bitcoin::bip32::Error) -> Self {
        SigilError::Crypto(e.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let e = ResourceError::InsufficientFunds { have: 100, need: 200 };
        assert_eq!(e.to_string(), "insufficient funds: have 100, need 200");
    }

    #[test]
    fn display_incomplete_psbt() {
        let e = StateError::IncompletePsbt { input: 0, have: 1, need: 2 };
        assert_eq!(e.to_string(), "incomplete PSBT: input 0 has 1 of 2 signatures");
    }

    #[test]
    fn umbrella_is_transparent() {
        let e: SigilError = CryptoError::WrongPassword.into();
        assert_eq!(e.to_string(), "wrong password");
        assert_eq!(e, SigilError::Crypto(CryptoError::WrongPassword));
    }

    #[test]
    fn from_concurrency_error() {
        let e: SigilError = ConcurrencyError::AlreadyReserved { outpoint: "ab:0".into() }.into();
        assert!(matches!(e, SigilError::Concurrency(ConcurrencyError::AlreadyReserved { .. })));
    }

    #[test]
    fn bip32_error_maps_to_crypto() {
        let e: SigilError = bitcoin::bip32::Error::CannotDeriveFromHardenedKey.into();
        assert!(matches!(e, SigilError::Crypto(CryptoError::KeyDerivation(_))));
    }
}
