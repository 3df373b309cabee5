//! # sigil-core
//! Leaf components of the Sigil wallet engine: deterministic key derivation,
//! address/script construction, size estimation and the error taxonomy.
//!
//! Nothing in this crate performs I/O or holds shared mutable state; every
//! function is a pure computation over its inputs and is safe to call in
//! parallel across accounts.

pub mod constants;
pub mod derivation;
pub mod error;
pub mod script;
pub mod types;
pub mod weight;

pub use derivation::{DerivedKey, Purpose, Seed};
pub use error::{
    ConcurrencyError, CryptoError, ResourceError, SigilError, StateError, ValidationError,
};
pub use script::{MultisigScript, SingleSigScript};
pub use types::{AddressType, Chain, FeeRate, PolicyId, Recipient, Utxo};
