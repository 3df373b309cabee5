//! Integration test suite for the Sigil wallet engine.
//!
//! Tests here drive several independent wallets through the public command
//! surface: multisig setup across cosigners, PSBT exchange by base64 copy,
//! tamper detection, vault persistence and property checks on derivation
//! and merging.

pub mod helpers;
