//! # sigil-wallet: vault, accounts, coin selection and PSBT coordination.
//!
//! Builds on the pure key and script functions of `sigil-core` to provide
//! an encrypted wallet file, an account registry with gap-limit address
//! bookkeeping, UTXO selection with reservations, and the multisig PSBT
//! lifecycle. [`WalletEngine`] ties them into one command surface.
//!
//! # Modules
//!
//! - [`account`]: account, cosigner and address types
//! - [`registry`]: `AccountRegistry`, multisig setup staging, discovery
//! - [`coin_selection`]: fee-aware coin selection and UTXO reservations
//! - [`psbt`]: proprietary PSBT fields and the lifecycle status
//! - [`coordinator`]: build, sign, merge and finalize PSBTs
//! - [`encryption`], [`store`]: argon2id + AES-256-GCM wallet file
//! - [`mnemonic`]: BIP-39 phrases
//! - [`vault`]: `WalletVault`, the locked/unlocked secret holder
//! - [`config`], [`session`]: engine configuration and idle auto-lock
//! - [`engine`]: `WalletEngine`

pub mod account;
pub mod coin_selection;
pub mod config;
pub mod coordinator;
pub mod encryption;
pub mod engine;
pub mod mnemonic;
pub mod psbt;
pub mod registry;
pub mod session;
pub mod store;
pub mod vault;

// Re-exports for convenient access
pub use account::{Account, AccountConfig, AccountId, AddressInfo, SignerSource, XpubExport};
pub use coin_selection::{CoinSelection, ReservationId, SelectionPolicy, UtxoSelector};
pub use config::EngineConfig;
pub use coordinator::{FinalizedTransaction, PsbtContext, PsbtSummary};
pub use encryption::KdfParams;
pub use engine::{AccountImport, BuiltTransaction, TransactionDraft, TransactionRequest, WalletEngine};
pub use mnemonic::{MnemonicSecret, WordCount};
pub use psbt::PsbtStatus;
pub use registry::{AccountRegistry, DiscoveryReport, SetupProgress, UsageOracle};
pub use session::SessionState;
pub use vault::{PendingTransaction, WalletVault};
