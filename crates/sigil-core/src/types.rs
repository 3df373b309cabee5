//! Shared engine types: address policy, chains, fee rates, coins.

use bitcoin::{Address, Amount, OutPoint, Transaction, TxOut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;

/// Address/script family, fixed per account at creation.
///
/// The same family maps to different concrete script templates for
/// single-sig and multisig accounts:
///
/// | family           | single-sig   | multisig     |
/// |------------------|--------------|--------------|
/// | `Legacy`         | P2PKH        | P2SH         |
/// | `WrappedSegwit`  | P2SH-P2WPKH  | P2SH-P2WSH   |
/// | `NativeSegwit`   | P2WPKH       | P2WSH        |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressType {
    Legacy,
    WrappedSegwit,
    NativeSegwit,
}

impl AddressType {
    /// Whether spends of this family carry witness data.
    pub fn is_segwit(&self) -> bool {
        !matches!(self, AddressType::Legacy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::Legacy => "legacy",
            AddressType::WrappedSegwit => "segwit",
            AddressType::NativeSegwit => "native-segwit",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "p2pkh" | "p2sh" => Ok(AddressType::Legacy),
            "segwit" | "wrapped-segwit" | "p2sh-p2wpkh" | "p2sh-p2wsh" => {
                Ok(AddressType::WrappedSegwit)
            }
            "native-segwit" | "bech32" | "p2wpkh" | "p2wsh" => Ok(AddressType::NativeSegwit),
            other => Err(ValidationError::InvalidConfig(format!(
                "unknown address type: {other}"
            ))),
        }
    }
}

/// BIP-44 chain within an account: receive or change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    External,
    Internal,
}

impl Chain {
    /// Non-hardened child number of this chain under the account key.
    pub fn index(&self) -> u32 {
        match self {
            Chain::External => 0,
            Chain::Internal => 1,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        match index {
            0 => Some(Chain::External),
            1 => Some(Chain::Internal),
            _ => None,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::External => f.write_str("external"),
            Chain::Internal => f.write_str("internal"),
        }
    }
}

/// Fee rate in satoshis per virtual byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeRate(u64);

impl FeeRate {
    pub const MIN_RELAY: FeeRate = FeeRate(1);

    pub fn from_sat_per_vb(rate: u64) -> Result<Self, ValidationError> {
        if rate == 0 {
            return Err(ValidationError::InvalidAmount("fee rate must be non-zero".into()));
        }
        Ok(Self(rate))
    }

    pub fn sat_per_vb(&self) -> u64 {
        self.0
    }

    /// Fee for a transaction of `vsize` virtual bytes.
    pub fn fee_for(&self, vsize: u64) -> u64 {
        vsize.saturating_mul(self.0)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.0)
    }
}

/// An unspent output reported by the chain-data collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub txout: TxOut,
    pub confirmations: u32,
    /// Full previous transaction, attached to legacy inputs when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_tx: Option<Transaction>,
}

impl Utxo {
    pub fn new(outpoint: OutPoint, txout: TxOut, confirmations: u32) -> Self {
        Self {
            outpoint,
            txout,
            confirmations,
            prev_tx: None,
        }
    }

    pub fn value(&self) -> u64 {
        self.txout.value.to_sat()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

/// A payment destination.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    pub amount: Amount,
}

impl Recipient {
    pub fn new(address: Address, amount: Amount) -> Self {
        Self { address, amount }
    }
}

/// Identity of an account's spending policy.
///
/// SHA-256 over the canonical policy description (threshold, address type,
/// network and the sorted key origins). Independent co-signers compute the
/// same id for the same multisig wallet, which lets a PSBT be checked
/// against the account it claims to spend from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PolicyId(pub [u8; 32]);

impl PolicyId {
    pub fn from_descriptor(descriptor: &str) -> Self {
        Self(Sha256::digest(descriptor.as_bytes()).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First four bytes in hex, for logs.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_type_parse_aliases() {
        assert_eq!("p2wpkh".parse::<AddressType>().unwrap(), AddressType::NativeSegwit);
        assert_eq!("SEGWIT".parse::<AddressType>().unwrap(), AddressType::WrappedSegwit);
        assert_eq!("legacy".parse::<AddressType>().unwrap(), AddressType::Legacy);
        assert!("taproot".parse::<AddressType>().is_err());
    }

    #[test]
    fn address_type_display_roundtrips() {
        for t in [AddressType::Legacy, AddressType::WrappedSegwit, AddressType::NativeSegwit] {
            assert_eq!(t.to_string().parse::<AddressType>().unwrap(), t);
        }
    }

    #[test]
    fn chain_indices() {
        assert_eq!(Chain::External.index(), 0);
        assert_eq!(Chain::Internal.index(), 1);
        assert_eq!(Chain::from_index(1), Some(Chain::Internal));
        assert_eq!(Chain::from_index(2), None);
    }

    #[test]
    fn zero_fee_rate_rejected() {
        assert!(FeeRate::from_sat_per_vb(0).is_err());
        assert_eq!(FeeRate::from_sat_per_vb(5).unwrap().fee_for(200), 1_000);
    }

    #[test]
    fn policy_id_is_stable() {
        let a = PolicyId::from_descriptor("wsh(sortedmulti(2,a,b,c))");
        let b = PolicyId::from_descriptor("wsh(sortedmulti(2,a,b,c))");
        assert_eq!(a, b);
        assert_eq!(a.short().len(), 8);
        assert_ne!(a, PolicyId::from_descriptor("wsh(sortedmulti(1,a,b,c))"));
    }
}
