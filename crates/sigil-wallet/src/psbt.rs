//! BIP-174 helpers: the integrity fields this wallet embeds in every PSBT.
//!
//! All extra data lives in proprietary key-value pairs under the `sigil`
//! prefix, so copies survive a round trip through other wallets and
//! hardware signers.

use std::fmt;
use std::str::FromStr;

use bitcoin::consensus::encode;
use bitcoin::psbt::raw::ProprietaryKey;
use bitcoin::psbt::Psbt;
use bitcoin::{Network, TxOut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sigil_core::constants::PSBT_PROPRIETARY_PREFIX;
use sigil_core::error::{SigilError, ValidationError};
use sigil_core::PolicyId;

const GLOBAL_SKELETON_HASH: u8 = 0;
const GLOBAL_POLICY_ID: u8 = 1;
const GLOBAL_NETWORK: u8 = 2;
const GLOBAL_STATUS: u8 = 3;
const INPUT_REQUIRED_SIGS: u8 = 0;

/// PSBT lifecycle. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PsbtStatus {
    Created,
    PartiallySigned,
    FullySigned,
    Finalized,
    Broadcast,
}

impl PsbtStatus {
    fn to_byte(self) -> u8 {
        match self {
            PsbtStatus::Created => 0,
            PsbtStatus::PartiallySigned => 1,
            PsbtStatus::FullySigned => 2,
            PsbtStatus::Finalized => 3,
            PsbtStatus::Broadcast => 4,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => PsbtStatus::Created,
            1 => PsbtStatus::PartiallySigned,
            2 => PsbtStatus::FullySigned,
            3 => PsbtStatus::Finalized,
            4 => PsbtStatus::Broadcast,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PsbtStatus::Created => "created",
            PsbtStatus::PartiallySigned => "partially-signed",
            PsbtStatus::FullySigned => "fully-signed",
            PsbtStatus::Finalized => "finalized",
            PsbtStatus::Broadcast => "broadcast",
        }
    }
}

impl fmt::Display for PsbtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn key(subtype: u8) -> ProprietaryKey {
    ProprietaryKey {
        prefix: PSBT_PROPRIETARY_PREFIX.to_vec(),
        subtype,
        key: Vec::new(),
    }
}

fn malformed(msg: impl Into<String>) -> SigilError {
    ValidationError::MalformedPsbt(msg.into()).into()
}

/// Hash of the unsigned transaction and the value of every coin it spends.
///
/// Covers recipients, amounts and (through the input values) the fee. Any
/// change to these after the PSBT was built changes the hash.
pub fn skeleton_hash(psbt: &Psbt) -> Result<[u8; 32], SigilError> {
    let mut hasher = Sha256::new();
    hasher.update(encode::serialize(&psbt.unsigned_tx));
    for index in 0..psbt.inputs.len() {
        hasher.update(spent_output(psbt, index)?.value.to_sat().to_le_bytes());
    }
    Ok(hasher.finalize().into())
}

/// The output spent by input `index`, from `witness_utxo` or the full
/// previous transaction.
pub fn spent_output(psbt: &Psbt, index: usize) -> Result<TxOut, SigilError> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| malformed(format!("no input {index}")))?;
    let txin = psbt
        .unsigned_tx
        .input
        .get(index)
        .ok_or_else(|| malformed(format!("no transaction input {index}")))?;

    if let Some(prev) = &input.non_witness_utxo {
        if prev.compute_txid() != txin.previous_output.txid {
            return Err(malformed(format!("input {index}: previous transaction does not match outpoint")));
        }
        return prev
            .output
            .get(txin.previous_output.vout as usize)
            .cloned()
            .ok_or_else(|| malformed(format!("input {index}: outpoint index out of range")));
    }
    input
        .witness_utxo
        .clone()
        .ok_or_else(|| malformed(format!("input {index} carries no spent output")))
}

pub fn stored_skeleton_hash(psbt: &Psbt) -> Option<[u8; 32]> {
    psbt.proprietary
        .get(&key(GLOBAL_SKELETON_HASH))
        .and_then(|v| v.as_slice().try_into().ok())
}

pub fn set_skeleton_hash(psbt: &mut Psbt, hash: [u8; 32]) {
    psbt.proprietary.insert(key(GLOBAL_SKELETON_HASH), hash.to_vec());
}

pub fn policy_id(psbt: &Psbt) -> Option<PolicyId> {
    psbt.proprietary
        .get(&key(GLOBAL_POLICY_ID))
        .and_then(|v| v.as_slice().try_into().ok())
        .map(PolicyId)
}

pub fn set_policy_id(psbt: &mut Psbt, id: PolicyId) {
    psbt.proprietary.insert(key(GLOBAL_POLICY_ID), id.0.to_vec());
}

pub fn network(psbt: &Psbt) -> Option<Network> {
    let raw = psbt.proprietary.get(&key(GLOBAL_NETWORK))?;
    let name = std::str::from_utf8(raw).ok()?;
    Network::from_core_arg(name).ok()
}

pub fn set_network(psbt: &mut Psbt, network: Network) {
    psbt.proprietary
        .insert(key(GLOBAL_NETWORK), network.to_core_arg().as_bytes().to_vec());
}

/// Stored status; a PSBT without one is treated as freshly created.
pub fn status(psbt: &Psbt) -> PsbtStatus {
    psbt.proprietary
        .get(&key(GLOBAL_STATUS))
        .and_then(|v| v.first().copied())
        .and_then(PsbtStatus::from_byte)
        .unwrap_or(PsbtStatus::Created)
}

pub fn set_status(psbt: &mut Psbt, status: PsbtStatus) {
    psbt.proprietary.insert(key(GLOBAL_STATUS), vec![status.to_byte()]);
}

pub fn required_signatures(psbt: &Psbt, index: usize) -> Option<usize> {
    let raw = psbt.inputs.get(index)?.proprietary.get(&key(INPUT_REQUIRED_SIGS))?;
    let bytes: [u8; 4] = raw.as_slice().try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as usize)
}

pub fn set_required_signatures(psbt: &mut Psbt, index: usize, required: usize) {
    if let Some(input) = psbt.inputs.get_mut(index) {
        input
            .proprietary
            .insert(key(INPUT_REQUIRED_SIGS), (required as u32).to_le_bytes().to_vec());
    }
}

pub fn to_base64(psbt: &Psbt) -> String {
    psbt.to_string()
}

/// Parse a base64 PSBT. Any structural failure is `MalformedPsbt`.
pub fn from_base64(s: &str) -> Result<Psbt, SigilError> {
    Psbt::from_str(s.trim()).map_err(|e| malformed(e.to_string()))
}

pub fn from_bytes(bytes: &[u8]) -> Result<Psbt, SigilError> {
    Psbt::deserialize(bytes).map_err(|e| malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::{absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, Txid, Witness};

    fn sample() -> Psbt {
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([7; 32]), 1),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(90_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a, 0x04, 1, 1, 1, 1]),
            }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(100_000),
            script_pubkey: ScriptBuf::new(),
        });
        psbt
    }

    #[test]
    fn status_is_ordered() {
        assert!(PsbtStatus::Created < PsbtStatus::PartiallySigned);
        assert!(PsbtStatus::FullySigned < PsbtStatus::Finalized);
        assert!(PsbtStatus::Finalized < PsbtStatus::Broadcast);
    }

    #[test]
    fn proprietary_fields_survive_serialization() {
        let mut psbt = sample();
        let hash = skeleton_hash(&psbt).unwrap();
        set_skeleton_hash(&mut psbt, hash);
        set_policy_id(&mut psbt, PolicyId([9; 32]));
        set_network(&mut psbt, Network::Testnet);
        set_status(&mut psbt, PsbtStatus::PartiallySigned);
        set_required_signatures(&mut psbt, 0, 2);

        let back = from_base64(&to_base64(&psbt)).unwrap();
        assert_eq!(stored_skeleton_hash(&back), Some(hash));
        assert_eq!(policy_id(&back), Some(PolicyId([9; 32])));
        assert_eq!(network(&back), Some(Network::Testnet));
        assert_eq!(status(&back), PsbtStatus::PartiallySigned);
        assert_eq!(required_signatures(&back, 0), Some(2));
    }

    #[test]
    fn skeleton_hash_covers_amounts_and_input_values() {
        let psbt = sample();
        let base = skeleton_hash(&psbt).unwrap();

        let mut amount = psbt.clone();
        amount.unsigned_tx.output[0].value = Amount::from_sat(90_001);
        assert_ne!(skeleton_hash(&amount).unwrap(), base);

        let mut value = psbt.clone();
        value.inputs[0].witness_utxo.as_mut().unwrap().value = Amount::from_sat(100_001);
        assert_ne!(skeleton_hash(&value).unwrap(), base);

        // Signatures and metadata do not affect it.
        let mut meta = psbt;
        set_status(&mut meta, PsbtStatus::FullySigned);
        assert_eq!(skeleton_hash(&meta).unwrap(), base);
    }

    #[test]
    fn missing_spent_output_is_malformed() {
        let mut psbt = sample();
        psbt.inputs[0].witness_utxo = None;
        assert!(matches!(
            skeleton_hash(&psbt).unwrap_err(),
            SigilError::Validation(ValidationError::MalformedPsbt(_))
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            from_base64("not a psbt").unwrap_err(),
            SigilError::Validation(ValidationError::MalformedPsbt(_))
        ));
        assert!(from_bytes(b"psbt\xff\x00").is_err());
    }

    #[test]
    fn unknown_status_defaults_to_created() {
        assert_eq!(status(&sample()), PsbtStatus::Created);
    }
}
