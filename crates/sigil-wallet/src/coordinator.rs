//! TransactionCoordinator: the PSBT state machine.
//!
//! ```text
//! Created -> PartiallySigned -> FullySigned -> Finalized -> Broadcast
//! ```
//!
//! Every function here is pure: it takes a PSBT by reference and returns a
//! new one, so independent signers can work on separate copies and meet
//! only at [`merge`].
//!
//! Integrity: [`build_unsigned`] stores a hash of the unsigned skeleton
//! (transaction plus spent values) in the PSBT. `sign`, `merge` and
//! `finalize` recompute it and refuse to touch a PSBT whose skeleton has
//! changed. Signatures arriving from other parties are verified against the
//! skeleton's sighash before they are accepted.

use std::collections::BTreeMap;

use bitcoin::bip32::Fingerprint;
use bitcoin::blockdata::opcodes::all::OP_PUSHBYTES_0;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::psbt::{Input, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{
    absolute, transaction, Address, Amount, CompressedPublicKey, Network, OutPoint, PublicKey, Script,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use sigil_core::derivation::{relative_path, secp, AccountKey};
use sigil_core::error::{CryptoError, SigilError, StateError, ValidationError};
use sigil_core::script::parse_multisig;
use sigil_core::weight::estimate_vsize;
use sigil_core::{FeeRate, PolicyId, Recipient, Utxo};

use crate::account::{Account, AddressInfo};
use crate::psbt::{self as fields, PsbtStatus};

/// Which account and network a PSBT must belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PsbtContext {
    pub policy: PolicyId,
    pub network: Network,
}

impl PsbtContext {
    pub fn for_account(account: &Account) -> Self {
        Self {
            policy: account.policy_id(),
            network: account.network,
        }
    }
}

/// A coin to spend with the derivation data of the address holding it.
#[derive(Clone, Debug)]
pub struct FundingInput {
    pub utxo: Utxo,
    pub address: AddressInfo,
}

/// Result of finalization.
#[derive(Clone, Debug)]
pub struct FinalizedTransaction {
    pub psbt: Psbt,
    pub tx: Transaction,
    pub txid: Txid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InputProgress {
    pub outpoint: OutPoint,
    pub value: u64,
    pub have: usize,
    pub need: usize,
    /// Master fingerprints of the keys that have signed.
    pub signers: Vec<Fingerprint>,
    pub finalized: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub address: Option<String>,
    pub value: u64,
}

/// Host-facing view of a PSBT.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PsbtSummary {
    pub txid: Txid,
    pub status: PsbtStatus,
    pub inputs: Vec<InputProgress>,
    pub outputs: Vec<OutputSummary>,
    pub fee: u64,
    pub complete: bool,
}

/// How an input is spent, resolved from its PSBT fields.
#[derive(Clone, Debug, PartialEq, Eq)]
enum SpendKind {
    P2pkh,
    P2shP2wpkh(ScriptBuf),
    P2wpkh,
    P2sh(ScriptBuf),
    P2shP2wsh { redeem: ScriptBuf, witness: ScriptBuf },
    P2wsh(ScriptBuf),
}

impl SpendKind {
    fn multisig_script(&self) -> Option<&Script> {
        match self {
            SpendKind::P2sh(s) | SpendKind::P2wsh(s) => Some(s),
            SpendKind::P2shP2wsh { witness, .. } => Some(witness),
            _ => None,
        }
    }
}

fn malformed(msg: impl Into<String>) -> SigilError {
    ValidationError::MalformedPsbt(msg.into()).into()
}

fn illegal(from: PsbtStatus, to: PsbtStatus) -> SigilError {
    StateError::IllegalTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
    .into()
}

/// Build an unsigned PSBT spending `inputs` to `recipients` plus optional
/// change. The fee is whatever the inputs leave over and must meet
/// `fee_rate` for the estimated size.
pub fn build_unsigned(
    account: &Account,
    inputs: &[FundingInput],
    recipients: &[Recipient],
    change: Option<(&AddressInfo, Amount)>,
    fee_rate: FeeRate,
) -> Result<Psbt, SigilError> {
    if inputs.is_empty() {
        return Err(ValidationError::InvalidConfig("transaction has no inputs".into()).into());
    }
    if recipients.is_empty() {
        return Err(ValidationError::InvalidConfig("transaction has no recipients".into()).into());
    }
    for input in inputs {
        if input.address.account != account.id || input.address.script_pubkey != input.utxo.txout.script_pubkey {
            return Err(ValidationError::InvalidConfig(format!(
                "coin {} is not held by account {}",
                input.utxo.outpoint, account.id
            ))
            .into());
        }
    }

    let mut outputs = Vec::with_capacity(recipients.len() + 1);
    for r in recipients {
        if r.amount == Amount::ZERO {
            return Err(ValidationError::InvalidAmount("recipient amount is zero".into()).into());
        }
        outputs.push(TxOut {
            value: r.amount,
            script_pubkey: r.address.script_pubkey(),
        });
    }
    if let Some((info, amount)) = change {
        if info.account != account.id {
            return Err(ValidationError::InvalidConfig("change address belongs to another account".into()).into());
        }
        outputs.push(TxOut {
            value: amount,
            script_pubkey: info.script_pubkey.clone(),
        });
    }

    let total_in = inputs
        .iter()
        .try_fold(Amount::ZERO, |acc, i| acc.checked_add(i.utxo.txout.value))
        .ok_or_else(|| ValidationError::InvalidAmount("input total overflows".into()))?;
    let total_out = outputs
        .iter()
        .try_fold(Amount::ZERO, |acc, o| acc.checked_add(o.value))
        .ok_or_else(|| ValidationError::InvalidAmount("output total overflows".into()))?;
    let fee = total_in
        .checked_sub(total_out)
        .ok_or_else(|| ValidationError::InvalidAmount(format!("outputs {total_out} exceed inputs {total_in}")))?;

    let shapes = vec![account.input_shape(); inputs.len()];
    let script_lens: Vec<usize> = outputs.iter().map(|o| o.script_pubkey.len()).collect();
    let min_fee = fee_rate.fee_for(estimate_vsize(&shapes, &script_lens));
    if fee.to_sat() < min_fee {
        return Err(ValidationError::InvalidAmount(format!(
            "fee {} sat is below {fee_rate} ({min_fee} sat)",
            fee.to_sat()
        ))
        .into());
    }

    let tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    };
    let mut psbt = Psbt::from_unsigned_tx(tx).map_err(|e| malformed(e.to_string()))?;

    for cosigner in account.cosigners() {
        psbt.xpub.insert(cosigner.xpub, cosigner.key_source());
    }

    let required = account.required_signatures();
    for (index, funding) in inputs.iter().enumerate() {
        let input = &mut psbt.inputs[index];
        input.witness_utxo = Some(funding.utxo.txout.clone());
        input.non_witness_utxo = funding.utxo.prev_tx.clone();
        input.redeem_script = funding.address.redeem_script.clone();
        input.witness_script = funding.address.witness_script.clone();
        input.bip32_derivation = funding.address.derivations.clone();
        fields::set_required_signatures(&mut psbt, index, required);
    }
    if let Some((info, _)) = change {
        if let Some(output) = psbt.outputs.last_mut() {
            output.redeem_script = info.redeem_script.clone();
            output.witness_script = info.witness_script.clone();
            output.bip32_derivation = info.derivations.clone();
        }
    }

    let hash = fields::skeleton_hash(&psbt)?;
    fields::set_skeleton_hash(&mut psbt, hash);
    fields::set_policy_id(&mut psbt, account.policy_id());
    fields::set_network(&mut psbt, account.network);
    fields::set_status(&mut psbt, PsbtStatus::Created);

    info!(
        account = account.id,
        txid = %psbt.unsigned_tx.compute_txid(),
        inputs = inputs.len(),
        fee = fee.to_sat(),
        "coordinator: psbt built"
    );
    Ok(psbt)
}

/// Reject a PSBT built for another account or network.
pub fn check_context(psbt: &Psbt, ctx: &PsbtContext) -> Result<(), SigilError> {
    match fields::network(psbt) {
        Some(n) if n == ctx.network => {}
        Some(n) => return Err(StateError::ForeignPsbt(format!("built for {n}, wallet is on {}", ctx.network)).into()),
        None => return Err(StateError::ForeignPsbt("no network recorded".into()).into()),
    }
    match fields::policy_id(psbt) {
        Some(p) if p == ctx.policy => Ok(()),
        Some(p) => Err(StateError::ForeignPsbt(format!("policy {} is not {}", p.short(), ctx.policy.short())).into()),
        None => Err(StateError::ForeignPsbt("no policy recorded".into()).into()),
    }
}

/// Recompute the skeleton hash and compare with the stored one.
pub fn check_skeleton(psbt: &Psbt) -> Result<(), SigilError> {
    let stored = fields::stored_skeleton_hash(psbt);
    let actual = fields::skeleton_hash(psbt)?;
    if stored != Some(actual) {
        warn!(txid = %psbt.unsigned_tx.compute_txid(), "coordinator: skeleton hash mismatch");
        return Err(StateError::TamperedTransaction.into());
    }
    Ok(())
}

/// Add this signer's signatures to every input its key controls.
///
/// Inputs already carrying a signature from the same key are left as they
/// are, so signing twice changes nothing.
pub fn sign(psbt: &Psbt, signer: &AccountKey, ctx: &PsbtContext) -> Result<Psbt, SigilError> {
    check_context(psbt, ctx)?;
    let status = fields::status(psbt);
    if status >= PsbtStatus::Finalized {
        return Err(illegal(status, PsbtStatus::PartiallySigned));
    }
    check_skeleton(psbt)?;

    let mut out = psbt.clone();
    let mut involved = false;
    let mut added = 0usize;

    for (index, input) in psbt.inputs.iter().enumerate() {
        let spent = fields::spent_output(psbt, index)?;
        let kind = spend_kind(input, &spent)?;
        check_sighash_type(input, index)?;
        let mut message = None;

        for (pk, (fingerprint, path)) in &input.bip32_derivation {
            if *fingerprint != signer.master_fingerprint {
                continue;
            }
            let Some(relative) = relative_path(path, &signer.path) else {
                continue;
            };
            let child = signer.xpriv.derive_priv(secp(), &relative)?;
            if child.private_key.public_key(secp()) != *pk {
                continue;
            }
            let key = PublicKey::new(*pk);
            if !signs_for(&kind, &spent.script_pubkey, &key) {
                continue;
            }
            involved = true;
            if input.partial_sigs.contains_key(&key) {
                continue;
            }

            let msg = match message {
                Some(m) => m,
                None => {
                    let m = sighash_message(psbt, index, &kind, &spent)?;
                    message = Some(m);
                    m
                }
            };
            let signature = ecdsa::Signature {
                signature: secp().sign_ecdsa(&msg, &child.private_key),
                sighash_type: EcdsaSighashType::All,
            };
            out.inputs[index].partial_sigs.insert(key, signature);
            added += 1;
            debug!(input = index, fingerprint = %fingerprint, "coordinator: input signed");
        }
    }

    if !involved {
        return Err(StateError::SignerNotInvolved.into());
    }
    refresh_status(&mut out)?;
    info!(
        fingerprint = %signer.master_fingerprint,
        added,
        status = %fields::status(&out),
        "coordinator: psbt signed"
    );
    Ok(out)
}

/// Union of the signatures of two copies of the same PSBT.
///
/// Both copies must carry the same unsigned skeleton and belong to `ctx`.
/// Every signature is verified before it is accepted. If the copies hold
/// different valid signatures for the same key, the byte-wise smaller one
/// is kept, which makes merging commutative.
pub fn merge(a: &Psbt, b: &Psbt, ctx: &PsbtContext) -> Result<Psbt, SigilError> {
    check_context(a, ctx)?;
    check_context(b, ctx)?;
    if a.unsigned_tx != b.unsigned_tx {
        return Err(StateError::TamperedTransaction.into());
    }
    check_skeleton(a)?;
    check_skeleton(b)?;
    if a.inputs.len() != b.inputs.len() || a.outputs.len() != b.outputs.len() {
        return Err(malformed("copies have different input or output counts"));
    }

    let (sa, sb) = (fields::status(a), fields::status(b));
    if sa >= PsbtStatus::Finalized || sb >= PsbtStatus::Finalized {
        if a == b {
            return Ok(a.clone());
        }
        return Err(illegal(sa.max(sb), PsbtStatus::PartiallySigned));
    }

    let mut out = a.clone();
    for index in 0..a.inputs.len() {
        let spent = fields::spent_output(a, index)?;
        let kind = spend_kind(&a.inputs[index], &spent)?;
        let msg = sighash_message(a, index, &kind, &spent)?;

        let mut sigs = BTreeMap::new();
        for source in [&a.inputs[index], &b.inputs[index]] {
            for (pk, sig) in &source.partial_sigs {
                if !signs_for(&kind, &spent.script_pubkey, pk) || !verify(&msg, pk, sig) {
                    warn!(input = index, pubkey = %pk, "coordinator: rejected invalid signature");
                    return Err(CryptoError::InvalidSignature { input: index }.into());
                }
                sigs.entry(*pk)
                    .and_modify(|kept: &mut ecdsa::Signature| {
                        if sig.to_vec() < kept.to_vec() {
                            *kept = *sig;
                        }
                    })
                    .or_insert(*sig);
            }
        }

        let target = &mut out.inputs[index];
        target.partial_sigs = sigs;
        for (pk, source) in &b.inputs[index].bip32_derivation {
            target.bip32_derivation.entry(*pk).or_insert_with(|| source.clone());
        }
        for (k, v) in &b.inputs[index].unknown {
            target.unknown.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    for (k, v) in &b.unknown {
        out.unknown.entry(k.clone()).or_insert_with(|| v.clone());
    }

    refresh_status(&mut out)?;
    debug!(status = %fields::status(&out), "coordinator: copies merged");
    Ok(out)
}

/// Signature progress of every input. Only valid signatures count.
pub fn progress(psbt: &Psbt) -> Result<Vec<InputProgress>, SigilError> {
    let mut result = Vec::with_capacity(psbt.inputs.len());
    for (index, input) in psbt.inputs.iter().enumerate() {
        let spent = fields::spent_output(psbt, index)?;
        let outpoint = psbt.unsigned_tx.input[index].previous_output;

        if is_finalized(input) {
            let need = fields::required_signatures(psbt, index).unwrap_or(1);
            result.push(InputProgress {
                outpoint,
                value: spent.value.to_sat(),
                have: need,
                need,
                signers: Vec::new(),
                finalized: true,
            });
            continue;
        }

        let kind = spend_kind(input, &spent)?;
        let need = required(&kind)?;
        if let Some(recorded) = fields::required_signatures(psbt, index) {
            if recorded != need {
                return Err(malformed(format!("input {index}: recorded threshold {recorded} != script threshold {need}")));
            }
        }
        let valid = valid_signatures(psbt, index, &kind, &spent)?;
        let signers = valid
            .iter()
            .filter_map(|(pk, _)| input.bip32_derivation.get(&pk.inner).map(|(fp, _)| *fp))
            .collect();
        result.push(InputProgress {
            outpoint,
            value: spent.value.to_sat(),
            have: valid.len(),
            need,
            signers,
            finalized: false,
        });
    }
    Ok(result)
}

/// Every input has at least its required number of valid signatures.
pub fn is_complete(psbt: &Psbt) -> Result<bool, SigilError> {
    Ok(progress(psbt)?.iter().all(|p| p.have >= p.need))
}

/// Build the final scriptSig and witness of every input and extract the
/// network transaction.
pub fn finalize(psbt: &Psbt, ctx: &PsbtContext) -> Result<FinalizedTransaction, SigilError> {
    check_context(psbt, ctx)?;
    let status = fields::status(psbt);
    if status == PsbtStatus::Broadcast {
        return Err(illegal(status, PsbtStatus::Finalized));
    }
    check_skeleton(psbt)?;

    let mut out = psbt.clone();
    if status < PsbtStatus::Finalized {
        // Check every input before touching any.
        let mut plans = Vec::with_capacity(psbt.inputs.len());
        for (index, input) in psbt.inputs.iter().enumerate() {
            let spent = fields::spent_output(psbt, index)?;
            let kind = spend_kind(input, &spent)?;
            let need = required(&kind)?;
            let sigs = ordered_signatures(psbt, index, &kind, &spent)?;
            if sigs.len() < need {
                return Err(StateError::IncompletePsbt {
                    input: index,
                    have: sigs.len(),
                    need,
                }
                .into());
            }
            plans.push((kind, sigs.into_iter().take(need).collect::<Vec<_>>()));
        }

        for (index, (kind, sigs)) in plans.into_iter().enumerate() {
            let (script_sig, witness) = final_scripts(&kind, &sigs)?;
            let input = &mut out.inputs[index];
            input.final_script_sig = script_sig;
            input.final_script_witness = witness;
            input.partial_sigs.clear();
            input.sighash_type = None;
            input.redeem_script = None;
            input.witness_script = None;
            input.bip32_derivation.clear();
        }
        fields::set_status(&mut out, PsbtStatus::Finalized);
    }

    let tx = out.clone().extract_tx_unchecked_fee_rate();
    let txid = tx.compute_txid();
    info!(%txid, inputs = tx.input.len(), "coordinator: psbt finalized");
    Ok(FinalizedTransaction { psbt: out, tx, txid })
}

/// Record that the finalized transaction has been handed to the broadcaster.
pub fn mark_broadcast(psbt: &Psbt) -> Result<Psbt, SigilError> {
    let status = fields::status(psbt);
    if status != PsbtStatus::Finalized {
        return Err(illegal(status, PsbtStatus::Broadcast));
    }
    let mut out = psbt.clone();
    fields::set_status(&mut out, PsbtStatus::Broadcast);
    Ok(out)
}

pub fn summarize(psbt: &Psbt, network: Network) -> Result<PsbtSummary, SigilError> {
    let inputs = progress(psbt)?;
    let total_in: u64 = inputs.iter().map(|i| i.value).sum();
    let outputs: Vec<OutputSummary> = psbt
        .unsigned_tx
        .output
        .iter()
        .map(|o| OutputSummary {
            address: Address::from_script(&o.script_pubkey, network).ok().map(|a| a.to_string()),
            value: o.value.to_sat(),
        })
        .collect();
    let total_out: u64 = outputs.iter().map(|o| o.value).sum();
    Ok(PsbtSummary {
        txid: psbt.unsigned_tx.compute_txid(),
        status: fields::status(psbt),
        complete: inputs.iter().all(|i| i.have >= i.need),
        inputs,
        outputs,
        fee: total_in.saturating_sub(total_out),
    })
}

fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

/// Status implied by the signatures present, never moving backwards.
fn refresh_status(psbt: &mut Psbt) -> Result<(), SigilError> {
    let current = fields::status(psbt);
    let progress = progress(psbt)?;
    let implied = if progress.iter().all(|p| p.have >= p.need) {
        PsbtStatus::FullySigned
    } else if progress.iter().any(|p| p.have > 0) {
        PsbtStatus::PartiallySigned
    } else {
        PsbtStatus::Created
    };
    fields::set_status(psbt, current.max(implied));
    Ok(())
}

fn check_sighash_type(input: &Input, index: usize) -> Result<(), SigilError> {
    match input.sighash_type {
        None => Ok(()),
        Some(t) if matches!(t.ecdsa_hash_ty(), Ok(EcdsaSighashType::All)) => Ok(()),
        Some(t) => Err(malformed(format!("input {index}: unsupported sighash type {t}"))),
    }
}

fn spend_kind(input: &Input, spent: &TxOut) -> Result<SpendKind, SigilError> {
    let spk = &spent.script_pubkey;
    let kind = match (&input.redeem_script, &input.witness_script) {
        (Some(redeem), Some(witness)) => {
            if *redeem != ScriptBuf::new_p2wsh(&witness.wscript_hash())
                || *spk != ScriptBuf::new_p2sh(&redeem.script_hash())
            {
                return Err(malformed("nested witness script does not match the spent output"));
            }
            SpendKind::P2shP2wsh { redeem: redeem.clone(), witness: witness.clone() }
        }
        (None, Some(witness)) => {
            if *spk != ScriptBuf::new_p2wsh(&witness.wscript_hash()) {
                return Err(malformed("witness script does not match the spent output"));
            }
            SpendKind::P2wsh(witness.clone())
        }
        (Some(redeem), None) => {
            if *spk != ScriptBuf::new_p2sh(&redeem.script_hash()) {
                return Err(malformed("redeem script does not match the spent output"));
            }
            if redeem.is_p2wpkh() {
                SpendKind::P2shP2wpkh(redeem.clone())
            } else {
                SpendKind::P2sh(redeem.clone())
            }
        }
        (None, None) if spk.is_p2wpkh() => SpendKind::P2wpkh,
        (None, None) if spk.is_p2pkh() => SpendKind::P2pkh,
        (None, None) => return Err(malformed("unsupported output script")),
    };
    Ok(kind)
}

fn required(kind: &SpendKind) -> Result<usize, SigilError> {
    match kind.multisig_script() {
        Some(script) => parse_multisig(script)
            .map(|(m, _)| m)
            .ok_or_else(|| malformed("script is not a multisig script")),
        None => Ok(1),
    }
}

/// Whether `key` is one of the keys the input's script checks.
fn signs_for(kind: &SpendKind, spk: &Script, key: &PublicKey) -> bool {
    let compressed = CompressedPublicKey::try_from(*key).ok();
    match kind {
        SpendKind::P2pkh => *spk == ScriptBuf::new_p2pkh(&key.pubkey_hash()),
        SpendKind::P2wpkh => compressed.is_some_and(|c| *spk == ScriptBuf::new_p2wpkh(&c.wpubkey_hash())),
        SpendKind::P2shP2wpkh(redeem) => {
            compressed.is_some_and(|c| *redeem == ScriptBuf::new_p2wpkh(&c.wpubkey_hash()))
        }
        _ => kind
            .multisig_script()
            .and_then(parse_multisig)
            .is_some_and(|(_, keys)| keys.contains(key)),
    }
}

fn sighash_message(psbt: &Psbt, index: usize, kind: &SpendKind, spent: &TxOut) -> Result<Message, SigilError> {
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let ty = EcdsaSighashType::All;
    let err = |e: String| SigilError::from(CryptoError::Signing(e));
    let digest = match kind {
        SpendKind::P2pkh => cache
            .legacy_signature_hash(index, &spent.script_pubkey, ty.to_u32())
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
        SpendKind::P2sh(redeem) => cache
            .legacy_signature_hash(index, redeem, ty.to_u32())
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
        SpendKind::P2wpkh => cache
            .p2wpkh_signature_hash(index, &spent.script_pubkey, spent.value, ty)
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
        SpendKind::P2shP2wpkh(redeem) => cache
            .p2wpkh_signature_hash(index, redeem, spent.value, ty)
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
        SpendKind::P2wsh(witness) | SpendKind::P2shP2wsh { witness, .. } => cache
            .p2wsh_signature_hash(index, witness, spent.value, ty)
            .map_err(|e| err(e.to_string()))?
            .to_byte_array(),
    };
    Ok(Message::from_digest(digest))
}

fn verify(msg: &Message, pk: &PublicKey, sig: &ecdsa::Signature) -> bool {
    sig.sighash_type == EcdsaSighashType::All && secp().verify_ecdsa(msg, &sig.signature, &pk.inner).is_ok()
}

fn valid_signatures(
    psbt: &Psbt,
    index: usize,
    kind: &SpendKind,
    spent: &TxOut,
) -> Result<Vec<(PublicKey, ecdsa::Signature)>, SigilError> {
    let input = &psbt.inputs[index];
    if input.partial_sigs.is_empty() {
        return Ok(Vec::new());
    }
    let msg = sighash_message(psbt, index, kind, spent)?;
    Ok(input
        .partial_sigs
        .iter()
        .filter(|(pk, sig)| signs_for(kind, &spent.script_pubkey, pk) && verify(&msg, pk, sig))
        .map(|(pk, sig)| (*pk, *sig))
        .collect())
}

/// Valid signatures in the order the script checks them. An invalid
/// signature anywhere is an error rather than silently skipped.
fn ordered_signatures(
    psbt: &Psbt,
    index: usize,
    kind: &SpendKind,
    spent: &TxOut,
) -> Result<Vec<(PublicKey, ecdsa::Signature)>, SigilError> {
    let valid = valid_signatures(psbt, index, kind, spent)?;
    if valid.len() != psbt.inputs[index].partial_sigs.len() {
        return Err(CryptoError::InvalidSignature { input: index }.into());
    }
    let Some(script) = kind.multisig_script() else {
        return Ok(valid);
    };
    let (_, keys) = parse_multisig(script).ok_or_else(|| malformed("script is not a multisig script"))?;
    let by_key: BTreeMap<PublicKey, ecdsa::Signature> = valid.into_iter().collect();
    Ok(keys
        .iter()
        .filter_map(|k| by_key.get(k).map(|s| (*k, *s)))
        .collect())
}

fn push(bytes: Vec<u8>) -> Result<PushBytesBuf, SigilError> {
    PushBytesBuf::try_from(bytes).map_err(|_| malformed("push exceeds script limits"))
}

fn final_scripts(
    kind: &SpendKind,
    sigs: &[(PublicKey, ecdsa::Signature)],
) -> Result<(Option<ScriptBuf>, Option<Witness>), SigilError> {
    let multisig_witness = |script: &Script| {
        let mut witness = Witness::new();
        witness.push(Vec::<u8>::new());
        for (_, sig) in sigs {
            witness.push(sig.to_vec());
        }
        witness.push(script.as_bytes());
        witness
    };
    let first = || sigs.first().ok_or_else(|| malformed("no signature"));

    Ok(match kind {
        SpendKind::P2pkh => {
            let (pk, sig) = first()?;
            let script = Builder::new().push_slice(push(sig.to_vec())?).push_key(pk).into_script();
            (Some(script), None)
        }
        SpendKind::P2wpkh => {
            let (pk, sig) = first()?;
            (None, Some(Witness::p2wpkh(sig, &pk.inner)))
        }
        SpendKind::P2shP2wpkh(redeem) => {
            let (pk, sig) = first()?;
            let script = Builder::new().push_slice(push(redeem.to_bytes())?).into_script();
            (Some(script), Some(Witness::p2wpkh(sig, &pk.inner)))
        }
        SpendKind::P2sh(redeem) => {
            let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
            for (_, sig) in sigs {
                builder = builder.push_slice(push(sig.to_vec())?);
            }
            let script = builder.push_slice(push(redeem.to_bytes())?).into_script();
            (Some(script), None)
        }
        SpendKind::P2wsh(witness) => (None, Some(multisig_witness(witness))),
        SpendKind::P2shP2wsh { redeem, witness } => {
            let script = Builder::new().push_slice(push(redeem.to_bytes())?).into_script();
            (Some(script), Some(multisig_witness(witness)))
        }
    })
}
