//! Transaction size estimation for fee computation.
//!
//! Estimates are in weight units and assume worst-case 72-byte DER
//! signatures (with sighash byte), so a finalized transaction never pays
//! less than the rate it was built for.

use crate::types::AddressType;

/// DER signature plus sighash byte, worst case.
const SIG_LEN: u64 = 72;
const PUBKEY_LEN: u64 = 33;
/// Outpoint (36) plus sequence (4).
const TXIN_BASE: u64 = 40;
/// Version (4) plus locktime (4).
const TX_BASE: u64 = 8;
/// Segwit marker and flag, counted in weight units.
const SEGWIT_MARKER_WEIGHT: u64 = 2;
const WITNESS_SCALE: u64 = 4;

/// Spend shape of one input.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputShape {
    SingleSig(AddressType),
    Multisig { address_type: AddressType, m: usize, n: usize },
}

impl InputShape {
    pub fn is_segwit(&self) -> bool {
        match self {
            InputShape::SingleSig(t) => t.is_segwit(),
            InputShape::Multisig { address_type, .. } => address_type.is_segwit(),
        }
    }

    /// Weight of this input, excluding the transaction-wide segwit marker.
    pub fn weight(&self) -> u64 {
        let (script_sig, witness) = match *self {
            InputShape::SingleSig(AddressType::Legacy) => (push_len(SIG_LEN) + push_len(PUBKEY_LEN), 0),
            InputShape::SingleSig(AddressType::WrappedSegwit) => (push_len(22), p2wpkh_witness()),
            InputShape::SingleSig(AddressType::NativeSegwit) => (0, p2wpkh_witness()),
            InputShape::Multisig { address_type, m, n } => {
                let script = multisig_script_len(n);
                let sigs = m as u64 * push_len(SIG_LEN);
                match address_type {
                    // OP_0 dummy, signatures, redeem script push.
                    AddressType::Legacy => (1 + sigs + push_len(script), 0),
                    AddressType::WrappedSegwit => (push_len(34), p2wsh_witness(m, script, sigs)),
                    AddressType::NativeSegwit => (0, p2wsh_witness(m, script, sigs)),
                }
            }
        };
        let base = TXIN_BASE + varint_len(script_sig) + script_sig;
        base * WITNESS_SCALE + witness
    }

    /// Virtual size of this input, rounded up.
    pub fn vsize(&self) -> u64 {
        self.weight().div_ceil(WITNESS_SCALE)
    }
}

/// Weight of an output paying to a scriptPubKey of `script_len` bytes.
pub fn output_weight(script_len: usize) -> u64 {
    let len = script_len as u64;
    (8 + varint_len(len) + len) * WITNESS_SCALE
}

/// scriptPubKey length of a receive or change output of this family.
pub fn script_pubkey_len(address_type: AddressType, multisig: bool) -> usize {
    match (address_type, multisig) {
        (AddressType::Legacy, false) => 25,
        (AddressType::Legacy, true) | (AddressType::WrappedSegwit, _) => 23,
        (AddressType::NativeSegwit, false) => 22,
        (AddressType::NativeSegwit, true) => 34,
    }
}

/// Estimated virtual size of a transaction with the given inputs and
/// output script lengths.
pub fn estimate_vsize(inputs: &[InputShape], output_script_lens: &[usize]) -> u64 {
    let mut weight =
        (TX_BASE + varint_len(inputs.len() as u64) + varint_len(output_script_lens.len() as u64))
            * WITNESS_SCALE;
    if inputs.iter().any(InputShape::is_segwit) {
        weight += SEGWIT_MARKER_WEIGHT;
        // Legacy inputs in a segwit transaction carry an empty witness stack.
        weight += inputs.iter().filter(|i| !i.is_segwit()).count() as u64;
    }
    weight += inputs.iter().map(InputShape::weight).sum::<u64>();
    weight += output_script_lens.iter().map(|&l| output_weight(l)).sum::<u64>();
    weight.div_ceil(WITNESS_SCALE)
}

/// `OP_m <key>*n OP_n OP_CHECKMULTISIG`
pub fn multisig_script_len(n: usize) -> u64 {
    1 + n as u64 * (1 + PUBKEY_LEN) + 1 + 1
}

fn p2wpkh_witness() -> u64 {
    1 + 1 + SIG_LEN + 1 + PUBKEY_LEN
}

fn p2wsh_witness(m: usize, script: u64, sigs: u64) -> u64 {
    // item count, empty dummy, signatures, witness script.
    let items = m as u64 + 2;
    varint_len(items) + 1 + sigs + varint_len(script) + script
}

/// Length of a minimal push of `len` bytes, including the data.
fn push_len(len: u64) -> u64 {
    let opcode = match len {
        0..=75 => 1,
        76..=255 => 2,
        256..=65_535 => 3,
        _ => 5,
    };
    opcode + len
}

fn varint_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn single_sig_input_sizes() {
        assert_eq!(InputShape::SingleSig(AddressType::Legacy).vsize(), 148);
        assert_eq!(InputShape::SingleSig(AddressType::WrappedSegwit).vsize(), 91);
        assert_eq!(InputShape::SingleSig(AddressType::NativeSegwit).vsize(), 68);
    }

    #[test]
    fn output_sizes() {
        assert_eq!(output_weight(script_pubkey_len(AddressType::Legacy, false)), 34 * 4);
        assert_eq!(output_weight(script_pubkey_len(AddressType::NativeSegwit, false)), 31 * 4);
        assert_eq!(output_weight(script_pubkey_len(AddressType::NativeSegwit, true)), 43 * 4);
        assert_eq!(output_weight(script_pubkey_len(AddressType::WrappedSegwit, true)), 32 * 4);
    }

    #[test]
    fn native_multisig_cheaper_than_legacy() {
        let legacy = InputShape::Multisig { address_type: AddressType::Legacy, m: 2, n: 3 };
        let wrapped = InputShape::Multisig { address_type: AddressType::WrappedSegwit, m: 2, n: 3 };
        let native = InputShape::Multisig { address_type: AddressType::NativeSegwit, m: 2, n: 3 };
        assert!(native.vsize() < wrapped.vsize());
        assert!(wrapped.vsize() < legacy.vsize());
        // 2-of-3 P2WSH spends are about 104-105 vbytes.
        assert!((100..=110).contains(&native.vsize()));
    }

    #[test]
    fn one_in_two_out_p2wpkh() {
        let inputs = [InputShape::SingleSig(AddressType::NativeSegwit)];
        let vsize = estimate_vsize(&inputs, &[22, 22]);
        // 10.5 overhead + 68 input + 2 * 31 outputs.
        assert_eq!(vsize, 141);
    }

    #[test]
    fn legacy_tx_has_no_marker() {
        let inputs = [InputShape::SingleSig(AddressType::Legacy)];
        assert_eq!(estimate_vsize(&inputs, &[25]), 10 + 148 + 34);
    }

    #[test]
    fn push_lengths() {
        assert_eq!(push_len(33), 34);
        assert_eq!(push_len(105), 107);
        assert_eq!(push_len(300), 303);
    }

    proptest! {
        #[test]
        fn extra_signature_costs_weight(n in 2usize..=15, t in 0usize..3) {
            let address_type = [AddressType::Legacy, AddressType::WrappedSegwit, AddressType::NativeSegwit][t];
            for m in 1..n {
                let fewer = InputShape::Multisig { address_type, m, n };
                let more = InputShape::Multisig { address_type, m: m + 1, n };
                prop_assert!(more.weight() > fewer.weight());
            }
        }

        #[test]
        fn vsize_covers_every_part(
            singles in 0usize..8,
            multis in 0usize..8,
            outputs in prop::collection::vec(prop::sample::select(vec![22usize, 23, 25, 34]), 1..6),
        ) {
            let mut inputs = vec![InputShape::SingleSig(AddressType::NativeSegwit); singles];
            inputs.extend(vec![InputShape::Multisig { address_type: AddressType::Legacy, m: 2, n: 3 }; multis]);
            let parts: u64 = inputs.iter().map(InputShape::weight).sum::<u64>()
                + outputs.iter().map(|&l| output_weight(l)).sum::<u64>();
            prop_assert!(estimate_vsize(&inputs, &outputs) * WITNESS_SCALE >= parts + TX_BASE * WITNESS_SCALE);
        }
    }
}
