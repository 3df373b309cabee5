//! Engine constants. All monetary values in satoshis (1 BTC = 10^8 sats).

pub const COIN: u64 = 100_000_000;

/// Consecutive unused addresses scanned before discovery stops.
pub const GAP_LIMIT: u32 = 20;

/// Default cap on multisig participants.
///
/// Fifteen compressed keys is the largest bare `OP_CHECKMULTISIG` that fits a
/// 520-byte P2SH redeem script.
pub const MAX_COSIGNERS: usize = 15;

/// Consensus limit on a P2SH redeem script push.
pub const MAX_REDEEM_SCRIPT_SIZE: usize = 520;

/// Standardness limit on a P2WSH witness script.
pub const MAX_WITNESS_SCRIPT_SIZE: usize = 3_600;

/// Outputs below this value are folded into the fee instead of created.
pub const DUST_LIMIT: u64 = 546;

/// Seed length bounds from BIP-32 (128 to 512 bits).
pub const MIN_SEED_LEN: usize = 16;
pub const MAX_SEED_LEN: usize = 64;

/// First hardened child index.
pub const HARDENED_OFFSET: u32 = 1 << 31;

/// Prefix of every proprietary PSBT key written by this engine.
pub const PSBT_PROPRIETARY_PREFIX: &[u8] = b"sigil";

/// Coin type for BIP-44 style paths: 0' on mainnet, 1' on every test network.
pub fn coin_type(network: bitcoin::Network) -> u32 {
    match network {
        bitcoin::Network::Bitcoin => 0,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_type_per_network() {
        assert_eq!(coin_type(bitcoin::Network::Bitcoin), 0);
        assert_eq!(coin_type(bitcoin::Network::Testnet), 1);
        assert_eq!(coin_type(bitcoin::Network::Regtest), 1);
        assert_eq!(coin_type(bitcoin::Network::Signet), 1);
    }

    #[test]
    fn fifteen_keys_fit_p2sh() {
        // OP_m + 15 * (1 + 33) + OP_n + OP_CHECKMULTISIG
        let size = 1 + MAX_COSIGNERS * 34 + 1 + 1;
        assert!(size <= MAX_REDEEM_SCRIPT_SIZE);
    }
}
