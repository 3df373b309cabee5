//! Criterion benchmarks for sigil-core hot paths.
//!
//! Covers: account and address key derivation, watch-only derivation from
//! an xpub, and 2-of-3 multisig script construction.

use bitcoin::{Network, PublicKey};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

use sigil_core::constants::MAX_COSIGNERS;
use sigil_core::derivation::{derive_account_key, derive_address_key, derive_address_pubkey};
use sigil_core::script::build_multisig_script;
use sigil_core::{AddressType, Chain, Purpose, Seed};

fn bench_seed() -> Seed {
    Seed::from_bytes(&[42u8; 64]).expect("valid seed")
}

fn bench_account_derivation(c: &mut Criterion) {
    let seed = bench_seed();

    c.bench_function("derive_account_key_bip84", |b| {
        b.iter(|| {
            derive_account_key(
                black_box(&seed),
                Network::Bitcoin,
                Purpose::Bip84,
                0,
                0,
                AddressType::NativeSegwit,
            )
        })
    });
}

fn bench_address_derivation(c: &mut Criterion) {
    let seed = bench_seed();
    let account = derive_account_key(&seed, Network::Bitcoin, Purpose::Bip84, 0, 0, AddressType::NativeSegwit)
        .expect("derive account");
    let xpub = account.xpub();

    c.bench_function("derive_address_key", |b| {
        b.iter(|| derive_address_key(black_box(&account), Chain::External, black_box(7)))
    });

    c.bench_function("derive_address_pubkey_from_xpub", |b| {
        b.iter(|| derive_address_pubkey(black_box(&xpub), Chain::External, black_box(7)))
    });
}

fn bench_multisig_script(c: &mut Criterion) {
    let seed = bench_seed();
    let keys: Vec<PublicKey> = (0..3)
        .map(|i| {
            let account = derive_account_key(&seed, Network::Bitcoin, Purpose::Bip48, 0, i, AddressType::NativeSegwit)
                .expect("derive account");
            PublicKey::from(derive_address_key(&account, Chain::External, 0).expect("derive key").public_key)
        })
        .collect();

    c.bench_function("build_multisig_2_of_3_p2wsh", |b| {
        b.iter(|| build_multisig_script(black_box(&keys), 2, AddressType::NativeSegwit, Network::Bitcoin, MAX_COSIGNERS))
    });
}

criterion_group!(
    benches,
    bench_account_derivation,
    bench_address_derivation,
    bench_multisig_script,
);
criterion_main!(benches);
