//! UTXO selection and the reservation set.
//!
//! Confirmed coins are tried before unconfirmed ones. Within a pool the
//! selector ranks candidate sets by input count, then fee, so a single coin
//! that covers the payment beats any combination. Change below the dust
//! limit is folded into the fee instead of creating an output.
//!
//! Every coin chosen for an unbroadcast transaction is reserved under a
//! [`ReservationId`]. Selection and reservation happen under one lock, so
//! two concurrent selections can never pick the same coin.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Instant;

use bitcoin::OutPoint;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sigil_core::constants::DUST_LIMIT;
use sigil_core::error::{ConcurrencyError, ResourceError, SigilError, ValidationError};
use sigil_core::weight::{estimate_vsize, InputShape};
use sigil_core::{FeeRate, Utxo};

/// Caller constraints on a selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectionPolicy {
    /// Break ties between equally good candidate sets at random.
    pub privacy_randomize: bool,
    /// Coins with fewer confirmations are ignored. Zero admits unconfirmed
    /// coins, which are still only used when confirmed ones fall short.
    pub min_confirmations: u32,
    pub dust_limit: u64,
    /// Give up with [`ResourceError::Timeout`] past this instant.
    pub deadline: Option<Instant>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            privacy_randomize: false,
            min_confirmations: 0,
            dust_limit: DUST_LIMIT,
            deadline: None,
        }
    }
}

/// Size model of the transaction being funded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CostModel {
    /// Shape of every input (all coins come from one account).
    pub input: InputShape,
    /// scriptPubKey lengths of the payment outputs.
    pub outputs: Vec<usize>,
    /// scriptPubKey length of a change output.
    pub change: usize,
}

impl CostModel {
    fn vsize(&self, inputs: usize, with_change: bool) -> u64 {
        let shapes = vec![self.input; inputs];
        let mut outputs = self.outputs.clone();
        if with_change {
            outputs.push(self.change);
        }
        estimate_vsize(&shapes, &outputs)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoinSelection {
    pub chosen: Vec<Utxo>,
    pub total_in: u64,
    /// Amount paid to recipients.
    pub target: u64,
    pub fee: u64,
    /// Zero when no change output is created.
    pub change: u64,
    pub vsize: u64,
}

impl CoinSelection {
    pub fn has_change(&self) -> bool {
        self.change > 0
    }

    pub fn outpoints(&self) -> Vec<OutPoint> {
        self.chosen.iter().map(|u| u.outpoint).collect()
    }
}

/// Handle on a set of reserved coins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReservationId(pub u64);

impl fmt::Display for ReservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[derive(Default)]
struct Reservations {
    next_id: u64,
    by_outpoint: HashMap<OutPoint, ReservationId>,
    by_id: HashMap<ReservationId, Vec<OutPoint>>,
}

impl Reservations {
    fn insert(&mut self, outpoints: Vec<OutPoint>) -> ReservationId {
        let id = ReservationId(self.next_id);
        self.next_id += 1;
        for op in &outpoints {
            self.by_outpoint.insert(*op, id);
        }
        self.by_id.insert(id, outpoints);
        id
    }

    fn remove(&mut self, id: ReservationId) -> Option<Vec<OutPoint>> {
        let outpoints = self.by_id.remove(&id)?;
        for op in &outpoints {
            self.by_outpoint.remove(op);
        }
        Some(outpoints)
    }
}

/// Coin selector owning the wallet-wide reservation set.
#[derive(Default)]
pub struct UtxoSelector {
    reservations: Mutex<Reservations>,
}

impl UtxoSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select and reserve coins paying `target` plus fee at `fee_rate`.
    pub fn select_inputs(
        &self,
        utxos: &[Utxo],
        target: u64,
        fee_rate: FeeRate,
        cost: &CostModel,
        policy: &SelectionPolicy,
    ) -> Result<(ReservationId, CoinSelection), SigilError> {
        if target == 0 {
            return Err(ValidationError::InvalidAmount("target must be non-zero".into()).into());
        }

        let mut reservations = self.reservations.lock();
        let eligible = eligible(utxos, policy.min_confirmations);
        if eligible.is_empty() {
            return Err(ResourceError::NoUtxos.into());
        }
        let (free, held): (Vec<&Utxo>, Vec<&Utxo>) = eligible
            .into_iter()
            .partition(|u| !reservations.by_outpoint.contains_key(&u.outpoint));

        let confirmed: Vec<&Utxo> = free.iter().copied().filter(|u| u.is_confirmed()).collect();
        let mut selection = None;
        if confirmed.len() < free.len() {
            selection = select_from(&confirmed, target, fee_rate, cost, policy)?;
        }
        if selection.is_none() {
            selection = select_from(&free, target, fee_rate, cost, policy)?;
        }

        let Some(selection) = selection else {
            let available: u64 = free.iter().map(|u| u.value()).sum();
            let reserved: u64 = held.iter().map(|u| u.value()).sum();
            let mut everything = free.clone();
            everything.extend(held.iter().copied());
            if !held.is_empty() && select_from(&everything, target, fee_rate, cost, policy)?.is_some() {
                warn!(available, reserved, "selection: funds held by pending transactions");
                return Err(ConcurrencyError::FundsReserved { available, reserved }.into());
            }
            let need = target.saturating_add(fee_rate.fee_for(cost.vsize(free.len().max(1), false)));
            return Err(ResourceError::InsufficientFunds { have: available, need }.into());
        };

        let id = reservations.insert(selection.outpoints());
        debug!(
            reservation = %id,
            inputs = selection.chosen.len(),
            fee = selection.fee,
            change = selection.change,
            "selection: coins reserved"
        );
        Ok((id, selection))
    }

    /// Sweep every available coin into the payment outputs, no change.
    /// `target` in the result is the amount left after the fee.
    pub fn select_max(
        &self,
        utxos: &[Utxo],
        fee_rate: FeeRate,
        cost: &CostModel,
        policy: &SelectionPolicy,
    ) -> Result<(ReservationId, CoinSelection), SigilError> {
        let mut reservations = self.reservations.lock();
        let mut chosen: Vec<Utxo> = eligible(utxos, policy.min_confirmations)
            .into_iter()
            .filter(|u| !reservations.by_outpoint.contains_key(&u.outpoint))
            .cloned()
            .collect();
        if chosen.is_empty() {
            return Err(ResourceError::NoUtxos.into());
        }
        chosen.sort_by_key(|u| u.outpoint);
        check_deadline(policy)?;

        let total_in: u64 = chosen.iter().map(Utxo::value).sum();
        let vsize = cost.vsize(chosen.len(), false);
        let fee = fee_rate.fee_for(vsize);
        let amount = total_in.saturating_sub(fee);
        if amount < policy.dust_limit {
            return Err(ResourceError::InsufficientFunds {
                have: total_in,
                need: fee.saturating_add(policy.dust_limit),
            }
            .into());
        }

        let selection = CoinSelection {
            chosen,
            total_in,
            target: amount,
            fee,
            change: 0,
            vsize,
        };
        let id = reservations.insert(selection.outpoints());
        debug!(reservation = %id, inputs = selection.chosen.len(), amount, fee, "selection: sweep reserved");
        Ok((id, selection))
    }

    /// Reserve caller-chosen coins. Fails without reserving anything if any
    /// of them is already held.
    pub fn reserve_specific(&self, outpoints: &[OutPoint]) -> Result<ReservationId, SigilError> {
        let mut reservations = self.reservations.lock();
        let mut seen = HashSet::new();
        for op in outpoints {
            if reservations.by_outpoint.contains_key(op) || !seen.insert(*op) {
                return Err(ConcurrencyError::AlreadyReserved { outpoint: op.to_string() }.into());
            }
        }
        Ok(reservations.insert(outpoints.to_vec()))
    }

    /// Abandon a reservation, making its coins selectable again.
    /// Returns `false` if it was already gone.
    pub fn release(&self, id: ReservationId) -> bool {
        let released = self.reservations.lock().remove(id);
        if let Some(outpoints) = &released {
            debug!(reservation = %id, coins = outpoints.len(), "selection: reservation released");
        }
        released.is_some()
    }

    /// End a reservation because its transaction was broadcast. The coins are
    /// spent; the chain-data collaborator stops reporting them.
    pub fn settle(&self, id: ReservationId) -> bool {
        let settled = self.reservations.lock().remove(id);
        if settled.is_some() {
            debug!(reservation = %id, "selection: reservation settled");
        }
        settled.is_some()
    }

    pub fn is_reserved(&self, outpoint: &OutPoint) -> bool {
        self.reservations.lock().by_outpoint.contains_key(outpoint)
    }

    pub fn reserved(&self, id: ReservationId) -> Option<Vec<OutPoint>> {
        self.reservations.lock().by_id.get(&id).cloned()
    }

    pub fn clear(&self) {
        let mut reservations = self.reservations.lock();
        reservations.by_id.clear();
        reservations.by_outpoint.clear();
    }
}

/// Deduplicated coins meeting the confirmation floor.
fn eligible(utxos: &[Utxo], min_confirmations: u32) -> Vec<&Utxo> {
    let mut seen = HashSet::new();
    utxos
        .iter()
        .filter(|u| u.confirmations >= min_confirmations && u.value() > 0)
        .filter(|u| seen.insert(u.outpoint))
        .collect()
}

fn check_deadline(policy: &SelectionPolicy) -> Result<(), SigilError> {
    match policy.deadline {
        Some(deadline) if Instant::now() >= deadline => {
            Err(ResourceError::Timeout("coin selection".into()).into())
        }
        _ => Ok(()),
    }
}

/// Fee and change for spending `coins` (summing to `total`), or `None` if
/// they fall short.
fn evaluate(
    coins: Vec<&Utxo>,
    total: u64,
    target: u64,
    fee_rate: FeeRate,
    cost: &CostModel,
    dust_limit: u64,
) -> Option<CoinSelection> {
    let n = coins.len();
    let bare_vsize = cost.vsize(n, false);
    let bare_fee = fee_rate.fee_for(bare_vsize);
    if total < target.checked_add(bare_fee)? {
        return None;
    }

    let change_vsize = cost.vsize(n, true);
    let change_fee = fee_rate.fee_for(change_vsize);
    let change = total.saturating_sub(target).saturating_sub(change_fee);
    let (fee, change, vsize) = if total >= target.saturating_add(change_fee) && change >= dust_limit {
        (change_fee, change, change_vsize)
    } else {
        (total - target, 0, bare_vsize)
    };

    Some(CoinSelection {
        chosen: coins.into_iter().cloned().collect(),
        total_in: total,
        target,
        fee,
        change,
        vsize,
    })
}

/// Best candidate set from `pool`, or `None` if even the whole pool is short.
fn select_from(
    pool: &[&Utxo],
    target: u64,
    fee_rate: FeeRate,
    cost: &CostModel,
    policy: &SelectionPolicy,
) -> Result<Option<CoinSelection>, SigilError> {
    let mut candidates = Vec::new();

    for coin in pool {
        check_deadline(policy)?;
        if let Some(c) = evaluate(vec![*coin], coin.value(), target, fee_rate, cost, policy.dust_limit) {
            candidates.push(c);
        }
    }

    // Largest first until covered.
    let mut by_value: Vec<&Utxo> = pool.to_vec();
    by_value.sort_by(|a, b| b.value().cmp(&a.value()).then(a.outpoint.cmp(&b.outpoint)));
    let mut picked = Vec::new();
    let mut total = 0u64;
    for coin in by_value {
        check_deadline(policy)?;
        picked.push(coin);
        total = total.saturating_add(coin.value());
        if let Some(c) = evaluate(picked.clone(), total, target, fee_rate, cost, policy.dust_limit) {
            candidates.push(c);
            break;
        }
    }

    let Some(best) = candidates.iter().map(|c| (c.chosen.len(), c.fee)).min() else {
        return Ok(None);
    };
    let mut tied: Vec<CoinSelection> = candidates
        .into_iter()
        .filter(|c| (c.chosen.len(), c.fee) == best)
        .collect();

    let mut winner = if policy.privacy_randomize {
        let mut rng = rand::rngs::OsRng;
        tied.shuffle(&mut rng);
        tied.swap_remove(0)
    } else {
        tied.sort_by(|a, b| a.change.cmp(&b.change).then_with(|| a.outpoints().cmp(&b.outpoints())));
        tied.swap_remove(0)
    };

    if policy.privacy_randomize {
        winner.chosen.shuffle(&mut rand::rngs::OsRng);
    } else {
        winner.chosen.sort_by_key(|u| u.outpoint);
    }
    Ok(Some(winner))
}
