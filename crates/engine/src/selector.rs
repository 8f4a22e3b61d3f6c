//! Privacy-heuristic coin selection under lock contention.
//!
//! Selection serves the PayJoin contribution path and shares its candidate
//! ordering with the rebalancer. Candidates are ordered by a keyed hash of
//! their outpoint: SHA-256(outpoint) XOR a random 256-bit mask drawn once per
//! process. The order is stable within a process run (a coin that becomes
//! eligible again resurfaces in the same position) but unpredictable from
//! outside.

use std::sync::OnceLock;

use bitcoin::OutPoint;
use rand::Rng;
use sha2::{Digest, Sha256};

use treasury_types::TreasuryError;

use crate::chain::Coin;
use crate::locks::{outpoint_key, CoinLockManager};

/// Total lock attempts allowed across one selection call.
const MAX_LOCK_ATTEMPTS: usize = 30;

static ORDERING_MASK: OnceLock<[u8; 32]> = OnceLock::new();

fn ordering_mask() -> &'static [u8; 32] {
    ORDERING_MASK.get_or_init(|| rand::thread_rng().gen())
}

/// Masked sort key for one outpoint.
fn sort_key(outpoint: &OutPoint) -> [u8; 32] {
    let digest = Sha256::digest(outpoint_key(outpoint).as_bytes());
    let mask = ordering_mask();

    let mut key = [0u8; 32];
    for (i, byte) in digest.iter().enumerate() {
        key[i] = byte ^ mask[i];
    }
    key
}

/// Order candidates by their masked hash. Stable across repeated calls
/// within one process run.
pub fn order_candidates(coins: &mut [Coin]) {
    coins.sort_by_key(|c| sort_key(&c.outpoint));
}

/// UIH1/UIH2 check: adding `candidate` must not produce a transaction where
/// some input amount exceeds some output amount, since that would let an
/// observer tell the payment output from change.
///
/// Hypothetical inputs = other declared inputs plus the candidate;
/// hypothetical outputs = other declared outputs plus (payment + candidate).
pub fn violates_uih(
    candidate_value: u64,
    other_input_amounts: &[u64],
    payment_amount: u64,
    other_output_amounts: &[u64],
) -> bool {
    let max_input = other_input_amounts
        .iter()
        .copied()
        .chain(std::iter::once(candidate_value))
        .max()
        .unwrap_or(0);
    let min_output = other_output_amounts
        .iter()
        .copied()
        .chain(std::iter::once(payment_amount + candidate_value))
        .min()
        .unwrap_or(u64::MAX);

    max_input > min_output
}

/// Single-coin selection: heuristic filter, then lock acquisition, bounded
/// under contention.
pub struct UtxoSelector {
    locks: CoinLockManager,
}

impl UtxoSelector {
    pub fn new(locks: CoinLockManager) -> Self {
        Self { locks }
    }

    /// Pick one heuristically-safe, lockable coin from `candidates`.
    ///
    /// First pass walks candidates in masked-hash order: heuristic check,
    /// then `try_lock`; a lock failure advances to the next candidate, capped
    /// at 30 attempts overall. If nothing locked, a second bounded pass
    /// retries only the candidates that failed *locking*, not the heuristic.
    /// `Ok(None)` means no contribution is possible; callers handle that
    /// without error.
    pub fn select(
        &self,
        mut candidates: Vec<Coin>,
        other_input_amounts: &[u64],
        payment_amount: u64,
        other_output_amounts: &[u64],
    ) -> Result<Option<Coin>, TreasuryError> {
        order_candidates(&mut candidates);

        let mut attempts = 0;
        let mut lock_failed: Vec<Coin> = Vec::new();

        for coin in candidates {
            if attempts >= MAX_LOCK_ATTEMPTS {
                break;
            }
            if violates_uih(
                coin.value,
                other_input_amounts,
                payment_amount,
                other_output_amounts,
            ) {
                continue;
            }

            attempts += 1;
            if self.locks.try_lock(&coin.outpoint)? {
                return Ok(Some(coin));
            }
            lock_failed.push(coin);
        }

        // Second pass: the lock may have been a transient reservation that
        // has since been released.
        let mut attempts = 0;
        for coin in lock_failed {
            if attempts >= MAX_LOCK_ATTEMPTS {
                break;
            }
            attempts += 1;
            if self.locks.try_lock(&coin.outpoint)? {
                return Ok(Some(coin));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use bitcoin::hashes::Hash;
    use bitcoin::{ScriptBuf, Txid};
    use treasury_storage::TreasuryStore;

    fn coin(n: u8, value: u64) -> Coin {
        Coin {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([n; 32]),
                vout: 0,
            },
            value,
            wallet_id: "hot-1".to_string(),
            derivation_change: 0,
            derivation_index: n as u32,
            script_pubkey: ScriptBuf::new(),
        }
    }

    fn selector() -> (UtxoSelector, CoinLockManager) {
        let locks = CoinLockManager::new(Arc::new(TreasuryStore::open_in_memory().unwrap()));
        (UtxoSelector::new(locks.clone()), locks)
    }

    #[test]
    fn test_worked_example_accepted() {
        // One 50,000-sat candidate; sender's other input is 30,000; payment
        // is 40,000; no other outputs. Hypothetical inputs {30,000, 50,000},
        // hypothetical outputs {90,000}: no input exceeds any output, so the
        // candidate is accepted.
        assert!(!violates_uih(50_000, &[30_000], 40_000, &[]));

        let (selector, _) = selector();
        let picked = selector
            .select(vec![coin(1, 50_000)], &[30_000], 40_000, &[])
            .unwrap();
        assert_eq!(picked.unwrap().value, 50_000);
    }

    #[test]
    fn test_large_candidate_rejected_against_small_output() {
        // Sender pays 10,000 with a 5,000 change output declared. A 200,000
        // candidate makes one input (200,000) exceed the 5,000 output.
        assert!(violates_uih(200_000, &[20_000], 10_000, &[5_000]));

        let (selector, _) = selector();
        let picked = selector
            .select(vec![coin(2, 200_000)], &[20_000], 10_000, &[5_000])
            .unwrap();
        assert!(picked.is_none());
    }

    #[test]
    fn test_selected_coin_is_locked() {
        let (selector, locks) = selector();
        let picked = selector
            .select(vec![coin(3, 40_000)], &[30_000], 40_000, &[])
            .unwrap()
            .unwrap();

        // A second selection over the same candidate finds it locked.
        assert!(!locks.try_lock(&picked.outpoint).unwrap());
        let again = selector
            .select(vec![coin(3, 40_000)], &[30_000], 40_000, &[])
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn test_second_pass_retries_lock_failures() {
        let (selector, locks) = selector();
        let c = coin(4, 40_000);

        // Simulate contention: the coin is locked, selection fails; once the
        // lock is released a fresh call picks it up.
        locks.try_lock(&c.outpoint).unwrap();
        assert!(selector
            .select(vec![c.clone()], &[30_000], 40_000, &[])
            .unwrap()
            .is_none());

        locks.try_unlock(&[c.outpoint]).unwrap();
        let picked = selector.select(vec![c], &[30_000], 40_000, &[]).unwrap();
        assert!(picked.is_some());
    }

    #[test]
    fn test_ordering_is_stable_within_process() {
        let mut a: Vec<Coin> = (0..10).map(|n| coin(n, 1_000)).collect();
        let mut b = a.clone();
        b.reverse();

        order_candidates(&mut a);
        order_candidates(&mut b);

        let a_keys: Vec<_> = a.iter().map(|c| c.outpoint).collect();
        let b_keys: Vec<_> = b.iter().map(|c| c.outpoint).collect();
        assert_eq!(a_keys, b_keys);
    }
}
