//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - No lost updates: the final balance is the sum of applied deltas
//! - Money conservation: transfers never create or destroy funds
//! - Non-negativity: a rejected operation leaves balances untouched
//! - Atomic export: debit and enqueue happen together or not at all

use bank_core::{Amount, Config, Error, Export, Ledger, UserId};
use proptest::prelude::*;
use rand::Rng;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

/// Create test ledger with temp directory
fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();

    (Ledger::open(config).unwrap(), temp_dir)
}

fn users(n: usize) -> Vec<UserId> {
    (0..n).map(|i| UserId::new(format!("U{:04}", i))).collect()
}

/// Strategy for transfers between a small set of users: (dst, src, amount)
fn transfer_strategy(n: usize) -> impl Strategy<Value = (usize, usize, Amount)> {
    (0..n, 0..n, 1i64..200)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: increments behave like a checked running sum
    #[test]
    fn prop_increment_matches_model(deltas in prop::collection::vec(-50i64..50, 1..40)) {
        let (ledger, _temp) = create_test_ledger();
        let user = UserId::new("U0001");
        let mut model: Amount = 0;

        for delta in deltas {
            match ledger.incr(&user, delta) {
                Ok(balance) => {
                    model += delta;
                    prop_assert_eq!(balance, model);
                }
                Err(e) => {
                    prop_assert!(e.is_insufficient_funds());
                    prop_assert!(model + delta < 0);
                }
            }
            prop_assert_eq!(ledger.balance(&user).unwrap(), model);
            prop_assert!(model >= 0);
        }
    }

    /// Property: transfers conserve the total and never overdraw
    #[test]
    fn prop_transfers_conserve_money(
        initial in prop::collection::vec(0i64..500, 4),
        transfers in prop::collection::vec(transfer_strategy(4), 1..40),
    ) {
        let (ledger, _temp) = create_test_ledger();
        let users = users(4);
        let mut model = initial.clone();
        for (user, amount) in users.iter().zip(&initial) {
            if *amount > 0 {
                ledger.incr(user, *amount).unwrap();
            }
        }
        let total: Amount = initial.iter().sum();

        for (dst, src, amount) in transfers {
            match ledger.transfer(&users[dst], &users[src], amount) {
                Ok((new_dst, new_src)) => {
                    if dst != src {
                        model[src] -= amount;
                        model[dst] += amount;
                    }
                    prop_assert_eq!(new_dst, model[dst]);
                    prop_assert_eq!(new_src, model[src]);
                }
                Err(e) => {
                    prop_assert!(e.is_insufficient_funds());
                    prop_assert!(model[src] < amount);
                }
            }
        }

        for (user, expected) in users.iter().zip(&model) {
            prop_assert_eq!(ledger.balance(user).unwrap(), *expected);
        }
        let sum: Amount = users.iter().map(|u| ledger.balance(u).unwrap()).sum();
        prop_assert_eq!(sum, total);
    }

    /// Property: every accepted export is debited exactly once and queued
    /// exactly once; every rejected export leaves no trace
    #[test]
    fn prop_submit_export_all_or_nothing(
        initial in 0i64..300,
        amounts in prop::collection::vec(-5i64..80, 1..20),
    ) {
        let (ledger, _temp) = create_test_ledger();
        let exports = ledger.exports();
        let user = UserId::new("U0001");
        if initial > 0 {
            ledger.incr(&user, initial).unwrap();
        }

        let mut balance = initial;
        let mut queued = 0u64;
        for amount in amounts {
            match exports.submit_export(Export::new(user.clone(), amount, "chain", "p")) {
                Ok(id) => {
                    balance -= amount;
                    queued += 1;
                    prop_assert_eq!(id.seq(), queued);
                }
                Err(Error::InvalidAmount(n)) => prop_assert!(n <= 0),
                Err(e) => {
                    prop_assert!(e.is_insufficient_funds());
                    prop_assert!(balance < amount);
                }
            }
            prop_assert_eq!(ledger.balance(&user).unwrap(), balance);
            prop_assert_eq!(ledger.outbox().len().unwrap(), queued);
        }
    }
}

#[cfg(test)]
mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_increments_lose_nothing() {
        let (ledger, _temp) = create_test_ledger();
        let ledger = Arc::new(ledger);
        let user = UserId::new("U0001");
        ledger.incr(&user, 100).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (ledger, user) = (ledger.clone(), user.clone());
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    let mut applied: Amount = 0;
                    for _ in 0..100 {
                        let delta = rng.gen_range(-20i64..=20);
                        match ledger.incr(&user, delta) {
                            Ok(balance) => {
                                assert!(balance >= 0);
                                applied += delta;
                            }
                            Err(e) => assert!(e.is_insufficient_funds()),
                        }
                    }
                    applied
                })
            })
            .collect();

        let applied: Amount = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(ledger.balance(&user).unwrap(), 100 + applied);
    }

    #[test]
    fn test_concurrent_transfers_and_exports_conserve_money() {
        let (ledger, _temp) = create_test_ledger();
        let ledger = Arc::new(ledger);
        let users = Arc::new(users(5));
        for user in users.iter() {
            ledger.incr(user, 1_000).unwrap();
        }

        let handles: Vec<_> = (0..6)
            .map(|worker| {
                let (ledger, users) = (ledger.clone(), users.clone());
                thread::spawn(move || {
                    let exports = ledger.exports();
                    let mut rng = rand::thread_rng();
                    let mut exported: Amount = 0;
                    for _ in 0..150 {
                        let src = &users[rng.gen_range(0..users.len())];
                        let amount = rng.gen_range(1i64..=60);
                        if worker % 3 == 0 {
                            match exports.submit_export(Export::new(src.clone(), amount, "chain", "p")) {
                                Ok(_) => exported += amount,
                                Err(e) => assert!(e.is_insufficient_funds()),
                            }
                        } else {
                            let dst = &users[rng.gen_range(0..users.len())];
                            if let Err(e) = ledger.transfer(dst, src, amount) {
                                assert!(e.is_insufficient_funds());
                            }
                        }
                    }
                    exported
                })
            })
            .collect();

        let exported: Amount = handles.into_iter().map(|h| h.join().unwrap()).sum();
        let remaining: Amount = users.iter().map(|u| ledger.balance(u).unwrap()).sum();
        for user in users.iter() {
            assert!(ledger.balance(user).unwrap() >= 0);
        }
        assert_eq!(remaining + exported, 5_000);

        // The outbox holds exactly the accepted exports
        let mut queued: Amount = 0;
        for seq in 1..=ledger.outbox().len().unwrap() {
            let payload = ledger.outbox().get(bank_core::RecordId::new(seq)).unwrap().unwrap();
            let export: Export = serde_json::from_slice(&payload).unwrap();
            queued += export.amount;
        }
        assert_eq!(queued, exported);
    }
}
