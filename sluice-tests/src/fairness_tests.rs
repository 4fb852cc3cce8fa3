//! Fairness scenarios: proportional sharing, idle return, share updates,
//! cancellation accounting, and a seeded random workload.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use sluice_flow::{FairGroupConfig, FairQueueConfig, Ticket};

use crate::harness::SchedSim;

const REQUEST: Ticket = Ticket::new(1, 4096);

/// Seeds that drive the randomized workload.
const WORKLOAD_SEEDS: &[u64] = &[42, 12_345, 0xDEAD_BEEF];

/// A group whose grantable window is so large that capacity never pauses
/// dispatch in these scenarios.
fn open_group_config() -> FairGroupConfig {
    FairGroupConfig::new(1_000, 1 << 20, 1_000_000, 64 << 20)
        .with_rate_factor(1_024.0)
        .with_rate_limit_duration_us(10_000_000)
}

fn open_sim(queue_config: FairQueueConfig) -> SchedSim {
    let mut sim = SchedSim::new(&open_group_config(), queue_config);
    // Grant the whole burst window up front.
    sim.advance_ticks(10_000);
    sim
}

#[test]
fn test_proportional_sharing_three_to_one() {
    let mut sim = open_sim(FairQueueConfig::for_testing());
    sim.register_class(0, 100);
    sim.register_class(1, 300);

    for seq in 0..4_000 {
        sim.offer(0, seq, REQUEST);
        sim.offer(1, 10_000 + seq, REQUEST);
    }
    sim.dispatch();
    sim.complete_all();
    assert!(sim.verify().is_empty());

    // Shares 300 against 100 entitle class 1 to three quarters of the
    // early slots, within two percent.
    let first = &sim.records()[..4_000];
    let b_share = first.iter().filter(|r| r.class_id == 1).count();
    assert!(b_share.abs_diff(3_000) <= 60, "b_share = {b_share}");
}

#[test]
fn test_idle_class_returns_within_tau() {
    // A short fairness window keeps the newcomer's catch-up run small.
    let mut sim = open_sim(FairQueueConfig::new(100));
    sim.register_class(0, 100);
    sim.register_class(1, 300);

    // Class 0 runs alone for a while.
    for seq in 0..1_000 {
        sim.offer(0, seq, REQUEST);
    }
    sim.dispatch();
    let before_join = sim.records().len();
    assert_eq!(before_join, 1_000);

    // Class 1 joins with a backlog of its own; class 0 keeps offering.
    for seq in 0..400 {
        sim.offer(0, 2_000 + seq, REQUEST);
        sim.offer(1, 10_000 + seq, REQUEST);
    }
    sim.dispatch();
    sim.complete_all();
    assert!(sim.verify().is_empty());

    let after = &sim.records()[before_join..];

    // The returning class is served immediately.
    assert_eq!(after[0].class_id, 1);

    // Its catch-up run is bounded by the fairness window.
    let run = after.iter().take_while(|r| r.class_id == 1).count();
    assert!((1..=35).contains(&run), "run = {run}");

    // Beyond the catch-up run the backlog is shared 3:1, so the slower
    // class is not starved.
    let rest = &after[run..];
    let a_count = rest.iter().filter(|r| r.class_id == 0).count();
    assert!(a_count * 5 >= rest.len(), "a_count = {a_count} of {}", rest.len());
}

#[test]
fn test_share_update_shifts_ratio() {
    let mut sim = open_sim(FairQueueConfig::for_testing());
    sim.register_class(0, 1);
    sim.register_class(1, 1);

    // Equal shares serve an equal split.
    for seq in 0..100 {
        sim.offer(0, seq, REQUEST);
        sim.offer(1, 10_000 + seq, REQUEST);
    }
    sim.dispatch();
    assert_eq!(sim.served(0), 100);
    assert_eq!(sim.served(1), 100);

    // Raising class 0 to ten shares shifts new dispatches toward 10:1.
    sim.update_shares(0, 10);
    for seq in 0..1_100 {
        sim.offer(0, 2_000 + seq, REQUEST);
        sim.offer(1, 20_000 + seq, REQUEST);
    }
    sim.dispatch();
    sim.complete_all();
    assert!(sim.verify().is_empty());

    let after = &sim.records()[200..];
    let a_count = after
        .iter()
        .take(1_100)
        .filter(|r| r.class_id == 0)
        .count();
    assert!(a_count.abs_diff(1_000) <= 40, "a_count = {a_count}");
}

#[test]
fn test_cancellation_keeps_accounting_exact() {
    let mut sim = open_sim(FairQueueConfig::for_testing());
    sim.register_class(0, 100);

    for seq in 0..10 {
        sim.offer(0, seq, REQUEST);
    }
    sim.cancel(3);
    sim.cancel(7);
    assert!(sim.verify().is_empty());

    sim.dispatch();
    sim.complete_all();
    assert!(sim.verify().is_empty());

    // Exactly eight live entries arrive, still in arrival order; the two
    // cancelled ones surface flagged and charge nothing.
    let live: Vec<u64> = sim
        .records()
        .iter()
        .filter(|r| !r.cancelled)
        .map(|r| r.seq)
        .collect();
    assert_eq!(live, vec![0, 1, 2, 4, 5, 6, 8, 9]);
    let cancelled: Vec<u64> = sim
        .records()
        .iter()
        .filter(|r| r.cancelled)
        .map(|r| r.seq)
        .collect();
    assert_eq!(cancelled, vec![3, 7]);

    assert!(sim.queue().resources_currently_waiting().is_zero());
    assert_eq!(sim.queue().waiters(), 0);
}

#[test]
fn test_randomized_workload_holds_invariants() {
    for &seed in WORKLOAD_SEEDS {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut sim = open_sim(FairQueueConfig::for_testing());
        for class in 0..4 {
            sim.register_class(class, rng.gen_range(1..=512));
        }

        let mut next_seq = 0_u64;
        for step in 0..600 {
            match rng.gen_range(0_u32..100) {
                0..=54 => {
                    let class = rng.gen_range(0..4_u32);
                    let ticket = Ticket::new(1, rng.gen_range(512..=32_768));
                    sim.offer(class, next_seq, ticket);
                    next_seq += 1;
                }
                55..=69 => {
                    if next_seq > 0 {
                        // May target an already-dispatched entry; that must
                        // be a harmless no-op.
                        let seq = rng.gen_range(0..next_seq);
                        sim.cancel(seq);
                    }
                }
                70..=79 => {
                    sim.dispatch();
                }
                80..=89 => {
                    sim.advance_ticks(1);
                }
                _ => {
                    sim.complete_all();
                }
            }

            let violations = sim.verify();
            assert!(
                violations.is_empty(),
                "seed {seed} step {step}: {violations:?}"
            );
        }
    }
}
