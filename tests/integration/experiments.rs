//! tests/integration/experiments.rs
//!
//! Whole-experiment runs over loopback QUIC: a real tracker, real nodes,
//! real crash injection, and assertions on the JSON reports the tracker
//! writes. These are the slowest tests in the suite; each one runs a full
//! experiment in real time.

use crate::common::harness::{self, TestCluster};
use gossip_fd::{
    domain::{NodeId, PickStrategy},
    tracker::experiment::ExpectedCrash,
};
use std::time::Duration;
use test_log::test;

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_crash_free_run_reports_nothing() {
    // Three nodes, nobody crashes: the report must list neither expected
    // nor reported crashes.
    let cluster = TestCluster::spawn(3, |_| {
        vec![harness::fixed_experiment(
            0,
            harness::settings(3, 5_000, 200, 1_200, 1_200, false, PickStrategy::Uniform, false),
            Vec::new(),
        )]
    })
    .await
    .unwrap();

    let reports = cluster.await_reports(Duration::from_secs(30)).await.unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert!(report.result.expected_crashes.is_empty());
    assert!(
        report.result.reported_crashes.is_empty(),
        "no node should be suspected in a crash-free run: {:?}",
        report.result.reported_crashes
    );
    assert!(report.result.end_time >= report.result.start_time + 5_000);
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_single_crash_detected_by_every_correct_node() {
    const CRASH_AT: u64 = 1_000;
    const GOSSIP_DELTA: u64 = 250;
    const FAILURE_DELTA: u64 = 6 * GOSSIP_DELTA;

    let cluster = TestCluster::spawn(5, |ids| {
        vec![harness::fixed_experiment(
            0,
            harness::settings(
                5,
                8_000,
                GOSSIP_DELTA,
                FAILURE_DELTA,
                FAILURE_DELTA,
                true,
                PickStrategy::Linear,
                false,
            ),
            vec![ExpectedCrash {
                delta: CRASH_AT,
                node: ids[3].clone(),
            }],
        )]
    })
    .await
    .unwrap();

    let victim = cluster.node_ids[3].clone();
    let correct: Vec<NodeId> = cluster
        .node_ids
        .iter()
        .filter(|id| **id != victim)
        .cloned()
        .collect();

    let reports = cluster.await_reports(Duration::from_secs(40)).await.unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(
        report.result.expected_crashes,
        vec![ExpectedCrash {
            delta: CRASH_AT,
            node: victim.clone()
        }]
    );

    for reporter in &correct {
        assert_eq!(
            harness::report_count(report, reporter, &victim),
            1,
            "{reporter} should report {victim} exactly once: {:?}",
            report.result.reported_crashes
        );
    }
    for crash in &report.result.reported_crashes {
        assert_eq!(crash.node, victim, "only the crashed node may be suspected");
        assert!(crash.delta > CRASH_AT, "detected before the crash: {}", crash.delta);
        assert!(
            crash.delta < CRASH_AT + FAILURE_DELTA + 8 * GOSSIP_DELTA + 1_000,
            "detection far outside the expected window: {}",
            crash.delta
        );
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 8))]
async fn test_catastrophe_recovered_through_multicast() {
    // Seven nodes, ⌈2·7/3⌉ = 5 crash simultaneously. The two survivors must
    // find all five victims, and every verdict must have gone through the
    // MISSING grace period first.
    const CRASH_AT: u64 = 1_500;
    const GOSSIP_DELTA: u64 = 300;
    const FAILURE_DELTA: u64 = 6 * GOSSIP_DELTA;

    let cluster = TestCluster::spawn(7, |ids| {
        let mut settings = harness::settings(
            7,
            12_000,
            GOSSIP_DELTA,
            FAILURE_DELTA,
            FAILURE_DELTA,
            false,
            PickStrategy::Uniform,
            true,
        );
        settings.catastrophe = true;
        vec![harness::fixed_experiment(
            0,
            settings,
            ids[..5]
                .iter()
                .map(|node| ExpectedCrash {
                    delta: CRASH_AT,
                    node: node.clone(),
                })
                .collect(),
        )]
    })
    .await
    .unwrap();

    let victims: Vec<NodeId> = cluster.node_ids[..5].to_vec();
    let survivors: Vec<NodeId> = cluster.node_ids[5..].to_vec();

    let reports = cluster.await_reports(Duration::from_secs(60)).await.unwrap();
    assert_eq!(reports.len(), 1);
    let report = &reports[0];
    assert_eq!(report.result.expected_crashes.len(), 5);

    for survivor in &survivors {
        for victim in &victims {
            assert_eq!(
                harness::report_count(report, survivor, victim),
                1,
                "{survivor} should report {victim} exactly once: {:?}",
                report.result.reported_crashes
            );
        }
    }
    for crash in &report.result.reported_crashes {
        assert!(
            victims.contains(&crash.node),
            "a survivor was suspected: {crash:?}"
        );
        assert!(
            crash.delta > CRASH_AT + FAILURE_DELTA,
            "verdict skipped the MISSING grace period: {}",
            crash.delta
        );
    }
}

#[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
async fn test_experiments_run_sequentially_with_one_report_each() {
    // Two crash-free experiments back to back: two reports, in order, with
    // the second starting only after the first stopped.
    let make = |id: usize| {
        harness::fixed_experiment(
            id,
            harness::settings(3, 1_500, 100, 1_000, 1_000, true, PickStrategy::Quadratic, false),
            Vec::new(),
        )
    };
    let cluster = TestCluster::spawn(3, |_| vec![make(0), make(1)]).await.unwrap();

    let reports = cluster.await_reports(Duration::from_secs(30)).await.unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].id, 0);
    assert_eq!(reports[1].id, 1);
    for report in &reports {
        assert!(report.result.reported_crashes.is_empty());
    }
    assert!(
        reports[1].result.start_time >= reports[0].result.end_time,
        "experiments must not overlap"
    );
}
