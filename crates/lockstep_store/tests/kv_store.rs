//! Strongly-consistent k/v store operations through the full pipeline.
//!
//! Test flow:
//! 1) Submit updates and selects as unguarded commands through the log.
//! 2) Fetch each result from the side-channel on the proposing node.
//!
//! Failure model covered:
//! - Conditional updates applying despite a mismatched condition.
//! - Results missing from the side-channel or reported for the wrong
//!   command.
//! - Writes invisible to reads on other nodes after apply.
//!
//! Verification:
//! - Update-then-select round-trips the value; conditional updates report
//!   `applied` and the previous value exactly as the stored state dictates.

mod common;

use common::{kv_select, kv_update, TestCluster};
use lockstep_store::QueryResult;

#[tokio::test]
async fn update_then_select_round_trips() {
    let cluster = TestCluster::new(1);
    let node = cluster.node(1);

    assert_eq!(kv_select(node, b"k").await, None);
    assert_eq!(kv_update(node, b"k", b"v", None).await, QueryResult::None);
    assert_eq!(kv_select(node, b"k").await, Some(b"v".to_vec()));
}

#[tokio::test]
async fn conditional_update_applies_on_matching_value() {
    let cluster = TestCluster::new(1);
    let node = cluster.node(1);

    kv_update(node, b"k", b"v0", None).await;
    let result = kv_update(node, b"k", b"v1", Some(b"v0")).await;
    assert_eq!(
        result,
        QueryResult::ConditionalUpdate {
            applied: true,
            previous_value: Some(b"v0".to_vec()),
        }
    );
    assert_eq!(kv_select(node, b"k").await, Some(b"v1".to_vec()));
}

#[tokio::test]
async fn conditional_update_skips_on_mismatched_value() {
    let cluster = TestCluster::new(1);
    let node = cluster.node(1);

    kv_update(node, b"k", b"v0", None).await;
    let result = kv_update(node, b"k", b"v1", Some(b"v2")).await;
    assert_eq!(
        result,
        QueryResult::ConditionalUpdate {
            applied: false,
            previous_value: Some(b"v0".to_vec()),
        }
    );
    assert_eq!(kv_select(node, b"k").await, Some(b"v0".to_vec()));
}

#[tokio::test]
async fn conditional_update_on_missing_key_is_skipped() {
    let cluster = TestCluster::new(1);
    let node = cluster.node(1);

    let result = kv_update(node, b"k", b"v1", Some(b"v0")).await;
    assert_eq!(
        result,
        QueryResult::ConditionalUpdate {
            applied: false,
            previous_value: None,
        }
    );
    assert_eq!(kv_select(node, b"k").await, None);
}

#[tokio::test]
async fn writes_are_visible_from_other_nodes() {
    let cluster = TestCluster::new(2);
    let node1 = cluster.node(1);
    let node2 = cluster.node(2);

    kv_update(node1, b"k", b"v", None).await;

    // Node 2 issues its own linearized read through the log.
    assert_eq!(kv_select(node2, b"k").await, Some(b"v".to_vec()));
}

#[tokio::test]
async fn interleaved_updates_keep_the_latest_value() {
    let cluster = TestCluster::new(1);
    let node = cluster.node(1);

    for (value, condition) in [
        (&b"a"[..], None),
        (&b"b"[..], Some(&b"a"[..])),
        (&b"c"[..], Some(&b"zzz"[..])),
        (&b"d"[..], None),
    ] {
        kv_update(node, b"k", value, condition).await;
    }
    // "c" never applied: its condition did not match.
    assert_eq!(kv_select(node, b"k").await, Some(b"d".to_vec()));
}
