//! Transaction lifecycle tests
//!
//! Drive a single tablet through proposal, planning, predicate
//! calculation, the decision exchange and execution.

mod common;

use common::*;
use pq_tablet::storage::tx_key;
use pq_tablet::{Decision, ProposeRequest, ProposeStatus, ReadSetAck, TransactionState, TxOperation};

#[tokio::test]
async fn test_local_transaction_commits() {
    let mut h = Harness::new().await;

    h.propose_write(1, &[]).await;
    assert_eq!(h.links.statuses(1), vec![ProposeStatus::Prepared]);
    assert_eq!(h.state(1), Some(TransactionState::Prepared));
    assert!(h.store.contains(&tx_key(1)));

    h.plan(10, &[1]).await;
    assert_eq!(h.state(1), Some(TransactionState::Calculating));
    assert_eq!(h.links.pending_calc(), 1);

    h.answer(|_, _| true).await;
    assert_eq!(h.state(1), Some(TransactionState::Executing));
    assert_eq!(h.links.executions(), vec![(1, 0, true)]);

    h.complete().await;
    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Complete));
    assert_eq!(h.state(1), None);
    assert!(!h.store.contains(&tx_key(1)));
    assert_eq!(h.manager.exec_step(), (10, 1));

    let stats = h.manager.stats().snapshot();
    assert_eq!(stats.prepared, 1);
    assert_eq!(stats.committed, 1);
}

#[tokio::test]
async fn test_false_predicate_rolls_back() {
    let mut h = Harness::new().await;
    h.propose(ProposeRequest::data(
        1,
        vec![TxOperation::write(0), TxOperation::write(1)],
    ))
    .await;
    h.plan(10, &[1]).await;

    h.settle(|_, partition| partition != 1).await;

    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Aborted));
    let mut executions = h.links.executions();
    executions.sort();
    assert_eq!(executions, vec![(1, 0, false), (1, 1, false)]);
    assert_eq!(h.manager.stats().snapshot().aborted, 1);
}

#[tokio::test]
async fn test_decision_exchange_with_peers() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2, 3]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;

    assert_eq!(h.state(1), Some(TransactionState::WaitRs));
    for peer in [2, 3] {
        let sent = h.links.read_sets_to(peer, 1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].step, 10);
        assert_eq!(sent[0].source, TABLET);
        assert_eq!(sent[0].decision(), Decision::Commit);
    }

    h.read_set(2, 10, 1, Decision::Commit).await;
    assert_eq!(h.state(1), Some(TransactionState::WaitRs));

    h.read_set(3, 10, 1, Decision::Commit).await;
    assert_eq!(h.state(1), Some(TransactionState::Executing));

    h.complete().await;
    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Complete));
    assert_eq!(h.state(1), Some(TransactionState::WaitRsAcks));
    assert_eq!(
        h.links.acks_to(2, 1),
        vec![ReadSetAck {
            step: 10,
            tx_id: 1,
            source: 2,
            target: TABLET,
            consumer: TABLET,
        }]
    );
    assert_eq!(h.links.acks_to(3, 1).len(), 1);

    h.ack(2, 10, 1).await;
    assert_eq!(h.state(1), Some(TransactionState::WaitRsAcks));
    h.ack(3, 10, 1).await;
    assert_eq!(h.state(1), None);
    assert!(!h.store.contains(&tx_key(1)));
}

#[tokio::test]
async fn test_peer_abort_aborts() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2, 3]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;

    h.read_set(2, 10, 1, Decision::Commit).await;
    h.read_set(3, 10, 1, Decision::Abort).await;
    h.complete().await;

    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Aborted));
    assert_eq!(h.links.executions(), vec![(1, 0, false)]);
}

#[tokio::test]
async fn test_unknown_peer_decision_aborts() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;

    h.read_set(2, 10, 1, Decision::Unknown).await;
    h.complete().await;

    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Aborted));
}

#[tokio::test]
async fn test_local_abort_is_sent_to_peers() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| false).await;

    let sent = h.links.read_sets_to(2, 1);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].decision(), Decision::Abort);

    // Still waits for the peer before executing
    assert_eq!(h.state(1), Some(TransactionState::WaitRs));
    h.read_set(2, 10, 1, Decision::Commit).await;
    h.complete().await;
    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Aborted));
}

#[tokio::test]
async fn test_read_set_before_plan_step_is_kept() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;

    h.read_set(2, 10, 1, Decision::Commit).await;
    assert_eq!(h.state(1), Some(TransactionState::Prepared));

    h.plan(10, &[1]).await;
    h.settle_commit().await;
    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Complete));
}

#[tokio::test]
async fn test_early_read_set_for_other_step_is_dropped() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;

    h.read_set(2, 9, 1, Decision::Commit).await;
    h.plan(10, &[1]).await;
    h.settle_commit().await;

    assert_eq!(h.state(1), Some(TransactionState::WaitRs));
    let tx = h.manager.tx(1).expect("tx");
    assert_eq!(tx.missing_senders(), vec![2]);
}

#[tokio::test]
async fn test_read_set_from_non_sender_is_ignored() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;

    h.read_set(4, 10, 1, Decision::Commit).await;
    assert_eq!(h.state(1), Some(TransactionState::WaitRs));
    assert!(h.links.acks_to(4, 1).is_empty());
}

#[tokio::test]
async fn test_read_set_step_mismatch_is_ignored() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;

    h.read_set(2, 11, 1, Decision::Commit).await;
    assert_eq!(h.state(1), Some(TransactionState::WaitRs));
    assert_eq!(h.manager.tx(1).expect("tx").decision_from(2), None);
}

#[tokio::test]
async fn test_duplicate_read_set_keeps_first_decision() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2, 3]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;

    h.read_set(2, 10, 1, Decision::Abort).await;
    h.read_set(2, 10, 1, Decision::Commit).await;
    assert_eq!(
        h.manager.tx(1).expect("tx").decision_from(2),
        Some(Decision::Abort)
    );
}

#[tokio::test]
async fn test_read_set_for_unknown_tx_is_acknowledged() {
    let mut h = Harness::new().await;

    h.read_set(2, 10, 99, Decision::Commit).await;

    assert_eq!(
        h.links.acks_to(2, 99),
        vec![ReadSetAck {
            step: 10,
            tx_id: 99,
            source: 2,
            target: TABLET,
            consumer: TABLET,
        }]
    );
}

#[tokio::test]
async fn test_read_set_for_executed_tx_is_acknowledged() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2, 3]).await;
    h.plan(10, &[1]).await;
    h.answer(|_, _| true).await;
    h.read_set(2, 10, 1, Decision::Commit).await;
    h.read_set(3, 10, 1, Decision::Commit).await;
    h.complete().await;
    h.links.clear_messages();

    // Peer 2 lost our ack and re-sends
    h.read_set(2, 10, 1, Decision::Commit).await;
    assert_eq!(h.links.acks_to(2, 1).len(), 1);
    assert_eq!(h.state(1), Some(TransactionState::WaitRsAcks));
}

#[tokio::test]
async fn test_duplicate_proposal_is_idempotent() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[]).await;
    h.propose_write(1, &[]).await;

    assert_eq!(
        h.links.statuses(1),
        vec![ProposeStatus::Prepared, ProposeStatus::Prepared]
    );
    assert_eq!(h.manager.tx_count(), 1);
}

#[tokio::test]
async fn test_duplicate_proposal_after_execution_reports_outcome() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[2]).await;
    h.propose_write(2, &[2]).await;
    h.plan(10, &[1, 2]).await;
    h.answer(|tx_id, _| tx_id == 1).await;
    h.read_set(2, 10, 1, Decision::Commit).await;
    h.read_set(2, 10, 2, Decision::Commit).await;
    h.complete().await;
    assert_eq!(h.state(1), Some(TransactionState::WaitRsAcks));
    assert_eq!(h.state(2), Some(TransactionState::WaitRsAcks));

    h.propose_write(1, &[2]).await;
    h.propose_write(2, &[2]).await;
    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Complete));
    assert_eq!(h.links.last_status(2), Some(ProposeStatus::Aborted));

    // The same answer after a restart, from the durable outcome
    h.restart().await;
    h.propose_write(1, &[2]).await;
    assert_eq!(h.links.statuses(1), vec![ProposeStatus::Complete]);
}

#[tokio::test]
async fn test_malformed_proposals_are_aborted() {
    let mut h = Harness::new().await;

    h.propose(ProposeRequest::data(1, vec![])).await;
    h.propose(ProposeRequest::data(2, vec![TxOperation::write(42)]))
        .await;
    let mut both = ProposeRequest::data(3, vec![TxOperation::write(0)]);
    both.config = Some(topic().with_version(2));
    h.propose(both).await;

    for tx_id in [1, 2, 3] {
        assert_eq!(h.links.statuses(tx_id), vec![ProposeStatus::Aborted]);
    }
    let reasons: Vec<String> = h
        .links
        .with(|r| r.results.iter().filter_map(|res| res.reason.clone()).collect());
    assert_eq!(reasons[0], "missing operations");
    assert!(reasons[1].contains("unknown partition 42"));
    assert!(reasons[2].contains("mutually exclusive"));

    // Nothing was persisted
    assert_eq!(h.manager.tx_count(), 0);
    assert!(h.store.keys().iter().all(|k| !k.starts_with("tx_")));
}

#[tokio::test]
async fn test_cancel_before_plan() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[]).await;

    h.manager.cancel_proposal(1).await.expect("cancel");
    assert_eq!(h.state(1), None);
    assert!(!h.store.contains(&tx_key(1)));

    // Unknown ids are ignored
    h.manager.cancel_proposal(1).await.expect("cancel again");
}

#[tokio::test]
async fn test_cancel_after_plan_is_ignored() {
    let mut h = Harness::new().await;
    h.propose_write(1, &[]).await;
    h.plan(10, &[1]).await;

    h.manager.cancel_proposal(1).await.expect("cancel");
    assert_eq!(h.state(1), Some(TransactionState::Calculating));

    h.settle_commit().await;
    assert_eq!(h.links.last_status(1), Some(ProposeStatus::Complete));
}

#[tokio::test]
async fn test_store_failure_stops_before_reply() {
    let mut h = Harness::new().await;
    h.store.set_fail_writes(true);

    let result = h
        .manager
        .propose(ProposeRequest::data(1, vec![TxOperation::write(0)]))
        .await;
    assert!(result.is_err());
    assert!(h.links.statuses(1).is_empty());
}
