//! End-to-end tests for the triage pipeline over fake boundaries.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{Harness, MAILBOX, test_config};
use mail_triage::config::{ClassificationPolicy, RecoveryPoint, TriageConfig};
use mail_triage::error::BatchError;
use mail_triage::pipeline::retry::RetryPolicy;
use mail_triage::pipeline::types::{ActionStatus, Trigger, Watermark};
use mail_triage::pipeline::{
    CommitStatus, MailboxScheduler, Settlement, ShutdownSignal, Submission, shutdown_channel,
};
use mail_triage::store::{CursorStore, InMemoryCursorStore, LibSqlCursorStore};

/// Mailbox at 100 with A (urgent) at 101 and B (routine) at 103.
async fn seeded_harness() -> (Harness, Arc<InMemoryCursorStore>) {
    let harness = Harness::new();
    harness.changes.push(MAILBOX, 101, "A");
    harness.changes.push(MAILBOX, 103, "B");
    harness
        .messages
        .add("A", "URGENT: server down", "ops@example.com", "prod is down");
    harness
        .messages
        .add("B", "Lunch on Friday?", "friend@example.com", "tacos");

    let store = Arc::new(InMemoryCursorStore::new());
    store.seed(MAILBOX, Watermark::new(100)).await;
    (harness, store)
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn urgent_message_is_tagged_and_notified_routine_one_is_left_alone() {
    let (harness, store) = seeded_harness().await;
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    assert_eq!(report.started_from, Watermark::new(100));
    assert_eq!(report.settled_count(), 2);
    assert_eq!(report.committed(), Some(Watermark::new(103)));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(103));

    let a = report.outcome("A").unwrap();
    let analysis = a.analysis.as_ref().unwrap();
    assert!(analysis.is_urgent);
    assert_eq!(analysis.confidence, Some(0.9));
    let (tag, notify) = a.actions().unwrap();
    assert_eq!(tag.status, ActionStatus::Done);
    assert_eq!(notify.status, ActionStatus::Done);
    assert!(harness.labels.is_labelled("A"));

    let delivered = harness.notifier.delivered();
    assert_eq!(delivered.len(), 1);
    let (key, payload) = &delivered[0];
    assert_eq!(key, "triage:notify:A");
    assert_eq!(payload.sender, "ops@example.com");
    assert_eq!(payload.subject, "URGENT: server down");
    assert_eq!(payload.summary, "summary of prod is down");
    assert!(payload.source_link.ends_with("thread-A"));

    let b = report.outcome("B").unwrap();
    assert_eq!(b.settlement, Settlement::NoAction);
    assert!(!harness.labels.is_labelled("B"));
    assert_eq!(harness.labels.labelled_count(), 1);
}

#[tokio::test]
async fn redelivered_trigger_is_a_full_noop() {
    let (harness, store) = seeded_harness().await;
    let orchestrator = harness.orchestrator(test_config(), store.clone());
    let trigger = Trigger::new(MAILBOX, 103u64);

    orchestrator.run_batch(&trigger).await.unwrap();
    let listings = harness.changes.calls();
    let fetches = harness.messages.total_fetches();
    let labels = harness.labels.calls();
    let deliveries = harness.notifier.attempts();

    let replay = orchestrator.run_batch(&trigger).await.unwrap();
    assert!(replay.is_noop());
    assert_eq!(replay.commit, CommitStatus::AlreadyCovered);
    assert!(replay.outcomes.is_empty());
    assert_eq!(harness.changes.calls(), listings);
    assert_eq!(harness.messages.total_fetches(), fetches);
    assert_eq!(harness.labels.calls(), labels);
    assert_eq!(harness.notifier.attempts(), deliveries);

    let older = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 101u64))
        .await
        .unwrap();
    assert!(older.is_noop());
    assert_eq!(harness.changes.calls(), listings);
}

#[tokio::test]
async fn expired_watermark_jumps_to_trigger_and_reports_data_loss() {
    let (harness, store) = seeded_harness().await;
    harness.changes.set_horizon(MAILBOX, 150);
    harness.changes.set_latest(MAILBOX, 210);
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 200u64))
        .await
        .unwrap();

    let recovery = report.recovery.unwrap();
    assert!(recovery.data_loss);
    assert_eq!(recovery.expired, Watermark::new(100));
    assert_eq!(recovery.resumed_from, Watermark::new(200));
    assert!(report.outcomes.is_empty());
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(200));
    assert_eq!(harness.messages.total_fetches(), 0);
}

#[tokio::test]
async fn rewind_recovery_replays_changes_after_the_rewind_point() {
    let (harness, store) = seeded_harness().await;
    harness.changes.set_horizon(MAILBOX, 150);
    harness.changes.push(MAILBOX, 198, "C");
    harness.changes.push(MAILBOX, 200, "D");
    harness
        .messages
        .add("C", "URGENT: disk full", "ops@example.com", "90% used");
    harness.messages.add("D", "Newsletter", "news@example.com", "hi");

    let config = TriageConfig {
        recovery: RecoveryPoint::Rewind { positions: 5 },
        ..test_config()
    };
    let orchestrator = harness.orchestrator(config, store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 200u64))
        .await
        .unwrap();

    let recovery = report.recovery.unwrap();
    assert!(recovery.data_loss);
    assert_eq!(recovery.resumed_from, Watermark::new(195));
    assert_eq!(report.outcomes.len(), 2);
    assert!(harness.labels.is_labelled("C"));
    assert!(!harness.labels.is_labelled("A"));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(200));
}

#[tokio::test]
async fn rewind_past_the_horizon_falls_back_to_trigger() {
    let (harness, store) = seeded_harness().await;
    harness.changes.set_horizon(MAILBOX, 190);
    harness.changes.set_latest(MAILBOX, 200);

    let config = TriageConfig {
        recovery: RecoveryPoint::Rewind { positions: 50 },
        ..test_config()
    };
    let orchestrator = harness.orchestrator(config, store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 200u64))
        .await
        .unwrap();

    let recovery = report.recovery.unwrap();
    assert_eq!(recovery.resumed_from, Watermark::new(200));
    assert!(report.outcomes.is_empty());
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(200));
}

#[tokio::test]
async fn new_mailbox_bootstraps_without_data_loss() {
    let harness = Harness::new();
    harness.changes.set_horizon("new@example.com", 1);
    harness.changes.set_latest("new@example.com", 500);
    let store = Arc::new(InMemoryCursorStore::new());
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new("new@example.com", 500u64))
        .await
        .unwrap();

    let recovery = report.recovery.unwrap();
    assert!(!recovery.data_loss);
    assert_eq!(recovery.expired, Watermark::BEGINNING);
    assert_eq!(
        store.load("new@example.com").await.unwrap(),
        Watermark::new(500)
    );
}

// ── Per-message isolation ───────────────────────────────────────────

#[tokio::test]
async fn missing_message_does_not_block_the_rest_of_the_batch() {
    let (harness, store) = seeded_harness().await;
    harness.changes.push(MAILBOX, 102, "gone");
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    assert_eq!(report.outcome("gone").unwrap().settlement, Settlement::Skipped);
    assert_eq!(harness.messages.fetches("gone"), 1);
    assert_eq!(report.settled_count(), 3);
    assert!(harness.labels.is_labelled("A"));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(103));
}

#[tokio::test]
async fn failed_notify_keeps_the_tag_and_settles() {
    let (harness, store) = seeded_harness().await;
    harness.notifier.set_failing(true);
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    let a = report.outcome("A").unwrap();
    assert!(a.is_settled());
    assert!(a.has_failure());
    let (tag, notify) = a.actions().unwrap();
    assert_eq!(tag.status, ActionStatus::Done);
    assert_eq!(notify.status, ActionStatus::Failed);
    assert_eq!(notify.attempts, 3);
    assert!(harness.labels.is_labelled("A"));
    assert_eq!(harness.notifier.attempts(), 3);
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(103));
}

#[tokio::test]
async fn replayed_batch_collapses_side_effects() {
    let (harness, store) = seeded_harness().await;
    let orchestrator = harness.orchestrator(test_config(), store.clone());
    let trigger = Trigger::new(MAILBOX, 103u64);

    store.set_commits_failing(true);
    let err = orchestrator.run_batch(&trigger).await.unwrap_err();
    assert!(matches!(err, BatchError::CommitFailed { .. }));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(100));

    store.set_commits_failing(false);
    let replay = orchestrator.run_batch(&trigger).await.unwrap();
    assert_eq!(replay.committed(), Some(Watermark::new(103)));

    // The label is applied once; the second call reports it already there.
    assert_eq!(harness.labels.labelled_count(), 1);
    assert_eq!(harness.labels.calls(), 2);
    // The notify key was recently issued, so the replay never reaches the channel.
    assert_eq!(harness.notifier.delivered().len(), 1);
    let (_, notify) = replay.outcome("A").unwrap().actions().unwrap();
    assert!(notify.deduplicated);
    assert_eq!(notify.attempts, 0);
    assert_eq!(notify.status, ActionStatus::Done);
}

#[tokio::test]
async fn duplicate_change_records_are_processed_once_at_highest_sequence() {
    let harness = Harness::new();
    harness.changes.push(MAILBOX, 103, "A");
    harness.changes.push(MAILBOX, 101, "A");
    harness.changes.push(MAILBOX, 102, "B");
    harness.changes.push(MAILBOX, 102, "B");
    harness.messages.add("A", "hello", "a@example.com", "x");
    harness.messages.add("B", "hi", "b@example.com", "y");
    let store = Arc::new(InMemoryCursorStore::new());
    store.seed(MAILBOX, Watermark::new(100)).await;
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.outcome("A").unwrap().sequence, Watermark::new(103));
    assert_eq!(harness.messages.fetches("A"), 1);
    assert_eq!(harness.messages.fetches("B"), 1);
    assert_eq!(harness.classifier.calls(), 2);
}

// ── Watermark ───────────────────────────────────────────────────────

#[tokio::test]
async fn stale_commit_never_moves_the_watermark_back() {
    let store = LibSqlCursorStore::new_memory().await.unwrap();
    assert!(store.commit(MAILBOX, Watermark::new(105)).await.unwrap());
    assert!(!store.commit(MAILBOX, Watermark::new(103)).await.unwrap());
    assert!(!store.commit(MAILBOX, Watermark::new(105)).await.unwrap());
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(105));
}

#[tokio::test]
async fn commit_failure_is_surfaced_and_leaves_the_watermark() {
    let (harness, store) = seeded_harness().await;
    store.set_commits_failing(true);
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let err = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap_err();

    match &err {
        BatchError::CommitFailed {
            mailbox_id,
            watermark,
            ..
        } => {
            assert_eq!(mailbox_id, MAILBOX);
            assert_eq!(*watermark, Watermark::new(103));
        }
        other => panic!("expected CommitFailed, got {other:?}"),
    }
    assert!(err.is_retryable());
    store.set_commits_failing(false);
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(100));
}

#[tokio::test]
async fn unavailable_store_blocks_batch_start() {
    let (harness, store) = seeded_harness().await;
    store.set_loads_failing(true);
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let err = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap_err();

    assert!(matches!(err, BatchError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(harness.changes.calls(), 0);
    assert_eq!(harness.messages.total_fetches(), 0);
}

// ── Classification policy ───────────────────────────────────────────

#[tokio::test]
async fn fail_closed_hold_bounds_the_commit_and_replays() {
    let (harness, store) = seeded_harness().await;
    harness.changes.push(MAILBOX, 102, "C");
    harness.messages.add("C", "Quarterly numbers", "cfo@example.com", "see attached");
    harness.classifier.fail_on("Quarterly numbers");
    let orchestrator = harness.orchestrator(test_config(), store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    assert!(matches!(
        report.outcome("C").unwrap().settlement,
        Settlement::Held { .. }
    ));
    assert_eq!(report.unsettled_count(), 1);
    assert_eq!(report.committed(), Some(Watermark::new(101)));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(101));

    harness.classifier.heal("Quarterly numbers");
    let replay = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();
    assert_eq!(replay.started_from, Watermark::new(101));
    assert_eq!(replay.outcome("C").unwrap().settlement, Settlement::NoAction);
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(103));
    // A settled in the first batch and is not revisited.
    assert!(replay.outcome("A").is_none());
    assert_eq!(harness.notifier.delivered().len(), 1);
}

#[tokio::test]
async fn fail_open_settles_unclassified_messages_as_routine() {
    let (harness, store) = seeded_harness().await;
    harness.classifier.fail_on("URGENT: server down");
    let config = TriageConfig {
        classification_policy: ClassificationPolicy::FailOpen,
        ..test_config()
    };
    let orchestrator = harness.orchestrator(config, store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    assert!(matches!(
        report.outcome("A").unwrap().settlement,
        Settlement::FailedOpen { .. }
    ));
    assert!(!harness.labels.is_labelled("A"));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(103));
}

#[tokio::test(start_paused = true)]
async fn messages_past_the_batch_budget_are_deferred() {
    let (harness, store) = seeded_harness().await;
    harness.changes.push(MAILBOX, 102, "slow");
    harness.messages.add("slow", "Big report", "bi@example.com", "charts");
    harness.classifier.slow_on("Big report", Duration::from_secs(5));
    let config = TriageConfig {
        batch_timeout: Duration::from_secs(1),
        ..test_config()
    };
    let orchestrator = harness.orchestrator(config, store.clone());

    let report = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap();

    assert!(matches!(
        report.outcome("slow").unwrap().settlement,
        Settlement::Deferred { .. }
    ));
    assert!(report.outcome("A").unwrap().is_settled());
    assert!(report.outcome("B").unwrap().is_settled());
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(101));
}

// ── Concurrency ─────────────────────────────────────────────────────

#[tokio::test]
async fn second_batch_for_a_busy_mailbox_is_refused() {
    let (harness, store) = seeded_harness().await;
    let gate = harness.changes.close_gate();
    let orchestrator = Arc::new(harness.orchestrator(test_config(), store.clone()));

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.run_batch(&Trigger::new(MAILBOX, 103u64)).await })
    };
    harness.changes.wait_for_calls(1).await;

    let err = orchestrator
        .run_batch(&Trigger::new(MAILBOX, 103u64))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchError::MailboxBusy { .. }));
    assert!(!err.is_retryable());

    gate.add_permits(10);
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.committed(), Some(Watermark::new(103)));
}

#[tokio::test]
async fn scheduler_coalesces_triggers_for_a_busy_mailbox() {
    let (harness, store) = seeded_harness().await;
    let gate = harness.changes.close_gate();
    let orchestrator = Arc::new(harness.orchestrator(test_config(), store.clone()));
    let (tx, mut rx) = mpsc::channel(8);
    let scheduler = MailboxScheduler::new(
        orchestrator,
        RetryPolicy::immediate(2),
        ShutdownSignal::never(),
        Some(tx),
    );

    assert_eq!(scheduler.submit(Trigger::new(MAILBOX, 101u64)), Submission::Started);
    harness.changes.wait_for_calls(1).await;
    assert_eq!(scheduler.submit(Trigger::new(MAILBOX, 102u64)), Submission::Coalesced);
    assert_eq!(scheduler.submit(Trigger::new(MAILBOX, 103u64)), Submission::Coalesced);
    assert_eq!(scheduler.active_mailboxes(), vec![MAILBOX.to_string()]);

    gate.add_permits(10);
    assert!(scheduler.drain(Duration::from_secs(5)).await);

    let first = rx.recv().await.unwrap();
    assert_eq!(first.trigger_sequence, Watermark::new(101));
    assert_eq!(first.committed(), Some(Watermark::new(103)));
    // The coalesced triggers run as one follow-up batch, already covered.
    let second = rx.recv().await.unwrap();
    assert_eq!(second.trigger_sequence, Watermark::new(103));
    assert!(second.is_noop());
    assert!(rx.try_recv().is_err());
    assert_eq!(harness.changes.calls(), 1);
    assert!(scheduler.active_mailboxes().is_empty());
}

#[tokio::test]
async fn scheduler_runs_different_mailboxes_in_parallel() {
    let (harness, store) = seeded_harness().await;
    harness.changes.push("other@example.com", 11, "O");
    harness.messages.add("O", "URGENT: pager", "pager@example.com", "wake up");
    store.seed("other@example.com", Watermark::new(10)).await;
    let gate = harness.changes.close_gate();
    let orchestrator = Arc::new(harness.orchestrator(test_config(), store.clone()));
    let scheduler = MailboxScheduler::new(
        orchestrator,
        RetryPolicy::immediate(2),
        ShutdownSignal::never(),
        None,
    );

    assert_eq!(scheduler.submit(Trigger::new(MAILBOX, 103u64)), Submission::Started);
    assert_eq!(
        scheduler.submit(Trigger::new("other@example.com", 11u64)),
        Submission::Started
    );
    // Both batches reach the resolver while neither can finish.
    harness.changes.wait_for_calls(2).await;

    gate.add_permits(10);
    assert!(scheduler.drain(Duration::from_secs(5)).await);
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(103));
    assert_eq!(
        store.load("other@example.com").await.unwrap(),
        Watermark::new(11)
    );
    assert!(harness.labels.is_labelled("O"));
}

#[tokio::test]
async fn scheduler_retries_a_batch_after_store_outage() {
    let (harness, store) = seeded_harness().await;
    store.set_commits_failing(true);
    let gate = harness.changes.close_gate();
    let orchestrator = Arc::new(harness.orchestrator(test_config(), store.clone()));
    let (tx, mut rx) = mpsc::channel(8);
    let scheduler = MailboxScheduler::new(
        orchestrator,
        RetryPolicy::immediate(3),
        ShutdownSignal::never(),
        Some(tx),
    );

    scheduler.submit(Trigger::new(MAILBOX, 103u64));
    harness.changes.wait_for_calls(1).await;
    // Let the first attempt through to its failing commit, then hold the retry.
    gate.add_permits(1);
    harness.changes.wait_for_calls(2).await;
    store.set_commits_failing(false);
    gate.add_permits(10);
    assert!(scheduler.drain(Duration::from_secs(5)).await);

    let report = rx.recv().await.unwrap();
    assert_eq!(report.started_from, Watermark::new(100));
    assert_eq!(report.committed(), Some(Watermark::new(103)));
    assert_eq!(harness.notifier.delivered().len(), 1);
    assert_eq!(harness.labels.labelled_count(), 1);
    assert!(harness.labels.is_labelled("A"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_mid_batch_finishes_in_flight_and_defers_the_rest() {
    let (harness, store) = seeded_harness().await;
    harness
        .classifier
        .slow_on("URGENT: server down", Duration::from_secs(2));
    let (trigger, signal) = shutdown_channel();
    let config = TriageConfig {
        worker_concurrency: 1,
        shutdown_grace: Duration::from_secs(5),
        ..test_config()
    };
    let orchestrator = harness
        .orchestrator(config, store.clone())
        .with_shutdown(signal);

    let batch_trigger = Trigger::new(MAILBOX, 103u64);
    let batch = orchestrator.run_batch(&batch_trigger);
    let stop = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.trigger();
    };
    let (report, ()) = tokio::join!(batch, stop);
    let report = report.unwrap();

    assert!(matches!(
        report.outcome("A").unwrap().settlement,
        Settlement::Actioned { .. }
    ));
    assert!(matches!(
        &report.outcome("B").unwrap().settlement,
        Settlement::Deferred { reason } if reason.starts_with("shutdown")
    ));
    assert!(harness.labels.is_labelled("A"));
    assert_eq!(harness.notifier.delivered().len(), 1);
    // B was never started.
    assert_eq!(harness.messages.total_fetches(), 1);
    assert_eq!(report.committed(), Some(Watermark::new(102)));
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(102));
}

#[tokio::test]
async fn scheduler_refuses_triggers_after_shutdown() {
    let (harness, store) = seeded_harness().await;
    let (trigger, signal) = shutdown_channel();
    let orchestrator = Arc::new(
        harness
            .orchestrator(test_config(), store.clone())
            .with_shutdown(signal.clone()),
    );
    let scheduler = MailboxScheduler::new(orchestrator, RetryPolicy::no_retry(), signal, None);

    trigger.trigger();
    assert_eq!(
        scheduler.submit(Trigger::new(MAILBOX, 103u64)),
        Submission::ShuttingDown
    );
    assert!(scheduler.drain(Duration::from_secs(1)).await);
    assert_eq!(harness.changes.calls(), 0);
    assert_eq!(store.load(MAILBOX).await.unwrap(), Watermark::new(100));
}
