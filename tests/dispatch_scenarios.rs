//! Dispatcher and aggregator scenarios driven with explicit timestamps.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use ecocompute::config::{DispatchMode, ProviderConfig};
use ecocompute::device::{ManualPower, PauseReason, PowerSource, PowerStatus};
use ecocompute::error::SandboxError;
use ecocompute::jobs::{Job, JobBoard, JobInput, JobStatus, MicrotaskStatus, NewJob};
use ecocompute::provider::{Acceptance, Dispatcher, TaskRef, TickOutcome, TimeoutOutcome};
use ecocompute::sandbox::transform::transform;
use ecocompute::sandbox::{ResultMessage, TaskMessage, TaskSink};
use ecocompute::store::{JobStore, MemoryBlobStore};

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(usize, TaskMessage)>>,
}

impl RecordingSink {
    fn take(&self) -> Vec<(usize, TaskMessage)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

impl TaskSink for RecordingSink {
    fn submit(&self, slot: usize, task: TaskMessage) -> Result<(), SandboxError> {
        self.sent.lock().unwrap().push((slot, task));
        Ok(())
    }
}

struct RejectingSink;

impl TaskSink for RejectingSink {
    fn submit(&self, slot: usize, _task: TaskMessage) -> Result<(), SandboxError> {
        Err(SandboxError::UnitUnavailable { slot })
    }
}

struct Harness {
    store: JobStore,
    board: JobBoard,
    dispatcher: Dispatcher,
    _timeouts: mpsc::UnboundedReceiver<TaskRef>,
}

fn harness(config: ProviderConfig, slots: usize, power: Arc<dyn PowerSource>) -> Harness {
    let store = JobStore::new(Arc::new(MemoryBlobStore::new()));
    let board = JobBoard::new(store.clone(), config.max_attempts);
    let (tx, rx) = mpsc::unbounded_channel();
    let dispatcher = Dispatcher::new(&config, store.clone(), "device-test", power, slots, tx);
    Harness {
        store,
        board,
        dispatcher,
        _timeouts: rx,
    }
}

fn default_harness(slots: usize) -> Harness {
    harness(ProviderConfig::default(), slots, ManualPower::unknown())
}

fn items_job(raw: &str, chunk_size: usize, redundancy: u32) -> NewJob {
    NewJob {
        title: "items".to_string(),
        description: String::new(),
        job_type: "batch".to_string(),
        chunk_size,
        redundancy,
        priority: None,
        budget: None,
        input: JobInput::Items {
            raw: raw.to_string(),
        },
    }
}

fn at(start: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    start + chrono::Duration::seconds(secs)
}

async fn job(h: &Harness, id: &str) -> Job {
    h.board.get(id).await.unwrap()
}

fn result_for(job_id: &str, task_id: &str, result: Value) -> ResultMessage {
    ResultMessage {
        job_id: job_id.to_string(),
        task_id: task_id.to_string(),
        result,
    }
}

#[tokio::test]
async fn items_job_completes_in_task_order() {
    let config = ProviderConfig {
        dispatch_mode: DispatchMode::FillFreeSlots,
        ..ProviderConfig::default()
    };
    let mut h = harness(config, 3, ManualPower::unknown());
    let submitted = h.board.submit(items_job("[1, 2, 3, 4, 5]", 2, 1)).await.unwrap();
    let sizes: Vec<usize> = submitted
        .microtasks
        .iter()
        .map(|m| match &m.payload {
            Some(ecocompute::jobs::TaskPayload::Items(items)) => items.len(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);

    let sink = RecordingSink::default();
    let now = Utc::now();
    match h.dispatcher.tick(&sink, now).await {
        TickOutcome::Dispatched(assignments) => assert_eq!(assignments.len(), 3),
        other => panic!("unexpected tick outcome {other:?}"),
    }
    assert_eq!(job(&h, &submitted.id).await.status, JobStatus::Queued);
    assert_eq!(h.dispatcher.counters().assigned_to_me, 3);

    let mut sent = sink.take();
    sent.reverse();
    let mut outcomes = Vec::new();
    for (_, message) in sent {
        let result = transform(&message.payload);
        outcomes.push(
            h.dispatcher
                .handle_result(result_for(&message.job_id, &message.task_id, result), now)
                .await,
        );
    }
    assert_eq!(
        outcomes.last(),
        Some(&Acceptance::Accepted {
            votes: 1,
            job_completed: true
        })
    );

    let done = job(&h, &submitted.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.completed_microtasks, 3);
    assert_eq!(done.progress, 100);
    let final_result = done.final_result.unwrap();
    assert_eq!(
        final_result.aggregated_by_task,
        vec![json!([1, 4]), json!([9, 16]), json!([25])]
    );
    assert_eq!(h.dispatcher.slots().busy_count(), 0);
    assert_eq!(h.dispatcher.armed_watchers(), 0);
    assert_eq!(h.dispatcher.counters().processed, 3);
}

#[tokio::test]
async fn one_assignment_per_tick_by_default() {
    let mut h = default_harness(3);
    h.board.submit(items_job("[1, 2, 3]", 1, 1)).await.unwrap();
    let sink = RecordingSink::default();

    match h.dispatcher.tick(&sink, Utc::now()).await {
        TickOutcome::Dispatched(assignments) => {
            assert_eq!(assignments.len(), 1);
            assert_eq!(assignments[0].slot, 0);
            assert!(assignments[0].submitted);
        }
        other => panic!("unexpected tick outcome {other:?}"),
    }
    assert_eq!(sink.take().len(), 1);
}

#[tokio::test]
async fn jobs_are_scanned_in_storage_order() {
    let mut h = default_harness(2);
    let older = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();
    let newer = h.board.submit(items_job("[2]", 1, 1)).await.unwrap();
    let sink = RecordingSink::default();

    h.dispatcher.tick(&sink, Utc::now()).await;
    h.dispatcher.tick(&sink, Utc::now()).await;
    let order: Vec<String> = sink.take().into_iter().map(|(_, m)| m.job_id).collect();
    assert_eq!(order, vec![newer.id, older.id]);
}

#[tokio::test]
async fn gate_skips_whole_tick() {
    let config = ProviderConfig {
        require_charging: true,
        min_battery: 30,
        ..ProviderConfig::default()
    };
    let power = ManualPower::new(PowerStatus {
        battery_level: Some(80),
        charging: Some(false),
    });
    let mut h = harness(config, 1, power.clone());
    let submitted = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();
    let sink = RecordingSink::default();

    assert_eq!(
        h.dispatcher.tick(&sink, Utc::now()).await,
        TickOutcome::Paused(PauseReason::NotCharging)
    );

    power.set_charging(Some(true));
    power.set_battery_level(Some(10));
    assert_eq!(
        h.dispatcher.tick(&sink, Utc::now()).await,
        TickOutcome::Paused(PauseReason::BatteryBelowMinimum {
            level: 10,
            minimum: 30
        })
    );
    assert!(sink.take().is_empty());
    assert_eq!(
        job(&h, &submitted.id).await.microtasks[0].status,
        MicrotaskStatus::Pending
    );

    power.set_battery_level(None);
    assert!(matches!(
        h.dispatcher.tick(&sink, Utc::now()).await,
        TickOutcome::Dispatched(_)
    ));
}

#[tokio::test]
async fn busy_slots_and_empty_store() {
    let mut h = default_harness(1);
    let sink = RecordingSink::default();
    assert_eq!(h.dispatcher.tick(&sink, Utc::now()).await, TickOutcome::Idle);

    h.board.submit(items_job("[1, 2]", 1, 1)).await.unwrap();
    h.dispatcher.tick(&sink, Utc::now()).await;
    assert_eq!(
        h.dispatcher.tick(&sink, Utc::now()).await,
        TickOutcome::NoFreeSlot
    );
}

#[tokio::test]
async fn submission_failure_returns_task_to_pending() {
    let mut h = default_harness(1);
    let submitted = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();

    match h.dispatcher.tick(&RejectingSink, Utc::now()).await {
        TickOutcome::Dispatched(assignments) => assert!(!assignments[0].submitted),
        other => panic!("unexpected tick outcome {other:?}"),
    }

    let stored = job(&h, &submitted.id).await;
    let task = &stored.microtasks[0];
    assert_eq!(task.status, MicrotaskStatus::Pending);
    assert!(task.assigned_to.is_none());
    assert_eq!(task.attempts, 1);
    assert!(stored.logs.iter().any(|l| l.contains("Submission of")));
    assert_eq!(h.dispatcher.slots().busy_count(), 0);
    assert_eq!(h.dispatcher.armed_watchers(), 0);
}

#[tokio::test]
async fn submission_failure_on_last_attempt_fails_task() {
    let config = ProviderConfig {
        max_attempts: 1,
        ..ProviderConfig::default()
    };
    let mut h = harness(config, 1, ManualPower::unknown());
    let submitted = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();
    let task = TaskRef::new(submitted.id.clone(), submitted.microtasks[0].id.clone());
    let start = Utc::now();

    match h.dispatcher.tick(&RejectingSink, start).await {
        TickOutcome::Dispatched(assignments) => assert!(!assignments[0].submitted),
        other => panic!("unexpected tick outcome {other:?}"),
    }
    let stored = job(&h, &submitted.id).await;
    assert_eq!(stored.microtasks[0].status, MicrotaskStatus::Failed);
    assert_eq!(stored.microtasks[0].attempts, 1);
    assert!(stored.logs.iter().any(|l| l.contains("failed (max attempts)")));
    assert_eq!(h.dispatcher.slots().busy_count(), 0);

    assert_eq!(
        h.dispatcher.handle_timeout(task, at(start, 21)).await,
        TimeoutOutcome::Ignored
    );
    assert_eq!(h.dispatcher.tick(&RejectingSink, at(start, 60)).await, TickOutcome::Idle);
    assert_eq!(
        job(&h, &submitted.id).await.microtasks[0].status,
        MicrotaskStatus::Failed
    );

    assert_eq!(h.board.rerun_failed(&submitted.id).await.unwrap(), 1);
    let sink = RecordingSink::default();
    assert!(matches!(
        h.dispatcher.tick(&sink, at(start, 61)).await,
        TickOutcome::Dispatched(_)
    ));
    assert_eq!(sink.take().len(), 1);
}

#[tokio::test]
async fn late_result_after_requeue_is_accepted() {
    let mut h = default_harness(1);
    let submitted = h.board.submit(items_job("[3]", 1, 1)).await.unwrap();
    let job_id = submitted.id.clone();
    let task_id = submitted.microtasks[0].id.clone();
    let task = TaskRef::new(job_id.clone(), task_id.clone());
    let sink = RecordingSink::default();
    let start = Utc::now();

    h.dispatcher.tick(&sink, start).await;
    assert_eq!(
        h.dispatcher.handle_timeout(task, at(start, 21)).await,
        TimeoutOutcome::Requeued
    );
    assert_eq!(
        h.dispatcher
            .handle_result(result_for(&job_id, &task_id, json!([9])), at(start, 22))
            .await,
        Acceptance::Accepted {
            votes: 1,
            job_completed: true
        }
    );

    let done = job(&h, &job_id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.microtasks[0].status, MicrotaskStatus::Completed);
    assert_eq!(done.microtasks[0].result, Some(json!([9])));
    assert_eq!(h.dispatcher.tick(&sink, at(start, 23)).await, TickOutcome::Idle);
}

#[tokio::test]
async fn timed_out_assignment_is_reclaimed_by_tick() {
    let mut h = default_harness(2);
    let submitted = h.board.submit(items_job("[7]", 1, 1)).await.unwrap();
    let sink = RecordingSink::default();
    let start = Utc::now();

    h.dispatcher.tick(&sink, start).await;
    assert_eq!(h.dispatcher.tick(&sink, at(start, 5)).await, TickOutcome::Idle);

    match h.dispatcher.tick(&sink, at(start, 21)).await {
        TickOutcome::Dispatched(assignments) => assert!(assignments[0].reclaimed),
        other => panic!("unexpected tick outcome {other:?}"),
    }
    let stored = job(&h, &submitted.id).await;
    assert_eq!(stored.microtasks[0].attempts, 2);
    assert_eq!(stored.microtasks[0].assigned_at, Some(at(start, 21)));
    assert!(stored.logs.iter().any(|l| l.contains("timed out, requeued")));
    assert_eq!(h.dispatcher.slots().busy_count(), 1);
}

#[tokio::test]
async fn exhausted_task_fails_and_stays_failed_until_rerun() {
    let config = ProviderConfig {
        max_attempts: 2,
        ..ProviderConfig::default()
    };
    let mut h = harness(config, 1, ManualPower::unknown());
    let submitted = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();
    let task = TaskRef::new(submitted.id.clone(), submitted.microtasks[0].id.clone());
    let sink = RecordingSink::default();
    let start = Utc::now();

    h.dispatcher.tick(&sink, start).await;
    assert_eq!(
        h.dispatcher.handle_timeout(task.clone(), at(start, 21)).await,
        TimeoutOutcome::Requeued
    );
    let requeued = job(&h, &submitted.id).await;
    assert_eq!(requeued.microtasks[0].status, MicrotaskStatus::Pending);
    assert!(requeued.microtasks[0].assigned_to.is_none());
    assert!(requeued.microtasks[0].assigned_at.is_none());
    assert_eq!(h.dispatcher.slots().busy_count(), 0);

    h.dispatcher.tick(&sink, at(start, 22)).await;
    assert_eq!(
        h.dispatcher.handle_timeout(task.clone(), at(start, 45)).await,
        TimeoutOutcome::Failed
    );

    assert_eq!(h.dispatcher.tick(&sink, at(start, 100)).await, TickOutcome::Idle);
    let failed = job(&h, &submitted.id).await;
    assert_eq!(failed.microtasks[0].status, MicrotaskStatus::Failed);
    assert_eq!(failed.microtasks[0].attempts, 2);
    assert!(failed.logs.iter().any(|l| l.ends_with("failed (max attempts)")));

    assert_eq!(h.board.rerun_failed(&submitted.id).await.unwrap(), 1);
    assert!(matches!(
        h.dispatcher.tick(&sink, at(start, 101)).await,
        TickOutcome::Dispatched(_)
    ));
}

#[tokio::test]
async fn quorum_waits_for_timeout_reclamation() {
    let mut h = default_harness(1);
    let submitted = h.board.submit(items_job("[3]", 1, 3)).await.unwrap();
    let job_id = submitted.id.clone();
    let task_id = submitted.microtasks[0].id.clone();
    let sink = RecordingSink::default();
    let start = Utc::now();

    h.dispatcher.tick(&sink, start).await;
    assert_eq!(
        h.dispatcher
            .handle_result(result_for(&job_id, &task_id, json!([9])), at(start, 1))
            .await,
        Acceptance::Recorded { responses: 1 }
    );
    assert_eq!(h.dispatcher.tick(&sink, at(start, 2)).await, TickOutcome::Idle);

    h.dispatcher.tick(&sink, at(start, 21)).await;
    assert_eq!(
        h.dispatcher
            .handle_result(result_for(&job_id, &task_id, json!([10])), at(start, 22))
            .await,
        Acceptance::Recorded { responses: 2 }
    );

    h.dispatcher.tick(&sink, at(start, 43)).await;
    assert_eq!(
        h.dispatcher
            .handle_result(result_for(&job_id, &task_id, json!([9])), at(start, 44))
            .await,
        Acceptance::Accepted {
            votes: 2,
            job_completed: true
        }
    );

    let done = job(&h, &job_id).await;
    assert_eq!(done.microtasks[0].result, Some(json!([9])));
    assert_eq!(done.microtasks[0].responses.len(), 3);
    assert!(done.logs.iter().any(|l| l.ends_with("accepted by majority (2)")));
}

#[tokio::test]
async fn results_for_missing_jobs_are_discarded() {
    let mut h = default_harness(1);
    let submitted = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();
    let sink = RecordingSink::default();
    h.dispatcher.tick(&sink, Utc::now()).await;
    let task_id = submitted.microtasks[0].id.clone();

    assert!(h.board.delete(&submitted.id).await.unwrap());
    let outcome = h
        .dispatcher
        .handle_result(result_for(&submitted.id, &task_id, json!([1])), Utc::now())
        .await;
    assert_eq!(outcome, Acceptance::UnknownTask);
    assert!(h.store.load().await.is_empty());
    assert_eq!(h.dispatcher.slots().busy_count(), 0);

    assert_eq!(
        h.dispatcher
            .handle_timeout(TaskRef::new("job_gone", "job_gone::task::0"), Utc::now())
            .await,
        TimeoutOutcome::Ignored
    );
}

#[tokio::test]
async fn late_result_after_completion_is_only_recorded() {
    let mut h = default_harness(1);
    let submitted = h.board.submit(items_job("[1, 2]", 1, 1)).await.unwrap();
    let job_id = submitted.id.clone();
    let first = submitted.microtasks[0].id.clone();
    let sink = RecordingSink::default();
    let now = Utc::now();

    h.dispatcher.tick(&sink, now).await;
    h.dispatcher
        .handle_result(result_for(&job_id, &first, json!([1])), now)
        .await;
    let outcome = h
        .dispatcher
        .handle_result(result_for(&job_id, &first, json!([99])), now)
        .await;
    assert_eq!(outcome, Acceptance::Recorded { responses: 2 });

    let stored = job(&h, &job_id).await;
    assert_eq!(stored.microtasks[0].result, Some(json!([1])));
    assert_eq!(stored.completed_microtasks, 1);
    assert_eq!(stored.status, JobStatus::Queued);
}

#[tokio::test]
async fn shutdown_leaves_in_flight_tasks_assigned() {
    let mut h = default_harness(1);
    let submitted = h.board.submit(items_job("[1]", 1, 1)).await.unwrap();
    let sink = RecordingSink::default();
    h.dispatcher.tick(&sink, Utc::now()).await;
    assert_eq!(h.dispatcher.armed_watchers(), 1);

    h.dispatcher.shutdown();
    assert_eq!(h.dispatcher.armed_watchers(), 0);
    assert_eq!(h.dispatcher.slots().busy_count(), 0);
    assert_eq!(
        job(&h, &submitted.id).await.microtasks[0].status,
        MicrotaskStatus::Assigned
    );

    tokio::time::sleep(Duration::from_millis(5)).await;
}
