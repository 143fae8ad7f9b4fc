//! The dispatch tick, timeout handling and result intake.
//!
//! [`Dispatcher`] holds the coordinator-side state (slot table, watchers)
//! and performs every read-modify-write of the job collection. It expects
//! to be driven serially by one loop; see [`crate::provider::session`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DispatchMode, ProviderConfig};
use crate::device::{EligibilityPolicy, PauseReason, PowerSource};
use crate::jobs::model::{Job, JobStatus, Microtask, MicrotaskStatus, TaskPayload};
use crate::jobs::splitter::derive_payload;
use crate::provider::aggregator::{self, Acceptance};
use crate::provider::slots::{SlotTable, TaskRef};
use crate::provider::watchers::Watchers;
use crate::sandbox::{transform, ResultMessage, TaskMessage, TaskSink};
use crate::store::JobStore;

/// One assignment made during a tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub slot: usize,
    pub task: TaskRef,
    /// The task was taken back from a timed-out assignment.
    pub reclaimed: bool,
    /// The sandbox accepted the task.
    pub submitted: bool,
}

/// Result of a single tick.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The eligibility gate refused work.
    Paused(PauseReason),
    /// Every slot is busy.
    NoFreeSlot,
    /// No job had an eligible microtask.
    Idle,
    Dispatched(Vec<Assignment>),
}

/// What a fired timeout did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    Requeued,
    Failed,
    /// The task finished, moved on or disappeared in the meantime.
    Ignored,
}

/// Counters exposed to telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchCounters {
    /// Microtasks currently assigned to this device.
    pub assigned_to_me: usize,
    /// Slots with a task in flight.
    pub running: usize,
    /// Results taken in since start.
    pub processed: u64,
}

/// Coordinator state for one sharing device.
pub struct Dispatcher {
    store: JobStore,
    device_id: String,
    power: Arc<dyn PowerSource>,
    policy: EligibilityPolicy,
    mode: DispatchMode,
    task_timeout: Duration,
    slots: SlotTable,
    watchers: Watchers,
    timeouts: mpsc::UnboundedSender<TaskRef>,
    assigned_to_me: usize,
    processed: u64,
}

impl Dispatcher {
    /// `timeouts` receives every watcher that fires; feed them back through
    /// [`Dispatcher::handle_timeout`].
    pub fn new(
        config: &ProviderConfig,
        store: JobStore,
        device_id: impl Into<String>,
        power: Arc<dyn PowerSource>,
        slot_count: usize,
        timeouts: mpsc::UnboundedSender<TaskRef>,
    ) -> Self {
        Self {
            store,
            device_id: device_id.into(),
            power,
            policy: EligibilityPolicy {
                require_charging: config.require_charging,
                min_battery: config.min_battery,
            },
            mode: config.dispatch_mode,
            task_timeout: config.task_timeout,
            slots: SlotTable::new(slot_count),
            watchers: Watchers::new(),
            timeouts,
            assigned_to_me: 0,
            processed: 0,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn armed_watchers(&self) -> usize {
        self.watchers.len()
    }

    pub fn counters(&self) -> DispatchCounters {
        DispatchCounters {
            assigned_to_me: self.assigned_to_me,
            running: self.slots.busy_count(),
            processed: self.processed,
        }
    }

    /// Run one dispatch tick at `now`.
    pub async fn tick(&mut self, sink: &dyn TaskSink, now: DateTime<Utc>) -> TickOutcome {
        if let Err(reason) = self.policy.check(self.power.status()) {
            debug!(reason = %reason, "Dispatch paused");
            return TickOutcome::Paused(reason);
        }

        let free: Vec<usize> = match self.mode {
            DispatchMode::OnePerTick => self.slots.first_free().into_iter().collect(),
            DispatchMode::FillFreeSlots => self.slots.free_slots(),
        };
        if free.is_empty() {
            return TickOutcome::NoFreeSlot;
        }

        let mut jobs = self.store.load().await;
        let mut assignments = Vec::new();

        for slot in free {
            let Some((job_idx, task_idx, reclaimed)) = self.select(&jobs, now) else {
                break;
            };
            let assignment = self.assign(&mut jobs, job_idx, task_idx, slot, reclaimed, sink, now).await;
            assignments.push(assignment);
        }

        self.refresh_assigned(&jobs);

        if assignments.is_empty() {
            TickOutcome::Idle
        } else {
            TickOutcome::Dispatched(assignments)
        }
    }

    /// Pick the next microtask: the first job in storage order that has a
    /// dispatchable task, or failing that a timed-out one.
    fn select(&self, jobs: &[Job], now: DateTime<Utc>) -> Option<(usize, usize, bool)> {
        jobs.iter().enumerate().find_map(|(job_idx, job)| {
            if let Some(task_idx) = job.microtasks.iter().position(Microtask::is_dispatchable) {
                return Some((job_idx, task_idx, false));
            }
            job.microtasks
                .iter()
                .position(|m| m.is_reclaimable(now, self.task_timeout))
                .map(|task_idx| (job_idx, task_idx, true))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn assign(
        &mut self,
        jobs: &mut [Job],
        job_idx: usize,
        task_idx: usize,
        slot: usize,
        reclaimed: bool,
        sink: &dyn TaskSink,
        now: DateTime<Utc>,
    ) -> Assignment {
        let job = &mut jobs[job_idx];
        let task_ref = TaskRef::new(job.id.clone(), job.microtasks[task_idx].id.clone());

        if reclaimed {
            job.microtasks[task_idx].release();
            job.log(now, format!("Microtask {} timed out, requeued", task_ref.task_id));
            self.slots.free_matching(&task_ref);
            info!(job_id = %task_ref.job_id, task_id = %task_ref.task_id, "Reclaimed timed-out microtask");
        }

        job.microtasks[task_idx].assign(&self.device_id, now);
        if job.status == JobStatus::Created {
            job.status = JobStatus::Queued;
        }
        job.log(now, format!("Assigned {} to {}", task_ref.task_id, self.device_id));
        let payload = resolve_payload(job, &job.microtasks[task_idx]);

        self.persist(jobs).await;
        self.slots.occupy(slot, task_ref.clone());
        self.watchers
            .arm(task_ref.clone(), self.task_timeout, self.timeouts.clone());

        info!(
            job_id = %task_ref.job_id,
            task_id = %task_ref.task_id,
            slot = self.slots.id(slot).unwrap_or_default(),
            "Assigned microtask"
        );

        let message = TaskMessage {
            job_id: task_ref.job_id.clone(),
            task_id: task_ref.task_id.clone(),
            payload,
        };
        let submitted = match sink.submit(slot, message) {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %task_ref.task_id, error = %e, "Task submission failed");
                let job = &mut jobs[job_idx];
                let task = &mut job.microtasks[task_idx];
                if task.has_attempts_left() {
                    task.release();
                    job.log(
                        now,
                        format!("Submission of {} failed ({e}); returned to pending", task_ref.task_id),
                    );
                } else {
                    task.fail();
                    job.log(
                        now,
                        format!("Microtask {} failed (max attempts); submission failed ({e})", task_ref.task_id),
                    );
                }
                self.slots.free_if_holds(slot, &task_ref);
                self.watchers.cancel(&task_ref.task_id);
                self.persist(jobs).await;
                false
            }
        };

        Assignment {
            slot,
            task: task_ref,
            reclaimed,
            submitted,
        }
    }

    /// React to a fired watcher for `task`.
    pub async fn handle_timeout(&mut self, task: TaskRef, now: DateTime<Utc>) -> TimeoutOutcome {
        self.watchers.forget(&task.task_id);
        let mut jobs = self.store.load().await;

        let outcome = match jobs.iter_mut().find(|j| j.id == task.job_id) {
            Some(job) => expire(job, &task.task_id, now),
            None => TimeoutOutcome::Ignored,
        };

        if outcome != TimeoutOutcome::Ignored {
            self.persist(&jobs).await;
            info!(task_id = %task.task_id, outcome = ?outcome, "Microtask timed out");
        } else {
            debug!(task_id = %task.task_id, "Stale timeout ignored");
        }
        if let Some(slot) = self.slots.free_matching(&task) {
            debug!(slot, task_id = %task.task_id, "Freed slot after timeout");
        }
        self.refresh_assigned(&jobs);
        outcome
    }

    /// Take in one unit result.
    pub async fn handle_result(&mut self, message: ResultMessage, now: DateTime<Utc>) -> Acceptance {
        let ResultMessage {
            job_id,
            task_id,
            result,
        } = message;
        self.processed += 1;
        self.watchers.cancel(&task_id);
        self.slots.free_matching(&TaskRef::new(job_id.clone(), task_id.clone()));

        let mut jobs = self.store.load().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            warn!(job_id = %job_id, task_id = %task_id, "Result for unknown job discarded");
            return Acceptance::UnknownTask;
        };

        if transform::is_error(&result) {
            warn!(task_id = %task_id, result = %result, "Unit reported an error result");
        }
        let outcome = aggregator::apply_result(job, &task_id, &self.device_id, result, now);
        if outcome == Acceptance::UnknownTask {
            warn!(job_id = %job_id, task_id = %task_id, "Result for unknown microtask discarded");
            return outcome;
        }
        match &outcome {
            Acceptance::UnknownTask => {}
            Acceptance::Recorded { responses } => {
                debug!(task_id = %task_id, responses, "Response recorded");
            }
            Acceptance::Accepted { votes, job_completed } => {
                info!(task_id = %task_id, votes, "Microtask accepted");
                if *job_completed {
                    info!(job_id = %job_id, "Job completed");
                }
            }
        }

        self.persist(&jobs).await;
        self.refresh_assigned(&jobs);
        outcome
    }

    /// Cancel every watcher and forget in-flight slots. Microtasks are left as
    /// they are in storage.
    pub fn shutdown(&mut self) {
        self.watchers.clear_all();
        self.slots.clear();
    }

    async fn persist(&self, jobs: &[Job]) {
        if let Err(e) = self.store.save(jobs).await {
            warn!(error = %e, "Failed to save job collection");
        }
    }

    fn refresh_assigned(&mut self, jobs: &[Job]) {
        self.assigned_to_me = jobs
            .iter()
            .flat_map(|j| j.microtasks.iter())
            .filter(|m| {
                m.status == MicrotaskStatus::Assigned
                    && m.assigned_to.as_deref() == Some(self.device_id.as_str())
            })
            .count();
    }
}

/// Payload to send for `task`: explicit, else re-derived from the job input,
/// else the raw input itself.
pub fn resolve_payload(job: &Job, task: &Microtask) -> TaskPayload {
    task.payload
        .clone()
        .or_else(|| derive_payload(job, task.index))
        .unwrap_or_else(|| TaskPayload::Raw(serde_json::to_value(&job.input).unwrap_or(Value::Null)))
}

/// Apply a timeout to `task_id` in `job`.
///
/// Completed and failed microtasks are left alone. Anything else is failed
/// once its attempts are exhausted, otherwise an assignment is requeued.
pub fn expire(job: &mut Job, task_id: &str, now: DateTime<Utc>) -> TimeoutOutcome {
    let Some(task) = job.microtask_mut(task_id) else {
        return TimeoutOutcome::Ignored;
    };
    if task.status.is_terminal() {
        return TimeoutOutcome::Ignored;
    }

    if !task.has_attempts_left() {
        task.fail();
        job.log(now, format!("Microtask {task_id} failed (max attempts)"));
        TimeoutOutcome::Failed
    } else if task.status == MicrotaskStatus::Assigned {
        task.release();
        job.log(now, format!("Microtask {task_id} timed out, requeued"));
        TimeoutOutcome::Requeued
    } else {
        TimeoutOutcome::Ignored
    }
}
