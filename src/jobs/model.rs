//! Job and microtask records as persisted in the shared store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attempt budget used when a persisted microtask carries none.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Separator between the job id and the task index in a microtask id.
const TASK_ID_SEPARATOR: &str = "::task::";

/// A dense numeric matrix, row-major.
pub type Matrix = Vec<Vec<f64>>;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Split and stored, nothing handed out yet.
    #[default]
    Created,
    /// At least one microtask has been assigned.
    Queued,
    /// Every microtask completed and the final result is assembled.
    Completed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Status of a microtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MicrotaskStatus {
    #[default]
    Pending,
    Assigned,
    Completed,
    /// Attempt budget exhausted. Only an explicit rerun brings it back.
    Failed,
}

impl MicrotaskStatus {
    /// Check whether moving to `target` is a legal edge.
    ///
    /// Forward edges are pending → assigned → completed. A late result may
    /// also complete a pending or failed task. The reversions are
    /// assigned → pending (timeout, submission failure), assigned/pending →
    /// failed (attempts exhausted) and any → pending (forced rerun, which goes
    /// through [`Microtask::reset_for_rerun`] instead).
    pub fn can_transition_to(&self, target: MicrotaskStatus) -> bool {
        use MicrotaskStatus::*;

        matches!(
            (self, target),
            (Pending, Assigned)
                | (Assigned, Completed)
                | (Pending, Completed)
                | (Failed, Completed)
                | (Assigned, Assigned)
                | (Assigned, Pending)
                | (Assigned, Failed)
                | (Pending, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for MicrotaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// An uploaded file staged by the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// File contents when the upload was readable as text.
    #[serde(default)]
    pub text: Option<String>,
}

/// Raw job input, one variant per input mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum JobInput {
    /// Pasted text: a JSON array, a JSON object with `items`, or one item per line.
    Items { raw: String },
    /// Uploaded file, parsed the same way as pasted text when it has text content.
    Upload { file: UploadedFile },
    /// Matrix pair for a row-wise `A × B`.
    Matrix { a: Matrix, b: Matrix },
}

impl JobInput {
    pub fn mode(&self) -> &'static str {
        match self {
            Self::Items { .. } => "items",
            Self::Upload { .. } => "upload",
            Self::Matrix { .. } => "matrix",
        }
    }
}

/// One row of a matrix-pair job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatrixRow {
    pub row_index: usize,
    pub row_of_a: Vec<f64>,
    pub matrix_b: Matrix,
}

/// Work handed to an execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskPayload {
    /// A contiguous chunk of an item list.
    Items(Vec<Value>),
    /// One row of A plus the whole of B.
    MatrixRow(MatrixRow),
    /// Anything else: the job's raw input when nothing better could be derived.
    Raw(Value),
}

/// A single device's answer for a microtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub device_id: String,
    pub result: Value,
    pub timestamp: DateTime<Utc>,
}

/// Smallest independently assignable unit of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Microtask {
    pub id: String,
    pub index: usize,
    /// Explicit payload. When absent it is re-derived from the job input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<TaskPayload>,
    #[serde(default)]
    pub status: MicrotaskStatus,
    #[serde(default)]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub responses: Vec<Response>,
    /// Accepted result.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Microtask {
    pub fn new(
        job_id: &str,
        index: usize,
        payload: Option<TaskPayload>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: task_id(job_id, index),
            index,
            payload,
            status: MicrotaskStatus::Pending,
            assigned_to: None,
            assigned_at: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            responses: Vec::new(),
            result: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Pending with budget left.
    pub fn is_dispatchable(&self) -> bool {
        self.status == MicrotaskStatus::Pending && self.has_attempts_left()
    }

    /// Assigned for longer than `timeout` with budget left.
    pub fn is_reclaimable(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.status != MicrotaskStatus::Assigned || !self.has_attempts_left() {
            return false;
        }
        match self.assigned_at {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|elapsed| elapsed > timeout)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Hand the task to `device_id`, consuming one attempt.
    pub fn assign(&mut self, device_id: &str, now: DateTime<Utc>) {
        self.status = MicrotaskStatus::Assigned;
        self.assigned_to = Some(device_id.to_string());
        self.assigned_at = Some(now);
        self.attempts = (self.attempts + 1).min(self.max_attempts);
    }

    /// Back to pending with the assignment cleared. Attempts are kept.
    pub fn release(&mut self) {
        self.status = MicrotaskStatus::Pending;
        self.assigned_to = None;
        self.assigned_at = None;
    }

    pub fn fail(&mut self) {
        self.status = MicrotaskStatus::Failed;
    }

    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = MicrotaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
    }

    /// Requester-initiated reset to pending. An exhausted budget is refilled
    /// so the task is eligible for dispatch again.
    pub fn reset_for_rerun(&mut self) {
        self.release();
        if !self.has_attempts_left() {
            self.attempts = 0;
        }
    }
}

/// Build the microtask id for `(job_id, index)`.
pub fn task_id(job_id: &str, index: usize) -> String {
    format!("{job_id}{TASK_ID_SEPARATOR}{index}")
}

/// Totals attached to a final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    pub total_microtasks: usize,
    pub completed: usize,
    pub timestamp: DateTime<Utc>,
}

/// Job-level aggregation of accepted microtask results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    /// Accepted results in microtask order.
    pub aggregated_by_task: Vec<Value>,
    pub summary: ResultSummary,
    /// Assembled product for matrix-pair jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix_c: Option<Matrix>,
}

/// A submitted job with its microtasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
    #[serde(default = "one")]
    pub chunk_size: usize,
    #[serde(default = "one_u32")]
    pub redundancy: u32,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub budget: Option<Decimal>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(rename = "payload")]
    pub input: JobInput,
    #[serde(default)]
    pub estimated_microtasks: usize,
    #[serde(default)]
    pub total_microtasks: usize,
    #[serde(default)]
    pub completed_microtasks: usize,
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub microtasks: Vec<Microtask>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_result: Option<FinalResult>,
}

fn one() -> usize {
    1
}

fn one_u32() -> u32 {
    1
}

impl Job {
    /// Append a timestamped line to the job's event log.
    pub fn log(&mut self, now: DateTime<Utc>, message: impl AsRef<str>) {
        self.logs
            .push(format!("[{}] {}", now.to_rfc3339(), message.as_ref()));
    }

    /// Total microtask count: explicit total, else the estimate, else the
    /// number of materialized microtasks.
    pub fn resolved_total(&self) -> usize {
        if self.total_microtasks > 0 {
            self.total_microtasks
        } else if self.estimated_microtasks > 0 {
            self.estimated_microtasks
        } else {
            self.microtasks.len()
        }
    }

    /// Recompute `completed_microtasks` and `progress` from the microtasks.
    pub fn recount(&mut self) {
        self.completed_microtasks = self
            .microtasks
            .iter()
            .filter(|m| m.status == MicrotaskStatus::Completed)
            .count();
        let total = self.resolved_total();
        self.progress = if total == 0 {
            0
        } else {
            let pct = (100.0 * self.completed_microtasks as f64 / total as f64).round();
            pct.clamp(0.0, 100.0) as u8
        };
    }

    pub fn microtask(&self, task_id: &str) -> Option<&Microtask> {
        self.microtasks.iter().find(|m| m.id == task_id)
    }

    pub fn microtask_mut(&mut self, task_id: &str) -> Option<&mut Microtask> {
        self.microtasks.iter_mut().find(|m| m.id == task_id)
    }

    pub fn count_with_status(&self, status: MicrotaskStatus) -> usize {
        self.microtasks.iter().filter(|m| m.status == status).count()
    }
}
