//! Quorum acceptance and job completion.
//!
//! Everything here is a pure function over a [`Job`]. The coordinating loop
//! loads the collection, applies a result with [`apply_result`] and saves.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::jobs::model::{
    FinalResult, Job, JobInput, JobStatus, Matrix, MicrotaskStatus, Response, ResultSummary,
};

/// What applying one response did to the job.
#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    /// The job has no microtask with that id.
    UnknownTask,
    /// Stored, but the microtask was not completed by it.
    Recorded { responses: usize },
    /// The microtask was completed with the value backed by `votes` responses.
    Accepted { votes: usize, job_completed: bool },
}

/// Order-independent serialization used to decide whether two results agree.
///
/// Object keys are sorted at every level; arrays keep their order.
pub fn canonical_key(value: &Value) -> String {
    canonicalize(value).to_string()
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Votes needed to accept a value at this redundancy.
pub fn quorum_threshold(redundancy: u32) -> usize {
    (redundancy.max(1) as usize).div_ceil(2)
}

/// Pick the majority value among `responses`.
///
/// Groups are ranked by size; on a tie the group seen first wins. Returns the
/// value and its vote count when the largest group reaches the threshold.
pub fn majority(responses: &[Response], redundancy: u32) -> Option<(Value, usize)> {
    let mut groups: Vec<(String, &Value, usize)> = Vec::new();
    for response in responses {
        let key = canonical_key(&response.result);
        match groups.iter_mut().find(|(k, _, _)| *k == key) {
            Some(group) => group.2 += 1,
            None => groups.push((key, &response.result, 1)),
        }
    }

    let mut best: Option<(&Value, usize)> = None;
    for (_, value, count) in &groups {
        if best.is_none_or(|(_, c)| *count > c) {
            best = Some((*value, *count));
        }
    }

    best.filter(|(_, count)| *count >= quorum_threshold(redundancy))
        .map(|(value, count)| (value.clone(), count))
}

/// Record `result` from `device_id` against `task_id` and advance the job.
///
/// A result counts toward quorum whatever the microtask's status, unless it
/// is already completed; the accepted value never changes after that.
pub fn apply_result(
    job: &mut Job,
    task_id: &str,
    device_id: &str,
    result: Value,
    now: DateTime<Utc>,
) -> Acceptance {
    let redundancy = job.redundancy.max(1);

    let Some(task) = job.microtask_mut(task_id) else {
        return Acceptance::UnknownTask;
    };

    task.responses.push(Response {
        device_id: device_id.to_string(),
        result: result.clone(),
        timestamp: now,
    });
    let responses = task.responses.len();

    if task.status == MicrotaskStatus::Completed {
        job.log(
            now,
            format!("Microtask {task_id} response recorded while completed ({responses})"),
        );
        return Acceptance::Recorded { responses };
    }

    let winner = if redundancy <= 1 {
        Some((result, 1))
    } else {
        majority(&task.responses, redundancy)
    };

    let Some((value, votes)) = winner else {
        job.log(now, format!("Microtask {task_id} response recorded ({responses})"));
        return Acceptance::Recorded { responses };
    };

    task.complete(value, now);
    job.log(now, format!("Microtask {task_id} completed by {device_id}"));
    if redundancy > 1 {
        job.log(now, format!("Microtask {task_id} accepted by majority ({votes})"));
    }

    job.recount();
    let job_completed = complete_if_done(job, now);
    Acceptance::Accepted {
        votes,
        job_completed,
    }
}

/// Assemble the final result once every microtask is completed.
///
/// Returns `true` only on the call that moves the job to completed.
pub fn complete_if_done(job: &mut Job, now: DateTime<Utc>) -> bool {
    let total = job.resolved_total();
    if job.status == JobStatus::Completed || total == 0 || job.completed_microtasks != total {
        return false;
    }

    let aggregated_by_task: Vec<Value> = job
        .microtasks
        .iter()
        .map(|m| m.result.clone().unwrap_or(Value::Null))
        .collect();

    let matrix_c = match job.input {
        JobInput::Matrix { .. } => assemble_matrix(&aggregated_by_task),
        _ => None,
    };

    job.final_result = Some(FinalResult {
        aggregated_by_task,
        summary: ResultSummary {
            total_microtasks: total,
            completed: job.completed_microtasks,
            timestamp: now,
        },
        matrix_c,
    });
    job.status = JobStatus::Completed;
    job.log(now, "Job completed; final result assembled");
    true
}

/// Rows of the product, if every result is a numeric row.
fn assemble_matrix(rows: &[Value]) -> Option<Matrix> {
    rows.iter()
        .map(|row| {
            row.as_array()?
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
        })
        .collect()
}
