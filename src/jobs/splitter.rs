//! Job splitting: turns a job's raw input into ordered microtasks.
//!
//! The same partitioning arithmetic backs three callers:
//! - `estimate()`: preview count before the job is committed
//! - `split()`: materializes the microtasks at submission time
//! - `derive_payload()`: rebuilds one microtask's payload from the job input
//!   when the stored microtask carries none

use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use super::model::{Job, JobInput, MatrixRow, Microtask, TaskPayload};

/// Parse pasted or uploaded text into an item list.
///
/// Accepts a JSON array, a JSON object with an `items` field, or any other
/// JSON value (treated as a single item). Text that is not JSON becomes one
/// item per non-empty trimmed line. Never fails.
pub fn parse_items(raw: &str) -> Vec<Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => {
            let items = match parsed {
                Value::Object(mut map) => match map.remove("items") {
                    Some(items) if !is_falsy(&items) => items,
                    Some(items) => {
                        map.insert("items".to_string(), items);
                        Value::Object(map)
                    }
                    None => Value::Object(map),
                },
                other => other,
            };
            match items {
                Value::Array(items) => items,
                single => vec![single],
            }
        }
        Err(_) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| Value::String(line.to_string()))
            .collect(),
    }
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Item list for the item-based input modes, `None` for matrix input.
pub fn input_items(input: &JobInput) -> Option<Vec<Value>> {
    match input {
        JobInput::Items { raw } => Some(parse_items(raw)),
        JobInput::Upload { file } => Some(match &file.text {
            Some(text) => parse_items(text),
            None => vec![json!({ "file": { "name": file.name, "size": file.size } })],
        }),
        JobInput::Matrix { .. } => None,
    }
}

/// Number of chunks for `len` items: `ceil(len / chunk_size)`, at least 1.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1)).max(1)
}

/// The slice of `items` that chunk `index` covers. Empty past the end.
pub fn chunk_at(items: &[Value], index: usize, chunk_size: usize) -> &[Value] {
    let chunk_size = chunk_size.max(1);
    let start = index.saturating_mul(chunk_size).min(items.len());
    let end = start.saturating_add(chunk_size).min(items.len());
    &items[start..end]
}

/// Microtask count `split()` would produce, without materializing anything.
pub fn estimate(input: &JobInput, chunk_size: usize) -> usize {
    match input {
        JobInput::Matrix { a, .. } => a.len(),
        other => {
            let len = input_items(other).map(|items| items.len()).unwrap_or(0);
            chunk_count(len, chunk_size)
        }
    }
}

/// Populate `job` with its ordered microtasks.
///
/// Item modes produce `ceil(len / chunkSize)` contiguous chunks (the last may
/// be shorter). Matrix mode produces one microtask per row of A regardless of
/// `chunkSize`, each carrying the row and the whole of B.
pub fn split(mut job: Job, max_attempts: u32, now: DateTime<Utc>) -> Job {
    let payloads: Vec<TaskPayload> = match &job.input {
        JobInput::Matrix { a, b } => a
            .iter()
            .enumerate()
            .map(|(row_index, row)| {
                TaskPayload::MatrixRow(MatrixRow {
                    row_index,
                    row_of_a: row.clone(),
                    matrix_b: b.clone(),
                })
            })
            .collect(),
        input => {
            let items = input_items(input).unwrap_or_default();
            let count = chunk_count(items.len(), job.chunk_size);
            (0..count)
                .map(|i| TaskPayload::Items(chunk_at(&items, i, job.chunk_size).to_vec()))
                .collect()
        }
    };

    job.microtasks = payloads
        .into_iter()
        .enumerate()
        .map(|(index, payload)| Microtask::new(&job.id, index, Some(payload), max_attempts, now))
        .collect();
    job.total_microtasks = job.microtasks.len();
    job.completed_microtasks = 0;
    job.progress = 0;
    job
}

/// Rebuild the payload of microtask `index` from the job's raw input.
///
/// Returns `None` when the index lies outside the input (a matrix row that
/// does not exist); callers fall back to the raw input.
pub fn derive_payload(job: &Job, index: usize) -> Option<TaskPayload> {
    match &job.input {
        JobInput::Matrix { a, b } => a.get(index).map(|row| {
            TaskPayload::MatrixRow(MatrixRow {
                row_index: index,
                row_of_a: row.clone(),
                matrix_b: b.clone(),
            })
        }),
        input => {
            let items = input_items(input)?;
            Some(TaskPayload::Items(
                chunk_at(&items, index, job.chunk_size).to_vec(),
            ))
        }
    }
}
