//! The pure, stateless transform an execution unit applies to a payload.
//!
//! Failures never escape as errors: they are returned as a structured
//! `{"error": "..."}` value and travel to the aggregator like any other answer.

use serde_json::{Value, json};

use crate::jobs::model::{MatrixRow, TaskPayload};

/// Field name of a captured unit error.
pub const ERROR_FIELD: &str = "error";

/// Run the transform for one payload.
pub fn transform(payload: &TaskPayload) -> Value {
    match payload {
        TaskPayload::Items(items) => Value::Array(square_items(items)),
        TaskPayload::MatrixRow(row) => match multiply_row(row) {
            Ok(product) => json!(product),
            Err(reason) => error_value(reason),
        },
        TaskPayload::Raw(value) => match value {
            Value::Array(items) => Value::Array(square_items(items)),
            Value::Object(map) => match map.get("items") {
                Some(Value::Array(items)) => Value::Array(square_items(items)),
                _ => value.clone(),
            },
            other => other.clone(),
        },
    }
}

/// Wrap a failure message as a result value.
pub fn error_value(reason: impl Into<String>) -> Value {
    let reason: String = reason.into();
    json!({ ERROR_FIELD: reason })
}

/// Check whether a result is a captured unit error.
pub fn is_error(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|map| map.len() == 1 && map.get(ERROR_FIELD).is_some_and(Value::is_string))
}

/// Square every numeric element, leaving everything else untouched.
fn square_items(items: &[Value]) -> Vec<Value> {
    items.iter().map(square).collect()
}

fn square(value: &Value) -> Value {
    let Value::Number(n) = value else {
        return value.clone();
    };
    if let Some(i) = n.as_i64() {
        if let Some(sq) = i.checked_mul(i) {
            return json!(sq);
        }
    }
    if let Some(u) = n.as_u64() {
        if let Some(sq) = u.checked_mul(u) {
            return json!(sq);
        }
    }
    match n.as_f64() {
        Some(f) => json!(f * f),
        None => value.clone(),
    }
}

/// One row of `A × B`.
fn multiply_row(row: &MatrixRow) -> Result<Vec<f64>, String> {
    let b = &row.matrix_b;
    if row.row_of_a.len() != b.len() {
        return Err(format!(
            "row {} has {} columns but B has {} rows",
            row.row_index,
            row.row_of_a.len(),
            b.len()
        ));
    }
    let cols = b.first().map(Vec::len).unwrap_or(0);
    if let Some(bad) = b.iter().position(|r| r.len() != cols) {
        return Err(format!("B row {bad} has {} columns, expected {cols}", b[bad].len()));
    }

    Ok((0..cols)
        .map(|j| {
            row.row_of_a
                .iter()
                .zip(b.iter())
                .map(|(a, b_row)| a * b_row[j])
                .sum()
        })
        .collect())
}
