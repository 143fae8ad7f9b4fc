//! Requester-side operations over the job collection.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::error::{JobError, Result};
use crate::jobs::model::{Job, JobInput, JobStatus, Matrix, Microtask, MicrotaskStatus};
use crate::jobs::splitter;
use crate::store::JobStore;

/// A job as submitted by a requester, before splitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub job_type: String,
    pub chunk_size: usize,
    pub redundancy: u32,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub budget: Option<Decimal>,
    pub input: JobInput,
}

/// Completion counts for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (100.0 * self.completed as f64 / self.total as f64)
            .round()
            .clamp(0.0, 100.0) as u8
    }
}

/// Completed versus total microtasks, with the total fallback chain applied.
pub fn progress(job: &Job) -> Progress {
    Progress {
        completed: job.count_with_status(MicrotaskStatus::Completed),
        total: job.resolved_total(),
    }
}

/// Classify pasted text.
///
/// A JSON object with non-empty numeric matrices under `A` and `B` is a
/// matrix pair. Anything else is an item list.
pub fn detect_input(text: &str) -> JobInput {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        let a = map.get("A").or_else(|| map.get("a")).and_then(as_matrix);
        let b = map.get("B").or_else(|| map.get("b")).and_then(as_matrix);
        if let (Some(a), Some(b)) = (a, b) {
            return JobInput::Matrix { a, b };
        }
    }
    JobInput::Items {
        raw: text.to_string(),
    }
}

fn as_matrix(value: &Value) -> Option<Matrix> {
    let rows = value.as_array()?;
    if rows.is_empty() {
        return None;
    }
    rows.iter()
        .map(|row| {
            row.as_array()?
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
        })
        .collect()
}

/// Requester view of the shared job collection.
#[derive(Clone)]
pub struct JobBoard {
    store: JobStore,
    max_attempts: u32,
}

impl JobBoard {
    pub fn new(store: JobStore, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Split and store a new job at the front of the collection.
    pub async fn submit(&self, new_job: NewJob) -> Result<Job> {
        self.submit_at(new_job, Utc::now()).await
    }

    pub async fn submit_at(&self, new_job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        if let JobInput::Matrix { a, b } = &new_job.input {
            if a.is_empty() || b.is_empty() {
                return Err(JobError::InvalidInput {
                    reason: "matrix input needs non-empty A and B".to_string(),
                }
                .into());
            }
        }

        let chunk_size = new_job.chunk_size.max(1);
        let job = Job {
            id: format!("job_{}", Uuid::now_v7()),
            title: new_job.title,
            description: new_job.description,
            job_type: new_job.job_type,
            chunk_size,
            redundancy: new_job.redundancy.max(1),
            priority: new_job.priority,
            budget: new_job.budget,
            created_at: now,
            status: JobStatus::Created,
            estimated_microtasks: splitter::estimate(&new_job.input, chunk_size),
            input: new_job.input,
            total_microtasks: 0,
            completed_microtasks: 0,
            progress: 0,
            microtasks: Vec::new(),
            logs: Vec::new(),
            final_result: None,
        };

        let mut job = splitter::split(job, self.max_attempts, now);
        job.log(now, "Job created");

        let mut jobs = self.store.load().await;
        jobs.insert(0, job.clone());
        self.store.save(&jobs).await?;

        info!(
            job_id = %job.id,
            mode = job.input.mode(),
            microtasks = job.microtasks.len(),
            redundancy = job.redundancy,
            "Job submitted"
        );
        Ok(job)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.store.load().await.into_iter().find(|j| j.id == job_id)
    }

    pub async fn list(&self) -> Vec<Job> {
        self.store.load().await
    }

    /// Remove a job. Returns `false` when there was nothing to remove.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.store.load().await;
        let before = jobs.len();
        jobs.retain(|j| j.id != job_id);
        if jobs.len() == before {
            return Ok(false);
        }
        self.store.save(&jobs).await?;
        info!(job_id, "Job deleted");
        Ok(true)
    }

    /// Put one microtask back to pending, whatever its state.
    pub async fn force_rerun(&self, job_id: &str, task_id: &str) -> Result<Microtask> {
        let now = Utc::now();
        let mut jobs = self.store.load().await;
        let job = find_job(&mut jobs, job_id)?;

        let task = job
            .microtask_mut(task_id)
            .ok_or_else(|| JobError::MicrotaskNotFound {
                job_id: job_id.to_string(),
                task_id: task_id.to_string(),
            })?;
        task.reset_for_rerun();
        let task = task.clone();

        job.log(now, format!("Microtask {task_id} forced to pending by requester"));
        job.recount();
        self.store.save(&jobs).await?;
        info!(job_id, task_id, "Microtask forced to pending");
        Ok(task)
    }

    /// Requeue every failed microtask of a job. Returns how many were requeued.
    pub async fn rerun_failed(&self, job_id: &str) -> Result<usize> {
        let now = Utc::now();
        let mut jobs = self.store.load().await;
        let job = find_job(&mut jobs, job_id)?;

        let mut count = 0;
        for task in job
            .microtasks
            .iter_mut()
            .filter(|m| m.status == MicrotaskStatus::Failed)
        {
            task.reset_for_rerun();
            count += 1;
        }
        if count == 0 {
            return Ok(0);
        }

        job.log(now, format!("{count} failed microtasks requeued by requester"));
        self.store.save(&jobs).await?;
        info!(job_id, count, "Failed microtasks requeued");
        Ok(count)
    }
}

fn find_job<'a>(jobs: &'a mut [Job], job_id: &str) -> std::result::Result<&'a mut Job, JobError> {
    jobs.iter_mut()
        .find(|j| j.id == job_id)
        .ok_or_else(|| JobError::NotFound {
            id: job_id.to_string(),
        })
}
