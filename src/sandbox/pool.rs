//! Pool of isolated execution units.
//!
//! Each unit is its own tokio task with a private inbox. Units share nothing
//! with the coordinator: a task goes in as a [`TaskMessage`], the answer
//! comes back on the shared results channel as a [`ResultMessage`].

use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SandboxError;
use crate::jobs::model::TaskPayload;
use crate::sandbox::transform::{error_value, transform};

/// Inbox capacity per unit.
const UNIT_INBOX_CAPACITY: usize = 4;

/// Coordinator → unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub job_id: String,
    pub task_id: String,
    pub payload: TaskPayload,
}

/// Unit → coordinator. `result` may carry a captured unit error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub job_id: String,
    pub task_id: String,
    pub result: Value,
}

/// Bounds of the artificial per-task delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyRange {
    pub min: Duration,
    pub max: Duration,
}

impl LatencyRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// No artificial delay.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Draw a delay uniformly from the range.
    pub fn sample(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if min == max {
            return self.min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

struct Unit {
    inbox: mpsc::Sender<TaskMessage>,
    handle: JoinHandle<()>,
}

/// A running pool of execution units.
pub struct SandboxPool {
    units: Vec<Unit>,
}

impl SandboxPool {
    /// Start `size` units (at least one) reporting to `results`.
    pub fn start(
        size: usize,
        latency: LatencyRange,
        results: mpsc::UnboundedSender<ResultMessage>,
    ) -> Self {
        let units: Vec<Unit> = (0..size.max(1))
            .map(|slot| {
                let (inbox, rx) = mpsc::channel(UNIT_INBOX_CAPACITY);
                let handle = tokio::spawn(run_unit(slot, rx, results.clone(), latency));
                Unit { inbox, handle }
            })
            .collect();

        info!(units = units.len(), "Execution pool started");
        Self { units }
    }

    pub fn size(&self) -> usize {
        self.units.len()
    }

    /// Hand a task to the unit behind `slot`.
    pub fn submit(&self, slot: usize, task: TaskMessage) -> Result<(), SandboxError> {
        let unit = self.units.get(slot).ok_or(SandboxError::NoSuchUnit {
            slot,
            size: self.units.len(),
        })?;
        unit.inbox.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SandboxError::UnitBusy { slot },
            mpsc::error::TrySendError::Closed(_) => SandboxError::UnitUnavailable { slot },
        })
    }

    /// Stop every unit. In-flight tasks are dropped without producing results.
    pub async fn shutdown(self) {
        for unit in &self.units {
            unit.handle.abort();
        }
        let handles = self.units.into_iter().map(|u| u.handle);
        for outcome in join_all(handles).await {
            if let Err(e) = outcome {
                if !e.is_cancelled() {
                    warn!(error = %e, "Execution unit ended abnormally");
                }
            }
        }
        info!("Execution pool stopped");
    }
}

async fn run_unit(
    slot: usize,
    mut inbox: mpsc::Receiver<TaskMessage>,
    results: mpsc::UnboundedSender<ResultMessage>,
    latency: LatencyRange,
) {
    while let Some(task) = inbox.recv().await {
        let TaskMessage {
            job_id,
            task_id,
            payload,
        } = task;

        let result = match tokio::task::spawn_blocking(move || transform(&payload)).await {
            Ok(value) => value,
            Err(e) => error_value(format!("transform aborted: {e}")),
        };

        tokio::time::sleep(latency.sample()).await;
        debug!(slot, task_id = %task_id, "Unit finished task");

        if results
            .send(ResultMessage {
                job_id,
                task_id,
                result,
            })
            .is_err()
        {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(n: usize) -> TaskMessage {
        TaskMessage {
            job_id: "job_1".to_string(),
            task_id: format!("job_1::task::{n}"),
            payload: TaskPayload::Items(vec![json!(n), json!(2)]),
        }
    }

    #[test]
    fn latency_range_orders_bounds() {
        let range = LatencyRange::new(Duration::from_millis(50), Duration::from_millis(10));
        assert_eq!(range.min, Duration::from_millis(10));
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(50));
        }
        assert_eq!(LatencyRange::none().sample(), Duration::ZERO);
    }

    #[tokio::test]
    async fn unit_returns_result_for_same_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = SandboxPool::start(2, LatencyRange::none(), tx);
        assert_eq!(pool.size(), 2);

        pool.submit(1, task(3)).unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.job_id, "job_1");
        assert_eq!(msg.task_id, "job_1::task::3");
        assert_eq!(msg.result, json!([9, 4]));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_to_missing_unit_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = SandboxPool::start(1, LatencyRange::none(), tx);
        assert!(matches!(
            pool.submit(4, task(0)),
            Err(SandboxError::NoSuchUnit { slot: 4, size: 1 })
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_discards_in_flight_results() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latency = LatencyRange::new(Duration::from_secs(30), Duration::from_secs(30));
        let pool = SandboxPool::start(1, latency, tx);
        pool.submit(0, task(1)).unwrap();
        pool.shutdown().await;
        assert!(rx.recv().await.is_none());
    }
}
